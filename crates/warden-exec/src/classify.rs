//! Command classification: timeout bucket, background detection, port inference

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use warden_plan::{is_package_install, CommandText};

/// Timeout categories, in match order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBucket {
    /// Image builds and compose stacks
    ContainerBuild,
    /// Compiled-language builds
    CompiledBuild,
    /// Dependency installation
    PackageInstall,
    /// Test runners
    TestRunner,
    /// Schema migrations
    Migration,
    /// Everything else
    Default,
}

impl TimeoutBucket {
    /// Wall-clock limit for the bucket
    #[must_use]
    pub const fn duration(self) -> Duration {
        Duration::from_secs(match self {
            Self::ContainerBuild => 600,
            Self::CompiledBuild | Self::PackageInstall => 300,
            Self::TestRunner => 180,
            Self::Migration | Self::Default => 120,
        })
    }
}

static BUCKET_RULES: &[(TimeoutBucket, &[&str])] = &[
    (
        TimeoutBucket::ContainerBuild,
        &["docker build", "docker-compose", "docker compose", "docker buildx", "podman build"],
    ),
    (
        TimeoutBucket::CompiledBuild,
        &[
            "mvn package", "mvn compile", "mvn install", "mvn verify", "gradle build",
            "gradlew build", "gradle assemble", "gradlew assemble", "cargo build", "flutter build",
            "npm run build", "yarn build", "pnpm build", "go build", "dotnet build", "tsc",
        ],
    ),
    (
        TimeoutBucket::PackageInstall,
        &[
            "npm install", "npm ci", "yarn install", "pnpm install", "pip install", "go mod tidy",
            "go mod download", "bundle install", "cargo install", "composer install",
            "flutter pub get", "dart pub get", "poetry install",
        ],
    ),
    (
        TimeoutBucket::TestRunner,
        &[
            "pytest", "jest", "mocha", "vitest", "mvn test", "gradle test", "gradlew test",
            "go test", "cargo test", "npm test", "npm run test", "yarn test", "pnpm test",
            "flutter test", "dart test", "rspec", "phpunit", "unittest",
        ],
    ),
    (
        TimeoutBucket::Migration,
        &["migrate", "alembic", "flyway", "liquibase", "prisma", "sequelize", "knex"],
    ),
];

static SERVER_KEYWORDS: &[&str] = &[
    "flask run", "uvicorn", "gunicorn", "hypercorn", "streamlit run", "chainlit run", "gradio",
    "npm start", "npm run dev", "npm run serve", "yarn start", "yarn dev", "pnpm dev", "next dev",
    "vite", "ng serve", "manage.py runserver", "http.server", "java -jar", "spring-boot:run",
    "docker-compose up", "docker compose up", "go run", "cargo run", "node server", "node app",
    "node index",
];

static DEFAULT_PORTS: &[(&str, u16)] = &[
    ("flask", 5000),
    ("uvicorn", 8000),
    ("gunicorn", 8000),
    ("hypercorn", 8000),
    ("streamlit", 8501),
    ("chainlit", 8000),
    ("gradio", 7860),
    ("manage.py runserver", 8000),
    ("http.server", 8000),
    ("next dev", 3000),
    ("vite", 5173),
    ("react-scripts", 3000),
    ("ng serve", 4200),
    ("spring-boot:run", 8080),
    ("java -jar", 8080),
    ("npm start", 3000),
    ("npm run dev", 3000),
    ("yarn start", 3000),
    ("yarn dev", 3000),
    ("pnpm dev", 3000),
    ("node server", 3000),
    ("node app", 3000),
    ("node index", 3000),
];

static PORT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"--port[= ](\d+)",
        r"(?:^|\s)-p\s+(\d+)",
        r":(\d{4,5})\b",
        r"(?i)\bPORT[= ](\d+)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandClass {
    /// Timeout bucket
    pub bucket: TimeoutBucket,
    /// Launch detached and health-check instead of waiting
    pub background: bool,
    /// Port to probe, for background servers
    pub port: Option<u16>,
}

/// Classify a command literal
#[must_use]
pub fn classify(text: &CommandText) -> CommandClass {
    let normalized = text.normalized();
    let bucket = bucket_for(&normalized, text);
    let background = SERVER_KEYWORDS.iter().any(|k| contains_keyword(&normalized, k));
    let port = if background { infer_port(text.literal()) } else { None };
    tracing::debug!(command = %text, ?bucket, background, ?port, "classified command");
    CommandClass {
        bucket,
        background,
        port,
    }
}

fn bucket_for(normalized: &str, text: &CommandText) -> TimeoutBucket {
    for (bucket, keywords) in BUCKET_RULES {
        if keywords.iter().any(|k| contains_keyword(normalized, k)) {
            return *bucket;
        }
        if *bucket == TimeoutBucket::PackageInstall && is_package_install(text) {
            return *bucket;
        }
    }
    TimeoutBucket::Default
}

/// Port from explicit flags, `:NNNN`, `PORT=`, or the framework default
#[must_use]
pub fn infer_port(literal: &str) -> Option<u16> {
    for pattern in PORT_PATTERNS.iter() {
        if let Some(port) = pattern
            .captures(literal)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .filter(|p| *p != 0)
        {
            return Some(port);
        }
    }
    let normalized = literal.to_lowercase();
    DEFAULT_PORTS
        .iter()
        .find(|(k, _)| contains_keyword(&normalized, k))
        .map(|(_, port)| *port)
}

/// Substring match that refuses to split words
///
/// `vite` does not match `vitest`, `go` does not match `google`.
pub(crate) fn contains_keyword(haystack: &str, keyword: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(keyword).any(|(start, _)| {
        let before_ok = haystack[..start].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = haystack[start + keyword.len()..]
            .chars()
            .next()
            .map_or(true, |c| !is_word(c));
        before_ok && after_ok
    })
}
