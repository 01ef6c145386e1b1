//! Stack profile registry
//!
//! Static table of supported stacks. Lookups never fail: unknown names
//! resolve to the generic profile.

use std::collections::BTreeMap;

use warden_plan::{CommandRole, CommandSpec};

use crate::classify::{contains_keyword, TimeoutBucket};

/// What the engine needs to know about a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackProfile {
    /// Language tag, also the error-pattern registry key
    pub tag: &'static str,
    /// Human-readable name
    pub display_name: &'static str,
    /// File suffixes (or exact names) belonging to the stack
    pub extensions: &'static [&'static str],
    /// Binaries that must resolve before any command runs
    pub required_binaries: &'static [&'static str],
    /// Lint used when the plan declares none
    pub fallback_lint: Option<&'static str>,
    /// Bucket for build steps the classifier cannot place
    pub timeout_hint: TimeoutBucket,
}

impl StackProfile {
    /// Fallback lint as a command spec
    #[must_use]
    pub fn fallback_lint_spec(&self) -> Option<CommandSpec> {
        self.fallback_lint
            .and_then(|l| CommandSpec::new(CommandRole::Lint, l).ok())
    }

    /// True when a path belongs to this stack
    #[must_use]
    pub fn matches_path(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        self.extensions
            .iter()
            .any(|ext| if ext.starts_with('.') { name.ends_with(ext) } else { name == *ext })
    }
}

const PYTHON: StackProfile = StackProfile {
    tag: "python",
    display_name: "Python",
    extensions: &[".py", ".pyi"],
    required_binaries: &["python3"],
    fallback_lint: Some("python3 -m compileall -q ."),
    timeout_hint: TimeoutBucket::PackageInstall,
};

const JAVA: StackProfile = StackProfile {
    tag: "java",
    display_name: "Java / JVM",
    extensions: &[".java", ".kt", ".scala", "pom.xml", "build.gradle", "build.gradle.kts"],
    required_binaries: &["java", "javac"],
    fallback_lint: Some("javac -Xlint:all"),
    timeout_hint: TimeoutBucket::CompiledBuild,
};

const NODE: StackProfile = StackProfile {
    tag: "node",
    display_name: "Node.js",
    extensions: &[".js", ".jsx", ".ts", ".tsx", ".mjs", ".cjs", "package.json"],
    required_binaries: &["node", "npm"],
    fallback_lint: Some("npx tsc --noEmit"),
    timeout_hint: TimeoutBucket::PackageInstall,
};

const GO: StackProfile = StackProfile {
    tag: "go",
    display_name: "Go",
    extensions: &[".go", "go.mod"],
    required_binaries: &["go"],
    fallback_lint: Some("go vet ./..."),
    timeout_hint: TimeoutBucket::CompiledBuild,
};

const RUST: StackProfile = StackProfile {
    tag: "rust",
    display_name: "Rust",
    extensions: &[".rs", "Cargo.toml"],
    required_binaries: &["cargo", "rustc"],
    fallback_lint: Some("cargo check"),
    timeout_hint: TimeoutBucket::CompiledBuild,
};

const DART: StackProfile = StackProfile {
    tag: "dart",
    display_name: "Dart / Flutter",
    extensions: &[".dart", "pubspec.yaml"],
    required_binaries: &["dart"],
    fallback_lint: Some("dart analyze"),
    timeout_hint: TimeoutBucket::CompiledBuild,
};

const DOCKER: StackProfile = StackProfile {
    tag: "docker",
    display_name: "Docker",
    extensions: &["Dockerfile", "docker-compose.yml", "docker-compose.yaml", "compose.yml", "compose.yaml"],
    required_binaries: &["docker"],
    fallback_lint: None,
    timeout_hint: TimeoutBucket::ContainerBuild,
};

const GENERIC: StackProfile = StackProfile {
    tag: "generic",
    display_name: "Generic",
    extensions: &[],
    required_binaries: &[],
    fallback_lint: None,
    timeout_hint: TimeoutBucket::Default,
};

static PROFILES: &[&StackProfile] = &[&PYTHON, &JAVA, &NODE, &GO, &RUST, &DART, &DOCKER, &GENERIC];

static ALIASES: &[(&str, &str)] = &[
    ("py", "python"),
    ("django", "python"),
    ("flask", "python"),
    ("fastapi", "python"),
    ("kotlin", "java"),
    ("scala", "java"),
    ("jvm", "java"),
    ("spring", "java"),
    ("javascript", "node"),
    ("typescript", "node"),
    ("js", "node"),
    ("ts", "node"),
    ("nodejs", "node"),
    ("golang", "go"),
    ("flutter", "dart"),
    ("compose", "docker"),
];

/// Ordered keyword table used to guess a stack from free text
static TEXT_KEYWORDS: &[(&str, &[&str])] = &[
    ("dart", &["flutter", "dart"]),
    ("docker", &["docker", "dockerfile", "docker-compose", "container"]),
    ("rust", &["rust", "cargo", "crate"]),
    ("go", &["golang", "go"]),
    ("java", &["java", "spring", "maven", "gradle", "kotlin"]),
    ("node", &["node", "nodejs", "express", "react", "next.js", "typescript", "javascript", "npm", "vite"]),
    ("python", &["python", "django", "flask", "fastapi", "pytest", "pip"]),
];

/// Lookup and detection over the static profile table
#[derive(Debug, Clone, Copy, Default)]
pub struct StackProfileRegistry;

impl StackProfileRegistry {
    /// Registry over the built-in profiles
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Every profile, generic last
    #[must_use]
    pub fn all(&self) -> &'static [&'static StackProfile] {
        PROFILES
    }

    /// The generic fallback
    #[must_use]
    pub fn generic(&self) -> &'static StackProfile {
        &GENERIC
    }

    /// Resolve a stack name or alias, falling back to generic
    #[must_use]
    pub fn lookup(&self, name: &str) -> &'static StackProfile {
        let name = name.trim().to_lowercase();
        let canonical = ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map_or(name.as_str(), |(_, tag)| *tag);
        PROFILES
            .iter()
            .copied()
            .find(|p| p.tag == canonical)
            .unwrap_or(&GENERIC)
    }

    /// Guess a stack from a task description
    #[must_use]
    pub fn detect_from_text(&self, text: &str) -> &'static StackProfile {
        let text = text.to_lowercase();
        for (tag, keywords) in TEXT_KEYWORDS {
            if keywords.iter().any(|k| contains_keyword(&text, k)) {
                return self.lookup(tag);
            }
        }
        &GENERIC
    }

    /// Pick a stack from discovered repository paths
    ///
    /// Container definitions win outright; otherwise the stack owning the
    /// most files is chosen, ties resolved by table order.
    #[must_use]
    pub fn detect_from_paths<'a, I>(&self, paths: I) -> &'static StackProfile
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for path in paths {
            if DOCKER.matches_path(path) {
                return &DOCKER;
            }
            if let Some(idx) = PROFILES.iter().position(|p| p.matches_path(path)) {
                *counts.entry(idx).or_default() += 1;
            }
        }
        counts
            .iter()
            .max_by(|(ia, ca), (ib, cb)| ca.cmp(cb).then(ib.cmp(ia)))
            .map_or(&GENERIC, |(idx, _)| PROFILES[*idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_aliases_and_fallback() {
        let reg = StackProfileRegistry::new();
        assert_eq!(reg.lookup("Python").tag, "python");
        assert_eq!(reg.lookup("typescript").tag, "node");
        assert_eq!(reg.lookup("kotlin").tag, "java");
        assert_eq!(reg.lookup("flutter").tag, "dart");
        assert_eq!(reg.lookup("cobol").tag, "generic");
    }

    #[test]
    fn detects_from_text() {
        let reg = StackProfileRegistry::new();
        assert_eq!(reg.detect_from_text("Add a Flask endpoint").tag, "python");
        assert_eq!(reg.detect_from_text("fix the go build").tag, "go");
        assert_eq!(reg.detect_from_text("build a flutter screen").tag, "dart");
        assert_eq!(reg.detect_from_text("google the answer").tag, "generic");
    }

    #[test]
    fn detects_from_paths() {
        let reg = StackProfileRegistry::new();
        let paths = ["src/main.rs", "src/lib.rs", "Cargo.toml", "scripts/gen.py"];
        assert_eq!(reg.detect_from_paths(paths).tag, "rust");
        let with_docker = ["app.py", "Dockerfile"];
        assert_eq!(reg.detect_from_paths(with_docker).tag, "docker");
        assert_eq!(reg.detect_from_paths(["README.md"]).tag, "generic");
    }

    #[test]
    fn fallback_lint_is_a_lint_command() {
        let spec = RUST.fallback_lint_spec().unwrap();
        assert_eq!(spec.role, CommandRole::Lint);
        assert_eq!(spec.literal(), "cargo check");
        assert!(GENERIC.fallback_lint_spec().is_none());
    }
}
