//! Runtime pre-check: every required binary must resolve before any command runs

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use serde::Serialize;
use warden_plan::CommandSpec;

use crate::profile::StackProfile;

/// Programs recognised when scanning command literals
static KNOWN_BINARIES: &[&str] = &[
    "javac", "java", "mvn", "gradle", "node", "npm", "npx", "yarn", "pnpm", "bun", "deno", "go",
    "cargo", "rustc", "docker", "docker-compose", "podman", "flutter", "dart", "python", "python3",
    "pip", "pip3", "pytest", "poetry", "uvicorn", "gunicorn", "psql", "mysql", "sqlite3", "ruby",
    "bundle", "php", "composer", "make",
];

static INSTALL_HINTS: &[(&str, &str)] = &[
    ("java", "install a JDK (e.g. `apt install openjdk-17-jdk` or https://adoptium.net)"),
    ("javac", "install a JDK (e.g. `apt install openjdk-17-jdk` or https://adoptium.net)"),
    ("mvn", "install Maven (`apt install maven` or `brew install maven`)"),
    ("gradle", "install Gradle (https://gradle.org/install) or use the project's ./gradlew"),
    ("node", "install Node.js (https://nodejs.org or `nvm install --lts`)"),
    ("npm", "npm ships with Node.js (https://nodejs.org)"),
    ("npx", "npx ships with Node.js (https://nodejs.org)"),
    ("yarn", "enable Yarn with `corepack enable`"),
    ("pnpm", "enable pnpm with `corepack enable`"),
    ("bun", "install Bun (`curl -fsSL https://bun.sh/install | bash`)"),
    ("go", "install Go (https://go.dev/dl)"),
    ("cargo", "install Rust via rustup (https://rustup.rs)"),
    ("rustc", "install Rust via rustup (https://rustup.rs)"),
    ("docker", "install Docker Engine (https://docs.docker.com/engine/install)"),
    ("docker-compose", "install the Docker Compose plugin and use `docker compose`"),
    ("flutter", "install the Flutter SDK (https://docs.flutter.dev/get-started/install)"),
    ("dart", "install the Dart SDK (https://dart.dev/get-dart)"),
    ("python", "install Python 3 (https://python.org/downloads) or alias python to python3"),
    ("python3", "install Python 3 (`apt install python3` or https://python.org/downloads)"),
    ("pip", "install pip (`python3 -m ensurepip --upgrade`)"),
    ("pip3", "install pip (`python3 -m ensurepip --upgrade`)"),
    ("psql", "install the PostgreSQL client (`apt install postgresql-client`)"),
    ("mysql", "install the MySQL client (`apt install mysql-client`)"),
    ("sqlite3", "install SQLite (`apt install sqlite3`)"),
];

/// A binary that did not resolve, with a remediation hint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingBinary {
    /// Program name
    pub name: String,
    /// How to install it
    pub hint: String,
}

impl Display for MissingBinary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.hint)
    }
}

/// Resolves program names to paths
pub trait BinaryResolver: Send + Sync {
    /// Full path of the program, if found
    fn resolve(&self, name: &str) -> Option<PathBuf>;
}

/// Searches the directories of a `PATH`-style variable
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    dirs: Vec<PathBuf>,
}

impl PathResolver {
    /// Resolver over the current process `PATH`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_path_var(std::env::var_os("PATH").unwrap_or_default())
    }

    /// Resolver over an explicit `PATH` value
    #[must_use]
    pub fn from_path_var(path: impl Into<OsString>) -> Self {
        Self {
            dirs: std::env::split_paths(&path.into()).collect(),
        }
    }
}

impl BinaryResolver for PathResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|d| d.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

/// Shell builtins that never need resolving
static SHELL_BUILTINS: &[&str] = &[
    ".", ":", "[", "alias", "cd", "echo", "eval", "exec", "exit", "export", "false", "printf", "pwd", "read",
    "set", "shift", "source", "test", "trap", "true", "type", "ulimit", "umask", "unset", "wait",
];

/// Binaries a plan needs
///
/// The profile's binaries, the program of every command segment (paths and
/// shell builtins excepted) and any recognised program named further along
/// a segment, e.g. behind `sudo` or `poetry run`.
pub fn required_binaries<'a, I>(profile: &StackProfile, commands: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a CommandSpec>,
{
    let mut required: BTreeSet<String> = profile
        .required_binaries
        .iter()
        .map(|b| (*b).to_string())
        .collect();
    for command in commands {
        for segment in command
            .text
            .tokens()
            .split(|t| matches!(t.as_str(), "&&" | "||" | ";" | "|"))
        {
            let mut words = segment.iter().map(String::as_str).skip_while(|t| is_env_assignment(t));
            let Some(program) = words.next() else {
                continue;
            };
            if !program.contains('/') && !SHELL_BUILTINS.contains(&program) {
                required.insert(program.to_string());
            }
            let mut previous = program;
            for word in words {
                // `python -m pytest` runs a module, not a binary
                if previous != "-m" && KNOWN_BINARIES.contains(&word) {
                    required.insert(word.to_string());
                }
                previous = word;
            }
        }
    }
    required
}

fn is_env_assignment(token: &str) -> bool {
    token.split_once('=').is_some_and(|(name, _)| {
        !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit())
    })
}

/// Install hint for a program
#[must_use]
pub fn install_hint(name: &str) -> String {
    INSTALL_HINTS
        .iter()
        .find(|(n, _)| *n == name)
        .map_or_else(|| format!("install `{name}` and make sure it is on PATH"), |(_, h)| (*h).to_string())
}

/// Resolve every required binary
///
/// # Errors
/// Every unresolved binary, each with its hint
pub fn check_binaries(
    resolver: &dyn BinaryResolver,
    required: &BTreeSet<String>,
) -> Result<(), Vec<MissingBinary>> {
    let missing: Vec<MissingBinary> = required
        .iter()
        .filter(|name| resolver.resolve(name).is_none())
        .map(|name| MissingBinary {
            name: name.clone(),
            hint: install_hint(name),
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}
