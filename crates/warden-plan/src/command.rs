//! Planned commands
//!
//! A [`CommandSpec`] is what the planner declared for one role. The literal
//! text is kept verbatim for execution and tokenised once for classification.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Upper bound on a command literal in bytes
pub const MAX_COMMAND_LEN: usize = 4096;

/// Role a command plays in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandRole {
    /// Dependency installation (the only command allowed network access)
    Install,
    /// Build / compile step
    Compile,
    /// Static checks
    Lint,
    /// Application run step
    Run,
    /// Test runner
    Test,
}

impl CommandRole {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Compile => "compile",
            Self::Lint => "lint",
            Self::Run => "run",
            Self::Test => "test",
        }
    }
}

impl Display for CommandRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated command literal plus its tokens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandText {
    literal: String,
    tokens: Vec<String>,
}

impl CommandText {
    /// Validate and tokenise a literal
    ///
    /// # Errors
    /// Rejects empty, oversized, control-character and unbalanced-quote input
    pub fn parse(literal: impl Into<String>) -> Result<Self, CommandError> {
        let literal = literal.into();
        if literal.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        if literal.len() > MAX_COMMAND_LEN {
            return Err(CommandError::TooLong {
                len: literal.len(),
                max: MAX_COMMAND_LEN,
            });
        }
        if let Some(c) = literal.chars().find(|c| c.is_control() && *c != '\t') {
            return Err(CommandError::ControlCharacter(c as u32));
        }
        let tokens = tokenize(&literal)?;
        Ok(Self { literal, tokens })
    }

    /// Literal text, exactly as planned
    #[must_use]
    pub fn literal(&self) -> &str {
        &self.literal
    }

    /// Quote-aware whitespace tokens
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// First token (the program, unless the command starts with env assignments)
    #[must_use]
    pub fn program(&self) -> &str {
        self.tokens
            .iter()
            .find(|t| !is_env_assignment(t))
            .map_or("", String::as_str)
    }

    /// Lowercased literal for keyword matching
    #[must_use]
    pub fn normalized(&self) -> String {
        self.literal.to_lowercase()
    }
}

impl Display for CommandText {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal)
    }
}

impl Serialize for CommandText {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.literal)
    }
}

impl<'de> Deserialize<'de> for CommandText {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(serde::de::Error::custom)
    }
}

/// A planned command tagged with its role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandSpec {
    /// What the command is for
    pub role: CommandRole,
    /// Validated literal
    pub text: CommandText,
}

impl CommandSpec {
    /// Build a spec from a literal
    ///
    /// # Errors
    /// Propagates [`CommandText::parse`] validation failures
    pub fn new(role: CommandRole, literal: impl Into<String>) -> Result<Self, CommandError> {
        Ok(Self {
            role,
            text: CommandText::parse(literal)?,
        })
    }

    /// Literal text
    #[must_use]
    pub fn literal(&self) -> &str {
        self.text.literal()
    }

    /// True when the command adds or installs packages
    #[must_use]
    pub fn is_package_install(&self) -> bool {
        is_package_install(&self.text)
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.role, self.text)
    }
}

/// `(program, subcommand words)` pairs that install packages
const INSTALL_VERBS: &[(&str, &[&str])] = &[
    ("npm", &["install", "i", "add", "ci"]),
    ("yarn", &["add", "install"]),
    ("pnpm", &["add", "install", "i"]),
    ("bun", &["add", "install"]),
    ("pip", &["install"]),
    ("pip3", &["install"]),
    ("poetry", &["add", "install"]),
    ("pipenv", &["install"]),
    ("cargo", &["add", "install"]),
    ("go", &["get", "install"]),
    ("gem", &["install"]),
    ("bundle", &["add", "install"]),
    ("composer", &["require", "install"]),
    ("flutter", &["pub"]),
    ("dart", &["pub"]),
];

/// Detect package-manager install verbs in any `&&`/`;`-chained segment
#[must_use]
pub fn is_package_install(text: &CommandText) -> bool {
    text.tokens()
        .split(|t| matches!(t.as_str(), "&&" | "||" | ";" | "|"))
        .any(|segment| segment_installs(segment))
}

fn segment_installs(segment: &[String]) -> bool {
    let mut words = segment
        .iter()
        .map(String::as_str)
        .skip_while(|t| is_env_assignment(t));
    let Some(mut program) = words.next() else {
        return false;
    };
    let rest: Vec<&str> = words.collect();
    let mut rest = rest.as_slice();

    // `python -m pip install ...`
    if matches!(program, "python" | "python3") {
        if let ["-m", module, tail @ ..] = rest {
            program = *module;
            rest = tail;
        }
    }

    let Some((_, verbs)) = INSTALL_VERBS.iter().find(|(p, _)| *p == program) else {
        return false;
    };
    let Some(first) = rest.iter().find(|t| !t.starts_with('-')) else {
        return false;
    };
    if !verbs.contains(first) {
        return false;
    }
    // `flutter pub get` / `dart pub add`
    if *first == "pub" {
        return rest
            .iter()
            .skip_while(|t| **t != "pub")
            .nth(1)
            .is_some_and(|t| matches!(*t, "get" | "add" | "upgrade"));
    }
    true
}

fn is_env_assignment(token: &str) -> bool {
    token
        .split_once('=')
        .is_some_and(|(k, _)| !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

fn tokenize(literal: &str) -> Result<Vec<String>, CommandError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in literal.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(CommandError::UnbalancedQuote(q));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Command validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Blank literal
    #[error("command is empty")]
    Empty,

    /// Literal exceeds [`MAX_COMMAND_LEN`]
    #[error("command is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    /// Literal contains a control character
    #[error("command contains control character U+{0:04X}")]
    ControlCharacter(u32),

    /// Quote opened but never closed
    #[error("unbalanced {0} quote in command")]
    UnbalancedQuote(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CommandText {
        CommandText::parse(s).unwrap()
    }

    #[test]
    fn tokenizes_quotes() {
        let t = text(r#"pytest -k "slow and not flaky" tests/"#);
        assert_eq!(t.tokens(), ["pytest", "-k", "slow and not flaky", "tests/"]);
        assert_eq!(t.program(), "pytest");
    }

    #[test]
    fn program_skips_env_assignments() {
        assert_eq!(text("PORT=8080 node server.js").program(), "node");
    }

    #[test]
    fn rejects_bad_literals() {
        assert_eq!(CommandText::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            CommandText::parse("echo \"open"),
            Err(CommandError::UnbalancedQuote('"'))
        );
        assert_eq!(
            CommandText::parse("echo a\nrm -rf /"),
            Err(CommandError::ControlCharacter(0x0A))
        );
        assert!(matches!(
            CommandText::parse("x".repeat(MAX_COMMAND_LEN + 1)),
            Err(CommandError::TooLong { .. })
        ));
    }

    #[test]
    fn detects_installs() {
        for cmd in [
            "npm install express",
            "npm i",
            "yarn add left-pad",
            "pip install -r requirements.txt",
            "python -m pip install requests",
            "cargo add serde",
            "go get github.com/x/y",
            "flutter pub get",
            "cd web && npm ci",
        ] {
            assert!(is_package_install(&text(cmd)), "{cmd}");
        }
    }

    #[test]
    fn ignores_non_installs() {
        for cmd in [
            "npm test",
            "npm run build",
            "cargo build --release",
            "go test ./...",
            "pytest",
            "dart analyze",
            "flutter test",
        ] {
            assert!(!is_package_install(&text(cmd)), "{cmd}");
        }
    }

    #[test]
    fn serde_keeps_literal() {
        let spec = CommandSpec::new(CommandRole::Test, "pytest -q").unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"role":"test","text":"pytest -q"}"#);
        let back: CommandSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
