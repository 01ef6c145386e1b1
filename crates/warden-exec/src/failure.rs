//! Failure classification
//!
//! Every failed attempt lands in exactly one class. Rules are evaluated top
//! to bottom and the last rule is a catch-all, so the mapping is total.

use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use warden_plan::CommandRole;

use crate::runner::ExitState;

/// Tool failure sub-kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    /// Parser rejected the source
    Syntax,
    /// Linter reported problems
    Lint,
    /// Compile-time type error
    Type,
    /// Crash or non-zero exit while running
    Runtime,
    /// Killed at the bucket timeout
    Timeout,
    /// Non-zero exit with nothing recognisable
    Unknown,
}

/// Failure class, deciding retry behaviour
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum FailureKind {
    /// Eligible for self-healing and the implementing retry budget
    Tool { kind: ToolFailure },
    /// Tests ran and asserted wrong behaviour; needs the user
    Logic,
    /// Host is missing something; fail fast
    Environment { reason: String },
    /// Stopped by cancellation
    Interrupted,
}

impl FailureKind {
    /// Whether the healing loop may attempt a fix
    #[inline]
    #[must_use]
    pub fn is_healable(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }

    /// Tool failure shorthand
    #[must_use]
    pub const fn tool(kind: ToolFailure) -> Self {
        Self::Tool { kind }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool { kind } => write!(f, "tool failure ({kind:?})"),
            Self::Logic => f.write_str("logic failure"),
            Self::Environment { reason } => write!(f, "environment failure: {reason}"),
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

static ENVIRONMENT: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"command not found",
        r"is not recognized as an internal or external command",
        r"Connection refused",
        r"ECONNREFUSED",
    ])
});

static SYNTAX: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"SyntaxError",
        r"IndentationError",
        r"(?i)syntax error",
        r"Unexpected token",
        r"ParseError",
        r"error: expected",
        r"expected ';'",
    ])
});

static TYPE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"error\[E0308\]",
        r"mismatched types",
        r"error TS\d+",
        r"incompatible types",
        r"cannot find symbol",
        r"is not assignable to",
    ])
});

static ASSERTION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"AssertionError",
        r"AssertionFailedError",
        r"assertion failed",
        r"assertion `left == right` failed",
        r"(?m)^--- FAIL",
        r"(?m)^FAILED ",
        r"Expected:.*\n.*Received:",
        r"expected .* (?:to equal|but got|got)",
        r"\d+ failed",
    ])
});

fn any(patterns: &[Regex], output: &str) -> bool {
    patterns.iter().any(|p| p.is_match(output))
}

/// Classify a failed attempt
///
/// `fatal` is whether a crash signature was seen even on exit 0.
#[must_use]
pub fn classify_failure(role: CommandRole, exit: &ExitState, output: &str, fatal: bool) -> FailureKind {
    match exit {
        ExitState::SpawnFailed(reason) => {
            return FailureKind::Environment {
                reason: reason.clone(),
            }
        }
        ExitState::Exited(code @ (126 | 127)) => {
            return FailureKind::Environment {
                reason: format!("exit {code}: command not executable or not found"),
            }
        }
        ExitState::TimedOut => return FailureKind::tool(ToolFailure::Timeout),
        ExitState::Cancelled => return FailureKind::Interrupted,
        _ => {}
    }
    if let Some(line) = ENVIRONMENT
        .iter()
        .find_map(|p| p.find(output))
        .map(|m| m.as_str().to_string())
    {
        return FailureKind::Environment { reason: line };
    }
    if any(&SYNTAX, output) {
        return FailureKind::tool(ToolFailure::Syntax);
    }
    if any(&TYPE, output) {
        return FailureKind::tool(ToolFailure::Type);
    }
    match role {
        CommandRole::Lint => FailureKind::tool(ToolFailure::Lint),
        CommandRole::Test if any(&ASSERTION, output) => FailureKind::Logic,
        CommandRole::Test => FailureKind::tool(ToolFailure::Runtime),
        _ if fatal => FailureKind::tool(ToolFailure::Runtime),
        _ => match exit {
            ExitState::Signalled => FailureKind::tool(ToolFailure::Runtime),
            _ => FailureKind::tool(ToolFailure::Unknown),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_first() {
        assert!(matches!(
            classify_failure(CommandRole::Compile, &ExitState::Exited(127), "", false),
            FailureKind::Environment { .. }
        ));
        assert!(matches!(
            classify_failure(
                CommandRole::Test,
                &ExitState::Exited(1),
                "sh: 1: pytest: command not found",
                false
            ),
            FailureKind::Environment { .. }
        ));
        assert!(matches!(
            classify_failure(CommandRole::Run, &ExitState::SpawnFailed("ENOENT".into()), "", false),
            FailureKind::Environment { .. }
        ));
    }

    #[test]
    fn timeout_is_a_tool_failure() {
        let kind = classify_failure(CommandRole::Test, &ExitState::TimedOut, "", false);
        assert_eq!(kind, FailureKind::tool(ToolFailure::Timeout));
        assert!(kind.is_healable());
    }

    #[test]
    fn syntax_beats_assertions() {
        let out = "  File \"app.py\", line 3\n    def f(:\nSyntaxError: invalid syntax\n1 failed";
        assert_eq!(
            classify_failure(CommandRole::Test, &ExitState::Exited(1), out, false),
            FailureKind::tool(ToolFailure::Syntax)
        );
    }

    #[test]
    fn assertion_in_tests_is_logic() {
        let out = "E       AssertionError: assert 3 == 4\nFAILED test_app.py::test_add\n1 failed in 0.02s";
        let kind = classify_failure(CommandRole::Test, &ExitState::Exited(1), out, false);
        assert_eq!(kind, FailureKind::Logic);
        assert!(!kind.is_healable());
    }

    #[test]
    fn test_crash_without_assertion_is_runtime() {
        let out = "ImportError: cannot import name 'add' from 'app'";
        assert_eq!(
            classify_failure(CommandRole::Test, &ExitState::Exited(2), out, false),
            FailureKind::tool(ToolFailure::Runtime)
        );
    }

    #[test]
    fn lint_and_type_and_unknown() {
        assert_eq!(
            classify_failure(CommandRole::Lint, &ExitState::Exited(1), "W0611 unused import", false),
            FailureKind::tool(ToolFailure::Lint)
        );
        assert_eq!(
            classify_failure(CommandRole::Compile, &ExitState::Exited(1), "error[E0308]: mismatched types", false),
            FailureKind::tool(ToolFailure::Type)
        );
        assert_eq!(
            classify_failure(CommandRole::Run, &ExitState::Exited(3), "", false),
            FailureKind::tool(ToolFailure::Unknown)
        );
        assert_eq!(
            classify_failure(CommandRole::Run, &ExitState::Exited(0), "thread 'main' panicked at", true),
            FailureKind::tool(ToolFailure::Runtime)
        );
    }
}
