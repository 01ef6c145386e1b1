use std::path::PathBuf;

use warden_exec::{ExecError, OracleError};
use warden_plan::PlanError;

use crate::invariants::{InvariantPhase, InvariantViolation};
use crate::state::State;

/// Why the controller refused a transition
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionRejection {
    /// No transition leaves a terminal state
    #[error("task is already terminal ({state})")]
    AlreadyTerminal { state: State },

    /// Edge not in the transition table
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: State, to: State },

    /// Exit or entry invariant failed
    #[error("{phase} invariant of {state} violated: {violation}")]
    Invariant {
        state: State,
        phase: InvariantPhase,
        violation: InvariantViolation,
    },

    /// External policy gate refused
    #[error("policy gate denied: {0}")]
    Gate(String),

    /// A frozen envelope is never replaced
    #[error("plan envelope is already frozen")]
    EnvelopeAlreadyFrozen,

    /// Isolation branch requested before the plan was frozen
    #[error("isolation requires a frozen plan envelope")]
    IsolationBeforeFreeze,

    /// Approval submitted while no request is pending
    #[error("no approval is pending")]
    NoPendingApproval,
}

impl TransitionRejection {
    /// Short cause recorded in the audit log
    #[must_use]
    pub fn cause(&self) -> String {
        self.to_string()
    }

    /// The violation, if an invariant failed
    #[must_use]
    pub fn violation(&self) -> Option<&InvariantViolation> {
        match self {
            Self::Invariant { violation, .. } => Some(violation),
            _ => None,
        }
    }
}

/// Audit chain verification failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("audit chain broken at record {seq}")]
    BrokenChain { seq: u64 },
}

/// Version-control adapter failure
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// `git` exited non-zero
    #[error("git {args} failed (exit {code}): {output}")]
    Command {
        args: String,
        code: i32,
        output: String,
    },

    /// `git` could not be started
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    /// The operation is not possible in the current repository state
    #[error("{0}")]
    Unsupported(String),
}

/// CI status query failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum CiError {
    #[error("ci status unavailable: {0}")]
    Unavailable(String),

    #[error("no ci run found for {branch}@{sha}")]
    NoRun { branch: String, sha: String },
}

/// Configuration loading failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Errors surfaced while driving a task
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transition(#[from] TransitionRejection),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Ci(#[from] CiError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Host or collaborator problems a human has to fix
    #[inline]
    #[must_use]
    pub fn is_environment(&self) -> bool {
        match self {
            Self::Exec(e) => e.is_environment(),
            Self::Vcs(VcsError::Spawn(_)) | Self::Ci(_) | Self::Oracle(OracleError::Unavailable(_)) => true,
            _ => false,
        }
    }
}
