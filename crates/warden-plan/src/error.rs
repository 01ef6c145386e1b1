use crate::command::CommandError;
use crate::hash::{ContentHash, HashError};
use crate::scope::{DirtyTree, ScopeViolation};

/// Errors raised while freezing or enforcing a plan
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Plan content is malformed
    #[error("invalid plan: {0}")]
    Invalid(String),

    /// A planned command failed validation
    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    /// Declared scope exceeds the file cap
    #[error("plan declares {declared} files, cap is {cap}")]
    ScopeTooLarge { declared: usize, cap: usize },

    /// A change landed outside the declared scope
    #[error(transparent)]
    Scope(#[from] ScopeViolation),

    /// Planning started on a dirty tree
    #[error(transparent)]
    DirtyTree(#[from] DirtyTree),

    /// Package installation outside the frozen install command
    #[error("implicit dependency installation blocked: {0}")]
    ImplicitInstall(String),

    /// Frozen content no longer matches its hash
    #[error("plan hash mismatch: frozen {expected}, recomputed {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Lockfiles changed since planning
    #[error("lockfile hash mismatch: frozen {}, current {}", expected.short(), actual.short())]
    LockfileMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Declared dependency scored at or above the risk threshold
    #[error("dependency {name} scored {score:.2}, threshold {threshold:.2}")]
    RiskyDependency {
        name: String,
        score: f32,
        threshold: f32,
    },

    /// Oracle sampling policy is not deterministic
    #[error("sampling policy must be deterministic (temperature {temperature}, top_p {top_p})")]
    NonDeterministicSampling { temperature: f32, top_p: f32 },

    /// Hashing failure
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlanError {
    /// Violations that end the task in the scope failure state
    #[inline]
    #[must_use]
    pub fn is_scope_failure(&self) -> bool {
        matches!(self, Self::Scope(_) | Self::ScopeTooLarge { .. })
    }
}
