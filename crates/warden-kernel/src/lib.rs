//! Warden Kernel
//!
//! Governance for an autonomous code-modification agent. A task moves
//! through a fixed lifecycle; every move goes through one controller that
//! checks invariants, writes a hash-chained audit record and rolls the
//! isolation branch back on failure.
//!
//! # Lifecycle
//!
//! ```text
//! INTENT_ANALYSIS → REPO_DISCOVERY → PLANNING → PROVING_GROUND
//!     → IMPLEMENTING ⇄ VERIFYING → COMPLETE
//! ```
//!
//! Any working state may park in FEEDBACK_WAIT, and any non-terminal state
//! may be forced into FAILED_BY_TIMEOUT, FAILED_BY_INTERRUPT,
//! FAILED_STALE or FAILED_SCOPE.
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_kernel::{Collaborators, TaskPipeline, WardenConfig};
//!
//! let pipeline = TaskPipeline::new(WardenConfig::discover(&repo)?, collaborators)?;
//! let (task, outcome) = pipeline.run("add a /health endpoint").await?;
//! if outcome.is_paused() {
//!     pipeline.resume(&task, Approval::approve("looks right")).await?;
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod audit;
mod budget;
mod ci;
mod config;
mod controller;
mod error;
mod invariants;
mod locks;
mod merge;
mod pipeline;
mod planner;
mod policy;
mod rollback;
mod state;
mod supervisor;
mod task;
mod test_quality;
mod vcs;
mod verify;

pub use audit::{verify_chain, AuditLog, TransitionOutcome, TransitionRecord};
pub use budget::{BudgetDimension, BudgetExceeded, BudgetUsage, RiskBudget};
pub use ci::{CiReport, CiState, CiStatusSource, LocalCi};
pub use config::{WardenConfig, CONFIG_FILE};
pub use controller::{ForceOutcome, GovernanceController};
pub use error::{AuditError, CiError, ConfigError, PipelineError, TransitionRejection, VcsError};
pub use invariants::{check_entry, check_exit, InvariantLimits, InvariantPhase, InvariantViolation};
pub use locks::{ExecutionLocks, LockGuard, LockHeld, LockKind};
pub use merge::{GuardFailure, MergeCheck, MergeGuard, MergeGuardContext};
pub use pipeline::{select_relevant_files, Collaborators, RunningTask, TaskOutcome, TaskPipeline};
pub use planner::Planner;
pub use policy::{
    actions, AllowAll, CapabilityCheck, CommandPolicy, CommandVerdict, DependencyRisk, GateDenial, InstallIsNetwork,
    NoDependencyRisk, PolicyGates,
};
pub use rollback::{rollback, RollbackReport};
pub use state::{allowed_transitions, validate_transition, ForcedTrigger, State};
pub use supervisor::{Supervisor, DEFAULT_RUNTIME_CAP};
pub use task::{Approval, ApprovalRequest, Evidence, IntentRecord, RedTest, RepoMap, Task, TaskId};
pub use test_quality::{assess_test, sut_modules, TestQuality, TestSmell};
pub use vcs::{GitVcs, Vcs, VcsTree};
pub use verify::{
    CheckFailure, GovernanceCheck, GovernanceResult, TierResult, VerificationReport, VerificationRoute,
    VerificationTier, Verifier,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
