//! Warden Exec
//!
//! Multi-stack command execution for governed tasks.
//!
//! - [`StackProfileRegistry`]: static stack table (binaries, fallback lint, timeout hint)
//! - [`classify`]: command → timeout bucket, background flag, port
//! - [`ErrorExtractor`]: output → ordered `(file, line, message)` locations
//! - [`ExecutionEngine`]: foreground/background runs and the self-healing loop
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_exec::{EngineConfig, ExecutionEngine, HealingContext, StackProfileRegistry};
//!
//! let engine = ExecutionEngine::new(EngineConfig::new(repo_root));
//! let profile = StackProfileRegistry::new().lookup(&envelope.content().stack);
//! engine.precheck(profile, envelope.content().commands())?;
//!
//! let report = engine.run_with_healing(&test_command, profile, &ctx).await;
//! assert!(report.session.attempts() <= 3);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod background;
mod classify;
mod engine;
mod error;
mod extract;
mod failure;
mod healing;
mod health;
mod oracle;
mod precheck;
mod profile;
mod runner;
mod workspace;

pub use background::{BackgroundProcesses, ServerInfo};
pub use classify::{classify, infer_port, CommandClass, TimeoutBucket};
pub use engine::{
    EngineConfig, ExecutionAttempt, ExecutionEngine, HealingContext, NoRedaction, OutputRedactor,
    MAX_HEAL_ATTEMPTS,
};
pub use error::ExecError;
pub use extract::{ErrorExtractor, ErrorLocation};
pub use failure::{classify_failure, FailureKind, ToolFailure};
pub use healing::{CommandReport, CycleKind, HealingOutcome, HealingRecord, HealingSession};
pub use health::{HealthChecker, HealthStatus};
pub use oracle::{CodeOracle, FilePatch, FixRequest, OracleError, Patch};
pub use precheck::{check_binaries, install_hint, required_binaries, BinaryResolver, MissingBinary, PathResolver};
pub use profile::{StackProfile, StackProfileRegistry};
pub use runner::{CommandRunner, ExitState, RawOutcome, ServerProcess, ShellRunner};
pub use workspace::{FsWorkspace, TreeStatus, Workspace, WorkspaceError};
