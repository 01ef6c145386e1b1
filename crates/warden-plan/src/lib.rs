//! Warden Plan
//!
//! The immutable side of a task: what the planner saw, what it declared,
//! and the hashes that pin both.
//!
//! # Core Concepts
//!
//! - [`InputSnapshot`]: request, repo map, base tree and toolchain, hashed once
//! - [`PlanEnvelope`]: frozen commands, file scope and lockfile hash
//! - [`CommandSpec`]: a validated command literal tagged with its role
//! - [`FileScope`] / [`FileChange`]: declared paths vs observed changes
//! - [`ReplayLog`]: hashes of every oracle exchange under a fixed [`SamplingPolicy`]
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_plan::{InputSnapshot, PlanEnvelope, FreezeLimits};
//!
//! let snapshot = InputSnapshot::new(request, repo_map, tree_sha, toolchain);
//! let content = planner.propose_plan(&snapshot).await?;
//! let envelope = PlanEnvelope::freeze(content, snapshot.hash(), base_sha, &FreezeLimits::default())?;
//!
//! // later, while implementing
//! envelope.check_changes(&vcs.status()?)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod command;
mod envelope;
mod error;
mod hash;
mod lockfile;
mod replay;
mod scope;
mod snapshot;

pub use command::{is_package_install, CommandError, CommandRole, CommandSpec, CommandText, MAX_COMMAND_LEN};
pub use envelope::{FreezeLimits, PlanContent, PlanEnvelope, MAX_FILE_CAP};
pub use error::PlanError;
pub use hash::{ContentHash, FieldHasher, HashError};
pub use lockfile::{compute_lockfile_hash, no_lockfiles_hash, DEFAULT_LOCKFILES};
pub use replay::{OracleCall, ReplayEntry, ReplayLog, SamplingPolicy};
pub use scope::{
    check_clean_tree, normalize_path, parse_porcelain, ChangeKind, DirtyTree, FileChange, FileScope,
    ScopeViolation,
};
pub use snapshot::{InputSnapshot, ToolchainManifest};
