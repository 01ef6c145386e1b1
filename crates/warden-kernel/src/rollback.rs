//! Rollback protocol run on every failure path

use serde::Serialize;

use crate::locks::ExecutionLocks;
use crate::vcs::Vcs;

/// What a rollback did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// Branch that was reset; `None` before isolation
    pub branch: Option<String>,
    /// Reset error, if the reset itself failed
    pub reset_error: Option<String>,
    /// Locks released for the task
    pub locks_released: usize,
}

impl RollbackReport {
    /// The working tree is back at the last commit (or was never touched)
    #[must_use]
    pub fn clean(&self) -> bool {
        self.reset_error.is_none()
    }
}

/// Reset the isolation branch, if any, then release every lock
///
/// Locks are released even when the reset fails.
pub fn rollback(branch: Option<&str>, vcs: &dyn Vcs, locks: &ExecutionLocks) -> RollbackReport {
    let reset_error = match branch {
        None => {
            tracing::debug!("rollback before isolation: nothing to reset");
            None
        }
        Some(b) => match vcs.hard_reset_to_last_commit(b) {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(branch = b, error = %e, "rollback reset failed");
                Some(e.to_string())
            }
        },
    };
    let locks_released = locks.release_all();
    RollbackReport {
        branch: branch.map(str::to_string),
        reset_error,
        locks_released,
    }
}
