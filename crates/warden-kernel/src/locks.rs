//! Execution locks held while a task mutates shared resources

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Resource a task may hold exclusively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Working tree writes
    Filesystem,
    /// Package manager runs
    DependencyInstall,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Filesystem => "filesystem",
            Self::DependencyInstall => "dependency_install",
        })
    }
}

/// A lock another task already holds
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} lock is held by {owner}")]
pub struct LockHeld {
    /// Contended lock
    pub kind: LockKind,
    /// Holder's task id
    pub owner: String,
}

/// Lock table shared by everything working on a repository
#[derive(Debug, Default)]
pub struct ExecutionLocks {
    held: Mutex<HashMap<LockKind, String>>,
}

impl ExecutionLocks {
    /// No locks held
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take `kind` for `owner`; released when the guard drops
    ///
    /// # Errors
    /// [`LockHeld`] when someone else holds it
    pub fn acquire(self: &Arc<Self>, kind: LockKind, owner: impl Into<String>) -> Result<LockGuard, LockHeld> {
        let owner = owner.into();
        let mut held = self.held.lock();
        if let Some(current) = held.get(&kind) {
            return Err(LockHeld {
                kind,
                owner: current.clone(),
            });
        }
        held.insert(kind, owner.clone());
        tracing::debug!(%kind, %owner, "lock acquired");
        Ok(LockGuard {
            locks: Arc::clone(self),
            kind,
            owner,
        })
    }

    /// Release everything regardless of owner; returns how many were held
    pub fn release_all(&self) -> usize {
        let mut held = self.held.lock();
        let n = held.len();
        held.clear();
        if n > 0 {
            tracing::info!(released = n, "execution locks released");
        }
        n
    }

    /// Current holders, ordered by kind
    #[must_use]
    pub fn held(&self) -> Vec<(LockKind, String)> {
        let mut out: Vec<_> = self.held.lock().iter().map(|(k, o)| (*k, o.clone())).collect();
        out.sort();
        out
    }

    fn release(&self, kind: LockKind, owner: &str) {
        let mut held = self.held.lock();
        if held.get(&kind).is_some_and(|o| o == owner) {
            held.remove(&kind);
        }
    }
}

/// Releases its lock on drop, unless a forced release already did
#[derive(Debug)]
pub struct LockGuard {
    locks: Arc<ExecutionLocks>,
    kind: LockKind,
    owner: String,
}

impl LockGuard {
    /// Which lock this guard holds
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.release(self.kind, &self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_owner_is_refused() {
        let locks = ExecutionLocks::new();
        let _g = locks.acquire(LockKind::Filesystem, "task-a").unwrap();
        let err = locks.acquire(LockKind::Filesystem, "task-b").unwrap_err();
        assert_eq!(err.owner, "task-a");
        assert!(locks.acquire(LockKind::DependencyInstall, "task-b").is_ok());
    }

    #[test]
    fn guard_drop_releases() {
        let locks = ExecutionLocks::new();
        drop(locks.acquire(LockKind::Filesystem, "task-a").unwrap());
        assert!(locks.held().is_empty());
    }

    #[test]
    fn stale_guard_does_not_release_a_new_owner() {
        let locks = ExecutionLocks::new();
        let old = locks.acquire(LockKind::Filesystem, "task-a").unwrap();
        assert_eq!(locks.release_all(), 1);
        let _new = locks.acquire(LockKind::Filesystem, "task-b").unwrap();
        drop(old);
        assert_eq!(locks.held(), vec![(LockKind::Filesystem, "task-b".to_string())]);
    }
}
