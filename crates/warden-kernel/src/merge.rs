//! Merge-time safety guard
//!
//! A branch may merge only when its base still equals `origin/main`, CI
//! validated exactly the branch head, CI passed, and that run is the
//! latest one for the branch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ci::{CiReport, CiState};

/// Inputs the guard compares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeGuardContext {
    /// origin/main head the branch was cut from
    pub branch_base_sha: String,
    /// origin/main head observed at check time
    pub origin_main_sha_at_check: String,
    /// Commit the CI run validated
    pub ci_validated_sha: String,
    /// Isolation branch head
    pub branch_head_sha: String,
    /// CI verdict
    pub ci_status: CiState,
    /// False when a newer run exists for the branch
    pub is_latest_run: bool,
}

impl MergeGuardContext {
    /// Context from the frozen base, fresh `origin/main`, the branch head and a CI report
    pub fn new(
        branch_base_sha: impl Into<String>,
        origin_main_sha: impl Into<String>,
        branch_head_sha: impl Into<String>,
        ci: &CiReport,
    ) -> Self {
        Self {
            branch_base_sha: branch_base_sha.into(),
            origin_main_sha_at_check: origin_main_sha.into(),
            ci_validated_sha: ci.validated_sha.clone(),
            branch_head_sha: branch_head_sha.into(),
            ci_status: ci.status,
            is_latest_run: ci.is_latest_run,
        }
    }
}

/// One failed guard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "guard", rename_all = "snake_case")]
pub enum GuardFailure {
    /// `origin/main` moved since planning
    StaleBase { base: String, origin: String },
    /// CI validated some other commit
    CiShaMismatch { validated: String, head: String },
    /// CI did not pass
    CiNotSuccess { status: CiState },
    /// A newer CI run exists
    CiNotLatest,
}

impl fmt::Display for GuardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleBase { base, origin } => {
                write!(f, "stale base: planned on {base}, origin/main is {origin}")
            }
            Self::CiShaMismatch { validated, head } => {
                write!(f, "ci validated {validated}, branch head is {head}")
            }
            Self::CiNotSuccess { status } => write!(f, "ci status is {status}"),
            Self::CiNotLatest => f.write_str("ci run is not the latest for the branch"),
        }
    }
}

/// Guard result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCheck {
    /// Inputs the guard was evaluated on
    pub context: MergeGuardContext,
    /// Every failing guard, in evaluation order
    pub failures: Vec<GuardFailure>,
    /// When the guard ran
    pub checked_at: DateTime<Utc>,
}

impl MergeCheck {
    /// True when every merge condition held
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// The base moved; only a stale failure resolves this
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, GuardFailure::StaleBase { .. }))
    }
}

/// Stateless evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeGuard;

impl MergeGuard {
    /// Evaluate every guard
    #[must_use]
    pub fn check(ctx: &MergeGuardContext) -> MergeCheck {
        let mut failures = Vec::new();
        if ctx.branch_base_sha != ctx.origin_main_sha_at_check {
            failures.push(GuardFailure::StaleBase {
                base: ctx.branch_base_sha.clone(),
                origin: ctx.origin_main_sha_at_check.clone(),
            });
        }
        if ctx.ci_validated_sha != ctx.branch_head_sha {
            failures.push(GuardFailure::CiShaMismatch {
                validated: ctx.ci_validated_sha.clone(),
                head: ctx.branch_head_sha.clone(),
            });
        }
        if ctx.ci_status != CiState::Success {
            failures.push(GuardFailure::CiNotSuccess { status: ctx.ci_status });
        }
        if !ctx.is_latest_run {
            failures.push(GuardFailure::CiNotLatest);
        }
        if failures.is_empty() {
            tracing::info!(head = %ctx.branch_head_sha, "merge guard passed");
        } else {
            tracing::warn!(failures = failures.len(), "merge guard failed");
        }
        MergeCheck {
            context: ctx.clone(),
            failures,
            checked_at: Utc::now(),
        }
    }

    /// All four guards hold
    #[must_use]
    pub fn can_merge(ctx: &MergeGuardContext) -> bool {
        Self::check(ctx).passed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MergeGuardContext {
        MergeGuardContext {
            branch_base_sha: "aaa".into(),
            origin_main_sha_at_check: "aaa".into(),
            ci_validated_sha: "head".into(),
            branch_head_sha: "head".into(),
            ci_status: CiState::Success,
            is_latest_run: true,
        }
    }

    #[test]
    fn all_guards_hold() {
        assert!(MergeGuard::can_merge(&ctx()));
    }

    #[test]
    fn ci_on_parent_commit_is_rejected() {
        let mut c = ctx();
        c.ci_validated_sha = "parent".into();
        let check = MergeGuard::check(&c);
        assert_eq!(
            check.failures,
            vec![GuardFailure::CiShaMismatch {
                validated: "parent".into(),
                head: "head".into()
            }]
        );
        assert!(!check.is_stale());
    }

    #[test]
    fn moved_origin_is_stale() {
        let mut c = ctx();
        c.origin_main_sha_at_check = "bbb".into();
        assert!(MergeGuard::check(&c).is_stale());
    }

    #[test]
    fn every_failure_is_reported() {
        let c = MergeGuardContext {
            branch_base_sha: "a".into(),
            origin_main_sha_at_check: "b".into(),
            ci_validated_sha: "c".into(),
            branch_head_sha: "d".into(),
            ci_status: CiState::Running,
            is_latest_run: false,
        };
        assert_eq!(MergeGuard::check(&c).failures.len(), 4);
    }
}
