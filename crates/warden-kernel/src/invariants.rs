//! Exit and entry invariants per state
//!
//! Exit invariants have a safety half (read-only and scope conditions)
//! and a progress half (the state produced what it exists to produce).
//! Escalation to FEEDBACK_WAIT only needs the safety half; every other
//! target needs both. Entry invariants are checked against the target.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use warden_plan::{FileChange, MAX_FILE_CAP};

use crate::budget::{BudgetExceeded, RiskBudget};
use crate::merge::GuardFailure;
use crate::state::State;
use crate::task::Task;

/// Which side of a transition failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantPhase {
    Exit,
    Entry,
}

impl fmt::Display for InvariantPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exit => "exit",
            Self::Entry => "entry",
        })
    }
}

/// A failed invariant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("intent has not been recorded")]
    IntentMissing,

    #[error("working tree mutated during a read-only state: {}", render(.0))]
    ReadOnlyMutation(Vec<FileChange>),

    #[error("repository map has not been recorded")]
    RepoMapMissing,

    #[error("repository map lists {files} files, cap is {cap}")]
    RepoMapTooLarge { files: usize, cap: usize },

    #[error("plan envelope has not been frozen")]
    EnvelopeMissing,

    #[error("plan envelope failed re-verification: {0}")]
    EnvelopeTampered(String),

    #[error("isolation branch has not been created")]
    BranchMissing,

    #[error("no red test has been registered")]
    RedTestMissing,

    #[error("red test {0} was never observed failing")]
    RedTestNotFailing(String),

    #[error("implementation retries {retries} exceed budget {budget}")]
    RetryBudgetExceeded { retries: u32, budget: u32 },

    #[error("risk budget exhausted: {0}")]
    RiskBudgetExhausted(BudgetExceeded),

    #[error("changes outside declared scope: {}", render(.0))]
    ScopeViolated(Vec<FileChange>),

    #[error("verification report has not been recorded")]
    VerificationMissing,

    #[error("verification did not pass")]
    VerificationFailed,

    #[error("merge guard has not been evaluated")]
    MergeCheckMissing,

    #[error("merge guard failed: {}", render_guards(.0))]
    MergeGuardFailed(Vec<GuardFailure>),

    #[error("no approval request is pending")]
    ApprovalNotRequested,

    #[error("no approval has been submitted")]
    ApprovalMissing,

    #[error("approval was denied")]
    ApprovalDenied,

    #[error("approval arrived after the {window_secs}s window")]
    ApprovalExpired { window_secs: u64 },
}

impl InvariantViolation {
    /// Violations that only a scope failure can resolve
    #[inline]
    #[must_use]
    pub fn is_scope(&self) -> bool {
        matches!(
            self,
            Self::ReadOnlyMutation(_) | Self::ScopeViolated(_) | Self::RepoMapTooLarge { .. }
        )
    }

    /// Violations that end the task like the runtime cap does
    #[inline]
    #[must_use]
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::RiskBudgetExhausted(_))
    }
}

fn render(changes: &[FileChange]) -> String {
    changes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_guards(failures: &[GuardFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Limits the invariants are evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvariantLimits {
    /// Largest repo map or plan scope
    pub max_file_cap: usize,
    /// Restarts allowed in IMPLEMENTING
    pub implement_retry_budget: u32,
    /// How long an approval request stays valid
    pub approval_window: Duration,
    /// Change-size and command-count limits
    pub budget: RiskBudget,
}

impl Default for InvariantLimits {
    fn default() -> Self {
        Self {
            max_file_cap: MAX_FILE_CAP,
            implement_retry_budget: 3,
            approval_window: Duration::from_secs(24 * 60 * 60),
            budget: RiskBudget::default(),
        }
    }
}

/// Exit invariant of `task.state()` for a move to `next`
///
/// # Errors
/// The first failing condition
pub fn check_exit(task: &Task, next: State, limits: &InvariantLimits) -> Result<(), InvariantViolation> {
    let ev = task.evidence();
    let escalating = next == State::FeedbackWait;

    match task.state() {
        State::IntentAnalysis => {
            read_only(task)?;
            if !escalating && ev.intent.is_none() {
                return Err(InvariantViolation::IntentMissing);
            }
        }
        State::RepoDiscovery => {
            read_only(task)?;
            if let Some(map) = &ev.repo_map {
                if map.files.len() > limits.max_file_cap {
                    return Err(InvariantViolation::RepoMapTooLarge {
                        files: map.files.len(),
                        cap: limits.max_file_cap,
                    });
                }
            } else if !escalating {
                return Err(InvariantViolation::RepoMapMissing);
            }
        }
        State::Planning => {
            if !escalating {
                let envelope = task.envelope().ok_or(InvariantViolation::EnvelopeMissing)?;
                envelope
                    .verify_integrity()
                    .map_err(|e| InvariantViolation::EnvelopeTampered(e.to_string()))?;
            }
        }
        State::ProvingGround => {
            in_scope(task)?;
            if !escalating {
                red_tests_failing(task)?;
            }
        }
        State::Implementing => {
            in_scope(task)?;
            within_risk_budget(task, limits)?;
            if !escalating {
                within_budget(task, limits)?;
            }
        }
        State::Verifying => {
            in_scope(task)?;
            within_risk_budget(task, limits)?;
            if !escalating && ev.verification.is_none() {
                return Err(InvariantViolation::VerificationMissing);
            }
        }
        State::FeedbackWait => approval_granted(task, limits)?,
        State::Complete
        | State::FailedByStale
        | State::FailedByInterrupt
        | State::FailedByTimeout
        | State::FailedByScope => {}
    }
    Ok(())
}

/// Entry invariant of `next`
///
/// # Errors
/// The first failing condition
pub fn check_entry(task: &Task, next: State, limits: &InvariantLimits) -> Result<(), InvariantViolation> {
    let ev = task.evidence();
    match next {
        State::RepoDiscovery => {
            if ev.intent.is_none() {
                return Err(InvariantViolation::IntentMissing);
            }
        }
        State::Planning => {
            if ev.repo_map.is_none() {
                return Err(InvariantViolation::RepoMapMissing);
            }
        }
        State::ProvingGround => {
            envelope_and_branch(task)?;
        }
        State::Implementing => {
            envelope_and_branch(task)?;
            red_tests_failing(task)?;
            within_budget(task, limits)?;
        }
        State::Verifying => {
            if task.envelope().is_none() {
                return Err(InvariantViolation::EnvelopeMissing);
            }
        }
        State::FeedbackWait => {
            if ev.approval_request.is_none() {
                return Err(InvariantViolation::ApprovalNotRequested);
            }
        }
        State::Complete => {
            match &ev.verification {
                None => return Err(InvariantViolation::VerificationMissing),
                Some(report) if !report.passed() => return Err(InvariantViolation::VerificationFailed),
                Some(_) => {}
            }
            match &ev.merge_check {
                None => return Err(InvariantViolation::MergeCheckMissing),
                Some(check) if !check.passed() => {
                    return Err(InvariantViolation::MergeGuardFailed(check.failures.clone()))
                }
                Some(_) => {}
            }
        }
        State::IntentAnalysis
        | State::FailedByStale
        | State::FailedByInterrupt
        | State::FailedByTimeout
        | State::FailedByScope => {}
    }
    Ok(())
}

fn read_only(task: &Task) -> Result<(), InvariantViolation> {
    let v = &task.evidence().readonly_violations;
    if v.is_empty() {
        Ok(())
    } else {
        Err(InvariantViolation::ReadOnlyMutation(v.clone()))
    }
}

fn in_scope(task: &Task) -> Result<(), InvariantViolation> {
    match &task.evidence().scope_violation {
        Some(v) => Err(InvariantViolation::ScopeViolated(v.offending.clone())),
        None => Ok(()),
    }
}

fn within_budget(task: &Task, limits: &InvariantLimits) -> Result<(), InvariantViolation> {
    let retries = task.evidence().implement_retries;
    if retries > limits.implement_retry_budget {
        return Err(InvariantViolation::RetryBudgetExceeded {
            retries,
            budget: limits.implement_retry_budget,
        });
    }
    Ok(())
}

fn within_risk_budget(task: &Task, limits: &InvariantLimits) -> Result<(), InvariantViolation> {
    match limits.budget.exhausted(&task.evidence().budget) {
        Some(over) => Err(InvariantViolation::RiskBudgetExhausted(over)),
        None => Ok(()),
    }
}

fn envelope_and_branch(task: &Task) -> Result<(), InvariantViolation> {
    if task.envelope().is_none() {
        return Err(InvariantViolation::EnvelopeMissing);
    }
    if task.branch().is_none() {
        return Err(InvariantViolation::BranchMissing);
    }
    Ok(())
}

fn red_tests_failing(task: &Task) -> Result<(), InvariantViolation> {
    let tests = &task.evidence().red_tests;
    if tests.is_empty() {
        return Err(InvariantViolation::RedTestMissing);
    }
    match tests.iter().find(|t| !t.observed_failing) {
        Some(t) => Err(InvariantViolation::RedTestNotFailing(t.path.clone())),
        None => Ok(()),
    }
}

fn approval_granted(task: &Task, limits: &InvariantLimits) -> Result<(), InvariantViolation> {
    let ev = task.evidence();
    let request = ev.approval_request.as_ref().ok_or(InvariantViolation::ApprovalNotRequested)?;
    let approval = ev.approval.as_ref().ok_or(InvariantViolation::ApprovalMissing)?;
    let waited = (approval.decided_at - request.requested_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    if waited > limits.approval_window {
        return Err(InvariantViolation::ApprovalExpired {
            window_secs: limits.approval_window.as_secs(),
        });
    }
    if !approval.approved {
        return Err(InvariantViolation::ApprovalDenied);
    }
    Ok(())
}
