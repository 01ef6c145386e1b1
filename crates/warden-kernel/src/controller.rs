//! Governance controller
//!
//! The single authority allowed to change a task's state. Every
//! transition, ordinary or forced, is decided under one per-task mutex, so
//! the audit log sees a total order and exactly one terminal transition
//! ever applies.
//!
//! Ordinary transitions check, in order: terminal state, the transition
//! table, the current state's exit invariant and the target's entry
//! invariant. Transitions into a `FAILED_*` state skip the invariants and
//! run the rollback protocol before the state changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use warden_plan::PlanEnvelope;

use crate::audit::{AuditLog, TransitionOutcome};
use crate::error::TransitionRejection;
use crate::invariants::{check_entry, check_exit, InvariantLimits, InvariantPhase};
use crate::locks::ExecutionLocks;
use crate::rollback::{rollback, RollbackReport};
use crate::state::{validate_transition, ForcedTrigger, State};
use crate::task::{Approval, ApprovalRequest, Evidence, Task, TaskId};
use crate::vcs::Vcs;

/// Result of a forced terminal transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceOutcome {
    /// The task moved from `from` into the trigger's failure state
    Applied { from: State, rollback: RollbackReport },
    /// The task was already terminal; the attempt was audited and discarded
    Discarded { state: State, rollback: RollbackReport },
}

impl ForceOutcome {
    /// True when this call moved the task; false when it was already terminal
    #[must_use]
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Owns one task and arbitrates every change to it
pub struct GovernanceController {
    task: Mutex<Task>,
    vcs: Arc<dyn Vcs>,
    locks: Arc<ExecutionLocks>,
    limits: InvariantLimits,
}

impl std::fmt::Debug for GovernanceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let task = self.task.lock();
        f.debug_struct("GovernanceController")
            .field("task", &task.id)
            .field("state", &task.state)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl GovernanceController {
    /// Controller owning `task`; every state change goes through it
    pub fn new(task: Task, vcs: Arc<dyn Vcs>, locks: Arc<ExecutionLocks>, limits: InvariantLimits) -> Self {
        Self {
            task: Mutex::new(task),
            vcs,
            locks,
            limits,
        }
    }

    /// Task identifier
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.lock().id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> State {
        self.task.lock().state
    }

    /// Shared handle to the transition log
    #[must_use]
    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.task.lock().audit)
    }

    /// Locks held on behalf of tasks
    #[must_use]
    pub fn locks(&self) -> &Arc<ExecutionLocks> {
        &self.locks
    }

    /// Limits invariants are checked against
    #[must_use]
    pub fn limits(&self) -> &InvariantLimits {
        &self.limits
    }

    /// Read the task under the transition mutex
    pub fn inspect<R>(&self, f: impl FnOnce(&Task) -> R) -> R {
        f(&self.task.lock())
    }

    /// Record evidence under the transition mutex
    pub fn record<R>(&self, f: impl FnOnce(&mut Evidence) -> R) -> R {
        f(&mut self.task.lock().evidence)
    }

    /// Store the frozen plan; it can never be replaced
    ///
    /// # Errors
    /// [`TransitionRejection::EnvelopeAlreadyFrozen`], or
    /// [`TransitionRejection::AlreadyTerminal`]
    pub fn freeze_envelope(&self, envelope: PlanEnvelope) -> Result<(), TransitionRejection> {
        let mut task = self.task.lock();
        if task.state.is_terminal() {
            return Err(TransitionRejection::AlreadyTerminal { state: task.state });
        }
        if task.envelope.is_some() {
            return Err(TransitionRejection::EnvelopeAlreadyFrozen);
        }
        tracing::info!(task = %task.id, plan = %envelope.plan_envelope_hash().short(), "plan envelope recorded");
        task.envelope = Some(envelope);
        Ok(())
    }

    /// Record the isolation branch
    ///
    /// # Errors
    /// [`TransitionRejection::IsolationBeforeFreeze`] without a frozen envelope
    pub fn set_branch(&self, branch: impl Into<String>) -> Result<(), TransitionRejection> {
        let mut task = self.task.lock();
        if task.envelope.is_none() {
            return Err(TransitionRejection::IsolationBeforeFreeze);
        }
        task.branch = Some(branch.into());
        Ok(())
    }

    /// Accumulate runtime spent outside FEEDBACK_WAIT
    pub fn add_active_time(&self, elapsed: Duration) {
        let mut task = self.task.lock();
        task.active_time += elapsed;
    }

    /// Ordinary transition request
    ///
    /// Returns the state the task left.
    ///
    /// # Errors
    /// [`TransitionRejection`] naming the failed check; the task is unchanged
    pub fn attempt_transition(&self, next: State, detail: impl Into<String>) -> Result<State, TransitionRejection> {
        let detail = detail.into();
        let mut task = self.task.lock();
        self.transition_locked(&mut task, next, &detail)
    }

    fn transition_locked(&self, task: &mut Task, next: State, detail: &str) -> Result<State, TransitionRejection> {
        let from = task.state;

        if from.is_terminal() {
            self.discard(task, next, None, detail);
            return Err(TransitionRejection::AlreadyTerminal { state: from });
        }
        if let Err(rejection) = validate_transition(from, next) {
            return Err(self.audit_rejection(task, next, rejection, detail));
        }
        if let Some(trigger) = ForcedTrigger::for_state(next) {
            self.apply_forced(task, trigger, detail);
            return Ok(from);
        }
        if let Err(violation) = check_exit(task, next, &self.limits) {
            let rejection = TransitionRejection::Invariant {
                state: from,
                phase: InvariantPhase::Exit,
                violation,
            };
            return Err(self.audit_rejection(task, next, rejection, detail));
        }
        if let Err(violation) = check_entry(task, next, &self.limits) {
            let rejection = TransitionRejection::Invariant {
                state: next,
                phase: InvariantPhase::Entry,
                violation,
            };
            return Err(self.audit_rejection(task, next, rejection, detail));
        }

        task.state = next;
        if from == State::FeedbackWait {
            task.evidence.approval_request = None;
            task.evidence.approval = None;
        }
        task.audit.append(task.id, from, next, TransitionOutcome::Applied, detail);
        tracing::info!(task = %task.id, %from, to = %next, "transition applied");

        if next == State::Complete {
            self.locks.release_all();
        }
        Ok(from)
    }

    /// Audit a rejection decided outside the controller, e.g. by a policy gate
    pub fn reject(&self, next: State, cause: impl Into<String>) -> TransitionRejection {
        let task = self.task.lock();
        let rejection = TransitionRejection::Gate(cause.into());
        self.audit_rejection(&task, next, rejection, "")
    }

    /// Forced transition into the trigger's failure state
    ///
    /// Invariants are skipped. Rollback runs before the state changes; when
    /// the task is already terminal the attempt is discarded and rollback
    /// still runs.
    pub fn force_terminal(&self, trigger: ForcedTrigger, detail: impl Into<String>) -> ForceOutcome {
        let detail = detail.into();
        let mut task = self.task.lock();
        if task.state.is_terminal() {
            let rollback = self.discard(&task, trigger.target(), Some(trigger), &detail);
            return ForceOutcome::Discarded {
                state: task.state,
                rollback,
            };
        }
        let from = task.state;
        let rollback = self.apply_forced(&mut task, trigger, &detail);
        ForceOutcome::Applied { from, rollback }
    }

    /// Record why human input is needed, then move to FEEDBACK_WAIT
    ///
    /// The request and the transition happen under one lock; a refused
    /// escalation leaves the previous request in place.
    ///
    /// # Errors
    /// [`TransitionRejection`] when escalation itself is refused
    pub fn request_approval(&self, reason: impl Into<String>, resume_to: State) -> Result<State, TransitionRejection> {
        let reason = reason.into();
        let mut task = self.task.lock();
        if task.state.is_terminal() {
            self.discard(&task, State::FeedbackWait, None, &reason);
            return Err(TransitionRejection::AlreadyTerminal { state: task.state });
        }
        let prior_request = task.evidence.approval_request.replace(ApprovalRequest {
            reason: reason.clone(),
            requested_at: Utc::now(),
            resume_to,
        });
        let prior_approval = task.evidence.approval.take();

        match self.transition_locked(&mut task, State::FeedbackWait, &reason) {
            Ok(from) => {
                tracing::warn!(task = %task.id, %reason, resume_to = %resume_to, "escalated to feedback wait");
                Ok(from)
            }
            Err(rejection) => {
                task.evidence.approval_request = prior_request;
                task.evidence.approval = prior_approval;
                Err(rejection)
            }
        }
    }

    /// Attach a human decision to the pending request
    ///
    /// # Errors
    /// [`TransitionRejection::NoPendingApproval`] outside FEEDBACK_WAIT
    pub fn submit_approval(&self, approval: Approval) -> Result<ApprovalRequest, TransitionRejection> {
        let mut task = self.task.lock();
        if task.state != State::FeedbackWait {
            return Err(TransitionRejection::NoPendingApproval);
        }
        let request = task
            .evidence
            .approval_request
            .clone()
            .ok_or(TransitionRejection::NoPendingApproval)?;
        tracing::info!(task = %task.id, approved = approval.approved, "approval submitted");
        task.evidence.approval = Some(approval);
        Ok(request)
    }

    /// Reset the isolation branch without changing state
    pub fn rollback(&self) -> RollbackReport {
        let task = self.task.lock();
        rollback(task.branch.as_deref(), self.vcs.as_ref(), &self.locks)
    }

    fn apply_forced(&self, task: &mut Task, trigger: ForcedTrigger, detail: &str) -> RollbackReport {
        let from = task.state;
        let to = trigger.target();
        let report = rollback(task.branch.as_deref(), self.vcs.as_ref(), &self.locks);
        task.state = to;
        let detail = match &report.reset_error {
            Some(e) => format!("{detail} (rollback reset failed: {e})"),
            None => detail.to_string(),
        };
        task.audit
            .append(task.id, from, to, TransitionOutcome::Forced { trigger }, detail);
        tracing::error!(task = %task.id, %from, %to, %trigger, "forced terminal transition");
        report
    }

    fn discard(&self, task: &Task, attempted: State, trigger: Option<ForcedTrigger>, detail: &str) -> RollbackReport {
        task.audit.append(
            task.id,
            task.state,
            attempted,
            TransitionOutcome::Discarded { trigger },
            detail,
        );
        tracing::warn!(task = %task.id, state = %task.state, %attempted, "transition discarded, task already terminal");
        rollback(task.branch.as_deref(), self.vcs.as_ref(), &self.locks)
    }

    fn audit_rejection(
        &self,
        task: &Task,
        next: State,
        rejection: TransitionRejection,
        detail: &str,
    ) -> TransitionRejection {
        task.audit.append(
            task.id,
            task.state,
            next,
            TransitionOutcome::Rejected {
                cause: rejection.cause(),
            },
            detail,
        );
        tracing::warn!(task = %task.id, from = %task.state, to = %next, %rejection, "transition rejected");
        rejection
    }
}
