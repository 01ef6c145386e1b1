use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use warden_kernel::{
    Approval, ExecutionLocks, ForceOutcome, ForcedTrigger, GovernanceController, InvariantLimits, InvariantPhase,
    InvariantViolation, LockKind, State, Task, TransitionOutcome, TransitionRejection, Vcs,
};
use warden_plan::{ChangeKind, ContentHash, FileChange, FreezeLimits, PlanEnvelope};
use warden_test_utils::{python_intent, python_plan, python_repo, InMemoryRepo};

fn controller_on(repo: &Arc<InMemoryRepo>) -> Arc<GovernanceController> {
    Arc::new(GovernanceController::new(
        Task::new("add /health"),
        Arc::clone(repo) as Arc<dyn Vcs>,
        ExecutionLocks::new(),
        InvariantLimits::default(),
    ))
}

fn controller() -> Arc<GovernanceController> {
    controller_on(&python_repo())
}

fn with_intent(c: &GovernanceController) {
    c.record(|ev| ev.intent = Some(python_intent()));
}

#[test]
fn test_illegal_transition_is_rejected_and_audited() {
    let c = controller();
    let err = c.attempt_transition(State::Planning, "skip ahead").unwrap_err();
    assert!(matches!(
        err,
        TransitionRejection::Illegal {
            from: State::IntentAnalysis,
            to: State::Planning
        }
    ));
    assert_eq!(c.state(), State::IntentAnalysis);

    let records = c.audit().records();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, TransitionOutcome::Rejected { .. }));
    assert_eq!(records[0].to, State::Planning);
}

#[test]
fn test_exit_invariant_requires_intent() {
    let c = controller();
    let err = c.attempt_transition(State::RepoDiscovery, "").unwrap_err();
    assert!(matches!(
        err,
        TransitionRejection::Invariant {
            phase: InvariantPhase::Exit,
            violation: InvariantViolation::IntentMissing,
            ..
        }
    ));

    with_intent(&c);
    assert_eq!(c.attempt_transition(State::RepoDiscovery, "").unwrap(), State::IntentAnalysis);
    assert_eq!(c.state(), State::RepoDiscovery);
}

#[test]
fn test_read_only_mutation_blocks_progress_as_a_scope_violation() {
    let c = controller();
    with_intent(&c);
    c.record(|ev| {
        ev.readonly_violations
            .push(FileChange::new("config.yaml", ChangeKind::Created));
    });
    let err = c.attempt_transition(State::RepoDiscovery, "").unwrap_err();
    assert!(err.violation().is_some_and(InvariantViolation::is_scope));
    assert_eq!(c.state(), State::IntentAnalysis);
}

#[test]
fn test_forced_transition_is_final() {
    let c = controller();
    let outcome = c.force_terminal(ForcedTrigger::Timeout, "cap exceeded");
    assert!(outcome.applied());
    assert_eq!(c.state(), State::FailedByTimeout);

    assert!(matches!(
        c.attempt_transition(State::RepoDiscovery, "late"),
        Err(TransitionRejection::AlreadyTerminal {
            state: State::FailedByTimeout
        })
    ));
    assert!(matches!(
        c.force_terminal(ForcedTrigger::Scope, "late"),
        ForceOutcome::Discarded {
            state: State::FailedByTimeout,
            ..
        }
    ));
    assert_eq!(c.state(), State::FailedByTimeout);

    let audit = c.audit();
    audit.verify_integrity().unwrap();
    let outcomes: Vec<_> = audit.records().into_iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            TransitionOutcome::Forced {
                trigger: ForcedTrigger::Timeout
            },
            TransitionOutcome::Discarded { trigger: None },
            TransitionOutcome::Discarded {
                trigger: Some(ForcedTrigger::Scope)
            },
        ]
    );
}

#[test]
fn test_forced_timeout_wins_any_race_with_an_ordinary_transition() {
    for _ in 0..64 {
        let c = controller();
        with_intent(&c);
        let barrier = Arc::new(Barrier::new(2));

        let mover = {
            let (c, barrier) = (Arc::clone(&c), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                let _ = c.attempt_transition(State::RepoDiscovery, "intent done");
            })
        };
        let watchdog = {
            let (c, barrier) = (Arc::clone(&c), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                c.force_terminal(ForcedTrigger::Timeout, "cap exceeded")
            })
        };
        mover.join().unwrap();
        assert!(watchdog.join().unwrap().applied());

        assert_eq!(c.state(), State::FailedByTimeout);
        let records = c.audit().records();
        assert_eq!(records.len(), 2);
        let forced = records
            .iter()
            .filter(|r| matches!(r.outcome, TransitionOutcome::Forced { .. }))
            .count();
        assert_eq!(forced, 1);
        c.audit().verify_integrity().unwrap();
    }
}

#[test]
fn test_escalation_needs_a_granted_approval() {
    let c = controller();
    with_intent(&c);
    c.request_approval("which framework?", State::IntentAnalysis).unwrap();
    assert_eq!(c.state(), State::FeedbackWait);

    let err = c.attempt_transition(State::IntentAnalysis, "").unwrap_err();
    assert_eq!(err.violation(), Some(&InvariantViolation::ApprovalMissing));

    let request = c.submit_approval(Approval::approve("flask")).unwrap();
    assert_eq!(request.resume_to, State::IntentAnalysis);
    c.attempt_transition(State::IntentAnalysis, "approved").unwrap();
    assert_eq!(c.state(), State::IntentAnalysis);
    c.inspect(|t| {
        assert!(t.evidence().approval_request.is_none());
        assert!(t.evidence().approval.is_none());
    });
}

#[test]
fn test_refused_escalation_keeps_the_pending_request() {
    let c = controller();
    c.request_approval("which framework?", State::IntentAnalysis).unwrap();
    c.submit_approval(Approval::approve("flask")).unwrap();

    let err = c.request_approval("second thoughts", State::Planning).unwrap_err();
    assert!(matches!(
        err,
        TransitionRejection::Illegal {
            from: State::FeedbackWait,
            to: State::FeedbackWait
        }
    ));
    c.inspect(|t| {
        let request = t.evidence().approval_request.clone().unwrap();
        assert_eq!(request.reason, "which framework?");
        assert_eq!(request.resume_to, State::IntentAnalysis);
        assert!(t.evidence().approval.as_ref().is_some_and(|a| a.approved));
    });
    c.attempt_transition(State::IntentAnalysis, "approved").unwrap();
}

#[test]
fn test_refused_escalation_records_no_request() {
    let repo = python_repo();
    let c = controller_on(&repo);
    c.record(|ev| ev.readonly_violations.push(FileChange::new("notes.txt", ChangeKind::Created)));

    let err = c.request_approval("stuck", State::IntentAnalysis).unwrap_err();
    assert!(err.violation().is_some_and(InvariantViolation::is_scope));
    assert_eq!(c.state(), State::IntentAnalysis);
    c.inspect(|t| assert!(t.evidence().approval_request.is_none()));
}

#[test]
fn test_denied_or_late_approval_cannot_resume() {
    let c = controller();
    c.request_approval("unclear", State::IntentAnalysis).unwrap();
    c.submit_approval(Approval::deny("no")).unwrap();
    let err = c.attempt_transition(State::IntentAnalysis, "").unwrap_err();
    assert_eq!(err.violation(), Some(&InvariantViolation::ApprovalDenied));

    let late = Approval {
        approved: true,
        decided_at: Utc::now() + ChronoDuration::days(2),
        note: String::new(),
    };
    c.submit_approval(late).unwrap();
    let err = c.attempt_transition(State::IntentAnalysis, "").unwrap_err();
    assert!(matches!(
        err.violation(),
        Some(InvariantViolation::ApprovalExpired { .. })
    ));
    assert_eq!(c.state(), State::FeedbackWait);
}

#[test]
fn test_submit_approval_outside_feedback_wait_is_refused() {
    let c = controller();
    assert!(matches!(
        c.submit_approval(Approval::approve("")),
        Err(TransitionRejection::NoPendingApproval)
    ));
}

#[test]
fn test_envelope_freezes_once_and_gates_isolation() {
    let repo = python_repo();
    let c = controller_on(&repo);
    assert!(matches!(
        c.set_branch("agent/task-x"),
        Err(TransitionRejection::IsolationBeforeFreeze)
    ));

    let envelope = PlanEnvelope::freeze(
        python_plan(),
        ContentHash::compute(b"snapshot"),
        repo.main_sha(),
        &FreezeLimits::default(),
    )
    .unwrap();
    c.freeze_envelope(envelope.clone()).unwrap();
    assert!(matches!(
        c.freeze_envelope(envelope),
        Err(TransitionRejection::EnvelopeAlreadyFrozen)
    ));
    c.set_branch("agent/task-x").unwrap();
}

#[test]
fn test_forced_failure_resets_the_branch_and_releases_locks() {
    let repo = python_repo();
    let c = controller_on(&repo);
    let envelope = PlanEnvelope::freeze(
        python_plan(),
        ContentHash::compute(b"snapshot"),
        repo.main_sha(),
        &FreezeLimits::default(),
    )
    .unwrap();
    c.freeze_envelope(envelope).unwrap();
    repo.create_branch("agent/task-x").unwrap();
    c.set_branch("agent/task-x").unwrap();

    let guard = c.locks().acquire(LockKind::Filesystem, "task").unwrap();
    repo.write("app.py", "broken(");
    repo.write("config.yaml", "debug: true\n");

    match c.force_terminal(ForcedTrigger::Scope, "config.yaml outside scope") {
        ForceOutcome::Applied { from, rollback } => {
            assert_eq!(from, State::IntentAnalysis);
            assert!(rollback.clean());
            assert_eq!(rollback.locks_released, 1);
        }
        other => panic!("expected an applied transition, got {other:?}"),
    }
    assert_eq!(c.state(), State::FailedByScope);
    assert!(repo.is_working_tree_clean().unwrap());
    assert_eq!(repo.file("config.yaml"), None);
    assert!(c.locks().held().is_empty());
    drop(guard);
}
