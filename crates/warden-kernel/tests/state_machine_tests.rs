use std::sync::Arc;

use proptest::prelude::*;
use warden_kernel::{
    allowed_transitions, validate_transition, ExecutionLocks, ForcedTrigger, GovernanceController,
    InvariantLimits, State, Task, TransitionOutcome, TransitionRejection, Vcs,
};
use warden_test_utils::{python_intent, python_repo};

#[derive(Debug, Clone)]
enum Op {
    Move(State),
    Force(ForcedTrigger),
}

fn any_state() -> impl Strategy<Value = State> {
    prop::sample::select(State::ALL.to_vec())
}

fn any_trigger() -> impl Strategy<Value = ForcedTrigger> {
    prop::sample::select(vec![
        ForcedTrigger::Timeout,
        ForcedTrigger::Interrupt,
        ForcedTrigger::Stale,
        ForcedTrigger::Scope,
    ])
}

fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any_state().prop_map(Op::Move),
        1 => any_trigger().prop_map(Op::Force),
    ]
}

fn controller() -> GovernanceController {
    let c = GovernanceController::new(
        Task::new("add /health"),
        python_repo() as Arc<dyn Vcs>,
        ExecutionLocks::new(),
        InvariantLimits::default(),
    );
    c.record(|ev| ev.intent = Some(python_intent()));
    c
}

#[test]
fn test_terminal_states_allow_nothing() {
    for state in State::ALL.into_iter().filter(|s| s.is_terminal()) {
        assert!(allowed_transitions(state).is_empty());
        for to in State::ALL {
            assert!(matches!(
                validate_transition(state, to),
                Err(TransitionRejection::AlreadyTerminal { .. })
            ));
        }
    }
}

#[test]
fn test_every_working_state_can_fail_and_escalate() {
    for state in State::ALL
        .into_iter()
        .filter(|s| !s.is_terminal() && *s != State::FeedbackWait)
    {
        let allowed = allowed_transitions(state);
        assert!(allowed.contains(&State::FeedbackWait), "{state} cannot escalate");
        for trigger in [
            ForcedTrigger::Timeout,
            ForcedTrigger::Interrupt,
            ForcedTrigger::Stale,
            ForcedTrigger::Scope,
        ] {
            assert!(allowed.contains(&trigger.target()), "{state} cannot reach {}", trigger.target());
        }
    }
}

proptest! {
    #[test]
    fn prop_applied_records_follow_the_table(ops in prop::collection::vec(any_op(), 1..40)) {
        let c = controller();
        for op in ops {
            match op {
                Op::Move(next) => { let _ = c.attempt_transition(next, "prop"); }
                Op::Force(trigger) => { let _ = c.force_terminal(trigger, "prop"); }
            }
        }
        let audit = c.audit();
        prop_assert!(audit.verify_integrity().is_ok());
        for record in audit.records() {
            if matches!(record.outcome, TransitionOutcome::Applied | TransitionOutcome::Forced { .. }) {
                prop_assert!(validate_transition(record.from, record.to).is_ok());
            }
        }
    }

    #[test]
    fn prop_exactly_one_terminal_transition(ops in prop::collection::vec(any_op(), 1..40)) {
        let c = controller();
        let mut terminal_at = None;
        for (i, op) in ops.iter().enumerate() {
            let before = c.state();
            match op {
                Op::Move(next) => { let _ = c.attempt_transition(*next, "prop"); }
                Op::Force(trigger) => { let _ = c.force_terminal(*trigger, "prop"); }
            }
            if before.is_terminal() {
                prop_assert_eq!(c.state(), before);
            } else if c.state().is_terminal() {
                terminal_at = Some(i);
            }
        }
        let terminal_records = c
            .audit()
            .records()
            .into_iter()
            .filter(|r| r.to.is_terminal() && r.outcome.changed_state())
            .count();
        prop_assert_eq!(terminal_records, usize::from(terminal_at.is_some()));
    }

    #[test]
    fn prop_rejections_leave_state_unchanged(target in any_state()) {
        let c = controller();
        let before = c.state();
        if c.attempt_transition(target, "prop").is_err() {
            prop_assert_eq!(c.state(), before);
        }
    }
}
