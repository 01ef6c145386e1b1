use std::sync::Arc;

use proptest::prelude::*;
use warden_exec::{EngineConfig, ExecutionEngine, FilePatch, HealingContext, HealingOutcome, Patch, StackProfileRegistry};
use warden_plan::{CommandRole, CommandSpec, ContentHash, FreezeLimits, PlanEnvelope, ReplayLog, SamplingPolicy};
use warden_test_utils::{python_plan, python_repo, AllowAllResolver, ScriptedOracle, ScriptedRunner, Step, LINT_COMMAND};

/// Lint fails `fails` times, then passes; every fix is distinct
fn heal(fails: usize, cap: u32) -> (usize, HealingOutcome) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let repo = python_repo();
        let runner = ScriptedRunner::new();
        let mut steps = vec![Step::fail(1, "app.py:3:1: E302 expected 2 blank lines\n"); fails];
        steps.push(Step::ok(""));
        runner.on(LINT_COMMAND, steps);

        let mut config = EngineConfig::new("/warden-in-memory");
        config.max_heal_attempts = cap;
        let engine = ExecutionEngine::new(config)
            .with_runner(runner as _)
            .with_resolver(Arc::new(AllowAllResolver));

        let oracle = (0..8).fold(ScriptedOracle::new(), |o, i| {
            o.with_fix(Patch::new(vec![FilePatch::write("app.py", format!("revision = {i}\n"))]))
        });
        let envelope = PlanEnvelope::freeze(
            python_plan(),
            ContentHash::compute(b"snapshot"),
            repo.main_sha(),
            &FreezeLimits::default(),
        )
        .unwrap();
        let replay = ReplayLog::new();
        let sampling = SamplingPolicy::default();
        let ctx = HealingContext {
            envelope: &envelope,
            oracle: &oracle,
            workspace: repo.as_ref(),
            tree: repo.as_ref(),
            replay: &replay,
            sampling: &sampling,
        };
        let spec = CommandSpec::new(CommandRole::Lint, LINT_COMMAND).unwrap();
        let report = engine
            .run_with_healing(&spec, StackProfileRegistry::new().lookup("python"), &ctx)
            .await;
        (report.session.attempts(), report.outcome)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_healing_never_exceeds_the_attempt_cap(fails in 0usize..6, cap in 1u32..5) {
        let (attempts, outcome) = heal(fails, cap);
        let cap = cap as usize;
        prop_assert!(attempts <= cap);
        prop_assert_eq!(attempts, (fails + 1).min(cap));
        if fails < cap {
            prop_assert!(matches!(outcome, HealingOutcome::Succeeded));
        } else {
            prop_assert!(matches!(outcome, HealingOutcome::Exhausted { .. }), "got {:?}", outcome);
        }
    }
}
