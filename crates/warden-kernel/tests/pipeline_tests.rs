use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use warden_exec::{
    CodeOracle, CommandRunner, ExecError, FilePatch, FixRequest, OracleError, Patch, RawOutcome, ServerProcess,
};
use warden_kernel::{
    verify_chain, Approval, CiError, CiReport, CiState, CiStatusSource, ForcedTrigger, State, TaskOutcome,
    TaskPipeline, TransitionOutcome, Vcs, WardenConfig,
};
use warden_plan::{CommandText, OracleCall, PlanEnvelope};
use warden_test_utils::{
    health_patch, python_intent, python_plan, red_test_patch, Harness, InMemoryRepo, ScriptedOracle,
    ScriptedPlanner, ScriptedRunner, Step, FAILING_TESTS, LINT_COMMAND, REQUEST, TEST_COMMAND,
};

const ORIGINAL_APP: &str = "from flask import Flask\n\napp = Flask(__name__)\n";

fn pipeline(h: &Harness, config: WardenConfig) -> TaskPipeline {
    TaskPipeline::new(config, h.collaborators()).unwrap()
}

fn applied(outcome: &TaskOutcome) -> Vec<(State, State)> {
    outcome
        .records
        .iter()
        .filter(|r| r.outcome == TransitionOutcome::Applied)
        .map(|r| (r.from, r.to))
        .collect()
}

fn last_outcome(outcome: &TaskOutcome) -> TransitionOutcome {
    outcome.records.last().map(|r| r.outcome.clone()).unwrap()
}

#[tokio::test]
async fn test_happy_path_reaches_complete() {
    let h = Harness::python();
    let (_task, outcome) = pipeline(&h, WardenConfig::default()).run(REQUEST).await.unwrap();

    assert_eq!(outcome.state, State::Complete);
    assert_eq!(
        applied(&outcome),
        vec![
            (State::IntentAnalysis, State::RepoDiscovery),
            (State::RepoDiscovery, State::Planning),
            (State::Planning, State::ProvingGround),
            (State::ProvingGround, State::Implementing),
            (State::Implementing, State::Verifying),
            (State::Verifying, State::Complete),
        ]
    );
    verify_chain(&outcome.records).unwrap();

    let branch = outcome.branch.clone().unwrap();
    assert!(branch.starts_with("agent/task-"));
    assert_eq!(h.repo.current_branch(), branch);
    assert_eq!(h.repo.committed("app.py"), health_patch().files[0].content.clone());
    assert!(h.repo.committed("test_app.py").is_some());
    assert!(h.repo.is_working_tree_clean().unwrap());

    let check = outcome.merge_check.clone().unwrap();
    assert!(check.passed());
    assert_eq!(check.context.ci_validated_sha, check.context.branch_head_sha);
    assert!(outcome.verification.as_ref().unwrap().passed());

    let calls: Vec<OracleCall> = outcome.replay.iter().map(|e| e.call).collect();
    assert_eq!(
        calls,
        vec![OracleCall::Intent, OracleCall::Plan, OracleCall::Tests, OracleCall::Implementation]
    );
    assert!(outcome.plan_envelope_hash.is_some());
    assert_eq!(
        outcome.input_snapshot_hash,
        Some(h.planner.snapshots()[0].hash())
    );
    // red run, implementation run, verification run
    assert_eq!(h.runner.count(TEST_COMMAND), 3);
}

#[tokio::test]
async fn test_clarification_pauses_and_resumes_with_the_note() {
    let unclear = warden_kernel::IntentRecord {
        needs_clarification: true,
        ..python_intent()
    };
    let h = Harness::python().with_planner(ScriptedPlanner::with_intents([unclear, python_intent()], python_plan()));
    let p = pipeline(&h, WardenConfig::default());

    let (task, outcome) = p.run(REQUEST).await.unwrap();
    assert!(outcome.is_paused());
    let request = outcome.pending_approval.unwrap();
    assert_eq!(request.resume_to, State::IntentAnalysis);

    let outcome = p.resume(&task, Approval::approve("use the flask app in app.py")).await.unwrap();
    assert!(outcome.is_complete());
    let requests = h.planner.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].ends_with("Clarification: use the flask app in app.py"));
}

#[tokio::test]
async fn test_out_of_scope_edit_fails_scope_and_rolls_back() {
    let sneaky = Patch::new(vec![
        FilePatch::write("app.py", "# edited\n"),
        FilePatch::write("config.yaml", "debug: true\n"),
    ]);
    let h = Harness::python().with_oracle(
        ScriptedOracle::new()
            .with_tests(red_test_patch())
            .with_implementation(sneaky),
    );
    let (task, outcome) = pipeline(&h, WardenConfig::default()).run(REQUEST).await.unwrap();

    assert_eq!(outcome.state, State::FailedByScope);
    assert_eq!(
        last_outcome(&outcome),
        TransitionOutcome::Forced {
            trigger: ForcedTrigger::Scope
        }
    );
    let violation = task
        .controller()
        .inspect(|t| t.evidence().scope_violation.clone())
        .unwrap();
    assert!(violation.offending.iter().any(|c| c.path == "config.yaml"));

    assert_eq!(h.repo.file("config.yaml"), None);
    assert_eq!(h.repo.file("app.py").as_deref(), Some(ORIGINAL_APP));
    assert!(h.repo.committed("test_app.py").is_some());
    assert!(h.repo.is_working_tree_clean().unwrap());
}

#[tokio::test]
async fn test_lint_failure_is_healed_in_place() {
    let h = Harness::python().with_oracle(
        ScriptedOracle::new()
            .with_tests(red_test_patch())
            .with_implementation(Patch::new(vec![FilePatch::write("app.py", "import os\n")]))
            .with_fix(health_patch()),
    );
    h.runner.on(
        LINT_COMMAND,
        [Step::fail(1, "app.py:1:8: F401 `os` imported but unused\n"), Step::ok("")],
    );
    let (_task, outcome) = pipeline(&h, WardenConfig::default()).run(REQUEST).await.unwrap();

    assert!(outcome.is_complete());
    let fixes = h.oracle.fix_requests();
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].command, LINT_COMMAND);
    assert_eq!(fixes[0].locations[0].file, "app.py");
    assert_eq!(h.repo.committed("app.py"), health_patch().files[0].content.clone());
}

#[tokio::test]
async fn test_assertion_failure_escalates_and_denial_interrupts() {
    let mut h = Harness::python();
    h.runner = ScriptedRunner::new();
    h.runner.on(TEST_COMMAND, [Step::fail(1, FAILING_TESTS)]);
    let p = pipeline(&h, WardenConfig::default());

    let (task, outcome) = p.run(REQUEST).await.unwrap();
    assert_eq!(outcome.state, State::FeedbackWait);
    assert_eq!(outcome.pending_approval.unwrap().resume_to, State::Implementing);

    let outcome = p.resume(&task, Approval::deny("tests are wrong")).await.unwrap();
    assert_eq!(outcome.state, State::FailedByInterrupt);
    assert_eq!(h.repo.file("app.py").as_deref(), Some(ORIGINAL_APP));
}

fn unclear_harness() -> Harness {
    let unclear = warden_kernel::IntentRecord {
        needs_clarification: true,
        ..python_intent()
    };
    Harness::python().with_planner(ScriptedPlanner::new(unclear, python_plan()))
}

#[tokio::test]
async fn test_interrupt_while_waiting_fails_by_interrupt() {
    let h = unclear_harness();
    let p = pipeline(&h, WardenConfig::default());

    let (task, outcome) = p.run(REQUEST).await.unwrap();
    assert!(outcome.is_paused());
    task.interrupt();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(task.controller().state(), State::FailedByInterrupt);
    let records = task.controller().audit().records();
    assert_eq!(
        records.last().map(|r| r.outcome.clone()),
        Some(TransitionOutcome::Forced {
            trigger: ForcedTrigger::Interrupt
        })
    );

    let outcome = p.resume(&task, Approval::approve("go")).await.unwrap();
    assert_eq!(outcome.state, State::FailedByInterrupt);
    assert!(outcome.pending_approval.is_none());
}

#[tokio::test]
async fn test_unanswered_approval_expires_into_timeout() {
    let h = unclear_harness();
    let config = WardenConfig {
        approval_window_secs: 1,
        ..WardenConfig::default()
    };
    let p = pipeline(&h, config);

    let (task, outcome) = p.run(REQUEST).await.unwrap();
    assert!(outcome.is_paused());
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(task.controller().state(), State::FailedByTimeout);
}

#[tokio::test]
async fn test_resume_disarms_the_approval_watchdog() {
    let h = Harness::python().with_planner(ScriptedPlanner::with_intents(
        [
            warden_kernel::IntentRecord {
                needs_clarification: true,
                ..python_intent()
            },
            python_intent(),
        ],
        python_plan(),
    ));
    let p = pipeline(&h, WardenConfig::default());

    let (task, _) = p.run(REQUEST).await.unwrap();
    let outcome = p.resume(&task, Approval::approve("app.py")).await.unwrap();
    assert!(outcome.is_complete());

    task.interrupt();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(task.controller().state(), State::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_runtime_cap_forces_timeout_and_rolls_back() {
    let mut h = Harness::python();
    h.runner = ScriptedRunner::new();
    h.runner.on(TEST_COMMAND, [Step::fail(1, FAILING_TESTS), Step::Hang]);
    let config = WardenConfig::default().with_runtime_cap(Duration::from_millis(300));

    let (_task, outcome) = tokio::time::timeout(Duration::from_secs(30), pipeline(&h, config).run(REQUEST))
        .await
        .expect("pipeline should stop at the runtime cap")
        .unwrap();

    assert_eq!(outcome.state, State::FailedByTimeout);
    assert_eq!(
        last_outcome(&outcome),
        TransitionOutcome::Forced {
            trigger: ForcedTrigger::Timeout
        }
    );
    assert_eq!(h.repo.file("app.py").as_deref(), Some(ORIGINAL_APP));
    assert!(h.repo.is_working_tree_clean().unwrap());
}

/// Moves the remote main branch while the implementation is written
struct DriftingOracle {
    inner: ScriptedOracle,
    repo: Arc<InMemoryRepo>,
}

#[async_trait]
impl CodeOracle for DriftingOracle {
    async fn propose_tests(&self, envelope: &PlanEnvelope) -> Result<Patch, OracleError> {
        self.inner.propose_tests(envelope).await
    }

    async fn propose_implementation(&self, envelope: &PlanEnvelope) -> Result<Patch, OracleError> {
        self.repo.advance_origin("f00dfeed");
        self.inner.propose_implementation(envelope).await
    }

    async fn propose_fix(&self, request: &FixRequest) -> Result<Patch, OracleError> {
        self.inner.propose_fix(request).await
    }
}

#[tokio::test]
async fn test_remote_drift_fails_stale() {
    let h = Harness::python();
    let drifting = DriftingOracle {
        inner: ScriptedOracle::new()
            .with_tests(red_test_patch())
            .with_implementation(health_patch()),
        repo: Arc::clone(&h.repo),
    };
    let mut collab = h.collaborators();
    collab.oracle = Arc::new(drifting);
    let p = TaskPipeline::new(WardenConfig::default(), collab).unwrap();

    let (_task, outcome) = p.run(REQUEST).await.unwrap();
    assert_eq!(outcome.state, State::FailedByStale);
    assert_eq!(
        last_outcome(&outcome),
        TransitionOutcome::Forced {
            trigger: ForcedTrigger::Stale
        }
    );
    assert!(outcome.merge_check.is_none());
}

#[tokio::test]
async fn test_dirty_tree_escalates_before_planning() {
    let h = Harness::python();
    h.repo.write("notes.txt", "scratch\n");
    let p = pipeline(&h, WardenConfig::default());
    let (_task, outcome) = p.run(REQUEST).await.unwrap();

    assert_eq!(outcome.state, State::FeedbackWait);
    assert_eq!(outcome.pending_approval.unwrap().resume_to, State::Planning);
    assert!(outcome.plan_envelope_hash.is_none());
    assert!(h.planner.snapshots().is_empty());
}

#[tokio::test]
async fn test_mutation_during_read_only_state_fails_scope() {
    let h = Harness::python();
    let p = pipeline(&h, WardenConfig::default());
    let task = p.start(REQUEST).unwrap();
    h.repo.write("notes.txt", "scratch\n");
    let outcome = p.drive(&task).await;

    assert_eq!(outcome.state, State::FailedByScope);
    let violations = task.controller().inspect(|t| t.evidence().readonly_violations.clone());
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].path, "notes.txt");
}

/// Runner that writes a file into the repo on the `nth` run of one command
struct WritesOnNthRun {
    inner: Arc<ScriptedRunner>,
    repo: Arc<InMemoryRepo>,
    literal: &'static str,
    nth: usize,
    path: &'static str,
    seen: AtomicUsize,
}

impl WritesOnNthRun {
    fn new(h: &Harness, literal: &'static str, nth: usize, path: &'static str) -> Self {
        Self {
            inner: Arc::clone(&h.runner),
            repo: Arc::clone(&h.repo),
            literal,
            nth,
            path,
            seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CommandRunner for WritesOnNthRun {
    async fn run(&self, command: &CommandText, cwd: &Path, timeout: Duration, cancel: &CancellationToken) -> RawOutcome {
        if command.literal() == self.literal && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
            self.repo.write(self.path, "debug: true\n");
        }
        self.inner.run(command, cwd, timeout, cancel).await
    }

    async fn spawn_background(&self, command: &CommandText, cwd: &Path) -> Result<Box<dyn ServerProcess>, ExecError> {
        self.inner.spawn_background(command, cwd).await
    }
}

#[tokio::test]
async fn test_file_written_during_verification_is_never_committed() {
    let h = Harness::python();
    let mut collab = h.collaborators();
    // red run, implementation run, verification run
    collab.runner = Arc::new(WritesOnNthRun::new(&h, TEST_COMMAND, 3, "config.yaml"));
    let p = TaskPipeline::new(WardenConfig::default(), collab).unwrap();

    let (task, outcome) = p.run(REQUEST).await.unwrap();
    assert_eq!(outcome.state, State::FailedByScope);
    assert_eq!(
        last_outcome(&outcome),
        TransitionOutcome::Forced {
            trigger: ForcedTrigger::Scope
        }
    );
    let violation = task
        .controller()
        .inspect(|t| t.evidence().scope_violation.clone())
        .unwrap();
    assert!(violation.offending.iter().any(|c| c.path == "config.yaml"));
    assert_eq!(h.repo.committed("config.yaml"), None);
    assert_eq!(h.repo.file("config.yaml"), None);
    assert!(outcome.merge_check.is_none());
}

#[tokio::test]
async fn test_file_written_by_the_red_run_is_never_committed() {
    let h = Harness::python();
    let mut collab = h.collaborators();
    collab.runner = Arc::new(WritesOnNthRun::new(&h, TEST_COMMAND, 1, ".pytest_cache/state"));
    let p = TaskPipeline::new(WardenConfig::default(), collab).unwrap();

    let (_task, outcome) = p.run(REQUEST).await.unwrap();
    assert_eq!(outcome.state, State::FailedByScope);
    assert_eq!(h.repo.commit_count(), 1);
    assert_eq!(h.repo.committed("test_app.py"), None);
}

#[tokio::test]
async fn test_lint_writing_outside_scope_fails_scope_without_a_fix() {
    let h = Harness::python().with_oracle(
        ScriptedOracle::new()
            .with_tests(red_test_patch())
            .with_implementation(health_patch())
            .with_fix(health_patch()),
    );
    h.runner.on(LINT_COMMAND, [Step::fail(1, "app.py:1:8: F401 `os` imported but unused\n"), Step::ok("")]);
    let mut collab = h.collaborators();
    collab.runner = Arc::new(WritesOnNthRun::new(&h, LINT_COMMAND, 1, "config.yaml"));
    let p = TaskPipeline::new(WardenConfig::default(), collab).unwrap();

    let (_task, outcome) = p.run(REQUEST).await.unwrap();
    assert_eq!(outcome.state, State::FailedByScope);
    assert_eq!(h.runner.count(LINT_COMMAND), 1);
    assert!(h.oracle.fix_requests().is_empty());
}

/// Moves the remote main branch while reporting a failed run
struct DriftingCi {
    repo: Arc<InMemoryRepo>,
}

#[async_trait]
impl CiStatusSource for DriftingCi {
    async fn status(&self, _branch: &str, head_sha: &str) -> Result<CiReport, CiError> {
        self.repo.advance_origin("f00dfeed");
        Ok(CiReport {
            validated_sha: head_sha.to_string(),
            status: CiState::Failure,
            is_latest_run: true,
        })
    }
}

#[tokio::test]
async fn test_stale_base_wins_over_a_failed_ci_run() {
    let h = Harness::python();
    let repo = Arc::clone(&h.repo);
    let h = h.with_ci(Arc::new(DriftingCi { repo }));
    let (_task, outcome) = pipeline(&h, WardenConfig::default()).run(REQUEST).await.unwrap();

    assert_eq!(outcome.state, State::FailedByStale);
    assert_eq!(
        last_outcome(&outcome),
        TransitionOutcome::Forced {
            trigger: ForcedTrigger::Stale
        }
    );
    let check = outcome.merge_check.unwrap();
    assert!(check.is_stale());
    assert!(!outcome.verification.unwrap().passed());
}

#[tokio::test]
async fn test_tests_that_mock_the_code_under_test_never_run() {
    let mocked = Patch::new(vec![FilePatch::write(
        "test_app.py",
        "from unittest.mock import patch\nimport app\n\n\
         @patch('app.create_app')\ndef test_health(create_app):\n    assert app.create_app() is not None\n",
    )]);
    let h = Harness::python().with_oracle(
        ScriptedOracle::new()
            .with_tests(mocked)
            .with_implementation(health_patch()),
    );
    let (task, outcome) = pipeline(&h, WardenConfig::default()).run(REQUEST).await.unwrap();

    assert!(outcome.is_paused());
    let request = outcome.pending_approval.unwrap();
    assert_eq!(request.resume_to, State::Planning);
    assert!(request.reason.contains("mocks the module under test `app`"), "{}", request.reason);
    assert_eq!(h.repo.file("test_app.py"), None);
    assert_eq!(h.runner.count(TEST_COMMAND), 0);

    let quality = task.controller().inspect(|t| t.evidence().test_quality.clone());
    assert_eq!(quality.len(), 1);
    assert!(!quality[0].passed());
}

#[tokio::test]
async fn test_oversized_implementation_waits_for_confirmation() {
    let large = "from flask import Flask\n\napp = Flask(__name__)\n\n\n@app.get('/health')\ndef health():\n    return 'ok'\n\n\n@app.get('/ready')\ndef ready():\n    return 'ok'\n";
    let h = Harness::python().with_oracle(
        ScriptedOracle::new()
            .with_tests(red_test_patch())
            .with_implementation(Patch::new(vec![FilePatch::write("app.py", large)])),
    );
    let mut config = WardenConfig::default();
    config.budget.max_patch_lines = 4;
    let p = pipeline(&h, config);

    let (task, outcome) = p.run(REQUEST).await.unwrap();
    assert!(outcome.is_paused());
    let request = outcome.pending_approval.unwrap();
    assert_eq!(request.resume_to, State::Implementing);
    assert!(request.reason.contains("patch size budget exceeded: 10 used, limit 4"), "{}", request.reason);
    assert_eq!(h.repo.file("app.py").as_deref(), Some(ORIGINAL_APP));

    let outcome = p.resume(&task, Approval::approve("expected, two endpoints")).await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(h.repo.committed("app.py").as_deref(), Some(large));
    let usage = task.controller().inspect(|t| t.evidence().budget.clone());
    assert_eq!(usage.largest_patch_lines, 10);
    assert_eq!(usage.total_lines, 14);
    assert_eq!(usage.awaiting_confirmation, None);
}

#[tokio::test]
async fn test_command_budget_forces_timeout_and_rolls_back() {
    let h = Harness::python();
    let mut config = WardenConfig::default();
    config.budget.max_commands = 2;

    let (task, outcome) = pipeline(&h, config).run(REQUEST).await.unwrap();
    assert_eq!(outcome.state, State::FailedByTimeout);
    assert_eq!(
        last_outcome(&outcome),
        TransitionOutcome::Forced {
            trigger: ForcedTrigger::Timeout
        }
    );
    assert!(outcome.records.last().unwrap().detail.contains("command count budget exceeded"));
    assert_eq!(task.controller().inspect(|t| t.evidence().budget.commands), 3);
    assert_eq!(h.repo.file("app.py").as_deref(), Some(ORIGINAL_APP));
    assert!(outcome.merge_check.is_none());
}
