//! Task pipeline
//!
//! Drives one task through the lifecycle. The pipeline does the work of
//! each state and then asks the [`GovernanceController`] to move on; it
//! never changes state itself. A [`Supervisor`] runs beside it for the
//! runtime cap and stop signals.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use warden_exec::{
    BinaryResolver, CodeOracle, CommandRunner, ExecutionEngine, FailureKind, FixRequest, HealingContext,
    HealingOutcome, OracleError, Patch, ServerInfo, StackProfile, StackProfileRegistry, Workspace,
};
use warden_plan::{
    check_clean_tree, compute_lockfile_hash, CommandText, ContentHash, FileChange, InputSnapshot, OracleCall,
    PlanEnvelope, ReplayEntry, ReplayLog, ToolchainManifest,
};

use crate::audit::TransitionRecord;
use crate::ci::CiStatusSource;
use crate::config::WardenConfig;
use crate::controller::GovernanceController;
use crate::error::{PipelineError, TransitionRejection};
use crate::invariants::InvariantViolation;
use crate::locks::{ExecutionLocks, LockGuard, LockKind};
use crate::merge::{MergeCheck, MergeGuard, MergeGuardContext};
use crate::planner::Planner;
use crate::policy::{actions, PolicyGates};
use crate::state::{ForcedTrigger, State};
use crate::supervisor::Supervisor;
use crate::task::{Approval, ApprovalRequest, RedTest, RepoMap, Task, TaskId};
use crate::test_quality::{assess_test, sut_modules, TestQuality};
use crate::verify::{VerificationReport, VerificationRoute, Verifier};
use crate::vcs::{Vcs, VcsTree};

const TOOLCHAIN_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything outside the kernel a task talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Branches, commits, status and the remote main head
    pub vcs: Arc<dyn Vcs>,
    /// CI verdicts for pushed heads
    pub ci: Arc<dyn CiStatusSource>,
    /// Intent analysis and plan proposals
    pub planner: Arc<dyn Planner>,
    /// Tests, implementations and fixes
    pub oracle: Arc<dyn CodeOracle>,
    /// Where patches are applied; must share its root with `vcs`
    pub workspace: Arc<dyn Workspace>,
    /// Spawns planned commands
    pub runner: Arc<dyn CommandRunner>,
    /// Locates binaries for the runtime pre-check
    pub resolver: Arc<dyn BinaryResolver>,
    /// Command, capability and dependency policies plus output redaction
    pub gates: PolicyGates,
}

/// A started task
pub struct RunningTask {
    controller: Arc<GovernanceController>,
    engine: Arc<ExecutionEngine>,
    replay: ReplayLog,
    stop: CancellationToken,
    execution: CancellationToken,
    /// Armed while the task waits in FEEDBACK_WAIT
    parked: Mutex<Option<Supervisor>>,
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        if let Some(watch) = self.parked.get_mut().take() {
            watch.cancel();
        }
    }
}

impl RunningTask {
    /// The controller owning this task's state and audit log
    #[must_use]
    pub fn controller(&self) -> &Arc<GovernanceController> {
        &self.controller
    }

    /// Task identifier
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.controller.id()
    }

    /// Token that stops the task when cancelled
    #[must_use]
    pub fn stop_signal(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Request a stop; the supervisor forces FAILED_BY_INTERRUPT, also
    /// while the task waits for approval
    pub fn interrupt(&self) {
        self.stop.cancel();
    }

    /// Oracle exchanges recorded so far
    #[must_use]
    pub fn replay(&self) -> &ReplayLog {
        &self.replay
    }

    /// Disarm the approval watchdog; returns the trigger if it already fired
    async fn unpark(&self) -> Option<ForcedTrigger> {
        let watch = self.parked.lock().take();
        match watch {
            Some(watch) => watch.disarm().await,
            None => None,
        }
    }
}

/// Where a drive stopped
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Task identifier
    pub task_id: TaskId,
    /// State when the drive stopped
    pub state: State,
    /// Full audit log, hash-chained
    pub records: Vec<TransitionRecord>,
    /// Oracle exchanges, sampled per the configured policy
    pub replay: Vec<ReplayEntry>,
    /// Set once the plan is frozen
    pub plan_envelope_hash: Option<ContentHash>,
    /// Hash of the inputs the plan was proposed from
    pub input_snapshot_hash: Option<ContentHash>,
    /// Isolation branch, once created
    pub branch: Option<String>,
    /// Latest verification report
    pub verification: Option<VerificationReport>,
    /// Latest merge guard evaluation
    pub merge_check: Option<MergeCheck>,
    /// Set while parked in FEEDBACK_WAIT
    pub pending_approval: Option<ApprovalRequest>,
    /// Background servers still tracked by the engine
    pub servers: Vec<ServerInfo>,
}

impl TaskOutcome {
    /// Reached COMPLETE
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Waiting for [`TaskPipeline::resume`]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state == State::FeedbackWait
    }
}

/// Why a step stopped short of its transition
#[derive(Debug)]
enum Halt {
    /// Ask a human; `None` resumes to the natural target for the current state
    Escalate { reason: String, resume_to: Option<State> },
    Force { trigger: ForcedTrigger, detail: String },
    /// Cancellation observed; the supervisor owns the terminal transition
    Stopped,
}

impl Halt {
    fn escalate(reason: impl Into<String>) -> Self {
        Self::Escalate {
            reason: reason.into(),
            resume_to: None,
        }
    }

    fn escalate_to(reason: impl Into<String>, resume_to: State) -> Self {
        Self::Escalate {
            reason: reason.into(),
            resume_to: Some(resume_to),
        }
    }

    fn scope(detail: impl Into<String>) -> Self {
        Self::Force {
            trigger: ForcedTrigger::Scope,
            detail: detail.into(),
        }
    }
}

/// IMPLEMENTING pass result
enum Pass {
    Done,
    /// Start over from the red-test commit
    Restart(String),
}

type Step = Result<(), Halt>;

/// FEEDBACK_WAIT exit for an escalation raised in `state`
fn resume_target(state: State) -> State {
    match state {
        State::IntentAnalysis | State::RepoDiscovery => State::IntentAnalysis,
        State::Planning | State::ProvingGround => State::Planning,
        _ => State::Implementing,
    }
}

/// Assess the test files a patch writes; declared test files only, when the plan names any
fn assess_tests(envelope: &PlanEnvelope, patch: &Patch) -> Vec<TestQuality> {
    let declared = &envelope.content().test_files;
    let sut = sut_modules(envelope);
    patch
        .files
        .iter()
        .filter(|f| declared.is_empty() || declared.contains(&f.path))
        .filter_map(|f| f.content.as_deref().map(|c| assess_test(&f.path, c, &sut)))
        .collect()
}

/// Rank files by how many request words their path mentions, keep `cap`
#[must_use]
pub fn select_relevant_files(files: &[String], request: &str, cap: usize) -> Vec<String> {
    let words: Vec<String> = request
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
        .collect();
    let mut scored: Vec<(usize, &String)> = files
        .iter()
        .map(|f| {
            let lower = f.to_lowercase();
            (words.iter().filter(|w| lower.contains(w.as_str())).count(), f)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored.into_iter().take(cap).map(|(_, f)| f.clone()).collect()
}

/// Runs tasks against one repository
pub struct TaskPipeline {
    config: WardenConfig,
    collab: Collaborators,
    locks: Arc<ExecutionLocks>,
    registry: StackProfileRegistry,
}

impl TaskPipeline {
    /// # Errors
    /// [`PipelineError::Config`] when the configuration is invalid
    pub fn new(config: WardenConfig, collab: Collaborators) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            collab,
            locks: ExecutionLocks::new(),
            registry: StackProfileRegistry::new(),
        })
    }

    /// Share an existing lock table, e.g. between pipelines on one repository
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<ExecutionLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Create a task in INTENT_ANALYSIS
    ///
    /// # Errors
    /// [`PipelineError::Vcs`] when the working tree cannot be read
    pub fn start(&self, request: impl Into<String>) -> Result<RunningTask, PipelineError> {
        let task = Task::new(request);
        let baseline = self.collab.vcs.status()?;
        let controller = Arc::new(GovernanceController::new(
            task,
            Arc::clone(&self.collab.vcs),
            Arc::clone(&self.locks),
            self.config.limits(),
        ));
        controller.record(|ev| ev.baseline_changes = baseline);

        let execution = CancellationToken::new();
        let engine = ExecutionEngine::new(self.config.engine_config(self.collab.workspace.root()))
            .with_runner(Arc::clone(&self.collab.runner))
            .with_resolver(Arc::clone(&self.collab.resolver))
            .with_redactor(Arc::clone(&self.collab.gates.redactor))
            .with_health_checker(self.config.health_checker())
            .with_cancellation(execution.clone());

        tracing::info!(task = %controller.id(), "task started");
        Ok(RunningTask {
            controller,
            engine: Arc::new(engine),
            replay: ReplayLog::new(),
            stop: CancellationToken::new(),
            execution,
            parked: Mutex::new(None),
        })
    }

    /// Start a task and drive it until it finishes or needs input
    ///
    /// # Errors
    /// As [`TaskPipeline::start`]
    pub async fn run(&self, request: impl Into<String>) -> Result<(RunningTask, TaskOutcome), PipelineError> {
        let task = self.start(request)?;
        let outcome = self.drive(&task).await;
        Ok((task, outcome))
    }

    /// Drive until terminal or FEEDBACK_WAIT
    #[instrument(skip_all, fields(task = %task.controller.id()))]
    pub async fn drive(&self, task: &RunningTask) -> TaskOutcome {
        if task.unpark().await.is_some() {
            return self.outcome(task);
        }
        let started = Instant::now();
        let budget = self
            .config
            .runtime_cap()
            .saturating_sub(task.controller.inspect(Task::active_time));
        let supervisor = Supervisor::arm(
            Arc::clone(&task.controller),
            budget,
            task.stop.clone(),
            task.execution.clone(),
        );

        loop {
            let state = task.controller.state();
            if state.is_terminal() || state == State::FeedbackWait || task.execution.is_cancelled() {
                break;
            }
            let step = match state {
                State::IntentAnalysis => self.analyze_intent(task).await,
                State::RepoDiscovery => self.discover(task).await,
                State::Planning => self.plan(task).await,
                State::ProvingGround => self.prove(task).await,
                State::Implementing => self.implement(task).await,
                State::Verifying => self.verify(task).await,
                _ => Ok(()),
            };
            if let Err(halt) = step {
                self.halt(task, halt);
            }
        }

        if task.execution.is_cancelled() {
            supervisor.fired().await;
        } else {
            supervisor.disarm().await;
        }
        task.controller.add_active_time(started.elapsed());
        match task.controller.state() {
            state if state.is_terminal() => self.finish(task).await,
            State::FeedbackWait => self.park(task),
            _ => {}
        }
        self.outcome(task)
    }

    /// Watch the stop signal and the approval window while parked
    fn park(&self, task: &RunningTask) {
        let requested_at = task
            .controller
            .inspect(|t| t.evidence().approval_request.as_ref().map(|r| r.requested_at));
        let window = self.config.limits().approval_window;
        let waited = requested_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or_default();
        let watch = Supervisor::park(
            Arc::clone(&task.controller),
            window.saturating_sub(waited),
            task.stop.clone(),
            Arc::clone(&task.engine),
        );
        if let Some(previous) = task.parked.lock().replace(watch) {
            previous.cancel();
        }
        tracing::info!(task = %task.id(), window_secs = window.as_secs(), "parked in feedback wait");
    }

    /// Submit a decision for a task parked in FEEDBACK_WAIT and keep driving
    ///
    /// A task the approval watchdog already failed is returned as is.
    ///
    /// # Errors
    /// [`PipelineError::Transition`] when no approval is pending
    pub async fn resume(&self, task: &RunningTask, approval: Approval) -> Result<TaskOutcome, PipelineError> {
        if task.unpark().await.is_some() {
            return Ok(self.outcome(task));
        }
        if task.stop.is_cancelled() {
            task.controller
                .force_terminal(ForcedTrigger::Interrupt, "stop signal received while waiting");
            self.finish(task).await;
            return Ok(self.outcome(task));
        }

        let request = task.controller.submit_approval(approval.clone())?;
        if approval.approved {
            task.controller.record(|ev| {
                ev.budget.confirm_awaiting();
                match request.resume_to {
                    State::Implementing => ev.implement_retries = 0,
                    State::IntentAnalysis if !approval.note.trim().is_empty() => {
                        ev.clarifications.push(approval.note.clone());
                    }
                    _ => {}
                }
            });
        }

        match task.controller.attempt_transition(request.resume_to, "approval received") {
            Ok(_) => Ok(self.drive(task).await),
            Err(rejection) => {
                let trigger = match rejection.violation() {
                    Some(InvariantViolation::ApprovalExpired { .. }) => ForcedTrigger::Timeout,
                    Some(InvariantViolation::ApprovalDenied) => ForcedTrigger::Interrupt,
                    _ => return Err(rejection.into()),
                };
                task.controller.force_terminal(trigger, rejection.to_string());
                self.finish(task).await;
                Ok(self.outcome(task))
            }
        }
    }

    async fn analyze_intent(&self, task: &RunningTask) -> Step {
        self.gate(task, State::RepoDiscovery, actions::SUBMIT)?;
        let request = task.controller.inspect(Task::effective_request);
        let intent = self
            .oracle_call(
                task,
                OracleCall::Intent,
                request.as_bytes(),
                self.collab.planner.analyze_intent(&request),
            )
            .await?;
        let summary = intent.summary.clone();
        let unclear = intent.needs_clarification;
        task.controller.record(|ev| ev.intent = Some(intent));
        self.record_read_only(task)?;

        if unclear {
            return Err(Halt::escalate_to("request needs clarification", State::IntentAnalysis));
        }
        self.transition(task, State::RepoDiscovery, summary)
    }

    async fn discover(&self, task: &RunningTask) -> Step {
        let vcs = self.collab.vcs.as_ref();
        let files = vcs.list_files().map_err(|e| Halt::escalate(e.to_string()))?;
        let base_tree_hash = vcs.base_tree_hash().map_err(|e| Halt::escalate(e.to_string()))?;
        let (request, hint) = task.controller.inspect(|t| {
            let hint = t.evidence().intent.as_ref().and_then(|i| i.stack_hint.clone());
            (t.effective_request(), hint)
        });

        let profile = match hint.map(|h| self.registry.lookup(&h)) {
            Some(p) if p.tag != self.registry.generic().tag => p,
            _ => self.registry.detect_from_paths(files.iter().map(String::as_str)),
        };
        let selected = select_relevant_files(&files, &request, self.config.max_file_cap);
        let toolchain = self.probe_toolchain(task, profile).await;
        tracing::info!(stack = profile.tag, files = selected.len(), "repository discovered");

        task.controller.record(|ev| {
            ev.repo_map = Some(RepoMap {
                files: selected,
                base_tree_hash,
                stack: profile.tag.to_string(),
                toolchain,
            });
        });
        self.record_read_only(task)?;
        self.transition(task, State::Planning, profile.display_name)
    }

    async fn plan(&self, task: &RunningTask) -> Step {
        let (frozen, isolated) = task
            .controller
            .inspect(|t| (t.envelope().is_some(), t.branch().is_some()));

        if !frozen {
            self.freeze_plan(task).await?;
        }
        let envelope = self.envelope(task)?;
        let profile = self.profile_for(&envelope);
        task.engine
            .precheck(profile, envelope.content().commands())
            .map_err(|e| Halt::escalate_to(e.to_string(), State::Planning))?;

        if !isolated {
            self.gate(task, State::ProvingGround, actions::MUTATE)?;
            let branch = format!("{}{}", self.config.branch_prefix, task.id().short());
            self.collab
                .vcs
                .create_branch(&branch)
                .map_err(|e| Halt::escalate_to(e.to_string(), State::Planning))?;
            task.controller.set_branch(branch).map_err(|e| Halt::escalate(e.to_string()))?;
        }
        self.transition(
            task,
            State::ProvingGround,
            format!("plan {}", envelope.plan_envelope_hash().short()),
        )
    }

    async fn freeze_plan(&self, task: &RunningTask) -> Step {
        let vcs = self.collab.vcs.as_ref();
        let changes = vcs.status().map_err(|e| Halt::escalate(e.to_string()))?;
        check_clean_tree(&changes, &self.config.ignore_file).map_err(|e| Halt::escalate(e.to_string()))?;

        let (request, map) = task
            .controller
            .inspect(|t| (t.effective_request(), t.evidence().repo_map.clone()));
        let map = map.ok_or_else(|| Halt::escalate("repository map missing"))?;
        let snapshot = InputSnapshot::new(request, map.render(), map.base_tree_hash.clone(), map.toolchain.clone());
        let input = serde_json::to_vec(&snapshot)
            .map_err(|e| Halt::escalate(format!("input snapshot could not be encoded: {e}")))?;
        let mut content = self
            .oracle_call(task, OracleCall::Plan, &input, self.collab.planner.propose_plan(&snapshot))
            .await?;

        content.lockfile_hash = compute_lockfile_hash(self.collab.workspace.root(), &self.config.lockfiles)
            .map_err(|e| Halt::escalate(format!("lockfiles unreadable: {e}")))?;
        self.collab
            .gates
            .check_dependencies(&content.dependencies, self.config.risk_threshold)
            .map_err(|e| Halt::escalate(e.to_string()))?;

        let base = vcs.origin_main_sha().map_err(|e| Halt::escalate(e.to_string()))?;
        let envelope = match PlanEnvelope::freeze(content, snapshot.hash(), base, &self.config.freeze_limits()) {
            Ok(envelope) => envelope,
            Err(e) if e.is_scope_failure() => return Err(Halt::scope(e.to_string())),
            Err(e) => return Err(Halt::escalate(e.to_string())),
        };
        task.controller
            .freeze_envelope(envelope)
            .map_err(|e| Halt::escalate(e.to_string()))
    }

    async fn prove(&self, task: &RunningTask) -> Step {
        let _fs = self.lock(task, LockKind::Filesystem)?;
        let envelope = self.envelope(task)?;
        let profile = self.profile_for(&envelope);
        let test_command = envelope
            .content()
            .test_command
            .clone()
            .ok_or_else(|| Halt::escalate("plan declares no test command"))?;

        let patch = self
            .oracle_call(
                task,
                OracleCall::Tests,
                envelope.plan_envelope_hash().as_bytes(),
                self.collab.oracle.propose_tests(&envelope),
            )
            .await?;
        if patch.is_empty() {
            return Err(Halt::escalate("oracle proposed no tests"));
        }
        let quality = assess_tests(&envelope, &patch);
        let rejected: Vec<String> = quality.iter().filter(|q| !q.passed()).map(ToString::to_string).collect();
        task.controller.record(|ev| ev.test_quality = quality);
        if !rejected.is_empty() {
            tracing::warn!(rejected = rejected.len(), "proposed tests do not exercise the code under test");
            return Err(Halt::escalate(format!("proposed tests rejected: {}", rejected.join("; "))));
        }
        self.apply_in_scope(task, &envelope, &patch)?;

        let attempt = task.engine.run(&test_command, profile).await;
        self.check_tree_scope(task, &envelope)?;
        self.charge(task, 0)?;
        match &attempt.failure {
            None => {
                return Err(Halt::escalate(
                    "new tests pass before any implementation exists",
                ))
            }
            Some(FailureKind::Interrupted) => return Err(Halt::Stopped),
            Some(FailureKind::Environment { reason }) => return Err(Halt::escalate(reason.clone())),
            Some(failure) => tracing::info!(%failure, "red tests observed failing"),
        }

        let paths: Vec<String> = if envelope.content().test_files.is_empty() {
            patch
                .files
                .iter()
                .filter(|f| f.content.is_some())
                .map(|f| f.path.clone())
                .collect()
        } else {
            envelope.content().test_files.iter().cloned().collect()
        };
        let mut red = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = self
                .collab
                .workspace
                .read(&path)
                .map_err(|e| Halt::escalate(e.to_string()))?
                .ok_or_else(|| Halt::escalate(format!("declared test file {path} was not written")))?;
            red.push(RedTest {
                path,
                content_hash: ContentHash::compute(&bytes),
                observed_failing: true,
            });
        }
        task.controller.record(|ev| ev.red_tests = red);

        self.gate(task, State::Implementing, actions::COMMIT)?;
        self.check_tree_scope(task, &envelope)?;
        self.collab
            .vcs
            .commit_with_message(&format!("test: failing tests for task {}", task.id()))
            .map_err(|e| Halt::escalate(e.to_string()))?;
        self.transition(task, State::Implementing, test_command.literal())
    }

    async fn implement(&self, task: &RunningTask) -> Step {
        let envelope = self.envelope(task)?;
        let profile = self.profile_for(&envelope);
        loop {
            let fs = self.lock(task, LockKind::Filesystem)?;
            match self.implement_pass(task, &envelope, profile).await? {
                Pass::Done => break,
                Pass::Restart(reason) => {
                    drop(fs);
                    let retries = task.controller.inspect(|t| t.evidence().implement_retries);
                    if retries >= self.config.implement_retry_budget {
                        return Err(Halt::escalate_to(
                            format!("implementation retry budget exhausted: {reason}"),
                            State::Implementing,
                        ));
                    }
                    tracing::warn!(%reason, retry = retries + 1, "restarting implementation from the red-test commit");
                    task.controller.record(|ev| {
                        ev.implement_retries += 1;
                        ev.pending_fix = None;
                    });
                    let report = task.controller.rollback();
                    if !report.clean() {
                        return Err(Halt::escalate(format!(
                            "rollback failed: {}",
                            report.reset_error.unwrap_or_default()
                        )));
                    }
                }
            }
        }
        self.transition(task, State::Verifying, "implementation complete")
    }

    async fn implement_pass(&self, task: &RunningTask, envelope: &PlanEnvelope, profile: &StackProfile) -> Result<Pass, Halt> {
        let pending = task.controller.record(|ev| ev.pending_fix.take());
        let patch = match pending {
            Some(request) => {
                let input = serde_json::to_vec(&request)
                    .map_err(|e| Halt::escalate(format!("fix request could not be encoded: {e}")))?;
                self.oracle_call(task, OracleCall::Fix, &input, self.collab.oracle.propose_fix(&request))
                    .await?
            }
            None => {
                self.oracle_call(
                    task,
                    OracleCall::Implementation,
                    envelope.plan_envelope_hash().as_bytes(),
                    self.collab.oracle.propose_implementation(envelope),
                )
                .await?
            }
        };
        if patch.is_empty() {
            return Ok(Pass::Restart("oracle proposed an empty implementation".into()));
        }
        let touched_tests: Vec<String> = task.controller.inspect(|t| {
            t.evidence()
                .red_tests
                .iter()
                .filter(|r| patch.files.iter().any(|f| f.path == r.path))
                .map(|r| r.path.clone())
                .collect()
        });
        if !touched_tests.is_empty() {
            return Ok(Pass::Restart(format!(
                "implementation edits registered tests: {}",
                touched_tests.join(", ")
            )));
        }
        self.apply_in_scope(task, envelope, &patch)?;

        let content = envelope.content();
        let lint = content.lint_command.clone().or_else(|| profile.fallback_lint_spec());
        let commands = content
            .install_command
            .iter()
            .chain(content.compile_command.iter())
            .chain(lint.iter())
            .chain(content.run_commands.iter())
            .chain(content.test_command.iter());

        let tree = VcsTree(self.collab.vcs.as_ref());
        let ctx = HealingContext {
            envelope,
            oracle: self.collab.oracle.as_ref(),
            workspace: self.collab.workspace.as_ref(),
            tree: &tree,
            replay: &task.replay,
            sampling: &self.config.sampling,
        };
        for spec in commands {
            if let Err(denial) = self.collab.gates.check_command(envelope, spec) {
                task.controller.reject(State::Verifying, denial.to_string());
                return Err(Halt::escalate(denial.to_string()));
            }
            let _install = if spec.is_package_install() {
                Some(self.lock(task, LockKind::DependencyInstall)?)
            } else {
                None
            };
            let report = task.engine.run_with_healing(spec, profile, &ctx).await;
            self.check_tree_scope(task, envelope)?;
            self.charge(task, report.session.fix_lines())?;

            match report.outcome {
                HealingOutcome::Succeeded => {}
                HealingOutcome::Interrupted => return Err(Halt::Stopped),
                HealingOutcome::OutOfScope { violation } => {
                    let detail = violation.to_string();
                    task.controller.record(|ev| ev.scope_violation = Some(violation));
                    return Err(Halt::scope(detail));
                }
                HealingOutcome::Blocked { reason } => return Err(Halt::escalate(reason)),
                HealingOutcome::NotRetryable { failure } => match failure {
                    FailureKind::Logic => {
                        return Err(Halt::escalate(format!(
                            "`{}` fails on assertions; the tests or the plan need review",
                            spec.literal()
                        )))
                    }
                    FailureKind::Environment { reason } => return Err(Halt::escalate(reason)),
                    FailureKind::Interrupted => return Err(Halt::Stopped),
                    other => return Ok(Pass::Restart(format!("`{}`: {other}", spec.literal()))),
                },
                HealingOutcome::Exhausted { failure } => {
                    return Ok(Pass::Restart(format!(
                        "`{}` still failing after {} attempts: {failure}",
                        spec.literal(),
                        report.session.attempts()
                    )))
                }
                HealingOutcome::CycleDetected { fix_hash, kind } => {
                    return Ok(Pass::Restart(format!(
                        "`{}`: fix {} repeats an earlier attempt ({kind:?})",
                        spec.literal(),
                        fix_hash.short()
                    )))
                }
                HealingOutcome::FixFailed { reason } => {
                    return Ok(Pass::Restart(format!("`{}`: {reason}", spec.literal())))
                }
            }
        }
        Ok(Pass::Done)
    }

    async fn verify(&self, task: &RunningTask) -> Step {
        let envelope = self.envelope(task)?;
        let profile = self.profile_for(&envelope);
        let red_tests = task.controller.inspect(|t| t.evidence().red_tests.clone());
        let verifier = Verifier {
            engine: task.engine.as_ref(),
            envelope: &envelope,
            profile,
            workspace: self.collab.workspace.as_ref(),
            vcs: self.collab.vcs.as_ref(),
            lockfiles: &self.config.lockfiles,
            red_tests: &red_tests,
        };
        let report = verifier.run().await;
        task.controller.record(|ev| ev.verification = Some(report.clone()));
        // Tiers run arbitrary commands; anything they wrote is checked before routing.
        self.check_tree_scope(task, &envelope)?;
        self.charge(task, 0)?;

        match report.route() {
            VerificationRoute::Pass => self.merge_gate(task, &envelope, report).await,
            route => self.route_failure(task, &report, route),
        }
    }

    fn route_failure(&self, task: &RunningTask, report: &VerificationReport, route: VerificationRoute) -> Step {
        let reason = report
            .failure
            .as_ref()
            .map_or_else(|| "verification failed".to_string(), ToString::to_string);
        match route {
            VerificationRoute::Pass => Ok(()),
            VerificationRoute::Stale => Err(Halt::Force {
                trigger: ForcedTrigger::Stale,
                detail: reason,
            }),
            VerificationRoute::Scope => Err(Halt::scope(reason)),
            VerificationRoute::Interrupted => Err(Halt::Stopped),
            VerificationRoute::Logic | VerificationRoute::Environment => {
                Err(Halt::escalate_to(reason, State::Implementing))
            }
            VerificationRoute::Retry => {
                let retries = task.controller.inspect(|t| t.evidence().implement_retries);
                if retries >= self.config.implement_retry_budget {
                    return Err(Halt::escalate_to(
                        format!("verification keeps failing: {reason}"),
                        State::Implementing,
                    ));
                }
                let request = match &report.failed_attempt {
                    Some(attempt) => FixRequest {
                        command: attempt.command.clone(),
                        attempt: attempt.index,
                        locations: attempt.locations.clone(),
                        output: attempt.output.clone(),
                        prior_fixes: Vec::new(),
                    },
                    None => FixRequest {
                        command: "verification".into(),
                        attempt: 0,
                        locations: Vec::new(),
                        output: reason.clone(),
                        prior_fixes: Vec::new(),
                    },
                };
                task.controller.record(|ev| {
                    ev.implement_retries += 1;
                    ev.pending_fix = Some(request);
                });
                self.transition(task, State::Implementing, reason)
            }
        }
    }

    async fn merge_gate(&self, task: &RunningTask, envelope: &PlanEnvelope, mut report: VerificationReport) -> Step {
        let vcs = self.collab.vcs.as_ref();
        self.gate(task, State::Complete, actions::COMMIT)?;
        self.check_tree_scope(task, envelope)?;
        let clean = vcs.is_working_tree_clean().map_err(|e| Halt::escalate(e.to_string()))?;
        let head = if clean {
            vcs.current_head_sha()
        } else {
            let summary = task
                .controller
                .inspect(|t| t.evidence().intent.as_ref().map(|i| i.summary.clone()))
                .unwrap_or_else(|| "implement task".into());
            vcs.commit_with_message(&format!(
                "{summary}\n\nplan {}\ntask {}",
                envelope.plan_envelope_hash(),
                task.id()
            ))
        }
        .map_err(|e| Halt::escalate(e.to_string()))?;

        let branch = task
            .controller
            .inspect(|t| t.branch().map(str::to_string))
            .ok_or_else(|| Halt::escalate("isolation branch missing"))?;
        let ci = tokio::select! {
            r = self.collab.ci.status(&branch, &head) => r.map_err(|e| Halt::escalate(e.to_string()))?,
            () = task.execution.cancelled() => return Err(Halt::Stopped),
        };
        report.record_ci(&ci);

        // Drift is judged before the CI verdict: a stale base fails the task whatever CI says.
        let origin = vcs.origin_main_sha().map_err(|e| Halt::escalate(e.to_string()))?;
        let ctx = MergeGuardContext::new(envelope.branch_base_sha(), origin, head, &ci);
        let check = MergeGuard::check(&ctx);
        let (stale, passed) = (check.is_stale(), check.passed());
        let detail = check
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        task.controller.record(|ev| {
            ev.verification = Some(report.clone());
            ev.merge_check = Some(check);
        });
        if stale {
            return Err(Halt::Force {
                trigger: ForcedTrigger::Stale,
                detail,
            });
        }
        if !report.passed() {
            return self.route_failure(task, &report, report.route());
        }
        if !passed {
            return Err(Halt::escalate_to(format!("merge guard: {detail}"), State::Implementing));
        }
        self.gate(task, State::Complete, actions::MERGE)?;
        self.transition(task, State::Complete, format!("merge-ready at {}", ctx.branch_head_sha))
    }

    fn halt(&self, task: &RunningTask, halt: Halt) {
        match halt {
            Halt::Stopped => {}
            Halt::Force { trigger, detail } => {
                task.controller.force_terminal(trigger, detail);
            }
            Halt::Escalate { reason, resume_to } => {
                let state = task.controller.state();
                let target = resume_to.unwrap_or_else(|| resume_target(state));
                match task.controller.request_approval(reason.clone(), target) {
                    Ok(_) | Err(TransitionRejection::AlreadyTerminal { .. }) => {}
                    Err(rejection) => {
                        let trigger = match rejection.violation() {
                            Some(v) if v.is_scope() => ForcedTrigger::Scope,
                            Some(v) if v.is_budget() => ForcedTrigger::Timeout,
                            _ => ForcedTrigger::Interrupt,
                        };
                        task.controller
                            .force_terminal(trigger, format!("escalation refused ({rejection}): {reason}"));
                    }
                }
            }
        }
    }

    fn transition(&self, task: &RunningTask, next: State, detail: impl Into<String>) -> Step {
        match task.controller.attempt_transition(next, detail) {
            Ok(_) => Ok(()),
            Err(TransitionRejection::AlreadyTerminal { .. }) => Err(Halt::Stopped),
            Err(rejection) if rejection.violation().is_some_and(InvariantViolation::is_scope) => {
                Err(Halt::scope(rejection.to_string()))
            }
            Err(rejection) if rejection.violation().is_some_and(InvariantViolation::is_budget) => Err(Halt::Force {
                trigger: ForcedTrigger::Timeout,
                detail: rejection.to_string(),
            }),
            Err(rejection) => Err(Halt::escalate(rejection.to_string())),
        }
    }

    fn gate(&self, task: &RunningTask, next: State, action: &str) -> Step {
        self.collab.gates.check_capability(action).map_err(|denial| {
            task.controller.reject(next, denial.to_string());
            Halt::escalate(denial.to_string())
        })
    }

    fn lock(&self, task: &RunningTask, kind: LockKind) -> Result<LockGuard, Halt> {
        self.locks
            .acquire(kind, task.id().to_string())
            .map_err(|held| Halt::escalate(held.to_string()))
    }

    fn envelope(&self, task: &RunningTask) -> Result<PlanEnvelope, Halt> {
        task.controller
            .inspect(|t| t.envelope().cloned())
            .ok_or_else(|| Halt::escalate("plan envelope missing"))
    }

    fn profile_for(&self, envelope: &PlanEnvelope) -> &'static StackProfile {
        self.registry.lookup(&envelope.content().stack)
    }

    /// Scope- and size-check a patch, apply it, then scope-check the working tree
    fn apply_in_scope(&self, task: &RunningTask, envelope: &PlanEnvelope, patch: &Patch) -> Step {
        if let Err(violation) = envelope.check_changes(&patch.changes()) {
            let detail = violation.to_string();
            task.controller.record(|ev| ev.scope_violation = Some(violation));
            return Err(Halt::scope(detail));
        }
        let lines = patch
            .changed_lines(self.collab.workspace.as_ref())
            .map_err(|e| Halt::escalate(e.to_string()))?;
        if let Err(over) = self.config.budget.check_patch(lines) {
            let hash = patch.hash();
            let confirmed = task.controller.record(|ev| {
                let confirmed = ev.budget.is_confirmed(&hash);
                if !confirmed {
                    ev.budget.awaiting_confirmation = Some(hash);
                }
                confirmed
            });
            if !confirmed {
                tracing::warn!(%over, patch = %hash.short(), "patch needs confirmation");
                return Err(Halt::escalate(format!("{over}; approve to apply patch {}", hash.short())));
            }
        }
        self.collab
            .workspace
            .apply(patch)
            .map_err(|e| Halt::escalate(e.to_string()))?;
        self.check_tree_scope(task, envelope)?;
        self.charge(task, lines)
    }

    /// Account lines and launched commands, ending the task past a hard limit
    fn charge(&self, task: &RunningTask, lines: usize) -> Step {
        let commands = task.engine.commands_launched();
        let usage = task.controller.record(|ev| {
            ev.budget.record_lines(lines);
            ev.budget.commands = commands;
            ev.budget.clone()
        });
        match self.config.budget.exhausted(&usage) {
            Some(over) => {
                tracing::error!(%over, "risk budget exhausted");
                Err(Halt::Force {
                    trigger: ForcedTrigger::Timeout,
                    detail: over.to_string(),
                })
            }
            None => Ok(()),
        }
    }

    fn check_tree_scope(&self, task: &RunningTask, envelope: &PlanEnvelope) -> Step {
        let changes = self
            .collab
            .vcs
            .status()
            .map_err(|e| Halt::escalate(e.to_string()))?;
        if let Err(violation) = envelope.check_changes(&changes) {
            let detail = violation.to_string();
            task.controller.record(|ev| ev.scope_violation = Some(violation));
            return Err(Halt::scope(detail));
        }
        Ok(())
    }

    /// Record working-tree changes made since the task started
    fn record_read_only(&self, task: &RunningTask) -> Step {
        let changes = self
            .collab
            .vcs
            .status()
            .map_err(|e| Halt::escalate(e.to_string()))?;
        task.controller.record(|ev| {
            let fresh: Vec<FileChange> = changes
                .into_iter()
                .filter(|c| !ev.baseline_changes.contains(c))
                .collect();
            if !fresh.is_empty() {
                tracing::error!(changes = fresh.len(), "working tree mutated during a read-only state");
            }
            ev.readonly_violations.extend(fresh);
        });
        Ok(())
    }

    async fn oracle_call<T, F>(&self, task: &RunningTask, call: OracleCall, input: &[u8], fut: F) -> Result<T, Halt>
    where
        T: Serialize,
        F: Future<Output = Result<T, OracleError>>,
    {
        let result = tokio::select! {
            r = fut => r,
            () = task.execution.cancelled() => return Err(Halt::Stopped),
        };
        match result {
            Ok(value) => {
                let output = serde_json::to_vec(&value)
                    .map_err(|e| tracing::warn!(?call, error = %e, "oracle response could not be encoded for replay"))
                    .ok();
                task.replay.record(call, input, output.as_deref(), &self.config.sampling);
                Ok(value)
            }
            Err(e) => {
                task.replay.record(call, input, None, &self.config.sampling);
                Err(Halt::escalate(format!("{call:?} oracle call failed: {e}")))
            }
        }
    }

    async fn probe_toolchain(&self, task: &RunningTask, profile: &StackProfile) -> ToolchainManifest {
        let mut manifest = ToolchainManifest::new();
        for binary in profile.required_binaries {
            let Ok(text) = CommandText::parse(format!("{binary} --version")) else {
                continue;
            };
            let raw = self
                .collab
                .runner
                .run(&text, self.collab.workspace.root(), TOOLCHAIN_PROBE_TIMEOUT, &task.execution)
                .await;
            let version = if raw.exit.is_success() {
                raw.combined_output()
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .unwrap_or("unknown")
                    .to_string()
            } else {
                "unavailable".to_string()
            };
            manifest.insert(*binary, version);
        }
        manifest
    }

    async fn finish(&self, task: &RunningTask) {
        let stopped = task.engine.shutdown().await;
        let released = self.locks.release_all();
        tracing::info!(
            task = %task.id(),
            state = %task.controller.state(),
            servers_stopped = stopped,
            locks_released = released,
            "task finished"
        );
    }

    fn outcome(&self, task: &RunningTask) -> TaskOutcome {
        let servers = task.engine.background().servers();
        task.controller.inspect(|t| {
            let ev = t.evidence();
            TaskOutcome {
                task_id: t.id(),
                state: t.state(),
                records: t.audit().records(),
                replay: task.replay.entries(),
                plan_envelope_hash: t.envelope().map(PlanEnvelope::plan_envelope_hash),
                input_snapshot_hash: t.envelope().map(PlanEnvelope::input_snapshot_hash),
                branch: t.branch().map(str::to_string),
                verification: ev.verification.clone(),
                merge_check: ev.merge_check.clone(),
                pending_approval: (t.state() == State::FeedbackWait)
                    .then(|| ev.approval_request.clone())
                    .flatten(),
                servers,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relevant_files_rank_by_request_words() {
        let files: Vec<String> = ["README.md", "src/health.py", "src/app.py", "tests/test_health.py"]
            .into_iter()
            .map(String::from)
            .collect();
        let picked = select_relevant_files(&files, "add a /health endpoint to the app", 2);
        assert_eq!(picked, vec!["src/health.py".to_string(), "tests/test_health.py".to_string()]);
    }

    #[test]
    fn relevant_files_respect_cap() {
        let files: Vec<String> = (0..80).map(|i| format!("f{i}.py")).collect();
        assert_eq!(select_relevant_files(&files, "anything", 50).len(), 50);
    }

    #[test]
    fn escalations_resume_to_a_legal_target() {
        for state in State::ALL.into_iter().filter(|s| !s.is_terminal() && *s != State::FeedbackWait) {
            let target = resume_target(state);
            assert!(crate::state::validate_transition(State::FeedbackWait, target).is_ok());
        }
    }
}
