//! Testing utilities for the Warden workspace
//!
//! In-memory stand-ins for every collaborator the kernel talks to, plus a
//! small Python fixture repository.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use warden_exec::{
    BinaryResolver, CodeOracle, CommandRunner, ExecError, ExitState, FixRequest, OracleError, Patch,
    RawOutcome, ServerProcess, TreeStatus, Workspace, WorkspaceError,
};
use warden_kernel::{
    CiError, CiReport, CiState, CiStatusSource, Collaborators, IntentRecord, Planner, PolicyGates, Vcs,
    VcsError,
};
use warden_plan::{
    ChangeKind, CommandRole, CommandSpec, CommandText, ContentHash, FieldHasher, FileChange, FileScope,
    InputSnapshot, PlanContent, PlanEnvelope,
};

// ── repository ───────────────────────────────────────────────────────────

type Tree = BTreeMap<String, String>;

#[derive(Debug)]
struct RepoState {
    /// `(sha, tree)` in commit order
    commits: Vec<(String, Tree)>,
    /// Branch name → index into `commits`
    branches: BTreeMap<String, usize>,
    current: String,
    working: Tree,
    /// Overrides the main head as the remote main commit
    origin_main: Option<String>,
}

impl RepoState {
    fn head(&self) -> usize {
        self.branches.get(&self.current).copied().unwrap_or(0)
    }
}

/// A git repository held in memory, usable as both [`Vcs`] and [`Workspace`]
#[derive(Debug)]
pub struct InMemoryRepo {
    root: PathBuf,
    state: Mutex<RepoState>,
}

fn tree_hash(tree: &Tree) -> ContentHash {
    tree.iter()
        .fold(FieldHasher::new(), |h, (path, content)| {
            h.field("path", path.as_bytes()).field("content", content.as_bytes())
        })
        .finish()
}

impl InMemoryRepo {
    /// Repository on `main` with one commit holding `files`
    pub fn new<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Arc<Self> {
        let tree: Tree = files
            .into_iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        let sha = FieldHasher::new()
            .field("message", b"initial commit")
            .field("tree", tree_hash(&tree).as_bytes())
            .finish()
            .to_string();
        Arc::new(Self {
            root: PathBuf::from("/warden-in-memory"),
            state: Mutex::new(RepoState {
                commits: vec![(sha, tree.clone())],
                branches: BTreeMap::from([("main".to_string(), 0)]),
                current: "main".into(),
                working: tree,
                origin_main: None,
            }),
        })
    }

    /// Write a file behind the kernel's back
    pub fn write(&self, path: &str, content: &str) {
        self.state.lock().working.insert(path.to_string(), content.to_string());
    }

    /// Working-tree content
    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().working.get(path).cloned()
    }

    /// Content at the head of the current branch
    pub fn committed(&self, path: &str) -> Option<String> {
        let state = self.state.lock();
        state.commits[state.head()].1.get(path).cloned()
    }

    pub fn current_branch(&self) -> String {
        self.state.lock().current.clone()
    }

    pub fn branches(&self) -> Vec<String> {
        self.state.lock().branches.keys().cloned().collect()
    }

    pub fn main_sha(&self) -> String {
        let state = self.state.lock();
        state.commits[state.branches["main"]].0.clone()
    }

    /// Commits reachable on the current branch, counting the initial one
    pub fn commit_count(&self) -> usize {
        self.state.lock().head() + 1
    }

    /// Simulate someone merging into the remote main branch
    pub fn advance_origin(&self, sha: impl Into<String>) {
        self.state.lock().origin_main = Some(sha.into());
    }
}

impl Vcs for InMemoryRepo {
    fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        let mut state = self.state.lock();
        if state.branches.contains_key(name) {
            return Err(VcsError::Unsupported(format!("branch {name} already exists")));
        }
        let head = state.head();
        state.branches.insert(name.to_string(), head);
        state.current = name.to_string();
        Ok(())
    }

    fn hard_reset_to_last_commit(&self, branch: &str) -> Result<(), VcsError> {
        let mut state = self.state.lock();
        let idx = *state
            .branches
            .get(branch)
            .ok_or_else(|| VcsError::Unsupported(format!("unknown branch {branch}")))?;
        state.current = branch.to_string();
        state.working = state.commits[idx].1.clone();
        Ok(())
    }

    fn commit_with_message(&self, message: &str) -> Result<String, VcsError> {
        let mut state = self.state.lock();
        let parent = state.commits[state.head()].0.clone();
        let tree = state.working.clone();
        let sha = FieldHasher::new()
            .field("parent", parent.as_bytes())
            .field("message", message.as_bytes())
            .field("tree", tree_hash(&tree).as_bytes())
            .finish()
            .to_string();
        state.commits.push((sha.clone(), tree));
        let idx = state.commits.len() - 1;
        let current = state.current.clone();
        state.branches.insert(current, idx);
        Ok(sha)
    }

    fn current_head_sha(&self) -> Result<String, VcsError> {
        let state = self.state.lock();
        Ok(state.commits[state.head()].0.clone())
    }

    fn base_tree_hash(&self) -> Result<String, VcsError> {
        let state = self.state.lock();
        Ok(tree_hash(&state.commits[state.head()].1).to_string())
    }

    fn status(&self) -> Result<Vec<FileChange>, VcsError> {
        let state = self.state.lock();
        let head = &state.commits[state.head()].1;
        let mut changes: Vec<FileChange> = state
            .working
            .iter()
            .filter_map(|(path, content)| match head.get(path) {
                None => Some(FileChange::new(path, ChangeKind::Created)),
                Some(old) if old != content => Some(FileChange::new(path, ChangeKind::Modified)),
                Some(_) => None,
            })
            .collect();
        changes.extend(
            head.keys()
                .filter(|p| !state.working.contains_key(*p))
                .map(|p| FileChange::new(p, ChangeKind::Deleted)),
        );
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn origin_main_sha(&self) -> Result<String, VcsError> {
        let state = self.state.lock();
        Ok(state
            .origin_main
            .clone()
            .unwrap_or_else(|| state.commits[state.branches["main"]].0.clone()))
    }

    fn list_files(&self) -> Result<Vec<String>, VcsError> {
        let state = self.state.lock();
        Ok(state.commits[state.head()].1.keys().cloned().collect())
    }
}

fn check_relative(path: &str) -> Result<(), WorkspaceError> {
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        Err(WorkspaceError::PathEscape(path.to_string()))
    } else {
        Ok(())
    }
}

impl Workspace for InMemoryRepo {
    fn root(&self) -> &Path {
        &self.root
    }

    fn apply(&self, patch: &Patch) -> Result<(), WorkspaceError> {
        for file in &patch.files {
            check_relative(&file.path)?;
        }
        let mut state = self.state.lock();
        for file in &patch.files {
            match &file.content {
                Some(content) => {
                    state.working.insert(file.path.clone(), content.clone());
                }
                None => {
                    state.working.remove(&file.path);
                }
            }
        }
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>, WorkspaceError> {
        check_relative(path)?;
        Ok(self.state.lock().working.get(path).map(|c| c.clone().into_bytes()))
    }
}

impl TreeStatus for InMemoryRepo {
    fn changes(&self) -> Result<Vec<FileChange>, WorkspaceError> {
        self.status().map_err(|e| WorkspaceError::Status(e.to_string()))
    }
}

// ── command runner ───────────────────────────────────────────────────────

/// One scripted command result
#[derive(Debug, Clone)]
pub enum Step {
    Exit { code: i32, output: String },
    /// Block until cancelled or timed out
    Hang,
    TimedOut,
}

impl Step {
    pub fn ok(output: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            output: output.into(),
        }
    }

    pub fn fail(code: i32, output: impl Into<String>) -> Self {
        Self::Exit {
            code,
            output: output.into(),
        }
    }
}

/// [`CommandRunner`] replaying scripted results per command literal
///
/// Steps for a literal are consumed in order; the last one repeats.
/// Unscripted commands succeed with no output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue steps for `literal`
    pub fn on(&self, literal: &str, steps: impl IntoIterator<Item = Step>) {
        self.steps
            .lock()
            .entry(literal.to_string())
            .or_default()
            .extend(steps);
    }

    /// Every command run, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, literal: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == literal).count()
    }

    fn next_step(&self, literal: &str) -> Step {
        let mut steps = self.steps.lock();
        match steps.get_mut(literal) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| Step::ok("")),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Step::ok("")),
            None => Step::ok(""),
        }
    }
}

/// Background process that does nothing
#[derive(Debug, Default)]
pub struct NoopServer {
    pub terminated: bool,
}

#[async_trait]
impl ServerProcess for NoopServer {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self) {
        self.terminated = true;
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandText, _cwd: &Path, timeout: Duration, cancel: &CancellationToken) -> RawOutcome {
        self.calls.lock().push(command.literal().to_string());
        let started = tokio::time::Instant::now();
        let (exit, stdout) = match self.next_step(command.literal()) {
            Step::Exit { code, output } => (ExitState::Exited(code), output),
            Step::TimedOut => (ExitState::TimedOut, String::new()),
            Step::Hang => tokio::select! {
                () = cancel.cancelled() => (ExitState::Cancelled, String::new()),
                () = tokio::time::sleep(timeout) => (ExitState::TimedOut, String::new()),
            },
        };
        RawOutcome {
            exit,
            stdout,
            stderr: String::new(),
            duration: started.elapsed(),
        }
    }

    async fn spawn_background(&self, command: &CommandText, _cwd: &Path) -> Result<Box<dyn ServerProcess>, ExecError> {
        self.calls.lock().push(command.literal().to_string());
        Ok(Box::new(NoopServer::default()))
    }
}

/// Resolves every binary to `/usr/bin/<name>`
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllResolver;

impl BinaryResolver for AllowAllResolver {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        Some(PathBuf::from("/usr/bin").join(name))
    }
}

// ── oracles ──────────────────────────────────────────────────────────────

fn pop_sticky<T: Clone>(queue: &Mutex<VecDeque<T>>, what: &str) -> Result<T, OracleError> {
    let mut queue = queue.lock();
    let item = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
    item.ok_or_else(|| OracleError::Unavailable(format!("no scripted {what}")))
}

/// [`CodeOracle`] returning queued patches; the last of each kind repeats
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    tests: Mutex<VecDeque<Patch>>,
    implementations: Mutex<VecDeque<Patch>>,
    fixes: Mutex<VecDeque<Patch>>,
    fix_requests: Mutex<Vec<FixRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tests(self, patch: Patch) -> Self {
        self.tests.lock().push_back(patch);
        self
    }

    #[must_use]
    pub fn with_implementation(self, patch: Patch) -> Self {
        self.implementations.lock().push_back(patch);
        self
    }

    #[must_use]
    pub fn with_fix(self, patch: Patch) -> Self {
        self.fixes.lock().push_back(patch);
        self
    }

    /// Fix requests received, in order
    pub fn fix_requests(&self) -> Vec<FixRequest> {
        self.fix_requests.lock().clone()
    }
}

#[async_trait]
impl CodeOracle for ScriptedOracle {
    async fn propose_tests(&self, _envelope: &PlanEnvelope) -> Result<Patch, OracleError> {
        pop_sticky(&self.tests, "tests")
    }

    async fn propose_implementation(&self, _envelope: &PlanEnvelope) -> Result<Patch, OracleError> {
        pop_sticky(&self.implementations, "implementation")
    }

    async fn propose_fix(&self, request: &FixRequest) -> Result<Patch, OracleError> {
        self.fix_requests.lock().push(request.clone());
        pop_sticky(&self.fixes, "fix")
    }
}

/// [`Planner`] returning queued intents and a fixed plan
#[derive(Debug)]
pub struct ScriptedPlanner {
    intents: Mutex<VecDeque<IntentRecord>>,
    plan: PlanContent,
    requests: Mutex<Vec<String>>,
    snapshots: Mutex<Vec<InputSnapshot>>,
}

impl ScriptedPlanner {
    pub fn new(intent: IntentRecord, plan: PlanContent) -> Self {
        Self {
            intents: Mutex::new(VecDeque::from([intent])),
            plan,
            requests: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    /// Intents returned in order before the last one repeats
    pub fn with_intents(intents: impl IntoIterator<Item = IntentRecord>, plan: PlanContent) -> Self {
        Self {
            intents: Mutex::new(intents.into_iter().collect()),
            ..Self::new(python_intent(), plan)
        }
    }

    /// Requests passed to intent analysis
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<InputSnapshot> {
        self.snapshots.lock().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn analyze_intent(&self, request: &str) -> Result<IntentRecord, OracleError> {
        self.requests.lock().push(request.to_string());
        pop_sticky(&self.intents, "intent")
    }

    async fn propose_plan(&self, snapshot: &InputSnapshot) -> Result<PlanContent, OracleError> {
        self.snapshots.lock().push(snapshot.clone());
        Ok(self.plan.clone())
    }
}

// ── CI ───────────────────────────────────────────────────────────────────

/// [`CiStatusSource`] with a fixed verdict
#[derive(Debug, Clone)]
pub enum FakeCi {
    /// Reports `status` on whatever head is asked about
    OnHead { status: CiState },
    /// Reports exactly this run
    Fixed(CiReport),
    Unavailable,
}

impl FakeCi {
    pub fn success() -> Arc<Self> {
        Arc::new(Self::OnHead {
            status: CiState::Success,
        })
    }
}

#[async_trait]
impl CiStatusSource for FakeCi {
    async fn status(&self, _branch: &str, head_sha: &str) -> Result<CiReport, CiError> {
        match self {
            Self::OnHead { status } => Ok(CiReport {
                validated_sha: head_sha.to_string(),
                status: *status,
                is_latest_run: true,
            }),
            Self::Fixed(report) => Ok(report.clone()),
            Self::Unavailable => Err(CiError::Unavailable("ci offline".into())),
        }
    }
}

// ── fixtures ─────────────────────────────────────────────────────────────

pub const REQUEST: &str = "Add a /health endpoint to the Python app";
pub const TEST_COMMAND: &str = "pytest -q";
pub const LINT_COMMAND: &str = "ruff check .";
pub const FAILING_TESTS: &str = "FAILED test_app.py::test_health - AssertionError\n1 failed in 0.02s\n";

pub fn python_intent() -> IntentRecord {
    IntentRecord {
        summary: "add GET /health returning ok".into(),
        stack_hint: Some("python".into()),
        needs_clarification: false,
    }
}

/// Plan touching `app.py` and creating `test_app.py`
pub fn python_plan() -> PlanContent {
    PlanContent {
        stack: "python".into(),
        install_command: None,
        compile_command: None,
        lint_command: CommandSpec::new(CommandRole::Lint, LINT_COMMAND).ok(),
        run_command: None,
        test_command: CommandSpec::new(CommandRole::Test, TEST_COMMAND).ok(),
        run_commands: Vec::new(),
        scope: FileScope::new().modify("app.py").create("test_app.py"),
        test_files: ["test_app.py".to_string()].into_iter().collect(),
        dependencies: std::collections::BTreeSet::new(),
        lockfile_hash: ContentHash::default(),
    }
}

pub fn python_repo() -> Arc<InMemoryRepo> {
    InMemoryRepo::new([
        ("app.py", "from flask import Flask\n\napp = Flask(__name__)\n"),
        ("README.md", "# demo\n"),
        (".gitignore", "__pycache__/\n"),
    ])
}

pub fn red_test_patch() -> Patch {
    Patch::new(vec![warden_exec::FilePatch::write(
        "test_app.py",
        "from app import app\n\ndef test_health():\n    assert app.test_client().get('/health').status_code == 200\n",
    )])
}

pub fn health_patch() -> Patch {
    Patch::new(vec![warden_exec::FilePatch::write(
        "app.py",
        "from flask import Flask\n\napp = Flask(__name__)\n\n@app.get('/health')\ndef health():\n    return 'ok'\n",
    )])
}

/// Collaborators over an in-memory repo; tests fail once, then pass
pub struct Harness {
    pub repo: Arc<InMemoryRepo>,
    pub runner: Arc<ScriptedRunner>,
    pub oracle: Arc<ScriptedOracle>,
    pub planner: Arc<ScriptedPlanner>,
    pub ci: Arc<dyn CiStatusSource>,
    pub gates: PolicyGates,
}

impl Harness {
    pub fn python() -> Self {
        let runner = ScriptedRunner::new();
        runner.on(TEST_COMMAND, [Step::fail(1, FAILING_TESTS), Step::ok("1 passed in 0.01s\n")]);
        Self {
            repo: python_repo(),
            runner,
            oracle: Arc::new(
                ScriptedOracle::new()
                    .with_tests(red_test_patch())
                    .with_implementation(health_patch()),
            ),
            planner: Arc::new(ScriptedPlanner::new(python_intent(), python_plan())),
            ci: FakeCi::success(),
            gates: PolicyGates::default(),
        }
    }

    #[must_use]
    pub fn with_oracle(mut self, oracle: ScriptedOracle) -> Self {
        self.oracle = Arc::new(oracle);
        self
    }

    #[must_use]
    pub fn with_planner(mut self, planner: ScriptedPlanner) -> Self {
        self.planner = Arc::new(planner);
        self
    }

    #[must_use]
    pub fn with_ci(mut self, ci: Arc<dyn CiStatusSource>) -> Self {
        self.ci = ci;
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            vcs: Arc::clone(&self.repo) as Arc<dyn Vcs>,
            ci: Arc::clone(&self.ci),
            planner: Arc::clone(&self.planner) as Arc<dyn Planner>,
            oracle: Arc::clone(&self.oracle) as Arc<dyn CodeOracle>,
            workspace: Arc::clone(&self.repo) as Arc<dyn Workspace>,
            runner: Arc::clone(&self.runner) as Arc<dyn CommandRunner>,
            resolver: Arc::new(AllowAllResolver),
            gates: self.gates.clone(),
        }
    }
}
