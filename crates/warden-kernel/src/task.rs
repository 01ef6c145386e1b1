//! The governed unit of work and the evidence its invariants read

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_exec::FixRequest;
use warden_plan::{ContentHash, FileChange, PlanEnvelope, ScopeViolation, ToolchainManifest};

use crate::audit::AuditLog;
use crate::budget::BudgetUsage;
use crate::merge::MergeCheck;
use crate::state::State;
use crate::test_quality::TestQuality;
use crate::verify::VerificationReport;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used in branch names
    #[must_use]
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of intent analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentRecord {
    /// One-line restatement of the request
    pub summary: String,
    /// Stack the request mentions, if any
    pub stack_hint: Option<String>,
    /// The request is too ambiguous to plan
    pub needs_clarification: bool,
}

/// Result of repository discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMap {
    /// Files relevant to the request
    pub files: Vec<String>,
    /// Tree id of the base commit
    pub base_tree_hash: String,
    /// Detected stack tag
    pub stack: String,
    /// Tool versions on the host
    pub toolchain: ToolchainManifest,
}

impl RepoMap {
    /// Newline-joined file list, the form the planner sees
    #[must_use]
    pub fn render(&self) -> String {
        self.files.join("\n")
    }
}

/// A test registered in PROVING_GROUND
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedTest {
    /// Repository-relative path
    pub path: String,
    /// Content hash at registration; later edits break TDD integrity
    pub content_hash: ContentHash,
    /// Observed failing before any implementation existed
    pub observed_failing: bool,
}

/// Pending request for human input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// What the human is asked to decide
    pub reason: String,
    /// When the request was raised
    pub requested_at: DateTime<Utc>,
    /// State the task returns to once approved
    pub resume_to: State,
}

/// Human decision on an [`ApprovalRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    /// True to resume, false to fail the task
    pub approved: bool,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
    /// Free-form note; becomes a clarification when resuming intent analysis
    #[serde(default)]
    pub note: String,
}

impl Approval {
    /// Approval decided now
    #[must_use]
    pub fn approve(note: impl Into<String>) -> Self {
        Self {
            approved: true,
            decided_at: Utc::now(),
            note: note.into(),
        }
    }

    /// Rejection decided now
    #[must_use]
    pub fn deny(note: impl Into<String>) -> Self {
        Self {
            approved: false,
            decided_at: Utc::now(),
            note: note.into(),
        }
    }
}

/// Facts gathered while the task runs
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    /// Structured request
    pub intent: Option<IntentRecord>,
    /// Notes attached to approvals that resumed into INTENT_ANALYSIS
    pub clarifications: Vec<String>,
    /// Files and toolchain seen in discovery
    pub repo_map: Option<RepoMap>,
    /// Working-tree changes present before the task started
    pub baseline_changes: Vec<FileChange>,
    /// Mutations seen during a read-only state
    pub readonly_violations: Vec<FileChange>,
    /// Tests committed failing before any implementation
    pub red_tests: Vec<RedTest>,
    /// Assessment of the last proposed test files
    pub test_quality: Vec<TestQuality>,
    /// Lines changed and commands launched so far
    pub budget: BudgetUsage,
    /// Routes from VERIFYING back to IMPLEMENTING plus in-state restarts
    pub implement_retries: u32,
    /// First write seen outside the plan
    pub scope_violation: Option<ScopeViolation>,
    /// Failure the next IMPLEMENTING pass must fix
    pub pending_fix: Option<FixRequest>,
    /// Latest verification result
    pub verification: Option<VerificationReport>,
    /// Escalation awaiting a decision
    pub approval_request: Option<ApprovalRequest>,
    /// Decision for `approval_request`
    pub approval: Option<Approval>,
    /// Latest merge guard evaluation
    pub merge_check: Option<MergeCheck>,
}

/// A task and everything the controller tracks for it
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) request: String,
    pub(crate) state: State,
    pub(crate) envelope: Option<PlanEnvelope>,
    pub(crate) branch: Option<String>,
    pub(crate) evidence: Evidence,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) active_time: Duration,
}

impl Task {
    /// New task in INTENT_ANALYSIS
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            request: request.into(),
            state: State::IntentAnalysis,
            envelope: None,
            branch: None,
            evidence: Evidence::default(),
            audit: Arc::new(AuditLog::new()),
            started_at: Utc::now(),
            active_time: Duration::ZERO,
        }
    }

    /// Task identifier
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request as submitted
    #[must_use]
    pub fn request(&self) -> &str {
        &self.request
    }

    /// The request followed by any clarifications, as the planner sees it
    #[must_use]
    pub fn effective_request(&self) -> String {
        let mut out = self.request.clone();
        for note in &self.evidence.clarifications {
            out.push_str("\n\nClarification: ");
            out.push_str(note);
        }
        out
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Frozen plan, once PLANNING produced one
    #[must_use]
    pub fn envelope(&self) -> Option<&PlanEnvelope> {
        self.envelope.as_ref()
    }

    /// Isolation branch, once created
    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Facts the invariants read
    #[must_use]
    pub fn evidence(&self) -> &Evidence {
        &self.evidence
    }

    /// Transition log
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Creation time
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Runtime consumed outside FEEDBACK_WAIT
    #[must_use]
    pub fn active_time(&self) -> Duration {
        self.active_time
    }
}
