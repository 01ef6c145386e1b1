//! Verification tiers and governance checks
//!
//! Governance checks run first (scope, dependency freeze, TDD integrity,
//! drift), then the command tiers in order: syntax, lint, unit test,
//! integration. The first failure stops the run and decides the route.
//! The CI tier is appended later, once the branch head has been pushed
//! through CI.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use warden_exec::{ExecutionAttempt, ExecutionEngine, FailureKind, StackProfile, Workspace};
use warden_plan::{compute_lockfile_hash, CommandSpec, ContentHash, FileChange, PlanEnvelope};

use crate::ci::{CiReport, CiState};
use crate::task::RedTest;
use crate::vcs::Vcs;

/// Command tiers, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationTier {
    Syntax,
    Lint,
    UnitTest,
    IntegrationTest,
    CiGate,
}

impl fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Syntax => "syntax",
            Self::Lint => "lint",
            Self::UnitTest => "unit_test",
            Self::IntegrationTest => "integration_test",
            Self::CiGate => "ci_gate",
        })
    }
}

/// Checks that do not run a planned command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernanceCheck {
    Scope,
    DependencyFreeze,
    TddIntegrity,
    Drift,
}

/// The first failure found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckFailure {
    OutOfScope { offending: Vec<FileChange> },
    LockfileChanged { expected: ContentHash, actual: ContentHash },
    TestModified { path: String },
    Drift { base: String, origin: String },
    Command { tier: VerificationTier, command: String, failure: FailureKind },
    Ci { status: CiState },
    /// A check could not be evaluated
    Unavailable { check: String, reason: String },
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfScope { offending } => write!(f, "{} change(s) outside declared scope", offending.len()),
            Self::LockfileChanged { expected, actual } => {
                write!(f, "lockfiles changed: {} -> {}", expected.short(), actual.short())
            }
            Self::TestModified { path } => write!(f, "registered test {path} was modified"),
            Self::Drift { base, origin } => write!(f, "origin/main moved from {base} to {origin}"),
            Self::Command { tier, command, failure } => write!(f, "{tier} `{command}` failed: {failure}"),
            Self::Ci { status } => write!(f, "ci status is {status}"),
            Self::Unavailable { check, reason } => write!(f, "{check} could not be evaluated: {reason}"),
        }
    }
}

/// Where a verification result sends the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationRoute {
    /// Proceed to the merge guard
    Pass,
    /// FAILED_BY_STALE
    Stale,
    /// FAILED_BY_SCOPE
    Scope,
    /// Back to IMPLEMENTING within the retry budget
    Retry,
    /// FEEDBACK_WAIT: the tests or the plan are wrong
    Logic,
    /// FEEDBACK_WAIT: the host needs fixing
    Environment,
    /// The task is being stopped
    Interrupted,
}

/// One governance check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GovernanceResult {
    /// Which check
    pub check: GovernanceCheck,
    /// Whether it held
    pub passed: bool,
}

/// One command tier
#[derive(Debug, Clone, Serialize)]
pub struct TierResult {
    /// Which tier
    pub tier: VerificationTier,
    /// `None` when the tier was skipped
    pub command: Option<String>,
    /// Whether the tier passed
    pub passed: bool,
    /// Outcome summary; the skip reason for skipped tiers
    pub detail: String,
}

/// Everything verification found
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    /// Governance checks in the order they ran
    pub governance: Vec<GovernanceResult>,
    /// Command tiers in the order they ran
    pub tiers: Vec<TierResult>,
    /// First failure; `None` when everything passed
    pub failure: Option<CheckFailure>,
    /// Last failing attempt, kept for the next fix request
    #[serde(skip)]
    pub failed_attempt: Option<ExecutionAttempt>,
    /// When verification finished
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    fn new() -> Self {
        Self {
            governance: Vec::new(),
            tiers: Vec::new(),
            failure: None,
            failed_attempt: None,
            verified_at: Utc::now(),
        }
    }

    /// True when no failure was recorded
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    /// Route implied by the first failure
    #[must_use]
    pub fn route(&self) -> VerificationRoute {
        match &self.failure {
            None => VerificationRoute::Pass,
            Some(CheckFailure::Drift { .. }) => VerificationRoute::Stale,
            Some(CheckFailure::OutOfScope { .. }) => VerificationRoute::Scope,
            Some(CheckFailure::Unavailable { .. }) => VerificationRoute::Environment,
            Some(CheckFailure::Command { failure, .. }) => match failure {
                FailureKind::Tool { .. } => VerificationRoute::Retry,
                FailureKind::Logic => VerificationRoute::Logic,
                FailureKind::Environment { .. } => VerificationRoute::Environment,
                FailureKind::Interrupted => VerificationRoute::Interrupted,
            },
            Some(
                CheckFailure::LockfileChanged { .. } | CheckFailure::TestModified { .. } | CheckFailure::Ci { .. },
            ) => VerificationRoute::Retry,
        }
    }

    /// Append the CI tier
    pub fn record_ci(&mut self, ci: &CiReport) {
        let passed = ci.status == CiState::Success;
        self.tiers.push(TierResult {
            tier: VerificationTier::CiGate,
            command: None,
            passed,
            detail: format!("{} on {}", ci.status, ci.validated_sha),
        });
        if !passed && self.failure.is_none() {
            self.failure = Some(CheckFailure::Ci { status: ci.status });
        }
    }

    fn governance(&mut self, check: GovernanceCheck, result: Result<(), CheckFailure>) -> bool {
        let passed = result.is_ok();
        self.governance.push(GovernanceResult { check, passed });
        if let Err(f) = result {
            tracing::warn!(?check, failure = %f, "governance check failed");
            self.failure = Some(f);
        }
        passed
    }
}

/// Runs verification for one task
pub struct Verifier<'a> {
    /// Runs the tier commands
    pub engine: &'a ExecutionEngine,
    /// Frozen plan
    pub envelope: &'a PlanEnvelope,
    /// Stack profile for fallbacks and error extraction
    pub profile: &'a StackProfile,
    /// Reads registered tests
    pub workspace: &'a dyn Workspace,
    /// Working tree status and drift
    pub vcs: &'a dyn Vcs,
    /// Lockfile names for the dependency freeze
    pub lockfiles: &'a [String],
    /// Tests registered in PROVING_GROUND
    pub red_tests: &'a [RedTest],
}

impl Verifier<'_> {
    /// Governance checks, then command tiers; stops at the first failure
    pub async fn run(&self) -> VerificationReport {
        let mut report = VerificationReport::new();
        let passed = report.governance(GovernanceCheck::Scope, self.check_scope())
            && report.governance(GovernanceCheck::DependencyFreeze, self.check_lockfiles())
            && report.governance(GovernanceCheck::TddIntegrity, self.check_red_tests())
            && report.governance(GovernanceCheck::Drift, self.check_drift());
        if !passed {
            return report;
        }

        let content = self.envelope.content();
        let lint = content
            .lint_command
            .clone()
            .or_else(|| self.profile.fallback_lint_spec());
        let tiers = [
            (VerificationTier::Syntax, content.compile_command.clone()),
            (VerificationTier::Lint, lint),
            (VerificationTier::UnitTest, content.test_command.clone()),
            (VerificationTier::IntegrationTest, content.run_command.clone()),
        ];
        for (tier, spec) in tiers {
            if !self.run_tier(&mut report, tier, spec.as_ref()).await {
                break;
            }
        }
        tracing::info!(passed = report.passed(), route = ?report.route(), "verification finished");
        report
    }

    async fn run_tier(&self, report: &mut VerificationReport, tier: VerificationTier, spec: Option<&CommandSpec>) -> bool {
        let Some(spec) = spec else {
            report.tiers.push(TierResult {
                tier,
                command: None,
                passed: true,
                detail: "skipped: no command".into(),
            });
            return true;
        };
        let attempt = self.engine.run(spec, self.profile).await;
        let detail = match (&attempt.failure, &attempt.server) {
            (Some(f), _) => f.to_string(),
            (None, Some(server)) => format!("background server, health {:?}", server.health),
            (None, None) => "ok".into(),
        };
        report.tiers.push(TierResult {
            tier,
            command: Some(spec.literal().to_string()),
            passed: attempt.succeeded(),
            detail,
        });
        match attempt.failure.clone() {
            None => true,
            Some(failure) => {
                report.failure = Some(CheckFailure::Command {
                    tier,
                    command: spec.literal().to_string(),
                    failure,
                });
                report.failed_attempt = Some(attempt);
                false
            }
        }
    }

    fn check_scope(&self) -> Result<(), CheckFailure> {
        let changes = self.vcs.status().map_err(|e| unavailable("scope", &e))?;
        self.envelope
            .check_changes(&changes)
            .map_err(|v| CheckFailure::OutOfScope { offending: v.offending })
    }

    fn check_lockfiles(&self) -> Result<(), CheckFailure> {
        let current = compute_lockfile_hash(self.workspace.root(), self.lockfiles)
            .map_err(|e| unavailable("dependency freeze", &e))?;
        let expected = self.envelope.content().lockfile_hash;
        if current == expected {
            Ok(())
        } else {
            Err(CheckFailure::LockfileChanged {
                expected,
                actual: current,
            })
        }
    }

    fn check_red_tests(&self) -> Result<(), CheckFailure> {
        for test in self.red_tests {
            let bytes = self
                .workspace
                .read(&test.path)
                .map_err(|e| unavailable("tdd integrity", &e))?;
            let unchanged = bytes.is_some_and(|b| ContentHash::compute(&b) == test.content_hash);
            if !unchanged {
                return Err(CheckFailure::TestModified {
                    path: test.path.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_drift(&self) -> Result<(), CheckFailure> {
        let origin = self.vcs.origin_main_sha().map_err(|e| unavailable("drift", &e))?;
        let base = self.envelope.branch_base_sha();
        if origin == base {
            Ok(())
        } else {
            Err(CheckFailure::Drift {
                base: base.to_string(),
                origin,
            })
        }
    }
}

fn unavailable(check: &str, err: &dyn fmt::Display) -> CheckFailure {
    CheckFailure::Unavailable {
        check: check.to_string(),
        reason: err.to_string(),
    }
}
