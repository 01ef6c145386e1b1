//! The execution engine
//!
//! Runs planned commands in foreground or background, applies bucket
//! timeouts, and drives the bounded self-healing loop.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use warden_plan::{CommandRole, CommandSpec, OracleCall, PlanEnvelope, ReplayLog, SamplingPolicy};

use crate::background::{BackgroundProcesses, ServerInfo};
use crate::classify::{classify, CommandClass, TimeoutBucket};
use crate::extract::{ErrorExtractor, ErrorLocation};
use crate::failure::{classify_failure, FailureKind};
use crate::healing::{AppliedFix, CommandReport, HealingOutcome, HealingSession};
use crate::health::HealthChecker;
use crate::oracle::CodeOracle;
use crate::precheck::{check_binaries, required_binaries, BinaryResolver, PathResolver};
use crate::profile::StackProfile;
use crate::runner::{CommandRunner, ExitState, ShellRunner};
use crate::workspace::{TreeStatus, Workspace};
use crate::ExecError;

/// Default self-healing attempt cap per command
pub const MAX_HEAL_ATTEMPTS: u32 = 3;

/// Scrubs secrets from captured output before it is logged or sent anywhere
pub trait OutputRedactor: Send + Sync {
    /// Redacted copy of `text`
    fn redact(&self, text: &str) -> String;
}

/// Redactor that returns its input unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRedaction;

impl OutputRedactor for NoRedaction {
    fn redact(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory commands run in
    pub workdir: PathBuf,
    /// Self-healing cap per command
    pub max_heal_attempts: u32,
    /// Replaces bucket timeouts when set
    pub timeout_override: Option<Duration>,
    /// Bytes of output kept per attempt (tail)
    pub output_limit: usize,
    /// Fixes changing more lines than this are refused
    pub max_fix_lines: Option<usize>,
}

impl EngineConfig {
    /// Defaults rooted at `workdir`
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            max_heal_attempts: MAX_HEAL_ATTEMPTS,
            timeout_override: None,
            output_limit: 64 * 1024,
            max_fix_lines: None,
        }
    }
}

/// One executed attempt
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    /// 1-based attempt index within the healing session
    pub index: u32,
    /// Command literal
    pub command: String,
    /// Planned role
    pub role: CommandRole,
    /// Timeout bucket
    pub bucket: TimeoutBucket,
    /// Applied timeout
    pub timeout: Duration,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Termination
    pub exit: ExitState,
    /// Redacted, tail-truncated combined output
    pub output: String,
    /// Extracted error locations (empty on success)
    pub locations: Vec<ErrorLocation>,
    /// Failure class, `None` on success
    pub failure: Option<FailureKind>,
    /// Set for background launches
    pub server: Option<ServerInfo>,
}

impl ExecutionAttempt {
    /// No failure recorded
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Timed out at the bucket limit
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.exit == ExitState::TimedOut
    }
}

/// Collaborators the healing loop needs
pub struct HealingContext<'a> {
    /// Frozen plan; fixes are scope-checked against it
    pub envelope: &'a PlanEnvelope,
    /// Fix oracle
    pub oracle: &'a dyn CodeOracle,
    /// Where fixes are applied
    pub workspace: &'a dyn Workspace,
    /// Re-read after every attempt; changes outside the plan end the session
    pub tree: &'a dyn TreeStatus,
    /// Oracle exchange log
    pub replay: &'a ReplayLog,
    /// Sampling policy in force
    pub sampling: &'a SamplingPolicy,
}

/// Runs commands for one task
pub struct ExecutionEngine {
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn BinaryResolver>,
    redactor: Arc<dyn OutputRedactor>,
    health: HealthChecker,
    extractor: ErrorExtractor,
    background: BackgroundProcesses,
    cancel: CancellationToken,
    launched: AtomicU32,
    config: EngineConfig,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .field("background", &self.background.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("launched", &self.commands_launched())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Engine using `sh`, the process `PATH` and no redaction
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            runner: Arc::new(ShellRunner::new()),
            resolver: Arc::new(PathResolver::from_env()),
            redactor: Arc::new(NoRedaction),
            health: HealthChecker::new(),
            extractor: ErrorExtractor::new(),
            background: BackgroundProcesses::new(),
            cancel: CancellationToken::new(),
            launched: AtomicU32::new(0),
            config,
        }
    }

    /// Replace the process runner
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replace the binary resolver
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn BinaryResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the output redactor
    #[must_use]
    pub fn with_redactor(mut self, redactor: Arc<dyn OutputRedactor>) -> Self {
        self.redactor = redactor;
        self
    }

    /// Replace the health checker
    #[must_use]
    pub fn with_health_checker(mut self, health: HealthChecker) -> Self {
        self.health = health;
        self
    }

    /// Observe an external cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Settings
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tracked background servers
    #[must_use]
    pub fn background(&self) -> &BackgroundProcesses {
        &self.background
    }

    /// Commands handed to the runner so far, background launches included
    #[must_use]
    pub fn commands_launched(&self) -> u32 {
        self.launched.load(Ordering::Relaxed)
    }

    /// Token observed by running commands
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolve every binary the profile and commands need
    ///
    /// # Errors
    /// [`ExecError::MissingBinaries`] listing each unresolved tool with a hint
    pub fn precheck<'a, I>(&self, profile: &StackProfile, commands: I) -> Result<BTreeSet<String>, ExecError>
    where
        I: IntoIterator<Item = &'a CommandSpec>,
    {
        let required = required_binaries(profile, commands);
        check_binaries(self.resolver.as_ref(), &required).map_err(|missing| {
            tracing::warn!(missing = missing.len(), "runtime pre-check failed");
            ExecError::MissingBinaries(missing)
        })?;
        tracing::info!(binaries = required.len(), "runtime pre-check passed");
        Ok(required)
    }

    /// Timeout applied to a classified command
    #[must_use]
    pub fn timeout_for(&self, spec: &CommandSpec, class: &CommandClass, profile: &StackProfile) -> Duration {
        if let Some(t) = self.config.timeout_override {
            return t;
        }
        if class.bucket == TimeoutBucket::Default && spec.role == CommandRole::Compile {
            return profile.timeout_hint.duration();
        }
        class.bucket.duration()
    }

    /// Run a command once
    pub async fn run(&self, spec: &CommandSpec, profile: &StackProfile) -> ExecutionAttempt {
        self.run_attempt(spec, profile, 1).await
    }

    #[instrument(skip_all, fields(command = %spec.text, attempt = index))]
    async fn run_attempt(&self, spec: &CommandSpec, profile: &StackProfile, index: u32) -> ExecutionAttempt {
        let class = classify(&spec.text);
        let timeout = self.timeout_for(spec, &class, profile);
        let started_at = Utc::now();
        let attempt = |exit, output: String, failure, locations, server| ExecutionAttempt {
            index,
            command: spec.literal().to_string(),
            role: spec.role,
            bucket: class.bucket,
            timeout,
            started_at,
            finished_at: Utc::now(),
            exit,
            output,
            locations,
            failure,
            server,
        };

        if self.cancel.is_cancelled() {
            return attempt(
                ExitState::Cancelled,
                String::new(),
                Some(FailureKind::Interrupted),
                Vec::new(),
                None,
            );
        }

        self.launched.fetch_add(1, Ordering::Relaxed);
        if class.background {
            tracing::info!(role = %spec.role, port = ?class.port, "launching background command");
            return match self.runner.spawn_background(&spec.text, &self.config.workdir).await {
                Ok(process) => {
                    let health = self.health.probe(class.port).await;
                    let info = self
                        .background
                        .track(spec.literal(), class.port, health, process);
                    attempt(ExitState::Detached, String::new(), None, Vec::new(), Some(info))
                }
                Err(e) => {
                    let reason = e.to_string();
                    attempt(
                        ExitState::SpawnFailed(reason.clone()),
                        reason.clone(),
                        Some(FailureKind::Environment { reason }),
                        Vec::new(),
                        None,
                    )
                }
            };
        }

        tracing::info!(role = %spec.role, bucket = ?class.bucket, timeout_secs = timeout.as_secs(), "running command");
        let raw = self
            .runner
            .run(&spec.text, &self.config.workdir, timeout, &self.cancel)
            .await;
        let output = self.prepare_output(&raw.combined_output());
        let fatal = self.extractor.has_fatal_pattern(&output);

        if raw.exit.is_success() && !fatal {
            tracing::info!(elapsed_ms = raw.duration.as_millis() as u64, "command succeeded");
            return attempt(raw.exit, output, None, Vec::new(), None);
        }

        let failure = classify_failure(spec.role, &raw.exit, &output, fatal);
        let locations = self.extractor.extract(&output, Some(profile.tag));
        tracing::warn!(exit = ?raw.exit, %failure, locations = locations.len(), "command failed");
        attempt(raw.exit, output, Some(failure), locations, None)
    }

    /// Run a command, healing tool failures through the oracle
    ///
    /// At most `max_heal_attempts` attempts execute. Every proposed fix is
    /// compared with those already applied and scope-checked before it
    /// touches the workspace.
    #[instrument(skip_all, fields(command = %spec.text))]
    pub async fn run_with_healing(
        &self,
        spec: &CommandSpec,
        profile: &StackProfile,
        ctx: &HealingContext<'_>,
    ) -> CommandReport {
        let mut session = HealingSession::new(spec.literal());

        if let Err(e) = ctx.envelope.authorize_command(spec) {
            tracing::warn!(error = %e, "command blocked by plan");
            return CommandReport {
                session,
                outcome: HealingOutcome::Blocked {
                    reason: e.to_string(),
                },
            };
        }

        let max = self.config.max_heal_attempts.max(1);
        let mut applied = None;
        let outcome = loop {
            let index = session.attempts() as u32 + 1;
            let attempt = self.run_attempt(spec, profile, index).await;
            let failure = attempt.failure.clone();
            session.push(attempt, applied.take());

            if failure == Some(FailureKind::Interrupted) {
                break HealingOutcome::Interrupted;
            }
            if let Err(outcome) = Self::check_tree(ctx) {
                break outcome;
            }
            let Some(failure) = failure else {
                break HealingOutcome::Succeeded;
            };
            if !failure.is_healable() {
                break HealingOutcome::NotRetryable { failure };
            }
            if index >= max {
                break HealingOutcome::Exhausted { failure };
            }
            if self.cancel.is_cancelled() {
                break HealingOutcome::Interrupted;
            }
            let Some(request) = session.fix_request() else {
                break HealingOutcome::FixFailed {
                    reason: "no attempt to fix".into(),
                };
            };

            let prompt = match serde_json::to_vec(&request) {
                Ok(prompt) => prompt,
                Err(e) => {
                    break HealingOutcome::FixFailed {
                        reason: format!("fix request could not be encoded: {e}"),
                    }
                }
            };
            let patch = match ctx.oracle.propose_fix(&request).await {
                Ok(patch) => {
                    let response = serde_json::to_vec(&patch)
                        .map_err(|e| tracing::warn!(error = %e, "fix response could not be encoded for replay"))
                        .ok();
                    ctx.replay.record(OracleCall::Fix, &prompt, response.as_deref(), ctx.sampling);
                    patch
                }
                Err(e) => {
                    ctx.replay.record(OracleCall::Fix, &prompt, None, ctx.sampling);
                    break HealingOutcome::FixFailed {
                        reason: e.to_string(),
                    };
                }
            };
            if patch.is_empty() {
                break HealingOutcome::FixFailed {
                    reason: "oracle returned an empty patch".into(),
                };
            }

            let (exact, normalized) = (patch.hash(), patch.normalized_hash());
            if let Some(kind) = session.detect_cycle(exact, normalized) {
                tracing::warn!(fix = %exact.short(), ?kind, "fix repeats an earlier attempt");
                break HealingOutcome::CycleDetected {
                    fix_hash: exact,
                    kind,
                };
            }
            if let Err(violation) = ctx.envelope.check_changes(&patch.changes()) {
                tracing::error!(%violation, "fix touches files outside the plan");
                break HealingOutcome::OutOfScope { violation };
            }
            let lines = match patch.changed_lines(ctx.workspace) {
                Ok(lines) => lines,
                Err(e) => {
                    break HealingOutcome::FixFailed {
                        reason: e.to_string(),
                    }
                }
            };
            if let Some(max) = self.config.max_fix_lines.filter(|max| lines > *max) {
                tracing::warn!(fix = %exact.short(), lines, max, "fix is larger than allowed");
                break HealingOutcome::FixFailed {
                    reason: format!("fix changes {lines} lines, more than the {max} allowed"),
                };
            }
            if let Err(e) = ctx.workspace.apply(&patch) {
                break HealingOutcome::FixFailed {
                    reason: e.to_string(),
                };
            }
            tracing::info!(fix = %exact.short(), lines, next_attempt = index + 1, "fix applied");
            applied = Some(AppliedFix {
                exact,
                normalized,
                lines,
            });
        };

        CommandReport { session, outcome }
    }

    /// Fail the session when the tree holds changes outside the plan
    fn check_tree(ctx: &HealingContext<'_>) -> Result<(), HealingOutcome> {
        let changes = ctx.tree.changes().map_err(|e| HealingOutcome::Blocked {
            reason: e.to_string(),
        })?;
        ctx.envelope.check_changes(&changes).map_err(|violation| {
            tracing::error!(%violation, "command left changes outside the plan");
            HealingOutcome::OutOfScope { violation }
        })
    }

    /// Terminate every tracked background server
    pub async fn shutdown(&self) -> usize {
        self.background.terminate_all().await
    }

    fn prepare_output(&self, raw: &str) -> String {
        let redacted = self.redactor.redact(raw);
        let limit = self.config.output_limit;
        if redacted.len() <= limit {
            return redacted;
        }
        let mut cut = redacted.len() - limit;
        while !redacted.is_char_boundary(cut) {
            cut += 1;
        }
        format!("[... {cut} bytes truncated ...]\n{}", &redacted[cut..])
    }
}
