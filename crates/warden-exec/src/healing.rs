//! Per-command self-healing history

use warden_plan::{ContentHash, ScopeViolation};

use crate::engine::ExecutionAttempt;
use crate::failure::FailureKind;
use crate::oracle::FixRequest;

/// An executed attempt and the fix applied right before it
#[derive(Debug, Clone)]
pub struct HealingRecord {
    /// The attempt
    pub attempt: ExecutionAttempt,
    /// Exact hash of the fix applied before this attempt (`None` for the first)
    pub fix_hash: Option<ContentHash>,
    /// Whitespace-normalised hash of the same fix
    pub fix_normalized_hash: Option<ContentHash>,
    /// Lines the fix added or removed
    pub fix_lines: usize,
}

/// A fix the loop applied, carried to the attempt that follows it
#[derive(Debug, Clone, Copy)]
pub(crate) struct AppliedFix {
    pub(crate) exact: ContentHash,
    pub(crate) normalized: ContentHash,
    pub(crate) lines: usize,
}

/// How a repeated fix was recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Byte-identical to an earlier fix
    Identical,
    /// Identical after whitespace normalisation
    Equivalent,
}

/// Append-only attempt history for one command
#[derive(Debug, Clone)]
pub struct HealingSession {
    command: String,
    records: Vec<HealingRecord>,
}

impl HealingSession {
    /// Empty session for a command
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            records: Vec::new(),
        }
    }

    /// Command literal
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Attempts in order
    #[must_use]
    pub fn records(&self) -> &[HealingRecord] {
        &self.records
    }

    /// Executed attempt count
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.records.len()
    }

    /// Most recent attempt
    #[must_use]
    pub fn last_attempt(&self) -> Option<&ExecutionAttempt> {
        self.records.last().map(|r| &r.attempt)
    }

    /// Exact hashes of every applied fix
    #[must_use]
    pub fn fix_hashes(&self) -> Vec<ContentHash> {
        self.records.iter().filter_map(|r| r.fix_hash).collect()
    }

    /// Lines changed by every applied fix
    #[must_use]
    pub fn fix_lines(&self) -> usize {
        self.records.iter().map(|r| r.fix_lines).sum()
    }

    pub(crate) fn push(&mut self, attempt: ExecutionAttempt, fix: Option<AppliedFix>) {
        self.records.push(HealingRecord {
            attempt,
            fix_hash: fix.map(|f| f.exact),
            fix_normalized_hash: fix.map(|f| f.normalized),
            fix_lines: fix.map_or(0, |f| f.lines),
        });
    }

    /// Whether a proposed fix repeats an earlier one
    #[must_use]
    pub fn detect_cycle(&self, exact: ContentHash, normalized: ContentHash) -> Option<CycleKind> {
        if self.records.iter().any(|r| r.fix_hash == Some(exact)) {
            return Some(CycleKind::Identical);
        }
        if self.records.iter().any(|r| r.fix_normalized_hash == Some(normalized)) {
            return Some(CycleKind::Equivalent);
        }
        None
    }

    /// Fix request describing the latest failed attempt
    #[must_use]
    pub fn fix_request(&self) -> Option<FixRequest> {
        let last = self.last_attempt()?;
        Some(FixRequest {
            command: self.command.clone(),
            attempt: last.index,
            locations: last.locations.clone(),
            output: last.output.clone(),
            prior_fixes: self.fix_hashes(),
        })
    }
}

/// Why a healing loop stopped
#[derive(Debug, Clone)]
pub enum HealingOutcome {
    /// Last attempt succeeded
    Succeeded,
    /// Failure class is not eligible for healing
    NotRetryable { failure: FailureKind },
    /// Attempt cap reached
    Exhausted { failure: FailureKind },
    /// The oracle repeated an earlier fix
    CycleDetected { fix_hash: ContentHash, kind: CycleKind },
    /// The proposed fix touches files outside the declared scope
    OutOfScope { violation: ScopeViolation },
    /// The command may not run under the frozen plan
    Blocked { reason: String },
    /// Oracle or workspace failure while fixing
    FixFailed { reason: String },
    /// Task cancellation
    Interrupted,
}

/// Session plus terminal outcome for one command
#[derive(Debug, Clone)]
pub struct CommandReport {
    /// Attempt history
    pub session: HealingSession,
    /// Why the loop stopped
    pub outcome: HealingOutcome,
}

impl CommandReport {
    /// True when the command eventually succeeded
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, HealingOutcome::Succeeded)
    }

    /// Failure class of the last attempt, if it failed
    #[must_use]
    pub fn last_failure(&self) -> Option<&FailureKind> {
        self.session.last_attempt().and_then(|a| a.failure.as_ref())
    }
}
