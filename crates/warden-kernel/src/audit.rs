//! Hash-chained transition audit log
//!
//! Every attempted transition (applied, rejected, forced or discarded) is
//! appended in the order it was decided. Each record commits to its
//! predecessor's hash, so truncation or in-place edits are detectable with
//! [`AuditLog::verify_integrity`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use warden_plan::{ContentHash, FieldHasher};

use crate::error::AuditError;
use crate::state::{ForcedTrigger, State};
use crate::task::TaskId;

/// What happened to an attempted transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// State changed
    Applied,
    /// State unchanged; `cause` names the failed check
    Rejected { cause: String },
    /// Terminal failure imposed by the supervisor or a scope/stale check
    Forced { trigger: ForcedTrigger },
    /// Lost the race against a terminal transition
    Discarded { trigger: Option<ForcedTrigger> },
}

impl TransitionOutcome {
    /// The state actually changed
    #[inline]
    #[must_use]
    pub fn changed_state(&self) -> bool {
        matches!(self, Self::Applied | Self::Forced { .. })
    }

    fn tag(&self) -> String {
        match self {
            Self::Applied => "applied".into(),
            Self::Rejected { cause } => format!("rejected:{cause}"),
            Self::Forced { trigger } => format!("forced:{trigger}"),
            Self::Discarded { trigger: Some(t) } => format!("discarded:{t}"),
            Self::Discarded { trigger: None } => "discarded".into(),
        }
    }
}

/// One audited transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Position in the log, from 0
    pub seq: u64,
    /// When the decision was taken
    pub timestamp: DateTime<Utc>,
    /// Owning task
    pub task_id: TaskId,
    /// State before the transition
    pub from: State,
    /// Requested or forced target
    pub to: State,
    /// Applied, rejected, discarded or forced
    #[serde(flatten)]
    pub outcome: TransitionOutcome,
    /// Why the transition was requested
    pub detail: String,
    /// Hash of the previous record; zero for the first
    pub prev_hash: ContentHash,
    /// Hash over this record and `prev_hash`
    pub hash: ContentHash,
}

/// Append-only, hash-chained log
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<TransitionRecord>>,
}

impl AuditLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, chaining it to the previous one
    pub fn append(
        &self,
        task_id: TaskId,
        from: State,
        to: State,
        outcome: TransitionOutcome,
        detail: impl Into<String>,
    ) -> TransitionRecord {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map(|r| r.hash).unwrap_or_default();
        let mut record = TransitionRecord {
            seq: guard.len() as u64,
            timestamp: Utc::now(),
            task_id,
            from,
            to,
            outcome,
            detail: detail.into(),
            prev_hash,
            hash: ContentHash::default(),
        };
        record.hash = compute_hash(&record);
        guard.push(record.clone());
        record
    }

    /// Snapshot of every record
    #[must_use]
    pub fn records(&self) -> Vec<TransitionRecord> {
        self.inner.lock().clone()
    }

    /// Records written
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True before the first transition
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Hash of the newest record, zero when empty
    #[must_use]
    pub fn head(&self) -> ContentHash {
        self.inner.lock().last().map(|r| r.hash).unwrap_or_default()
    }

    /// Re-walk the chain
    ///
    /// # Errors
    /// [`AuditError::BrokenChain`] at the first record whose links or hash do not match
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_chain(&self.inner.lock())
    }
}

/// Verify an exported chain, e.g. one read back from disk
///
/// # Errors
/// [`AuditError::BrokenChain`] at the first bad record
pub fn verify_chain(records: &[TransitionRecord]) -> Result<(), AuditError> {
    let mut prev = ContentHash::default();
    for (i, r) in records.iter().enumerate() {
        if r.seq != i as u64 || r.prev_hash != prev || r.hash != compute_hash(r) {
            return Err(AuditError::BrokenChain { seq: i as u64 });
        }
        prev = r.hash;
    }
    Ok(())
}

fn compute_hash(record: &TransitionRecord) -> ContentHash {
    FieldHasher::new()
        .field("seq", &record.seq.to_le_bytes())
        .field("timestamp", record.timestamp.to_rfc3339().as_bytes())
        .field("task", record.task_id.to_string().as_bytes())
        .field("from", record.from.as_str().as_bytes())
        .field("to", record.to.as_str().as_bytes())
        .field("outcome", record.outcome.tag().as_bytes())
        .field("detail", record.detail.as_bytes())
        .field("prev", record.prev_hash.as_bytes())
        .finish()
}
