//! Oracle sampling policy and the replay log of oracle calls

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, FieldHasher};
use crate::PlanError;

/// Fixed sampling configuration for every oracle call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingPolicy {
    /// Model identifier
    pub model: String,
    /// Must be zero
    pub temperature: f32,
    /// Nucleus sampling cut-off, fixed at 1.0
    pub top_p: f32,
    /// Optional seed forwarded to the oracle
    pub seed: Option<u64>,
    /// Response token ceiling
    pub max_tokens: u32,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            model: "default".into(),
            temperature: 0.0,
            top_p: 1.0,
            seed: Some(0),
            max_tokens: 4096,
        }
    }
}

impl SamplingPolicy {
    /// Reject non-deterministic settings
    ///
    /// # Errors
    /// [`PlanError::NonDeterministicSampling`]
    pub fn validate(&self) -> Result<(), PlanError> {
        #[allow(clippy::float_cmp)]
        let deterministic = self.temperature == 0.0 && self.top_p == 1.0;
        if deterministic && !self.model.trim().is_empty() && self.max_tokens > 0 {
            Ok(())
        } else {
            Err(PlanError::NonDeterministicSampling {
                temperature: self.temperature,
                top_p: self.top_p,
            })
        }
    }

    /// Hash logged alongside every oracle call
    #[must_use]
    pub fn policy_hash(&self) -> ContentHash {
        FieldHasher::new()
            .field("model", self.model.as_bytes())
            .field("temperature", &self.temperature.to_le_bytes())
            .field("top_p", &self.top_p.to_le_bytes())
            .field("seed", &self.seed.unwrap_or(u64::MAX).to_le_bytes())
            .field("max_tokens", &self.max_tokens.to_le_bytes())
            .finish()
    }
}

/// Which oracle call produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleCall {
    /// Intent classification
    Intent,
    /// Plan proposal
    Plan,
    /// Red test authoring
    Tests,
    /// Initial implementation
    Implementation,
    /// Self-healing fix
    Fix,
}

/// One recorded oracle exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Position in the log
    pub seq: u64,
    /// When it was recorded
    pub at: DateTime<Utc>,
    /// Which call
    pub call: OracleCall,
    /// Hash of the prompt / request
    pub input_hash: ContentHash,
    /// Hash of the response, `None` when the call failed
    pub output_hash: Option<ContentHash>,
    /// Policy in force
    pub sampling_policy_hash: ContentHash,
}

/// Append-only record of oracle exchanges for forensic replay
#[derive(Debug, Default)]
pub struct ReplayLog {
    inner: Mutex<Vec<ReplayEntry>>,
}

impl ReplayLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an exchange
    pub fn record(
        &self,
        call: OracleCall,
        input: &[u8],
        output: Option<&[u8]>,
        policy: &SamplingPolicy,
    ) -> ReplayEntry {
        let mut guard = self.inner.lock();
        let entry = ReplayEntry {
            seq: guard.len() as u64,
            at: Utc::now(),
            call,
            input_hash: ContentHash::compute(input),
            output_hash: output.map(ContentHash::compute),
            sampling_policy_hash: policy.policy_hash(),
        };
        tracing::debug!(
            seq = entry.seq,
            call = ?call,
            input = %entry.input_hash.short(),
            "oracle exchange recorded"
        );
        guard.push(entry.clone());
        entry
    }

    /// Snapshot of all entries
    #[must_use]
    pub fn entries(&self) -> Vec<ReplayEntry> {
        self.inner.lock().clone()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_deterministic() {
        SamplingPolicy::default().validate().unwrap();
    }

    #[test]
    fn rejects_warm_sampling() {
        let policy = SamplingPolicy {
            temperature: 0.7,
            ..SamplingPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PlanError::NonDeterministicSampling { .. })
        ));
    }

    #[test]
    fn policy_hash_tracks_model() {
        let a = SamplingPolicy::default();
        let b = SamplingPolicy {
            model: "other".into(),
            ..SamplingPolicy::default()
        };
        assert_eq!(a.policy_hash(), SamplingPolicy::default().policy_hash());
        assert_ne!(a.policy_hash(), b.policy_hash());
    }

    #[test]
    fn log_is_sequenced() {
        let log = ReplayLog::new();
        let policy = SamplingPolicy::default();
        log.record(OracleCall::Plan, b"prompt", Some(b"plan"), &policy);
        log.record(OracleCall::Fix, b"prompt2", None, &policy);
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 1);
        assert!(entries[1].output_hash.is_none());
        assert_eq!(entries[0].input_hash, ContentHash::compute(b"prompt"));
    }
}
