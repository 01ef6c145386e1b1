//! CI status seam

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CiError;

/// Status of a CI run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiState {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for CiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        })
    }
}

/// What CI reported for a branch head
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiReport {
    /// Commit the run actually validated
    pub validated_sha: String,
    /// Verdict for `validated_sha`
    pub status: CiState,
    /// No newer run exists for the branch
    pub is_latest_run: bool,
}

/// Where CI results come from
#[async_trait]
pub trait CiStatusSource: Send + Sync {
    /// Latest run for `branch`, expected to validate `head_sha`
    async fn status(&self, branch: &str, head_sha: &str) -> Result<CiReport, CiError>;
}

/// Treats local verification as the CI run
///
/// For repositories without remote CI: reports success on exactly the
/// head it is asked about.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCi;

#[async_trait]
impl CiStatusSource for LocalCi {
    async fn status(&self, _branch: &str, head_sha: &str) -> Result<CiReport, CiError> {
        Ok(CiReport {
            validated_sha: head_sha.to_string(),
            status: CiState::Success,
            is_latest_run: true,
        })
    }
}
