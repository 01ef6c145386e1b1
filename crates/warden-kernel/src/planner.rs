//! Planning oracle seam

use async_trait::async_trait;
use warden_exec::OracleError;
use warden_plan::{InputSnapshot, PlanContent};

use crate::task::IntentRecord;

/// Opaque planner producing intents and plans
///
/// The kernel overwrites `lockfile_hash` in the proposed content with its
/// own measurement before freezing.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Restate the request and flag ambiguity
    async fn analyze_intent(&self, request: &str) -> Result<IntentRecord, OracleError>;

    /// Propose a plan from the captured inputs
    async fn propose_plan(&self, snapshot: &InputSnapshot) -> Result<PlanContent, OracleError>;
}
