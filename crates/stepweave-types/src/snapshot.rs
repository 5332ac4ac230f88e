//! Point-in-time capture of a suspended run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::flow::FlowDefinition;
use crate::metrics::RunMetrics;
use crate::scoring::ScoringState;
use crate::state::AccessReport;

/// Everything needed to continue a run as if it was never interrupted.
///
/// This is the only structure that outlives a single engine invocation; it
/// is handed to a durable store and consumed once by resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedExecutionState {
    pub execution_id: Uuid,
    pub flow_definition: FlowDefinition,
    /// Serialized execution context (results, input, previous output).
    pub execution_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_snapshot: Option<AccessReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_snapshot: Option<ScoringState>,
    pub metrics_snapshot: RunMetrics,
    /// Index of the next top-level step to run.
    pub resume_from_step_index: usize,
    pub suspended_at: DateTime<Utc>,
    pub reason: String,
}

/// Listing row for stored snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub execution_id: Uuid,
    pub flow_name: String,
    pub resume_from_step_index: usize,
    pub suspended_at: DateTime<Utc>,
    pub reason: String,
}

impl From<&SuspendedExecutionState> for SnapshotSummary {
    fn from(s: &SuspendedExecutionState) -> Self {
        Self {
            execution_id: s.execution_id,
            flow_name: s.flow_definition.name.clone(),
            resume_from_step_index: s.resume_from_step_index,
            suspended_at: s.suspended_at,
            reason: s.reason.clone(),
        }
    }
}
