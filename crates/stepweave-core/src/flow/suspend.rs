//! Suspend/resume snapshots.
//!
//! A suspended run is captured as a [`SuspendedExecutionState`]: the
//! serialized execution context, the state access report, the scoring
//! history, metrics so far and the index of the next top-level step. Resume
//! rebuilds every run-scoped structure from it; steps before the index are
//! never executed again.

use chrono::Utc;
use serde_json::Value;
use stepweave_types::flow::FlowDefinition;
use stepweave_types::metrics::RunMetrics;
use stepweave_types::scoring::ScoringState;
use stepweave_types::snapshot::SuspendedExecutionState;
use stepweave_types::state::AccessReport;

use super::context::ExecutionContext;
use super::error::EngineError;
use super::scoring::ScoringLedger;
use super::state::{StateManager, declared_access};

/// What the orchestrator hands over when a run pauses.
#[derive(Debug)]
pub struct RunCheckpoint<'a> {
    pub flow: &'a FlowDefinition,
    pub context: &'a ExecutionContext,
    pub state: AccessReport,
    pub scoring: ScoringState,
    pub metrics: RunMetrics,
    /// Next top-level step to run.
    pub next_index: usize,
    pub reason: String,
}

/// Everything needed to continue a run.
#[derive(Debug)]
pub struct ResumePoint {
    pub flow: FlowDefinition,
    pub context: ExecutionContext,
    pub state: StateManager,
    pub ledger: ScoringLedger,
    pub metrics: RunMetrics,
    pub start_index: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SuspendManager;

impl SuspendManager {
    pub fn new() -> Self {
        Self
    }

    /// Capture a checkpoint as a self-contained snapshot.
    pub fn suspend(&self, checkpoint: RunCheckpoint<'_>) -> Result<SuspendedExecutionState, EngineError> {
        let execution_context = checkpoint
            .context
            .to_json()
            .map_err(|e| EngineError::InvalidSnapshot(format!("context is not serializable: {e}")))?;

        let scoring_snapshot =
            (!checkpoint.scoring.score_history.is_empty()).then_some(checkpoint.scoring);

        Ok(SuspendedExecutionState {
            execution_id: checkpoint.context.execution_id,
            flow_definition: checkpoint.flow.clone(),
            execution_context,
            state_snapshot: Some(checkpoint.state),
            scoring_snapshot,
            metrics_snapshot: checkpoint.metrics,
            resume_from_step_index: checkpoint.next_index,
            suspended_at: Utc::now(),
            reason: checkpoint.reason,
        })
    }

    /// Rebuild run structures from a snapshot. `resume_input` is exposed to
    /// expressions as `resume`.
    pub fn prepare_resume(
        &self,
        snapshot: SuspendedExecutionState,
        resume_input: Option<Value>,
    ) -> Result<ResumePoint, EngineError> {
        let total = snapshot.flow_definition.steps.len();
        if snapshot.resume_from_step_index > total {
            return Err(EngineError::InvalidSnapshot(format!(
                "resume index {} is past the end of a {total}-step flow",
                snapshot.resume_from_step_index
            )));
        }

        let mut context = ExecutionContext::from_json(snapshot.execution_context)
            .map_err(|e| EngineError::InvalidSnapshot(format!("execution context: {e}")))?;
        if context.execution_id != snapshot.execution_id {
            return Err(EngineError::InvalidSnapshot(format!(
                "context belongs to run {}, snapshot to {}",
                context.execution_id, snapshot.execution_id
            )));
        }
        context.resume = resume_input;

        let state = match snapshot.state_snapshot {
            Some(report) => StateManager::restore(report)?,
            None => StateManager::new(
                snapshot.flow_definition.state.clone(),
                declared_access(&snapshot.flow_definition),
            )?,
        };

        let ledger = snapshot
            .scoring_snapshot
            .map(ScoringLedger::restore)
            .unwrap_or_default();

        Ok(ResumePoint {
            flow: snapshot.flow_definition,
            context,
            state,
            ledger,
            metrics: snapshot.metrics_snapshot,
            start_index: snapshot.resume_from_step_index,
        })
    }
}
