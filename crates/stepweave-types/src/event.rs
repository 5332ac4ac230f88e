//! Event types for the flow event bus.
//!
//! `FlowEvent` is broadcast during a run. All variants are Clone + Send + Sync
//! for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A run has started (or resumed from a snapshot).
    RunStarted {
        execution_id: Uuid,
        flow_name: String,
        resumed: bool,
    },

    /// A leaf step has started executing.
    StepStarted {
        execution_id: Uuid,
        step: String,
        runner: String,
    },

    /// A leaf step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step: String,
        duration_ms: u64,
        cache_hit: bool,
    },

    /// A leaf step attempt failed.
    StepFailed {
        execution_id: Uuid,
        step: String,
        error: String,
        will_retry: bool,
    },

    /// A run completed successfully.
    RunCompleted {
        execution_id: Uuid,
        flow_name: String,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// A run failed.
    RunFailed {
        execution_id: Uuid,
        flow_name: String,
        step: Option<String>,
        error: String,
    },

    /// A run was suspended and handed back to the caller.
    RunSuspended {
        execution_id: Uuid,
        resume_from_step_index: usize,
        reason: String,
    },
}

impl FlowEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            FlowEvent::RunStarted { execution_id, .. }
            | FlowEvent::StepStarted { execution_id, .. }
            | FlowEvent::StepCompleted { execution_id, .. }
            | FlowEvent::StepFailed { execution_id, .. }
            | FlowEvent::RunCompleted { execution_id, .. }
            | FlowEvent::RunFailed { execution_id, .. }
            | FlowEvent::RunSuspended { execution_id, .. } => *execution_id,
        }
    }
}
