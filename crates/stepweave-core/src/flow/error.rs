//! Engine-wide error taxonomy.

use stepweave_types::error::RepositoryError;
use stepweave_types::metrics::RunMetrics;
use uuid::Uuid;

use super::expression::ExpressionError;
use super::state::StateError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no runner registered for step `{step}`")]
    StepNotFound { step: String },

    #[error("step `{step}` failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("step `{step}` timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    #[error("invalid flow: {0}")]
    RunValidation(String),

    #[error("evaluator for step `{step}` failed: {message}")]
    Evaluator { step: String, message: String },

    #[error("step `{step}` did not pass its quality gate after {attempts} attempts (best score {best_score:.2})")]
    MaxRetriesExceeded {
        step: String,
        attempts: u32,
        best_score: f64,
        /// Output of the highest-scoring attempt.
        best_output: serde_json::Value,
    },

    #[error("quality gate aborted step `{step}` at score {score:.2}")]
    QualityGateAborted { step: String, score: f64 },

    #[error("expression error in `{step}`: {source}")]
    Expression {
        step: String,
        #[source]
        source: ExpressionError,
    },

    #[error(transparent)]
    State(#[from] StateError),

    /// Control signal: a runner asked to pause the run. Never reported as a
    /// failure.
    #[error("step `{step}` requested suspension: {reason}")]
    Suspended { step: String, reason: String },

    #[error("no suspended run with id {0}")]
    SnapshotNotFound(Uuid),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("snapshot store error: {0}")]
    Store(#[from] RepositoryError),
}

impl EngineError {
    pub(crate) fn expression(step: impl Into<String>, source: ExpressionError) -> Self {
        Self::Expression {
            step: step.into(),
            source,
        }
    }

    /// Stable identifier used when recording errors.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::StepNotFound { .. } => "step_not_found",
            EngineError::StepExecution { .. } => "step_execution",
            EngineError::Timeout { .. } => "timeout",
            EngineError::RunValidation(_) => "run_validation",
            EngineError::Evaluator { .. } => "evaluator",
            EngineError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            EngineError::QualityGateAborted { .. } => "quality_gate_aborted",
            EngineError::Expression { .. } => "expression",
            EngineError::State(_) => "state",
            EngineError::Suspended { .. } => "suspended",
            EngineError::SnapshotNotFound(_) => "snapshot_not_found",
            EngineError::InvalidSnapshot(_) => "invalid_snapshot",
            EngineError::Store(_) => "store",
        }
    }

    /// The step the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            EngineError::StepNotFound { step }
            | EngineError::StepExecution { step, .. }
            | EngineError::Timeout { step, .. }
            | EngineError::Evaluator { step, .. }
            | EngineError::MaxRetriesExceeded { step, .. }
            | EngineError::QualityGateAborted { step, .. }
            | EngineError::Expression { step, .. }
            | EngineError::Suspended { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Best attempt's output when a quality gate ran out of retries.
    pub fn best_output(&self) -> Option<&serde_json::Value> {
        match self {
            EngineError::MaxRetriesExceeded { best_output, .. } => Some(best_output),
            _ => None,
        }
    }

    pub fn is_suspension(&self) -> bool {
        matches!(self, EngineError::Suspended { .. })
    }

    /// Whether a plain retry policy may run the step again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StepExecution { .. } | EngineError::Timeout { .. }
        )
    }
}

/// A failed run: the error plus everything executed before it.
#[derive(Debug, thiserror::Error)]
#[error("ran {executed} of {total_steps} steps, failed at {}: {error}", .failed_step.as_deref().unwrap_or("<flow>"))]
pub struct RunFailure {
    #[source]
    pub error: EngineError,
    pub execution_id: Uuid,
    pub metrics: RunMetrics,
    pub failed_step: Option<String>,
    /// Top-level index being executed when the run failed.
    pub failed_index: Option<usize>,
    pub total_steps: usize,
    /// Leaf steps that completed successfully before the failure.
    pub executed: usize,
}

impl RunFailure {
    pub(crate) fn new(
        error: EngineError,
        execution_id: Uuid,
        metrics: RunMetrics,
        failed_index: Option<usize>,
        total_steps: usize,
    ) -> Self {
        let failed_step = error.step().map(str::to_string);
        let executed = metrics.succeeded();
        Self {
            error,
            execution_id,
            metrics,
            failed_step,
            failed_index,
            total_steps,
            executed,
        }
    }
}
