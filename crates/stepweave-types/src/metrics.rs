//! Per-step and per-run execution metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One leaf-step execution, recorded whether it succeeded or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetric {
    /// Result key of the step.
    pub step: String,
    pub runner: String,
    pub duration_ms: u64,
    pub success: bool,
    pub cache_hit: bool,
    pub attempts: u32,
    pub skipped: bool,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub steps: Vec<StepMetric>,
    /// Wall time across all segments of the run, including resumed ones.
    pub total_duration_ms: u64,
}

impl RunMetrics {
    pub fn record(&mut self, metric: StepMetric) {
        self.steps.push(metric);
    }

    /// Steps that actually ran (not skipped by a condition).
    pub fn executed(&self) -> usize {
        self.steps.iter().filter(|m| !m.skipped).count()
    }

    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|m| m.success && !m.skipped).count()
    }

    pub fn failed(&self) -> usize {
        self.steps.iter().filter(|m| !m.success).count()
    }

    pub fn cache_hits(&self) -> usize {
        self.steps.iter().filter(|m| m.cache_hit).count()
    }

    /// Metric for the most recent execution of a step.
    pub fn last_for(&self, step: &str) -> Option<&StepMetric> {
        self.steps.iter().rev().find(|m| m.step == step)
    }

    /// One-line human summary, e.g. `3 executed, 2 succeeded, 1 failed, 0 cache hits in 120ms`.
    pub fn summary(&self) -> String {
        format!(
            "{} executed, {} succeeded, {} failed, {} cache hits in {}ms",
            self.executed(),
            self.succeeded(),
            self.failed(),
            self.cache_hits(),
            self.total_duration_ms
        )
    }
}
