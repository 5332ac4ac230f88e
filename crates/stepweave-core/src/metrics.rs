//! Step metric reporting.
//!
//! The orchestrator records a [`StepMetric`] for every executed or skipped
//! leaf step into the run's `RunMetrics` and forwards it to the configured
//! [`MetricsSink`].

use parking_lot::Mutex;
use stepweave_types::metrics::StepMetric;

/// Recording interface called by the orchestrator once per leaf step.
pub trait MetricsSink: Send + Sync {
    fn record_step_execution(&self, metric: &StepMetric);

    /// A step failed; `kind` is the stable engine error kind.
    fn record_error(&self, step: &str, kind: &str, message: &str);

    /// Called for steps with caching enabled.
    fn record_cache_performance(&self, step: &str, hit: bool);
}

/// Logs each call as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_step_execution(&self, metric: &StepMetric) {
        tracing::debug!(
            step = %metric.step,
            runner = %metric.runner,
            duration_ms = metric.duration_ms,
            success = metric.success,
            cache_hit = metric.cache_hit,
            attempts = metric.attempts,
            skipped = metric.skipped,
            timed_out = metric.timed_out,
            "step metric"
        );
    }

    fn record_error(&self, step: &str, kind: &str, message: &str) {
        tracing::warn!(step, kind, message, "step error");
    }

    fn record_cache_performance(&self, step: &str, hit: bool) {
        tracing::debug!(step, hit, "step cache");
    }
}

/// Keeps everything in memory. Used by embedders that inspect metrics
/// after a run, and by tests.
#[derive(Debug, Default)]
pub struct CollectingMetricsSink {
    steps: Mutex<Vec<StepMetric>>,
    errors: Mutex<Vec<(String, String)>>,
    cache: Mutex<(u64, u64)>,
}

impl CollectingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> Vec<StepMetric> {
        self.steps.lock().clone()
    }

    /// `(step, kind)` pairs in the order they were reported.
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }

    /// `(hits, misses)`.
    pub fn cache_counts(&self) -> (u64, u64) {
        *self.cache.lock()
    }
}

impl MetricsSink for CollectingMetricsSink {
    fn record_step_execution(&self, metric: &StepMetric) {
        self.steps.lock().push(metric.clone());
    }

    fn record_error(&self, step: &str, kind: &str, _message: &str) {
        self.errors.lock().push((step.to_string(), kind.to_string()));
    }

    fn record_cache_performance(&self, _step: &str, hit: bool) {
        let mut counts = self.cache.lock();
        if hit {
            counts.0 += 1;
        } else {
            counts.1 += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingMetricsSink::new();
        for step in ["a", "b"] {
            sink.record_step_execution(&StepMetric {
                step: step.into(),
                runner: "passthrough".into(),
                duration_ms: 1,
                success: true,
                cache_hit: false,
                attempts: 1,
                skipped: false,
                timed_out: false,
                error: None,
                started_at: Utc::now(),
            });
        }
        sink.record_error("b", "timeout", "took too long");
        sink.record_cache_performance("a", true);
        sink.record_cache_performance("a", false);

        let steps: Vec<String> = sink.steps().into_iter().map(|m| m.step).collect();
        assert_eq!(steps, vec!["a", "b"]);
        assert_eq!(sink.errors(), vec![("b".to_string(), "timeout".to_string())]);
        assert_eq!(sink.cache_counts(), (1, 1));
    }
}
