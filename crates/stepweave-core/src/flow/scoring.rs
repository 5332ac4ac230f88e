//! Quality-gated retry.
//!
//! [`QualityGate::execute_with_scoring`] runs a step, asks an evaluator to
//! score the output, and retries with backoff until the score clears
//! `thresholds.minimum` or the attempt budget runs out. Every attempt is
//! appended to the run's [`ScoringLedger`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use stepweave_types::config::ScoringDefaults;
use stepweave_types::scoring::{BackoffConfig, OnQualityFailure, ScoreEntry, ScoringConfig, ScoringState};

use super::error::EngineError;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Run-wide, append-only scoring record shared by concurrent branches.
#[derive(Debug, Clone, Default)]
pub struct ScoringLedger {
    inner: Arc<Mutex<ScoringState>>,
}

impl ScoringLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(state: ScoringState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn record(&self, entry: ScoreEntry) {
        let mut state = self.inner.lock();
        state.retry_count.insert(entry.agent.clone(), entry.attempt - 1);
        state.score_history.push(entry);
    }

    pub fn snapshot(&self) -> ScoringState {
        self.inner.lock().clone()
    }

    /// Finalize and return the completed state.
    pub fn finalize(&self) -> ScoringState {
        let mut state = self.inner.lock();
        state.finalize();
        state.clone()
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// What the step closure receives for each attempt.
#[derive(Debug, Clone)]
pub struct AttemptInput {
    pub attempt: u32,
    pub feedback: Option<String>,
}

/// What the evaluator closure receives.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub output: Value,
    pub attempt: u32,
    pub previous_score: Option<f64>,
}

/// A parsed evaluator verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub feedback: Option<String>,
    pub breakdown: Option<Value>,
}

impl Evaluation {
    /// Accepts a bare number or an object with a numeric `score`.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let (score, feedback, breakdown) = match value {
            Value::Number(n) => (n.as_f64(), None, None),
            Value::Object(fields) => (
                fields.get("score").and_then(Value::as_f64),
                fields
                    .get("feedback")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                fields.get("breakdown").cloned(),
            ),
            _ => (None, None, None),
        };
        let score = score.ok_or_else(|| format!("evaluator returned no numeric score: {value}"))?;
        if !score.is_finite() {
            return Err(format!("evaluator returned a non-finite score: {score}"));
        }
        Ok(Self {
            score,
            feedback,
            breakdown,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringStatus {
    Passed,
    /// Exhausted under `onFailure: continue`; the last output is accepted.
    Continued,
    /// Exhausted under `onFailure: retry`; the best output is reported.
    MaxRetriesExceeded,
}

#[derive(Debug, Clone)]
pub struct ScoringOutcome {
    pub output: Value,
    pub attempts: u32,
    pub status: ScoringStatus,
    /// Score of the returned output.
    pub score: f64,
}

// ---------------------------------------------------------------------------
// QualityGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    defaults: ScoringDefaults,
}

impl QualityGate {
    pub fn new(defaults: ScoringDefaults) -> Self {
        Self { defaults }
    }

    fn backoff(&self, config: &ScoringConfig) -> BackoffConfig {
        config.backoff.unwrap_or(BackoffConfig {
            initial_ms: self.defaults.backoff_initial_ms,
            multiplier: self.defaults.backoff_multiplier,
            max_ms: self.defaults.backoff_max_ms,
        })
    }

    /// Run the evaluate/retry loop for one step.
    ///
    /// Step failures and evaluator failures propagate immediately; only a
    /// low score triggers another attempt. Each attempt runs the step fresh.
    pub async fn execute_with_scoring<R, RF, E, EF>(
        &self,
        agent: &str,
        config: &ScoringConfig,
        ledger: &ScoringLedger,
        mut run_step: R,
        mut evaluate: E,
    ) -> Result<ScoringOutcome, EngineError>
    where
        R: FnMut(AttemptInput) -> RF,
        RF: Future<Output = Result<Value, EngineError>>,
        E: FnMut(EvaluationRequest) -> EF,
        EF: Future<Output = Result<Evaluation, EngineError>>,
    {
        let limit = config
            .retry_limit
            .unwrap_or(self.defaults.retry_limit)
            .max(1);
        let backoff = self.backoff(config);

        let mut best: Option<(f64, Value)> = None;
        let mut last: Option<(f64, Value)> = None;
        let mut previous_score = None;
        let mut feedback = None;

        for attempt in 1..=limit {
            let output = run_step(AttemptInput {
                attempt,
                feedback: feedback.take(),
            })
            .await?;

            let evaluation = evaluate(EvaluationRequest {
                output: output.clone(),
                attempt,
                previous_score,
            })
            .await?;

            let score = evaluation.score;
            let passed = config.thresholds.passes(score);
            ledger.record(ScoreEntry {
                agent: agent.to_string(),
                score,
                passed,
                tier: config.thresholds.tier(score),
                feedback: evaluation.feedback.clone(),
                breakdown: evaluation.breakdown,
                timestamp: Utc::now(),
                attempt,
            });
            tracing::debug!(step = agent, attempt, score, passed, "quality gate evaluated");

            if passed {
                return Ok(ScoringOutcome {
                    output,
                    attempts: attempt,
                    status: ScoringStatus::Passed,
                    score,
                });
            }

            if best.as_ref().is_none_or(|(b, _)| score > *b) {
                best = Some((score, output.clone()));
            }
            last = Some((score, output));
            previous_score = Some(score);
            feedback = evaluation.feedback;

            if attempt < limit {
                let delay = backoff.delay_ms(attempt);
                tracing::warn!(
                    step = agent,
                    attempt,
                    score,
                    minimum = config.thresholds.minimum,
                    delay_ms = delay,
                    "quality gate not met, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        // limit >= 1, so at least one attempt was scored.
        let (last_score, last_output) = last.unwrap_or((0.0, Value::Null));
        match config.on_failure {
            OnQualityFailure::Retry => {
                let (best_score, best_output) = best.unwrap_or((last_score, last_output));
                Ok(ScoringOutcome {
                    output: best_output,
                    attempts: limit,
                    status: ScoringStatus::MaxRetriesExceeded,
                    score: best_score,
                })
            }
            OnQualityFailure::Continue => Ok(ScoringOutcome {
                output: last_output,
                attempts: limit,
                status: ScoringStatus::Continued,
                score: last_score,
            }),
            OnQualityFailure::Abort => Err(EngineError::QualityGateAborted {
                step: agent.to_string(),
                score: last_score,
            }),
        }
    }
}
