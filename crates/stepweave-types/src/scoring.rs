//! Quality-gate configuration and scoring history types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Quality gate declared on an agent step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringConfig {
    /// Runner name of the evaluator step.
    pub evaluator: String,
    /// Configuration handed to the evaluator runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_config: Option<Value>,
    pub thresholds: Thresholds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Value>,
    #[serde(default)]
    pub on_failure: OnQualityFailure,
    /// Maximum number of attempts; engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub minimum: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excellent: Option<f64>,
}

impl Thresholds {
    pub fn passes(&self, score: f64) -> bool {
        score >= self.minimum
    }

    pub fn tier(&self, score: f64) -> QualityTier {
        if self.excellent.is_some_and(|t| score >= t) {
            QualityTier::Excellent
        } else if self.target.is_some_and(|t| score >= t) {
            QualityTier::Target
        } else if score >= self.minimum {
            QualityTier::Minimum
        } else {
            QualityTier::Below
        }
    }
}

/// Policy once every allowed attempt has failed the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnQualityFailure {
    #[default]
    Retry,
    Continue,
    Abort,
}

/// Delay schedule between scored attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub initial_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    pub max_ms: u64,
}

fn default_multiplier() -> f64 {
    2.0
}

impl BackoffConfig {
    /// Delay after the given 1-based attempt.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.powi(exp);
        if raw.is_finite() {
            (raw as u64).min(self.max_ms)
        } else {
            self.max_ms
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Target,
    Minimum,
    Below,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One evaluated attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub agent: String,
    pub score: f64,
    pub passed: bool,
    pub tier: QualityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

/// Append-only scoring record for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringState {
    pub score_history: Vec<ScoreEntry>,
    /// Retries consumed per agent (attempts - 1).
    pub retry_count: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<QualityMetrics>,
}

impl ScoringState {
    pub fn is_empty(&self) -> bool {
        self.score_history.is_empty()
    }

    /// Entries recorded for one agent, in attempt order.
    pub fn entries_for<'a>(&'a self, agent: &'a str) -> impl Iterator<Item = &'a ScoreEntry> + 'a {
        self.score_history.iter().filter(move |e| e.agent == agent)
    }

    /// Compute `final_score` and `quality_metrics`. Only the first call has
    /// an effect.
    pub fn finalize(&mut self) {
        if self.quality_metrics.is_some() || self.score_history.is_empty() {
            return;
        }

        let mut last_per_agent: BTreeMap<&str, f64> = BTreeMap::new();
        for entry in &self.score_history {
            last_per_agent.insert(entry.agent.as_str(), entry.score);
        }
        let final_score =
            last_per_agent.values().sum::<f64>() / last_per_agent.len() as f64;

        let scores: Vec<f64> = self.score_history.iter().map(|e| e.score).collect();
        let count = scores.len() as u32;
        let passed = self.score_history.iter().filter(|e| e.passed).count() as u32;
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        self.final_score = Some(final_score);
        self.quality_metrics = Some(QualityMetrics {
            evaluations: count,
            passed,
            pass_rate: passed as f64 / count as f64,
            mean_score: mean,
            min_score: min,
            max_score: max,
            total_retries: self.retry_count.values().sum(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub evaluations: u32,
    pub passed: u32,
    pub pass_rate: f64,
    pub mean_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub total_retries: u32,
}
