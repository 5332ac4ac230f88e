//! Engine configuration types.
//!
//! `EngineConfig` is the top-level `stepweave.toml`. Every field has a
//! default so an empty or missing file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-step timeout when a step does not declare `timeoutMs`.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Concurrency cap for Foreach/Map-Reduce without `maxConcurrency`.
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    /// Outputs larger than this are replaced by a truncation marker.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,

    #[serde(default)]
    pub scoring: ScoringDefaults,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_step_output_bytes() -> usize {
    1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: default_step_timeout_ms(),
            default_max_concurrency: default_max_concurrency(),
            max_step_output_bytes: default_max_step_output_bytes(),
            scoring: ScoringDefaults::default(),
            logging: LoggingConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Quality-gate defaults for steps that leave them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringDefaults {
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_retry_limit() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

impl Default for ScoringDefaults {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file for suspended runs; the platform data dir is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}
