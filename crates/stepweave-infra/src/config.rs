//! Engine configuration loader.
//!
//! Reads `stepweave.toml` and deserializes it into [`EngineConfig`].
//! [`load_engine_config`] falls back to defaults when the file is missing or
//! malformed; [`read_engine_config`] is the strict variant used when the
//! caller named the file explicitly.

use std::path::{Path, PathBuf};

use stepweave_types::config::EngineConfig;
use thiserror::Error;

use crate::sqlite::pool::default_data_dir;

pub const CONFIG_FILE_NAME: &str = "stepweave.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Default config location: `<data dir>/stepweave.toml`.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE_NAME)
}

/// Read and parse a config file, failing on any error.
pub async fn read_engine_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load engine configuration from `path`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning, returns the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    match read_engine_config(path).await {
        Ok(config) => config,
        Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {} found, using defaults", path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    }
}
