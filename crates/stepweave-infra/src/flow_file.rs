//! Flow definition files.
//!
//! Flows are stored as YAML (`.yaml`, `.yml`) or JSON (`.json`). Loading
//! parses and validates, so a returned definition is ready to run.

use std::path::{Path, PathBuf};

use stepweave_core::flow::validate_flow;
use stepweave_types::flow::FlowDefinition;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid flow: {0}")]
    Invalid(String),

    #[error("unsupported flow file extension: {0}")]
    UnsupportedExtension(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFormat {
    Yaml,
    Json,
}

impl FlowFormat {
    pub fn from_path(path: &Path) -> Result<Self, FlowFileError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            other => Err(FlowFileError::UnsupportedExtension(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

/// Parse and validate a flow definition.
pub fn parse_flow(content: &str, format: FlowFormat) -> Result<FlowDefinition, FlowFileError> {
    let flow: FlowDefinition = match format {
        FlowFormat::Yaml => {
            serde_yaml_ng::from_str(content).map_err(|e| FlowFileError::Parse(e.to_string()))?
        }
        FlowFormat::Json => {
            serde_json::from_str(content).map_err(|e| FlowFileError::Parse(e.to_string()))?
        }
    };
    validate_flow(&flow).map_err(|e| FlowFileError::Invalid(e.to_string()))?;
    Ok(flow)
}

/// Load a flow definition, picking the format from the file extension.
pub fn load_flow_file(path: &Path) -> Result<FlowDefinition, FlowFileError> {
    let format = FlowFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)?;
    parse_flow(&content, format)
}

/// Save a flow definition as YAML, creating parent directories.
pub fn save_flow_file(path: &Path, flow: &FlowDefinition) -> Result<(), FlowFileError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = match FlowFormat::from_path(path)? {
        FlowFormat::Yaml => {
            serde_yaml_ng::to_string(flow).map_err(|e| FlowFileError::Parse(e.to_string()))?
        }
        FlowFormat::Json => {
            serde_json::to_string_pretty(flow).map_err(|e| FlowFileError::Parse(e.to_string()))?
        }
    };
    std::fs::write(path, content)?;
    Ok(())
}

/// Every loadable flow file under `base_dir`, recursively. Files that fail
/// to load are skipped with a warning.
pub fn discover_flows(base_dir: &Path) -> Result<Vec<(PathBuf, FlowDefinition)>, FlowFileError> {
    let mut found = Vec::new();
    if base_dir.exists() {
        discover_recursive(base_dir, &mut found)?;
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

fn discover_recursive(
    dir: &Path,
    found: &mut Vec<(PathBuf, FlowDefinition)>,
) -> Result<(), FlowFileError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, found)?;
            continue;
        }
        if FlowFormat::from_path(&path).is_err() {
            continue;
        }
        match load_flow_file(&path) {
            Ok(flow) => found.push((path, flow)),
            Err(err) => tracing::warn!(?path, %err, "skipping unloadable flow file"),
        }
    }
    Ok(())
}
