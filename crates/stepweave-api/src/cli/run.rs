//! `run` and `resume` command handlers.

use std::path::Path;

use anyhow::{Context, bail};
use serde_json::Value;
use stepweave_core::flow::{RunFailure, RunOptions, RunOutcome};
use stepweave_core::repository::SnapshotStore;
use stepweave_infra::flow_file::load_flow_file;
use uuid::Uuid;

use crate::cli::render;
use crate::state::AppState;

/// Run a flow file and persist the snapshot if it suspends.
pub async fn handle_run(
    state: &AppState,
    flow_path: &Path,
    input: Option<&str>,
    input_file: Option<&Path>,
    suspend_before: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let flow = load_flow_file(flow_path)
        .with_context(|| format!("Failed to load flow {}", flow_path.display()))?;

    let input = match (input, input_file) {
        (Some(text), _) => parse_input(text),
        (None, Some(path)) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read input file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Input file {} is not valid JSON", path.display()))?
        }
        (None, None) => Value::Null,
    };

    tracing::info!(flow = %flow.name, steps = flow.steps.len(), "running flow");
    let outcome = state
        .orchestrator
        .run_with_options(&flow, input, RunOptions { suspend_before })
        .await;
    finish(state, outcome, json).await
}

/// Resume a stored snapshot. The snapshot is consumed whether or not the
/// resumed segment succeeds.
pub async fn handle_resume(
    state: &AppState,
    execution_id: &str,
    input: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let id = Uuid::parse_str(execution_id)
        .with_context(|| format!("Invalid execution id '{execution_id}'"))?;
    let resume_input = input.map(parse_input);

    tracing::info!(execution_id = %id, "resuming run");
    let outcome = state
        .orchestrator
        .resume_from_store(&state.store, id, resume_input)
        .await;
    finish(state, outcome, json).await
}

async fn finish(
    state: &AppState,
    outcome: Result<RunOutcome, RunFailure>,
    json: bool,
) -> anyhow::Result<()> {
    match outcome {
        Ok(RunOutcome::Completed(result)) => render::print_completed(&result, json),
        Ok(RunOutcome::Suspended(snapshot)) => {
            state
                .store
                .save(&snapshot)
                .await
                .context("Failed to save snapshot")?;
            render::print_suspended(&snapshot, json)
        }
        Err(failure) => {
            render::print_failure(&failure, json)?;
            bail!("run {} failed: {}", failure.execution_id, failure.error)
        }
    }
}

/// Parse CLI input as JSON, falling back to a plain string.
pub fn parse_input(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
