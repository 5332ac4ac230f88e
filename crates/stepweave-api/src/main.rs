//! Stepweave CLI entry point.
//!
//! Binary name: `stepweave`
//!
//! Parses arguments, loads `stepweave.toml`, installs tracing, opens the
//! snapshot store and dispatches to a command handler.

mod cli;
mod state;

use anyhow::Context;
use clap::Parser;
use stepweave_infra::config::{default_config_path, load_engine_config, read_engine_config};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // An explicit --config must exist and parse; the default location may not.
    let mut config = match &cli.config {
        Some(path) => read_engine_config(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => load_engine_config(&default_config_path()).await,
    };

    config.logging.level = stepweave_observe::effective_level(&config.logging.level, cli.verbose, cli.quiet);
    if cli.json {
        config.logging.json = true;
    }
    stepweave_observe::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    // `validate` needs neither the engine nor the store.
    if let Commands::Validate { flow } = &cli.command {
        return cli::validate::handle_validate(flow, cli.json);
    }

    let state = AppState::init(config, !cli.json && !cli.quiet).await?;

    match cli.command {
        Commands::Run {
            flow,
            input,
            input_file,
            suspend_before,
        } => {
            cli::run::handle_run(
                &state,
                &flow,
                input.as_deref(),
                input_file.as_deref(),
                suspend_before,
                cli.json,
            )
            .await?;
        }
        Commands::Resume {
            execution_id,
            input,
        } => {
            cli::run::handle_resume(&state, &execution_id, input.as_deref(), cli.json).await?;
        }
        Commands::Snapshots => {
            cli::snapshots::handle_snapshots(&state, cli.json).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}
