//! CLI command definitions for the `stepweave` binary.

pub mod progress;
pub mod render;
pub mod run;
pub mod snapshots;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run, validate and resume step flows.
#[derive(Parser)]
#[command(name = "stepweave", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to stepweave.toml (defaults to the data directory).
    #[arg(long, global = true, env = "STEPWEAVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a flow definition file.
    Run {
        /// Flow file (.yaml, .yml or .json).
        flow: PathBuf,

        /// Run input as JSON (plain text is passed as a string).
        #[arg(long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read the run input from a JSON file.
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Suspend just before this top-level step index.
        #[arg(long)]
        suspend_before: Option<usize>,
    },

    /// Validate a flow definition file without running it.
    Validate {
        /// Flow file (.yaml, .yml or .json).
        flow: PathBuf,
    },

    /// Resume a suspended run.
    Resume {
        /// Execution id printed when the run suspended.
        execution_id: String,

        /// Resume input as JSON, visible to expressions as `resume`.
        #[arg(long)]
        input: Option<String>,
    },

    /// List suspended runs awaiting resume.
    #[command(alias = "ls")]
    Snapshots,
}
