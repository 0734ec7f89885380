//! CLI command definitions and shared helpers for the `sagaflow` binary.
//!
//! Uses clap derive macros. `serve`/`run` host workers; the rest are control
//! commands against the shared database.

pub mod instance;
pub mod run;
pub mod serve;

use clap::{Args, Parser, Subcommand};
use sagaflow_infra::sqlite::pool::default_database_url;

/// Durable, database-backed workflow engine.
#[derive(Parser)]
#[command(name = "sagaflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Database URL (defaults to $SAGAFLOW_DB, then ~/.sagaflow/sagaflow.db).
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn db_url(&self) -> String {
        self.db.clone().unwrap_or_else(default_database_url)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load a YAML document, register its flows and handlers, and run the
    /// worker pool until interrupted.
    Serve(ServeArgs),

    /// One-shot: serve a YAML document, start one flow, and wait for the
    /// instance to finish.
    Run(RunArgs),

    /// Start an instance of a registered workflow.
    Start(StartArgs),

    /// Show an instance's status.
    Status {
        /// Instance id.
        instance_id: i64,
    },

    /// List an instance's step records.
    Steps {
        /// Instance id.
        instance_id: i64,
    },

    /// Request a compensating cancellation of an instance.
    Cancel(CancelArgs),

    /// Request an abort (no compensations) of an instance.
    Abort(CancelArgs),

    /// Show aggregate engine statistics.
    Stats,

    /// Delete terminal instances older than the retention window.
    Cleanup {
        /// Retention window in days.
        #[arg(long, default_value_t = 30)]
        older_than_days: u64,
    },
}

#[derive(Args)]
pub struct ServeArgs {
    /// YAML file with workflow configuration.
    #[arg(short, long)]
    pub file: String,

    /// Workflow version to register the document's flows under.
    #[arg(long, default_value_t = 1)]
    pub workflow_version: i32,

    /// Number of worker pool workers.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Worker idle polling interval in milliseconds.
    #[arg(long)]
    pub worker_interval_ms: Option<u64>,

    /// Drain timeout on shutdown, in seconds.
    #[arg(long, default_value_t = 10)]
    pub drain_timeout_secs: u64,

    /// Print handler input/output to stderr.
    #[arg(short = 'D', long)]
    pub debug: bool,
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub serve: ServeArgs,

    /// JSON file with the initial input (stdin when omitted).
    #[arg(short, long)]
    pub input: Option<String>,

    /// Flow to start (defaults to the document's only flow).
    #[arg(long)]
    pub flow: Option<String>,

    /// Timeout for workflow completion, in seconds.
    #[arg(long, default_value_t = 600)]
    pub completion_timeout_secs: u64,

    /// Interval for checking workflow status, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub status_interval_ms: u64,
}

#[derive(Args)]
pub struct StartArgs {
    /// Workflow id ("{name}-v{version}").
    pub workflow_id: String,

    /// JSON file with the initial input (stdin when omitted).
    #[arg(short, long)]
    pub input: Option<String>,
}

#[derive(Args)]
pub struct CancelArgs {
    /// Instance id.
    pub instance_id: i64,

    /// Who requested the cancellation.
    #[arg(long, default_value = "cli")]
    pub requested_by: String,

    /// Free-form reason recorded with the request.
    #[arg(long)]
    pub reason: Option<String>,
}

/// Read the initial input payload: a JSON file when given, otherwise stdin,
/// otherwise `{}`.
pub fn read_input(input_file: Option<&str>) -> anyhow::Result<serde_json::Value> {
    use std::io::{IsTerminal, Read};

    let data = match input_file {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read input file {path}: {e}"))?,
        None => {
            let mut buffer = String::new();
            // Only consume stdin when it is piped in.
            if !std::io::stdin().is_terminal() {
                std::io::stdin().read_to_string(&mut buffer)?;
            }
            buffer
        }
    };

    if data.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&data).map_err(|e| anyhow::anyhow!("input is not valid JSON: {e}"))
}
