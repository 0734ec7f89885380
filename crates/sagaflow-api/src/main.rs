//! sagaflow CLI entry point.
//!
//! Binary name: `sagaflow`
//!
//! `serve` and `run` load a YAML workflow document, register definitions and
//! shell handlers, and drive the worker pool; the remaining commands talk to
//! the same database to start, inspect, cancel, or abort instances.

mod cli;
mod shell;

use clap::Parser;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,sagaflow=debug",
        _ => "trace",
    };
    if let Err(err) = sagaflow_observe::tracing_setup::init_tracing(filter) {
        eprintln!("failed to initialize tracing: {err}");
    }

    let db_url = cli.db_url();
    let json = cli.json;

    match cli.command {
        Commands::Serve(args) => cli::serve::serve(&db_url, args).await,
        Commands::Run(args) => cli::run::run(&db_url, args, json).await,
        Commands::Start(args) => cli::instance::start(&db_url, args, json).await,
        Commands::Status { instance_id } => {
            cli::instance::status(&db_url, instance_id, json).await
        }
        Commands::Steps { instance_id } => {
            cli::instance::steps(&db_url, instance_id, json).await
        }
        Commands::Cancel(args) => cli::instance::cancel(&db_url, args, json).await,
        Commands::Abort(args) => cli::instance::abort(&db_url, args, json).await,
        Commands::Stats => cli::instance::stats(&db_url, json).await,
        Commands::Cleanup { older_than_days } => {
            cli::instance::cleanup(&db_url, older_than_days, json).await
        }
    }
}
