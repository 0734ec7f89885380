//! `sagaflow serve`: host the worker pool for a YAML workflow document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use sagaflow_core::engine::Engine;
use sagaflow_core::yaml::parse_workflow_yaml;
use sagaflow_infra::SqliteStore;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::workflow::WorkflowDefinition;

use super::ServeArgs;
use crate::shell::ShellHandler;

pub async fn serve(db_url: &str, args: ServeArgs) -> anyhow::Result<()> {
    let drain_timeout = Duration::from_secs(args.drain_timeout_secs);
    let (engine, defs) = bootstrap(db_url, &args).await?;

    engine.start_workers().await?;
    let flows: Vec<&str> = defs.keys().map(String::as_str).collect();
    tracing::info!(flows = ?flows, "serving workflows");

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received, draining workers");
    engine.shutdown(drain_timeout).await;
    Ok(())
}

/// Load the YAML document, open the database, and wire up an engine with
/// the document's definitions and shell handlers.
pub(crate) async fn bootstrap(
    db_url: &str,
    args: &ServeArgs,
) -> anyhow::Result<(Arc<Engine<SqliteStore>>, HashMap<String, WorkflowDefinition>)> {
    let yaml_data = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read YAML file {}", args.file))?;
    let (defs, handlers_exec) = parse_workflow_yaml(&yaml_data, args.workflow_version)?;
    if defs.is_empty() {
        bail!("no flows defined in YAML file");
    }

    let store = SqliteStore::connect(db_url)
        .await
        .with_context(|| format!("failed to open database {db_url}"))?;

    let mut config = EngineConfig::from_env();
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(interval_ms) = args.worker_interval_ms {
        config.poll_interval = Duration::from_millis(interval_ms);
    }

    let engine = Arc::new(Engine::new(store, config));
    for handler in ShellHandler::from_exec_table(&handlers_exec, args.debug) {
        engine.register_handler(handler);
    }
    for def in defs.values() {
        engine.register_workflow(def.clone()).await?;
    }

    Ok((engine, defs))
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
