//! Control commands against the shared database: start, inspect, cancel,
//! abort, stats, cleanup.
//!
//! These commands never run handlers; a `serve` process (or any worker pool
//! on the same database) picks the work up.

use std::time::Duration;

use chrono::{DateTime, Utc};
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use console::style;
use sagaflow_core::engine::Engine;
use sagaflow_core::store::WorkflowStore;
use sagaflow_infra::SqliteStore;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::workflow::WorkflowStep;

use super::{CancelArgs, StartArgs, read_input};

async fn control_engine(db_url: &str) -> anyhow::Result<Engine<SqliteStore>> {
    let store = SqliteStore::connect(db_url).await?;
    Ok(Engine::new(store, EngineConfig::from_env()))
}

pub async fn start(db_url: &str, args: StartArgs, json: bool) -> anyhow::Result<()> {
    let engine = control_engine(db_url).await?;
    let def = engine
        .store()
        .get_definition(&args.workflow_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("workflow not found: {}", args.workflow_id))?;

    let input = read_input(args.input.as_deref())?;
    let instance_id = engine
        .store()
        .create_instance(&args.workflow_id, &input, &def.start)
        .await?;

    if json {
        println!("{}", serde_json::json!({"instance_id": instance_id}));
    } else {
        println!(
            "started instance {} of {}",
            style(instance_id).bold(),
            args.workflow_id
        );
    }
    Ok(())
}

pub async fn status(db_url: &str, instance_id: i64, json: bool) -> anyhow::Result<()> {
    let engine = control_engine(db_url).await?;
    let instance = engine.get_instance(instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    println!(
        "instance {} [{}]: {}",
        style(instance.id).bold(),
        instance.workflow_id,
        style(instance.status).bold()
    );
    if let Some(current) = &instance.current_step {
        println!("  current step: {current}");
    }
    if let Some(error) = &instance.error {
        println!("  error: {}", style(error).red());
    }
    println!("  started: {}", fmt_time(Some(instance.started_at)));
    println!("  completed: {}", fmt_time(instance.completed_at));
    Ok(())
}

pub async fn steps(db_url: &str, instance_id: i64, json: bool) -> anyhow::Result<()> {
    let engine = control_engine(db_url).await?;
    let steps = engine.get_steps(instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&steps)?);
    } else {
        print_steps_table(&steps);
    }
    Ok(())
}

pub async fn cancel(db_url: &str, args: CancelArgs, json: bool) -> anyhow::Result<()> {
    let engine = control_engine(db_url).await?;
    let request_id = engine
        .cancel_workflow(args.instance_id, &args.requested_by, args.reason.as_deref())
        .await?;
    print_request(json, "cancel", args.instance_id, request_id);
    Ok(())
}

pub async fn abort(db_url: &str, args: CancelArgs, json: bool) -> anyhow::Result<()> {
    let engine = control_engine(db_url).await?;
    let request_id = engine
        .abort_workflow(args.instance_id, &args.requested_by, args.reason.as_deref())
        .await?;
    print_request(json, "abort", args.instance_id, request_id);
    Ok(())
}

pub async fn stats(db_url: &str, json: bool) -> anyhow::Result<()> {
    let engine = control_engine(db_url).await?;
    let stats = engine.summary_stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("instances: {}", stats.total_instances);
    println!("  pending:   {}", stats.pending);
    println!("  running:   {}", stats.running);
    println!("  completed: {}", stats.completed);
    println!("  failed:    {}", stats.failed);
    println!("  cancelled: {}", stats.cancelled);
    println!("  aborted:   {}", stats.aborted);
    println!("queue depth: {}", stats.queue_depth);
    println!("unprocessed cancellations: {}", stats.unprocessed_cancellations);
    Ok(())
}

pub async fn cleanup(db_url: &str, older_than_days: u64, json: bool) -> anyhow::Result<()> {
    let engine = control_engine(db_url).await?;
    let removed = engine
        .cleanup_old_workflows(Duration::from_secs(older_than_days * 24 * 60 * 60))
        .await?;

    if json {
        println!("{}", serde_json::json!({"removed": removed}));
    } else {
        println!("removed {removed} old workflow instance(s)");
    }
    Ok(())
}

fn print_request(json: bool, kind: &str, instance_id: i64, request_id: i64) {
    if json {
        println!(
            "{}",
            serde_json::json!({"kind": kind, "instance_id": instance_id, "request_id": request_id})
        );
    } else {
        println!("{kind} requested for instance {instance_id} (request {request_id})");
    }
}

pub(crate) fn print_steps_table(steps: &[WorkflowStep]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(["step", "status", "retries", "started", "completed", "error"]);
    for step in steps {
        table.add_row([
            step.step_name.clone(),
            step.status.to_string(),
            step.retry_count.to_string(),
            fmt_time(step.started_at),
            fmt_time(step.completed_at),
            step.error.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
}

fn fmt_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "-".to_string(),
    }
}
