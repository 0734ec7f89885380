//! `sagaflow run`: one-shot execution of a YAML flow to completion.

use std::time::{Duration, Instant};

use anyhow::bail;
use console::style;

use super::instance::print_steps_table;
use super::{RunArgs, read_input, serve};

pub async fn run(db_url: &str, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let (engine, defs) = serve::bootstrap(db_url, &args.serve).await?;

    let flow = match &args.flow {
        Some(name) => defs
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("flow '{name}' not defined in the document"))?,
        None => {
            if defs.len() > 1 {
                bail!("document defines multiple flows; pick one with --flow");
            }
            defs.values()
                .next()
                .ok_or_else(|| anyhow::anyhow!("no flows defined"))?
        }
    };

    let input = read_input(args.input.as_deref())?;
    engine.start_workers().await?;
    let instance_id = engine.start(&flow.id(), input).await?;

    let deadline = Instant::now() + Duration::from_secs(args.completion_timeout_secs);
    let timed_out = loop {
        let status = engine.get_status(instance_id).await?;
        if status.is_terminal() {
            break false;
        }
        if Instant::now() >= deadline {
            break true;
        }
        tokio::time::sleep(Duration::from_millis(args.status_interval_ms)).await;
    };

    engine
        .shutdown(Duration::from_secs(args.serve.drain_timeout_secs))
        .await;

    let instance = engine.get_instance(instance_id).await?;
    let steps = engine.get_steps(instance_id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "instance": instance,
                "steps": steps,
            }))?
        );
    } else {
        println!(
            "instance {} [{}]: {}",
            style(instance.id).bold(),
            instance.workflow_id,
            style(instance.status).bold()
        );
        if let Some(error) = &instance.error {
            println!("  error: {}", style(error).red());
        }
        if let Some(output) = &instance.output {
            println!("  output: {output}");
        }
        print_steps_table(&steps);
    }

    if timed_out {
        bail!("workflow did not finish within {}s", args.completion_timeout_secs);
    }
    if instance.status != sagaflow_types::workflow::InstanceStatus::Completed {
        bail!(
            "workflow finished as {}{}",
            instance.status,
            instance
                .error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
