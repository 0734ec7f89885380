//! Shared helpers for engine integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sagaflow_core::engine::Engine;
use sagaflow_core::handler::{Handler, HandlerError, StepContext};
use sagaflow_infra::SqliteStore;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::workflow::StepStatus;
use serde_json::Value;

/// Engine over a fresh temp-file SQLite database. Workers are driven
/// manually via `execute_next`; the background pool stays off.
pub async fn test_engine() -> Arc<Engine<SqliteStore>> {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    std::mem::forget(dir);

    let store = SqliteStore::connect(&url).await.unwrap();
    let config = EngineConfig {
        workers: 1,
        poll_interval: Duration::from_millis(10),
        cancel_interval: Duration::from_millis(50),
        claim_timeout: Duration::from_secs(60),
    };
    Arc::new(Engine::new(store, config))
}

/// Run `execute_next` until the queue reports empty.
pub async fn drive(engine: &Engine<SqliteStore>, worker_id: &str) {
    for _ in 0..200 {
        match engine.execute_next(worker_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => panic!("execute_next failed: {err}"),
        }
    }
    panic!("workflow did not drain within 200 iterations");
}

/// Step name -> status for one instance.
pub async fn step_statuses(
    engine: &Engine<SqliteStore>,
    instance_id: i64,
) -> HashMap<String, StepStatus> {
    engine
        .get_steps(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_name, s.status))
        .collect()
}

/// Checks the rollback invariant: steps before the savepoint stay
/// `completed`, the failing step is `failed` (or `rolled_back`), and every
/// other step ends `rolled_back` or `skipped` -- never `completed`.
pub fn assert_rollback_invariant(
    statuses: &HashMap<String, StepStatus>,
    failing_step: &str,
    steps_before_savepoint: &[&str],
) {
    let retained: HashSet<&str> = steps_before_savepoint.iter().copied().collect();

    for (step, status) in statuses {
        if retained.contains(step.as_str()) {
            assert_eq!(
                *status,
                StepStatus::Completed,
                "step {step} (before savepoint) should remain completed, got {status}"
            );
            continue;
        }
        if step == failing_step {
            assert!(
                matches!(status, StepStatus::Failed | StepStatus::RolledBack),
                "failing step {step} should be failed or rolled_back, got {status}"
            );
            continue;
        }
        assert!(
            matches!(status, StepStatus::RolledBack | StepStatus::Skipped),
            "step {step} should be rolled_back or skipped after rollback, got {status}"
        );
    }
}

/// A handler scripted per step name: fail always, fail the first N calls,
/// or echo the input. Records every call with its idempotency key.
pub struct ScriptedHandler {
    name: String,
    fail_always: HashSet<String>,
    fail_times: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_always: HashSet::new(),
            fail_times: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every invocation for these step names.
    pub fn failing_on(mut self, steps: &[&str]) -> Self {
        self.fail_always = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Fail the first `times` invocations for this step, then succeed.
    pub fn failing_times(self, step: &str, times: u32) -> Self {
        self.fail_times
            .lock()
            .unwrap()
            .insert(step.to_string(), times);
        self
    }

    /// Step names in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(step, _)| step.clone())
            .collect()
    }

    pub fn call_count(&self, step: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == step)
            .count()
    }

    /// Idempotency keys seen for a step, in invocation order.
    pub fn keys_for(&self, step: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == step)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: StepContext, input: Value) -> Result<Value, HandlerError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.step_name.clone(), ctx.idempotency_key.clone()));

        if self.fail_always.contains(&ctx.step_name) {
            return Err(HandlerError::retryable(format!(
                "intentional failure in step {}",
                ctx.step_name
            )));
        }
        if let Some(remaining) = self.fail_times.lock().unwrap().get_mut(&ctx.step_name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(HandlerError::retryable(format!(
                    "scripted failure in step {}",
                    ctx.step_name
                )));
            }
        }
        Ok(input)
    }
}
