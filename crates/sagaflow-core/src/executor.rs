//! Executor: run one dequeued step to a recorded outcome.
//!
//! `execute_next` is the unit of work a worker performs: claim a ready queue
//! entry, mark the step running, invoke its handler under the configured
//! timeout, classify the result, and persist it together with whatever the
//! scheduler says comes next. Structural steps (fork, join, condition,
//! savepoint) execute as pass-throughs; their meaning lives in the
//! scheduler.

use std::time::Duration;

use sagaflow_types::queue::QueueEntry;
use sagaflow_types::workflow::{
    InstanceStatus, StepDefinition, StepStatus, StepType, WorkflowDefinition, WorkflowInstance,
    WorkflowStep,
};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::{Engine, EngineError};
use crate::handler::{HandlerError, StepContext};
use crate::retry;
use crate::scheduler;
use crate::store::{StepOutcome, WorkflowStore};

/// How one step attempt ended, before retry classification.
enum StepFailure {
    /// Transient; retried while retries remain.
    Retryable(String),
    /// Skips any remaining retries.
    Fatal(String),
    /// Exceeded the configured timeout; subject to the same retry policy.
    Timeout(Duration),
}

impl<S: WorkflowStore> Engine<S> {
    /// Execute at most one ready step. Returns `true` when the queue had
    /// nothing ready ("empty"), `false` when a step was processed.
    pub async fn execute_next(&self, worker_id: &str) -> Result<bool, EngineError> {
        let Some(entry) = self.store.dequeue_one(worker_id).await? else {
            return Ok(true);
        };
        self.run_entry(worker_id, entry).await?;
        Ok(false)
    }

    async fn run_entry(&self, worker_id: &str, entry: QueueEntry) -> Result<(), EngineError> {
        let Some(instance) = self.store.get_instance(entry.instance_id).await? else {
            self.store.delete_queue_entry(entry.id).await?;
            return Ok(());
        };

        // Work for a terminal instance is dropped, not executed.
        if instance.status.is_terminal() {
            self.store.delete_queue_entry(entry.id).await?;
            self.store.mark_steps_skipped(instance.id).await?;
            return Ok(());
        }

        let def = self.definition(&instance.workflow_id).await?;
        let Some(step_def) = def.step(&entry.step_name) else {
            return self
                .fail_instance_invariant(
                    &entry,
                    format!("queued step '{}' not in definition", entry.step_name),
                )
                .await;
        };
        let Some(step_row) = self.store.get_step(instance.id, &entry.step_name).await? else {
            return self
                .fail_instance_invariant(
                    &entry,
                    format!("queued step '{}' has no step row", entry.step_name),
                )
                .await;
        };

        // Key is stable across retries unless the step opts out.
        let idempotency_key = match (&step_row.idempotency_key, step_def.no_idempotent) {
            (Some(key), false) => key.clone(),
            _ => Uuid::now_v7().to_string(),
        };

        let Some(step_row) = self
            .store
            .mark_step_running(instance.id, &entry.step_name, &idempotency_key)
            .await?
        else {
            // No longer runnable -- a rollback skipped it under us.
            self.store.delete_queue_entry(entry.id).await?;
            return Ok(());
        };

        tracing::debug!(
            worker = worker_id,
            instance_id = instance.id,
            step = entry.step_name.as_str(),
            retry_count = step_row.retry_count,
            "executing step"
        );

        let input = step_row.input.clone().unwrap_or(Value::Null);
        match self.invoke(step_def, &step_row, input).await {
            Ok(output) => {
                self.complete_step(&def, step_def, &entry, &instance, output)
                    .await
            }
            Err(failure) => {
                self.fail_step(&def, step_def, &entry, &instance, &step_row, failure)
                    .await
            }
        }
    }

    /// Invoke the step's handler (tasks) or pass the input through
    /// (structural steps), applying the configured timeout.
    async fn invoke(
        &self,
        step_def: &StepDefinition,
        step_row: &WorkflowStep,
        input: Value,
    ) -> Result<Value, StepFailure> {
        if step_def.step_type != StepType::Task {
            return Ok(input);
        }

        let handler_name = step_def.handler.as_deref().unwrap_or_default();
        let Some(handler) = self.handlers.get(handler_name) else {
            return Err(StepFailure::Fatal(format!(
                "handler not registered: {handler_name}"
            )));
        };

        let token = self.instance_token(step_row.instance_id).child_token();
        let ctx = StepContext {
            instance_id: step_row.instance_id,
            step_name: step_row.step_name.clone(),
            idempotency_key: step_row.idempotency_key.clone().unwrap_or_default(),
            retry_count: step_row.retry_count,
            metadata: step_def.metadata.clone(),
            cancellation: token.clone(),
        };

        let invocation = handler.execute(ctx, input);
        let result = match step_def.timeout_ms {
            Some(ms) => {
                let limit = Duration::from_millis(ms);
                match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        return Err(StepFailure::Timeout(limit));
                    }
                }
            }
            None => invocation.await,
        };

        result.map_err(|err| match err {
            HandlerError::Retryable(message) => StepFailure::Retryable(message),
            HandlerError::Fatal(message) => StepFailure::Fatal(message),
        })
    }

    async fn complete_step(
        &self,
        def: &WorkflowDefinition,
        step_def: &StepDefinition,
        entry: &QueueEntry,
        instance: &WorkflowInstance,
        output: Value,
    ) -> Result<(), EngineError> {
        let successors = scheduler::successors(def, step_def, &output)?;
        let applied = self
            .store
            .record_step_result(&StepOutcome {
                instance_id: instance.id,
                step_name: entry.step_name.clone(),
                queue_entry_id: entry.id,
                status: StepStatus::Completed,
                output: Some(output.clone()),
                error: None,
                successors,
            })
            .await?;
        if !applied {
            // A rollback transitioned the step while the handler ran; the
            // outcome is discarded.
            return Ok(());
        }

        tracing::debug!(
            instance_id = instance.id,
            step = entry.step_name.as_str(),
            "step completed"
        );

        if step_def.is_compensation() {
            return self.on_compensation_complete(step_def, instance.id).await;
        }
        self.maybe_complete_instance(instance.id, &output).await
    }

    async fn fail_step(
        &self,
        def: &WorkflowDefinition,
        step_def: &StepDefinition,
        entry: &QueueEntry,
        instance: &WorkflowInstance,
        step_row: &WorkflowStep,
        failure: StepFailure,
    ) -> Result<(), EngineError> {
        let (error, retryable) = match failure {
            StepFailure::Retryable(message) => (message, true),
            StepFailure::Fatal(message) => (message, false),
            StepFailure::Timeout(limit) => {
                (format!("timeout after {}ms", limit.as_millis()), true)
            }
        };

        if retryable && step_row.retry_count < step_def.max_retries {
            let delay = retry::backoff_delay(
                step_def.retry_strategy,
                step_def.retry_delay_ms,
                step_row.retry_count,
            );
            self.store
                .retry_step(entry.id, instance.id, &entry.step_name, &error, delay)
                .await?;
            tracing::warn!(
                instance_id = instance.id,
                step = entry.step_name.as_str(),
                retry_count = step_row.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = error.as_str(),
                "step failed, retrying"
            );
            return Ok(());
        }

        let applied = self
            .store
            .record_step_result(&StepOutcome {
                instance_id: instance.id,
                step_name: entry.step_name.clone(),
                queue_entry_id: entry.id,
                status: StepStatus::Failed,
                output: None,
                error: Some(error.clone()),
                successors: Vec::new(),
            })
            .await?;
        if !applied {
            return Ok(());
        }

        tracing::warn!(
            instance_id = instance.id,
            step = entry.step_name.as_str(),
            error = error.as_str(),
            "step failed terminally"
        );

        if step_def.is_compensation() {
            return self
                .compensation_failed(instance.id, &entry.step_name, &error)
                .await;
        }
        self.trigger_rollback_failure(def, instance.id, &entry.step_name, &error)
            .await
    }

    /// An impossible queue/definition state: count it, fail the instance
    /// without retry.
    async fn fail_instance_invariant(
        &self,
        entry: &QueueEntry,
        message: String,
    ) -> Result<(), EngineError> {
        tracing::error!(
            instance_id = entry.instance_id,
            step = entry.step_name.as_str(),
            message = message.as_str(),
            "invariant violation"
        );
        self.store.delete_queue_entry(entry.id).await?;
        self.store
            .update_instance_status(
                entry.instance_id,
                InstanceStatus::Failed,
                Some(&format!("invariant violation: {message}")),
                None,
            )
            .await?;
        self.forget_instance(entry.instance_id);
        Ok(())
    }
}
