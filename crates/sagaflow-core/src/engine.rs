//! The workflow engine: public surface and shared state.
//!
//! `Engine` is generic over its [`WorkflowStore`] so the same engine runs
//! against SQLite in production and against temp databases in tests. All
//! coordination between workers happens through the store; the engine keeps
//! no in-process mutable state about instances beyond a definition cache and
//! the cooperative cancellation tokens.
//!
//! The executor, scheduler, rollback controller, cancellation watcher, and
//! worker pool are implemented in sibling modules as further `impl Engine`
//! blocks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::error::StoreError;
use sagaflow_types::queue::CancelKind;
use sagaflow_types::workflow::{
    InstanceStatus, SummaryStats, WorkflowDefinition, WorkflowInstance, WorkflowStep,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::definition::{WorkflowError, validate_definition};
use crate::expression::ExpressionError;
use crate::handler::{Handler, HandlerRegistry};
use crate::store::WorkflowStore;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine's public surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(i64),

    #[error("handler not registered: {0}")]
    HandlerNotRegistered(String),

    #[error(transparent)]
    Definition(#[from] WorkflowError),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Internal invariant violation: fails the instance without retry and is
    /// surfaced to observability.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The durable workflow engine.
pub struct Engine<S: WorkflowStore> {
    pub(crate) store: S,
    pub(crate) config: EngineConfig,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) definitions: DashMap<String, Arc<WorkflowDefinition>>,
    /// Per-instance cancellation tokens, children of `shutdown_token`.
    pub(crate) instance_tokens: DashMap<i64, CancellationToken>,
    pub(crate) shutdown_token: CancellationToken,
    pub(crate) background: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: WorkflowStore> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            handlers: HandlerRegistry::new(),
            definitions: DashMap::new(),
            instance_tokens: DashMap::new(),
            shutdown_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a handler. Idempotent on name.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) {
        tracing::debug!(handler = handler.name(), "handler registered");
        self.handlers.register(handler);
    }

    /// Validate and persist a workflow definition. Idempotent on
    /// `(name, version)`; re-registering a changed definition under an
    /// existing id is a conflict.
    pub async fn register_workflow(&self, def: WorkflowDefinition) -> Result<(), EngineError> {
        validate_definition(&def)?;
        self.store.save_definition(&def).await?;
        let id = def.id();
        tracing::info!(workflow = id.as_str(), "workflow registered");
        self.definitions.insert(id, Arc::new(def));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle
    // -----------------------------------------------------------------------

    /// Start a new instance of a registered workflow. Creates the instance
    /// row and enqueues the start step atomically; returns the instance id.
    pub async fn start(&self, workflow_id: &str, input: Value) -> Result<i64, EngineError> {
        let def = self.definition(workflow_id).await?;

        // Unknown handlers surface here, synchronously, rather than as a
        // terminal failure mid-run.
        for step in def.steps.values() {
            if let Some(handler) = step.handler.as_deref() {
                if !self.handlers.contains(handler) {
                    return Err(EngineError::HandlerNotRegistered(handler.to_string()));
                }
            }
        }

        let instance_id = self
            .store
            .create_instance(workflow_id, &input, &def.start)
            .await?;
        tracing::info!(
            instance_id,
            workflow = workflow_id,
            "workflow instance started"
        );
        Ok(instance_id)
    }

    pub async fn get_instance(&self, instance_id: i64) -> Result<WorkflowInstance, EngineError> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    pub async fn get_status(&self, instance_id: i64) -> Result<InstanceStatus, EngineError> {
        Ok(self.get_instance(instance_id).await?.status)
    }

    pub async fn get_steps(&self, instance_id: i64) -> Result<Vec<WorkflowStep>, EngineError> {
        Ok(self.store.list_steps(instance_id).await?)
    }

    /// Request a compensating cancellation of an instance. Returns the
    /// request id; the cancellation watcher picks it up.
    pub async fn cancel_workflow(
        &self,
        instance_id: i64,
        requested_by: &str,
        reason: Option<&str>,
    ) -> Result<i64, EngineError> {
        self.get_instance(instance_id).await?;
        let id = self
            .store
            .request_cancellation(instance_id, CancelKind::Cancel, requested_by, reason)
            .await?;
        tracing::info!(instance_id, requested_by, "cancellation requested");
        Ok(id)
    }

    /// Request an abort: no compensations, instance ends `aborted`.
    pub async fn abort_workflow(
        &self,
        instance_id: i64,
        requested_by: &str,
        reason: Option<&str>,
    ) -> Result<i64, EngineError> {
        self.get_instance(instance_id).await?;
        let id = self
            .store
            .request_cancellation(instance_id, CancelKind::Abort, requested_by, reason)
            .await?;
        tracing::info!(instance_id, requested_by, "abort requested");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Operational surface
    // -----------------------------------------------------------------------

    pub async fn summary_stats(&self) -> Result<SummaryStats, EngineError> {
        Ok(self.store.summary_stats().await?)
    }

    pub async fn active_instances(&self) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.store.active_instances().await?)
    }

    pub async fn cleanup_old_workflows(&self, older_than: Duration) -> Result<u64, EngineError> {
        Ok(self.store.cleanup_old_workflows(older_than).await?)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Resolve a definition from the cache, falling back to the store.
    pub(crate) async fn definition(
        &self,
        workflow_id: &str,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        if let Some(def) = self.definitions.get(workflow_id) {
            return Ok(Arc::clone(&def));
        }
        let def = self
            .store
            .get_definition(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        let def = Arc::new(def);
        self.definitions
            .insert(workflow_id.to_string(), Arc::clone(&def));
        Ok(def)
    }

    /// The cancellation token for an instance, created on first use as a
    /// child of the shutdown token.
    pub(crate) fn instance_token(&self, instance_id: i64) -> CancellationToken {
        self.instance_tokens
            .entry(instance_id)
            .or_insert_with(|| self.shutdown_token.child_token())
            .clone()
    }

    /// Cancel in-flight work for an instance and install a fresh token so
    /// subsequent executions (compensations) are not born cancelled.
    pub(crate) fn reset_instance_token(&self, instance_id: i64) {
        if let Some((_, token)) = self.instance_tokens.remove(&instance_id) {
            token.cancel();
        }
        self.instance_tokens
            .insert(instance_id, self.shutdown_token.child_token());
    }

    /// Drop per-instance state once an instance reaches a terminal status.
    pub(crate) fn forget_instance(&self, instance_id: i64) {
        self.instance_tokens.remove(&instance_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::WorkflowNotFound("order-v1".to_string());
        assert_eq!(err.to_string(), "workflow not found: order-v1");

        let err = EngineError::HandlerNotRegistered("charge".to_string());
        assert!(err.to_string().contains("charge"));

        let err = EngineError::Invariant("step vanished".to_string());
        assert!(err.to_string().contains("invariant"));
    }
}
