//! Cancellation watcher: apply out-of-band cancel/abort requests.
//!
//! The watcher periodically reads unprocessed cancellation requests and, per
//! request, consults the instance: terminal instances just acknowledge the
//! request; otherwise `cancel` starts a compensating rollback and `abort`
//! skips straight to `aborted`. The `processed` flag flips in the same
//! transaction that starts the rollback, so each request is applied at most
//! once. In-flight handlers of the instance are cancelled cooperatively via
//! its token.

use sagaflow_types::queue::{CancelKind, CancellationRequest};
use sagaflow_types::workflow::RollbackKind;
use tokio::task::JoinHandle;

use crate::engine::{Engine, EngineError};
use crate::store::WorkflowStore;

impl<S: WorkflowStore + 'static> Engine<S> {
    pub(crate) fn spawn_watcher(self: &std::sync::Arc<Self>) -> JoinHandle<()> {
        let engine = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.cancel_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.shutdown_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = engine.process_cancellations().await {
                            tracing::error!(error = %err, "cancellation watcher pass failed");
                        }
                    }
                }
            }
            tracing::debug!("cancellation watcher stopped");
        })
    }
}

impl<S: WorkflowStore> Engine<S> {
    /// One watcher pass: apply every pending cancellation request. Exposed
    /// so control paths and tests can run a pass without the background
    /// loop. Returns how many requests were applied.
    pub async fn process_cancellations(&self) -> Result<usize, EngineError> {
        let requests = self.store.pending_cancellations().await?;
        let mut applied = 0;
        for request in requests {
            self.process_request(&request).await?;
            applied += 1;
        }
        Ok(applied)
    }

    async fn process_request(&self, request: &CancellationRequest) -> Result<(), EngineError> {
        let Some(instance) = self.store.get_instance(request.instance_id).await? else {
            self.store.mark_cancellation_processed(request.id).await?;
            return Ok(());
        };
        if instance.status.is_terminal() {
            self.store.mark_cancellation_processed(request.id).await?;
            return Ok(());
        }

        let kind = match request.kind {
            CancelKind::Cancel => RollbackKind::Cancel,
            CancelKind::Abort => RollbackKind::Abort,
        };
        let reason = request
            .reason
            .clone()
            .unwrap_or_else(|| format!("{} requested by {}", request.kind, request.requested_by));

        let started = self
            .store
            .begin_rollback(request.instance_id, kind, Some(&reason), Some(request.id))
            .await?;
        if !started {
            // Another rollback already owns this instance; the request was
            // still marked processed in the same transaction.
            return Ok(());
        }

        tracing::info!(
            instance_id = request.instance_id,
            kind = %request.kind,
            requested_by = request.requested_by.as_str(),
            "applying cancellation request"
        );

        self.reset_instance_token(request.instance_id);
        let def = self.definition(&instance.workflow_id).await?;
        let origin = instance.current_step.as_deref();
        self.run_rollback(&def, request.instance_id, origin, kind)
            .await
    }
}
