//! Worker pool: N stateless workers polling the queue.
//!
//! Each worker loops on `execute_next`; an empty poll sleeps
//! `poll_interval`, a processed step loops immediately. Workers are not
//! pinned to instances -- any worker may execute any step. Shutdown cancels
//! the shared token; workers finish their current step and exit, bounded by
//! the caller's drain timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::engine::{Engine, EngineError};
use crate::store::WorkflowStore;

impl<S: WorkflowStore + 'static> Engine<S> {
    /// Recover orphaned claims, then start the worker pool and the
    /// cancellation watcher.
    pub async fn start_workers(self: &Arc<Self>) -> Result<(), EngineError> {
        let recovered = self
            .store
            .recover_orphaned(self.config.claim_timeout)
            .await?;
        if recovered > 0 {
            tracing::info!(recovered, "released orphaned queue claims");
        }

        let mut background = self
            .background
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for index in 0..self.config.workers {
            background.push(self.spawn_worker(index));
        }
        background.push(self.spawn_watcher());
        tracing::info!(workers = self.config.workers, "worker pool started");
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, index: usize) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let worker_id = format!("worker-{index}");
        tokio::spawn(async move {
            tracing::debug!(worker = worker_id.as_str(), "worker started");
            loop {
                if engine.shutdown_token.is_cancelled() {
                    break;
                }
                match engine.execute_next(&worker_id).await {
                    Ok(false) => {}
                    Ok(true) => {
                        tokio::select! {
                            _ = engine.shutdown_token.cancelled() => break,
                            _ = tokio::time::sleep(engine.config.poll_interval) => {}
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            worker = worker_id.as_str(),
                            error = %err,
                            "step execution failed"
                        );
                        tokio::time::sleep(engine.config.poll_interval).await;
                    }
                }
            }
            tracing::debug!(worker = worker_id.as_str(), "worker stopped");
        })
    }
}

impl<S: WorkflowStore> Engine<S> {
    /// Signal shutdown and wait for workers to drain their current step,
    /// bounded by `drain_timeout`. Handlers observe the cancellation token;
    /// blocked handlers are not forcibly killed.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shutdown_token.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut background = self
                .background
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            background.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(drain_timeout, drain).await.is_err() {
            tracing::warn!("drain timeout elapsed before all workers stopped");
        } else {
            tracing::info!("worker pool drained");
        }
    }
}
