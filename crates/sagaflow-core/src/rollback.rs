//! Rollback controller: unwind completed steps when an instance fails or is
//! cancelled.
//!
//! Triggered by a step's terminal failure or by a `cancel` request. The
//! algorithm:
//!
//! 1. Mark the rollback started (`begin_rollback`; at most once per
//!    instance) and record the triggering error.
//! 2. Drop all queued work and mark every pending/running step `skipped`.
//! 3. Find the nearest savepoint by walking `prev` backwards from the origin
//!    step. Steps from which the savepoint is forward-reachable (and the
//!    savepoint itself) are retained as `completed`.
//! 4. Every other completed step is a candidate, taken in reverse completion
//!    order (actual timestamps, not topology -- concurrent branches
//!    interleave). A candidate with `on_failure` gets its compensation
//!    enqueued; otherwise it is marked `rolled_back` directly.
//! 5. Compensations run as ordinary step executions. When the last one
//!    completes, the instance finalizes to the status implied by the
//!    persisted rollback kind (`failed` / `cancelled` / `aborted`).
//!
//! Candidate selection is global across the instance, so a failure inside a
//! nested fork unwinds sibling branches of every enclosing fork as well.
//! Compensations are enqueued at most once per step: the queue's
//! `(instance, step)` uniqueness and the candidate set being computed once
//! under `begin_rollback` prevent double-compensation when several branches
//! converge on the same failure.
//!
//! The abort path skips compensations entirely: non-terminal steps become
//! `skipped` and the instance finalizes as `aborted`.
//!
//! A compensation that itself fails terminally is fatal: remaining work is
//! dropped and the instance fails with a distinct `rollback failed at step`
//! error marker. There is no rollback of rollbacks.

use std::collections::HashSet;
use std::time::Duration;

use sagaflow_types::workflow::{
    InstanceStatus, RollbackKind, StepDefinition, StepType, WorkflowDefinition, WorkflowStep,
};
use serde_json::Value;

use crate::definition::forward_edges;
use crate::engine::{Engine, EngineError};
use crate::store::{EnqueueRequest, WorkflowStore};

impl<S: WorkflowStore> Engine<S> {
    /// Entry point for failure-triggered rollback, called by the executor
    /// after a step's terminal failure has been recorded.
    pub(crate) async fn trigger_rollback_failure(
        &self,
        def: &WorkflowDefinition,
        instance_id: i64,
        failing_step: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        let summary = format!("step '{failing_step}' failed: {error}");
        let started = self
            .store
            .begin_rollback(instance_id, RollbackKind::Failure, Some(&summary), None)
            .await?;
        if !started {
            // A rollback is already driving this instance; this failure is
            // absorbed into it.
            return self.maybe_finalize_rollback(instance_id).await;
        }

        tracing::warn!(
            instance_id,
            failing_step,
            error,
            "starting rollback after terminal failure"
        );
        self.reset_instance_token(instance_id);
        self.run_rollback(def, instance_id, Some(failing_step), RollbackKind::Failure)
            .await
    }

    /// Drive the rollback: clear forward work, select candidates, enqueue
    /// compensations, finalize if nothing is left to run.
    pub(crate) async fn run_rollback(
        &self,
        def: &WorkflowDefinition,
        instance_id: i64,
        origin_step: Option<&str>,
        kind: RollbackKind,
    ) -> Result<(), EngineError> {
        self.store.clear_queue(instance_id).await?;
        let skipped = self.store.mark_steps_skipped(instance_id).await?;
        if skipped > 0 {
            tracing::debug!(instance_id, skipped, "marked unreached steps skipped");
        }

        if kind == RollbackKind::Abort {
            return self.maybe_finalize_rollback(instance_id).await;
        }

        let retained = origin_step
            .and_then(|origin| nearest_savepoint(def, origin))
            .map(|savepoint| retained_behind_savepoint(def, savepoint))
            .unwrap_or_default();

        let completed = self.store.completed_steps_newest_first(instance_id).await?;
        let mut compensations = Vec::new();
        for candidate in &completed {
            if retained.contains(candidate.step_name.as_str()) {
                continue;
            }
            let Some(step_def) = def.step(&candidate.step_name) else {
                continue;
            };
            if step_def.is_compensation() {
                continue;
            }
            match &step_def.on_failure {
                Some(compensation) => compensations.push(compensation_request(candidate, compensation)),
                None => {
                    self.store
                        .mark_step_rolled_back(instance_id, &candidate.step_name)
                        .await?;
                }
            }
        }

        if !compensations.is_empty() {
            tracing::info!(
                instance_id,
                compensations = compensations.len(),
                "enqueueing compensations in reverse completion order"
            );
            self.store.enqueue(&compensations).await?;
        }

        self.maybe_finalize_rollback(instance_id).await
    }

    /// A compensation step finished: mark the step it undoes `rolled_back`,
    /// then finalize if it was the last outstanding work.
    pub(crate) async fn on_compensation_complete(
        &self,
        comp_def: &StepDefinition,
        instance_id: i64,
    ) -> Result<(), EngineError> {
        if let Some(owner) = comp_def.compensation_for.as_deref() {
            self.store.mark_step_rolled_back(instance_id, owner).await?;
            tracing::debug!(
                instance_id,
                step = owner,
                compensation = comp_def.name.as_str(),
                "step compensated"
            );
        }
        self.maybe_finalize_rollback(instance_id).await
    }

    /// A compensation failed terminally: fatal instance failure, no nested
    /// rollback.
    pub(crate) async fn compensation_failed(
        &self,
        instance_id: i64,
        compensation_step: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        let marker = format!("rollback failed at step '{compensation_step}': {error}");
        tracing::error!(instance_id, compensation_step, error, "compensation failed");
        self.store.clear_queue(instance_id).await?;
        self.store.mark_steps_skipped(instance_id).await?;
        self.store
            .update_instance_status(instance_id, InstanceStatus::Failed, Some(&marker), None)
            .await?;
        self.forget_instance(instance_id);
        Ok(())
    }

    /// Finalize a rolling-back instance once no queued work remains.
    pub(crate) async fn maybe_finalize_rollback(
        &self,
        instance_id: i64,
    ) -> Result<(), EngineError> {
        if self.store.count_active_work(instance_id).await? > 0 {
            return Ok(());
        }
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            return Ok(());
        };
        if instance.status.is_terminal() {
            return Ok(());
        }
        let Some(kind) = instance.rollback_kind else {
            return Ok(());
        };

        let status = kind.terminal_status();
        self.store
            .update_instance_status(instance_id, status, None, None)
            .await?;
        self.forget_instance(instance_id);
        tracing::info!(instance_id, status = %status, "rollback finalized");
        Ok(())
    }
}

/// Build the enqueue request for a candidate's compensation: the candidate's
/// output is what the compensation has to undo.
fn compensation_request(candidate: &WorkflowStep, compensation: &str) -> EnqueueRequest {
    EnqueueRequest {
        instance_id: candidate.instance_id,
        step_name: compensation.to_string(),
        input: candidate.output.clone().unwrap_or(Value::Null),
        delay: Duration::ZERO,
    }
}

/// Walk `prev` backwards from `origin` looking for the nearest savepoint.
/// Returns the savepoint's name, or `None` when no savepoint lies on the
/// path back to the root.
fn nearest_savepoint<'a>(def: &'a WorkflowDefinition, origin: &str) -> Option<&'a str> {
    let mut visited = HashSet::new();
    let mut current = def.step(origin)?;
    while visited.insert(current.name.clone()) {
        if current.step_type == StepType::Savepoint {
            return Some(current.name.as_str());
        }
        current = def.step(current.prev.as_deref()?)?;
    }
    None
}

/// Steps retained by a savepoint: the savepoint itself plus every step from
/// which it is forward-reachable. Those stay `completed`; rollback never
/// crosses them.
fn retained_behind_savepoint(def: &WorkflowDefinition, savepoint: &str) -> HashSet<String> {
    let mut retained = HashSet::new();
    retained.insert(savepoint.to_string());
    // Fixed-point over the forward edges: a step is retained when any of its
    // successors leads to the savepoint.
    let mut changed = true;
    while changed {
        changed = false;
        for step in def.steps.values() {
            if retained.contains(step.name.as_str()) {
                continue;
            }
            if forward_edges(step).any(|succ| retained.contains(succ)) {
                retained.insert(step.name.clone());
                changed = true;
            }
        }
    }
    retained
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
