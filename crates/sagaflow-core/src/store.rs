//! The `WorkflowStore` port: durable state operations the engine runs
//! against.
//!
//! The store exclusively owns all persisted rows. Contracts the engine
//! relies on:
//!
//! - `dequeue_one` hands an entry to at most one caller at a time: a claimed
//!   entry is invisible to other callers until it is released (retry),
//!   consumed (`record_step_result`), or its claim times out.
//! - `record_step_result` is one atomic unit: the step row update, the queue
//!   entry removal, and every scheduler-issued successor enqueue or join
//!   arrival commit together. The step update is guarded on the row still
//!   being `running`; when the guard fails (a rollback got there first) the
//!   whole outcome is discarded and `false` is returned.
//! - `begin_rollback` sets the instance's rollback kind at most once, and
//!   flips the triggering cancellation request's `processed` flag in the
//!   same transaction.
//!
//! Transient database errors are returned as-is; the caller decides whether
//! to retry. Uniqueness conflicts on step upsert are idempotent success.
//!
//! Uses native async fn in traits (RPITIT), consistent with the rest of the
//! workspace.

use std::future::Future;
use std::time::Duration;

use sagaflow_types::error::StoreError;
use sagaflow_types::queue::{CancelKind, CancellationRequest, QueueEntry};
use sagaflow_types::workflow::{
    InstanceStatus, JoinStrategy, RollbackKind, StepStatus, SummaryStats, WorkflowDefinition,
    WorkflowInstance, WorkflowStep,
};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Operation payloads
// ---------------------------------------------------------------------------

/// A request to make a step runnable: upsert its step row (created lazily on
/// first enqueue, input = predecessor output) and insert its queue entry.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub instance_id: i64,
    pub step_name: String,
    pub input: Value,
    /// Schedule offset: `available_at = now + delay`.
    pub delay: Duration,
}

/// Scheduler-issued follow-up work recorded atomically with a step result.
#[derive(Debug, Clone)]
pub enum Successor {
    /// Enqueue a plain successor step with the completed step's output as
    /// its input.
    Enqueue {
        step_name: String,
        input: Value,
        delay: Duration,
    },
    /// Report a branch arrival at a join step. The store merges the branch
    /// output into the join's aggregated input, increments the arrival
    /// counter, and enqueues the join when it fires (`all`: the last awaited
    /// branch; `any`: the first). Exactly one arrival observes the firing
    /// condition.
    JoinArrival {
        join_step: String,
        branch: String,
        output: Value,
        expected: u32,
        strategy: JoinStrategy,
        delay: Duration,
    },
}

/// Terminal result of one step attempt, plus the follow-up work to record
/// with it.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub instance_id: i64,
    pub step_name: String,
    pub queue_entry_id: i64,
    /// `Completed` or `Failed`.
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub successors: Vec<Successor>,
}

// ---------------------------------------------------------------------------
// WorkflowStore trait
// ---------------------------------------------------------------------------

/// Persistence port for the workflow engine, implemented by
/// `sagaflow-infra`.
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Persist a definition. Re-registration of an identical definition is
    /// idempotent; a different definition under an existing id is a
    /// `Conflict`.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_definition(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, StoreError>> + Send;

    fn list_definitions(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkflowDefinition>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create an instance and enqueue its start step in one transaction.
    /// Returns the new instance id.
    fn create_instance(
        &self,
        workflow_id: &str,
        input: &Value,
        start_step: &str,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn get_instance(
        &self,
        instance_id: i64,
    ) -> impl Future<Output = Result<Option<WorkflowInstance>, StoreError>> + Send;

    /// Update instance status. `error` and `output` overwrite only when
    /// `Some`; terminal statuses stamp `completed_at`.
    fn update_instance_status(
        &self,
        instance_id: i64,
        status: InstanceStatus,
        error: Option<&str>,
        output: Option<&Value>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Instances whose status is not terminal.
    fn active_instances(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkflowInstance>, StoreError>> + Send;

    fn summary_stats(&self) -> impl Future<Output = Result<SummaryStats, StoreError>> + Send;

    /// Delete terminal instances (and their dependent rows) that completed
    /// more than `older_than` ago. Returns the number of instances removed.
    fn cleanup_old_workflows(
        &self,
        older_than: Duration,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn get_step(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> impl Future<Output = Result<Option<WorkflowStep>, StoreError>> + Send;

    fn list_steps(
        &self,
        instance_id: i64,
    ) -> impl Future<Output = Result<Vec<WorkflowStep>, StoreError>> + Send;

    /// Create a pending step row if absent. Returns `true` when a row was
    /// created; an existing row is idempotent success.
    fn upsert_step(
        &self,
        instance_id: i64,
        step_name: &str,
        input: &Value,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Transition a step to `running`, stamp `started_at`, record the
    /// idempotency key, and update the instance's `current_step` (promoting
    /// a pending instance to `running`). Returns the updated row, or `None`
    /// when the step is no longer runnable (e.g. a rollback skipped it).
    fn mark_step_running(
        &self,
        instance_id: i64,
        step_name: &str,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<Option<WorkflowStep>, StoreError>> + Send;

    /// Transition a `completed` step to `rolled_back`. Idempotent: a step
    /// already rolled back is left untouched.
    fn mark_step_rolled_back(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Mark every `pending` or `running` step of the instance `skipped`.
    /// Returns the number of steps transitioned.
    fn mark_steps_skipped(
        &self,
        instance_id: i64,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Completed steps of the instance, most recently completed first.
    /// Rollback candidate order.
    fn completed_steps_newest_first(
        &self,
        instance_id: i64,
    ) -> impl Future<Output = Result<Vec<WorkflowStep>, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Upsert step rows and insert queue entries for each request, in one
    /// transaction. FIFO position follows insertion order.
    fn enqueue(
        &self,
        requests: &[EnqueueRequest],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Claim the lowest-id ready entry (`available_at <= now`, unclaimed)
    /// for this worker, or `None` when the queue is empty. No other caller
    /// can receive a claimed entry.
    fn dequeue_one(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<QueueEntry>, StoreError>> + Send;

    fn delete_queue_entry(
        &self,
        entry_id: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Drop every queue entry of the instance. Returns how many were
    /// removed.
    fn clear_queue(&self, instance_id: i64)
    -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Atomically record a step attempt's terminal result (see module docs).
    /// Returns `false` when the guarded step update did not apply.
    fn record_step_result(
        &self,
        outcome: &StepOutcome,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Re-arm a failed step for another attempt: step back to `pending` with
    /// `retry_count + 1` and the attempt error recorded; queue entry
    /// released and rescheduled to `now + delay` with `attempt_count + 1`.
    fn retry_step(
        &self,
        entry_id: i64,
        instance_id: i64,
        step_name: &str,
        error: &str,
        delay: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Number of queue entries (claimed or not) outstanding for the
    /// instance.
    fn count_active_work(
        &self,
        instance_id: i64,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Release claims older than `claim_timeout` and flip their steps back
    /// to `pending`. Run at worker-pool start to recover work orphaned by a
    /// crashed worker. Returns the number of entries released.
    fn recover_orphaned(
        &self,
        claim_timeout: Duration,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    // -----------------------------------------------------------------------
    // Rollback & cancellation
    // -----------------------------------------------------------------------

    /// Start a rollback: set the instance's rollback kind (at most once) and
    /// record the triggering error; when `request_id` is given, flip that
    /// request's `processed` flag in the same transaction. Returns `true`
    /// when this call started the rollback, `false` when one was already in
    /// progress.
    fn begin_rollback(
        &self,
        instance_id: i64,
        kind: RollbackKind,
        error: Option<&str>,
        request_id: Option<i64>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Record a cancellation request; returns its id.
    fn request_cancellation(
        &self,
        instance_id: i64,
        kind: CancelKind,
        requested_by: &str,
        reason: Option<&str>,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn pending_cancellations(
        &self,
    ) -> impl Future<Output = Result<Vec<CancellationRequest>, StoreError>> + Send;

    fn mark_cancellation_processed(
        &self,
        request_id: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
