//! SQLite implementation of the engine's `WorkflowStore` port.
//!
//! All mutations go through the single-connection writer pool, which is what
//! serializes claim-one dequeue, the join arrival counter, and rollback
//! initiation -- the SQLite rendition of `SELECT ... FOR UPDATE SKIP
//! LOCKED`. Multi-statement operations (`create_instance`,
//! `record_step_result`, `retry_step`, `begin_rollback`) run in writer
//! transactions so they commit or vanish as one unit.
//!
//! Timestamps are stored as RFC 3339 text with fixed microsecond precision,
//! so lexical comparison in SQL matches chronological order.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sagaflow_core::store::{EnqueueRequest, StepOutcome, Successor, WorkflowStore};
use sagaflow_types::error::StoreError;
use sagaflow_types::queue::{CancelKind, CancellationRequest, QueueEntry};
use sagaflow_types::workflow::{
    InstanceStatus, JoinStrategy, RollbackKind, StepStatus, SummaryStats, WorkflowDefinition,
    WorkflowInstance, WorkflowStep,
};
use serde_json::Value;
use sqlx::{Row, Sqlite, Transaction};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    /// Create a store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open a pool for `database_url` (running migrations) and wrap it.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(DatabasePool::new(database_url).await?))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::Query(format!("invalid JSON: {e}"))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_string() -> String {
    format_datetime(&Utc::now())
}

/// `now + delay` as a stored timestamp.
fn after(delay: Duration) -> String {
    let delta = chrono::Duration::milliseconds(delay.as_millis() as i64);
    format_datetime(&(Utc::now() + delta))
}

/// `now - age` as a stored timestamp.
fn before(age: Duration) -> String {
    let delta = chrono::Duration::milliseconds(age.as_millis() as i64);
    format_datetime(&(Utc::now() - delta))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid datetime: {e}")))
}

fn parse_json(s: &str) -> Result<Value, StoreError> {
    serde_json::from_str(s).map_err(json_err)
}

fn parse_opt_json(s: Option<&str>) -> Result<Option<Value>, StoreError> {
    s.map(parse_json).transpose()
}

fn parse_status<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, StoreError> {
    s.parse().map_err(StoreError::Query)
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: i64,
    workflow_id: String,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    rollback_kind: Option<String>,
    current_step: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            rollback_kind: row.try_get("rollback_kind")?,
            current_step: row.try_get("current_step")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, StoreError> {
        Ok(WorkflowInstance {
            id: self.id,
            workflow_id: self.workflow_id,
            status: parse_status::<InstanceStatus>(&self.status)?,
            input: parse_json(&self.input)?,
            output: parse_opt_json(self.output.as_deref())?,
            error: self.error,
            rollback_kind: self
                .rollback_kind
                .as_deref()
                .map(parse_status::<RollbackKind>)
                .transpose()?,
            current_step: self.current_step,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    instance_id: i64,
    step_name: String,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    retry_count: i64,
    join_arrivals: i64,
    idempotency_key: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            join_arrivals: row.try_get("join_arrivals")?,
            idempotency_key: row.try_get("idempotency_key")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_step(self) -> Result<WorkflowStep, StoreError> {
        Ok(WorkflowStep {
            instance_id: self.instance_id,
            step_name: self.step_name,
            status: parse_status::<StepStatus>(&self.status)?,
            input: parse_opt_json(self.input.as_deref())?,
            output: parse_opt_json(self.output.as_deref())?,
            error: self.error,
            retry_count: self.retry_count as u32,
            join_arrivals: self.join_arrivals as u32,
            idempotency_key: self.idempotency_key,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct QueueRow {
    id: i64,
    instance_id: i64,
    step_name: String,
    available_at: String,
    attempt_count: i64,
    claimed_by: Option<String>,
    claimed_at: Option<String>,
}

impl QueueRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_name: row.try_get("step_name")?,
            available_at: row.try_get("available_at")?,
            attempt_count: row.try_get("attempt_count")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }

    fn into_entry(self) -> Result<QueueEntry, StoreError> {
        Ok(QueueEntry {
            id: self.id,
            instance_id: self.instance_id,
            step_name: self.step_name,
            available_at: parse_datetime(&self.available_at)?,
            attempt_count: self.attempt_count as u32,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct CancellationRow {
    id: i64,
    instance_id: i64,
    kind: String,
    requested_by: String,
    reason: Option<String>,
    requested_at: String,
    processed: i64,
}

impl CancellationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            kind: row.try_get("kind")?,
            requested_by: row.try_get("requested_by")?,
            reason: row.try_get("reason")?,
            requested_at: row.try_get("requested_at")?,
            processed: row.try_get("processed")?,
        })
    }

    fn into_request(self) -> Result<CancellationRequest, StoreError> {
        Ok(CancellationRequest {
            id: self.id,
            instance_id: self.instance_id,
            kind: parse_status::<CancelKind>(&self.kind)?,
            requested_by: self.requested_by,
            reason: self.reason,
            requested_at: parse_datetime(&self.requested_at)?,
            processed: self.processed != 0,
        })
    }
}

// ---------------------------------------------------------------------------
// In-transaction helpers
// ---------------------------------------------------------------------------

/// Upsert the step row (lazy creation, input = predecessor output) and
/// insert the queue entry. `(instance, step)` uniqueness makes both
/// idempotent.
async fn enqueue_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    instance_id: i64,
    step_name: &str,
    input: &Value,
    delay: Duration,
) -> Result<(), StoreError> {
    let input_str = serde_json::to_string(input).map_err(json_err)?;
    sqlx::query(
        r#"INSERT INTO workflow_steps (instance_id, step_name, status, input)
           VALUES (?, ?, 'pending', ?)
           ON CONFLICT(instance_id, step_name) DO NOTHING"#,
    )
    .bind(instance_id)
    .bind(step_name)
    .bind(&input_str)
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    sqlx::query(
        r#"INSERT INTO queue (instance_id, step_name, available_at, attempt_count)
           VALUES (?, ?, ?, 0)
           ON CONFLICT(instance_id, step_name) DO NOTHING"#,
    )
    .bind(instance_id)
    .bind(step_name)
    .bind(after(delay))
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    Ok(())
}

/// Record one branch arrival at a join: merge the branch output into the
/// join's aggregated input, bump the arrival counter, and enqueue the join
/// when it fires. Serialized by the writer connection, so exactly one
/// arrival observes the firing condition.
#[allow(clippy::too_many_arguments)]
async fn join_arrival_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    instance_id: i64,
    join_step: &str,
    branch: &str,
    output: &Value,
    expected: u32,
    strategy: JoinStrategy,
    delay: Duration,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO workflow_steps (instance_id, step_name, status, input, join_arrivals)
           VALUES (?, ?, 'pending', '{}', 0)
           ON CONFLICT(instance_id, step_name) DO NOTHING"#,
    )
    .bind(instance_id)
    .bind(join_step)
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    let row = sqlx::query(
        "SELECT input, join_arrivals FROM workflow_steps WHERE instance_id = ? AND step_name = ?",
    )
    .bind(instance_id)
    .bind(join_step)
    .fetch_one(&mut **tx)
    .await
    .map_err(query_err)?;

    let input: Option<String> = row.try_get("input").map_err(query_err)?;
    let arrivals: i64 = row.try_get("join_arrivals").map_err(query_err)?;

    let mut aggregate = match input.as_deref() {
        Some(s) => parse_json(s)?,
        None => Value::Object(serde_json::Map::new()),
    };
    if !aggregate.is_object() {
        aggregate = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = aggregate.as_object_mut() {
        map.insert(branch.to_string(), output.clone());
    }
    let arrivals = arrivals + 1;

    sqlx::query(
        "UPDATE workflow_steps SET input = ?, join_arrivals = ? WHERE instance_id = ? AND step_name = ?",
    )
    .bind(serde_json::to_string(&aggregate).map_err(json_err)?)
    .bind(arrivals)
    .bind(instance_id)
    .bind(join_step)
    .execute(&mut **tx)
    .await
    .map_err(query_err)?;

    let fires = match strategy {
        JoinStrategy::All => arrivals == i64::from(expected),
        JoinStrategy::Any => arrivals == 1,
    };
    if fires {
        sqlx::query(
            r#"INSERT INTO queue (instance_id, step_name, available_at, attempt_count)
               VALUES (?, ?, ?, 0)
               ON CONFLICT(instance_id, step_name) DO NOTHING"#,
        )
        .bind(instance_id)
        .bind(join_step)
        .bind(after(delay))
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteStore {
    // -- Definitions --------------------------------------------------------

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let id = def.id();
        let spec = serde_json::to_string(def).map_err(json_err)?;

        let existing = sqlx::query("SELECT spec FROM workflow_definitions WHERE id = ?")
            .bind(&id)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if let Some(row) = existing {
            let stored: String = row.try_get("spec").map_err(query_err)?;
            let stored_value = parse_json(&stored)?;
            let new_value = serde_json::to_value(def).map_err(json_err)?;
            if stored_value == new_value {
                return Ok(());
            }
            return Err(StoreError::Conflict(format!(
                "definition '{id}' already registered with different content"
            )));
        }

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, version, spec, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&def.name)
        .bind(def.version)
        .bind(&spec)
        .bind(now_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT spec FROM workflow_definitions WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let spec: String = row.try_get("spec").map_err(query_err)?;
                Ok(Some(serde_json::from_str(&spec).map_err(json_err)?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows =
            sqlx::query("SELECT spec FROM workflow_definitions ORDER BY name ASC, version ASC")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_err)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let spec: String = row.try_get("spec").map_err(query_err)?;
            defs.push(serde_json::from_str(&spec).map_err(json_err)?);
        }
        Ok(defs)
    }

    // -- Instances ----------------------------------------------------------

    async fn create_instance(
        &self,
        workflow_id: &str,
        input: &Value,
        start_step: &str,
    ) -> Result<i64, StoreError> {
        let input_str = serde_json::to_string(input).map_err(json_err)?;
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_instances (workflow_id, status, input, started_at)
               VALUES (?, 'pending', ?, ?)"#,
        )
        .bind(workflow_id)
        .bind(&input_str)
        .bind(now_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        let instance_id = result.last_insert_rowid();

        enqueue_in_tx(&mut tx, instance_id, start_step, input, Duration::ZERO).await?;

        tx.commit().await.map_err(query_err)?;
        Ok(instance_id)
    }

    async fn get_instance(&self, instance_id: i64) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn update_instance_status(
        &self,
        instance_id: i64,
        status: InstanceStatus,
        error: Option<&str>,
        output: Option<&Value>,
    ) -> Result<(), StoreError> {
        let completed_at = status.is_terminal().then(now_string);
        let output_str = output
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?;

        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET status = ?,
                   error = COALESCE(?, error),
                   output = COALESCE(?, output),
                   completed_at = COALESCE(?, completed_at)
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&output_str)
        .bind(&completed_at)
        .bind(instance_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn active_instances(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE status IN ('pending', 'running') ORDER BY id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_err)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }

    async fn summary_stats(&self) -> Result<SummaryStats, StoreError> {
        let mut stats = SummaryStats::default();

        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM workflow_instances GROUP BY status")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_err)?;
        for row in &rows {
            let status: String = row.try_get("status").map_err(query_err)?;
            let n: i64 = row.try_get("n").map_err(query_err)?;
            let n = n as u64;
            stats.total_instances += n;
            match parse_status::<InstanceStatus>(&status)? {
                InstanceStatus::Pending => stats.pending = n,
                InstanceStatus::Running => stats.running = n,
                InstanceStatus::Completed => stats.completed = n,
                InstanceStatus::Failed => stats.failed = n,
                InstanceStatus::Cancelled => stats.cancelled = n,
                InstanceStatus::Aborted => stats.aborted = n,
            }
        }

        let (queue_depth,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;
        stats.queue_depth = queue_depth as u64;

        let (pending_cancels,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM cancellation_requests WHERE processed = 0")
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_err)?;
        stats.unprocessed_cancellations = pending_cancels as u64;

        Ok(stats)
    }

    async fn cleanup_old_workflows(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"DELETE FROM workflow_instances
               WHERE status IN ('completed', 'failed', 'cancelled', 'aborted')
                 AND completed_at IS NOT NULL
                 AND completed_at <= ?"#,
        )
        .bind(before(older_than))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    // -- Steps --------------------------------------------------------------

    async fn get_step(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<Option<WorkflowStep>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM workflow_steps WHERE instance_id = ? AND step_name = ?")
                .bind(instance_id)
                .bind(step_name)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = StepRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_step()?))
            }
            None => Ok(None),
        }
    }

    async fn list_steps(&self, instance_id: i64) -> Result<Vec<WorkflowStep>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflow_steps WHERE instance_id = ? ORDER BY rowid ASC")
            .bind(instance_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(query_err)?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    async fn upsert_step(
        &self,
        instance_id: i64,
        step_name: &str,
        input: &Value,
    ) -> Result<bool, StoreError> {
        let input_str = serde_json::to_string(input).map_err(json_err)?;
        let result = sqlx::query(
            r#"INSERT INTO workflow_steps (instance_id, step_name, status, input)
               VALUES (?, ?, 'pending', ?)
               ON CONFLICT(instance_id, step_name) DO NOTHING"#,
        )
        .bind(instance_id)
        .bind(step_name)
        .bind(&input_str)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_step_running(
        &self,
        instance_id: i64,
        step_name: &str,
        idempotency_key: &str,
    ) -> Result<Option<WorkflowStep>, StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let result = sqlx::query(
            r#"UPDATE workflow_steps
               SET status = 'running', started_at = ?, idempotency_key = ?
               WHERE instance_id = ? AND step_name = ? AND status IN ('pending', 'running')"#,
        )
        .bind(now_string())
        .bind(idempotency_key)
        .bind(instance_id)
        .bind(step_name)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(query_err)?;
            return Ok(None);
        }

        sqlx::query(
            r#"UPDATE workflow_instances
               SET status = 'running', current_step = ?
               WHERE id = ? AND status IN ('pending', 'running')"#,
        )
        .bind(step_name)
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let row =
            sqlx::query("SELECT * FROM workflow_steps WHERE instance_id = ? AND step_name = ?")
                .bind(instance_id)
                .bind(step_name)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;
        let step = StepRow::from_row(&row).map_err(query_err)?.into_step()?;

        tx.commit().await.map_err(query_err)?;
        Ok(Some(step))
    }

    async fn mark_step_rolled_back(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE workflow_steps
               SET status = 'rolled_back'
               WHERE instance_id = ? AND step_name = ? AND status = 'completed'"#,
        )
        .bind(instance_id)
        .bind(step_name)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn mark_steps_skipped(&self, instance_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE workflow_steps
               SET status = 'skipped', completed_at = COALESCE(completed_at, ?)
               WHERE instance_id = ? AND status IN ('pending', 'running')"#,
        )
        .bind(now_string())
        .bind(instance_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn completed_steps_newest_first(
        &self,
        instance_id: i64,
    ) -> Result<Vec<WorkflowStep>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_steps
               WHERE instance_id = ? AND status = 'completed'
               ORDER BY completed_at DESC, rowid DESC"#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(query_err)?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }

    // -- Queue --------------------------------------------------------------

    async fn enqueue(&self, requests: &[EnqueueRequest]) -> Result<(), StoreError> {
        if requests.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        for request in requests {
            enqueue_in_tx(
                &mut tx,
                request.instance_id,
                &request.step_name,
                &request.input,
                request.delay,
            )
            .await?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn dequeue_one(&self, worker_id: &str) -> Result<Option<QueueEntry>, StoreError> {
        // Single-statement claim on the serialized writer: the SQLite
        // rendition of `SELECT ... FOR UPDATE SKIP LOCKED`.
        let row = sqlx::query(
            r#"UPDATE queue
               SET claimed_by = ?, claimed_at = ?
               WHERE id = (
                   SELECT id FROM queue
                   WHERE available_at <= ? AND claimed_by IS NULL
                   ORDER BY available_at ASC, id ASC
                   LIMIT 1
               )
               RETURNING id, instance_id, step_name, available_at, attempt_count,
                         claimed_by, claimed_at"#,
        )
        .bind(worker_id)
        .bind(now_string())
        .bind(now_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = QueueRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_entry()?))
            }
            None => Ok(None),
        }
    }

    async fn delete_queue_entry(&self, entry_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn clear_queue(&self, instance_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queue WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn record_step_result(&self, outcome: &StepOutcome) -> Result<bool, StoreError> {
        let output_str = outcome
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?;

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        // Guarded on the row still being `running`: a rollback that skipped
        // the step while its handler ran wins, and the outcome is dropped.
        let result = sqlx::query(
            r#"UPDATE workflow_steps
               SET status = ?,
                   output = COALESCE(?, output),
                   error = COALESCE(?, error),
                   completed_at = ?
               WHERE instance_id = ? AND step_name = ? AND status = 'running'"#,
        )
        .bind(outcome.status.as_str())
        .bind(&output_str)
        .bind(&outcome.error)
        .bind(now_string())
        .bind(outcome.instance_id)
        .bind(&outcome.step_name)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            sqlx::query("DELETE FROM queue WHERE id = ?")
                .bind(outcome.queue_entry_id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            tx.commit().await.map_err(query_err)?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(outcome.queue_entry_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        for successor in &outcome.successors {
            match successor {
                Successor::Enqueue {
                    step_name,
                    input,
                    delay,
                } => {
                    enqueue_in_tx(&mut tx, outcome.instance_id, step_name, input, *delay).await?;
                }
                Successor::JoinArrival {
                    join_step,
                    branch,
                    output,
                    expected,
                    strategy,
                    delay,
                } => {
                    join_arrival_in_tx(
                        &mut tx,
                        outcome.instance_id,
                        join_step,
                        branch,
                        output,
                        *expected,
                        *strategy,
                        *delay,
                    )
                    .await?;
                }
            }
        }

        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn retry_step(
        &self,
        entry_id: i64,
        instance_id: i64,
        step_name: &str,
        error: &str,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        sqlx::query(
            r#"UPDATE workflow_steps
               SET status = 'pending', retry_count = retry_count + 1, error = ?
               WHERE instance_id = ? AND step_name = ?"#,
        )
        .bind(error)
        .bind(instance_id)
        .bind(step_name)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        sqlx::query(
            r#"UPDATE queue
               SET available_at = ?, attempt_count = attempt_count + 1,
                   claimed_by = NULL, claimed_at = NULL
               WHERE id = ?"#,
        )
        .bind(after(delay))
        .bind(entry_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn count_active_work(&self, instance_id: i64) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(count as u64)
    }

    async fn recover_orphaned(&self, claim_timeout: Duration) -> Result<u64, StoreError> {
        let cutoff = before(claim_timeout);
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let rows = sqlx::query(
            "SELECT id, instance_id, step_name FROM queue WHERE claimed_by IS NOT NULL AND claimed_at <= ?",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;

        for row in &rows {
            let entry_id: i64 = row.try_get("id").map_err(query_err)?;
            let instance_id: i64 = row.try_get("instance_id").map_err(query_err)?;
            let step_name: String = row.try_get("step_name").map_err(query_err)?;

            sqlx::query(
                r#"UPDATE workflow_steps SET status = 'pending'
                   WHERE instance_id = ? AND step_name = ? AND status = 'running'"#,
            )
            .bind(instance_id)
            .bind(&step_name)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

            sqlx::query("UPDATE queue SET claimed_by = NULL, claimed_at = NULL WHERE id = ?")
                .bind(entry_id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(rows.len() as u64)
    }

    // -- Rollback & cancellation -------------------------------------------

    async fn begin_rollback(
        &self,
        instance_id: i64,
        kind: RollbackKind,
        error: Option<&str>,
        request_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        // First trigger wins; the recorded error is the original cause.
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET rollback_kind = ?, error = COALESCE(error, ?)
               WHERE id = ? AND rollback_kind IS NULL"#,
        )
        .bind(kind.as_str())
        .bind(error)
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        let started = result.rows_affected() > 0;

        if let Some(request_id) = request_id {
            sqlx::query("UPDATE cancellation_requests SET processed = 1 WHERE id = ?")
                .bind(request_id)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(started)
    }

    async fn request_cancellation(
        &self,
        instance_id: i64,
        kind: CancelKind,
        requested_by: &str,
        reason: Option<&str>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"INSERT INTO cancellation_requests
               (instance_id, kind, requested_by, reason, requested_at, processed)
               VALUES (?, ?, ?, ?, ?, 0)"#,
        )
        .bind(instance_id)
        .bind(kind.as_str())
        .bind(requested_by)
        .bind(reason)
        .bind(now_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.last_insert_rowid())
    }

    async fn pending_cancellations(&self) -> Result<Vec<CancellationRequest>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM cancellation_requests WHERE processed = 0 ORDER BY id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CancellationRow::from_row(row).map_err(query_err)?;
            requests.push(r.into_request()?);
        }
        Ok(requests)
    }

    async fn mark_cancellation_processed(&self, request_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE cancellation_requests SET processed = 1 WHERE id = ?")
            .bind(request_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_types::workflow::StepDefinition;
    use serde_json::json;
    use std::collections::HashMap;

    async fn test_store() -> SqliteStore {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteStore::connect(&url).await.unwrap()
    }

    fn two_step_definition() -> WorkflowDefinition {
        let mut a = StepDefinition::task("a", "h");
        a.next = vec!["b".to_string()];
        let mut b = StepDefinition::task("b", "h");
        b.prev = Some("a".to_string());
        WorkflowDefinition {
            name: "wf".to_string(),
            version: 1,
            start: "a".to_string(),
            steps: HashMap::from([("a".to_string(), a), ("b".to_string(), b)]),
        }
    }

    async fn seed_instance(store: &SqliteStore) -> i64 {
        let def = two_step_definition();
        store.save_definition(&def).await.unwrap();
        store
            .create_instance(&def.id(), &json!({"x": 1}), "a")
            .await
            .unwrap()
    }

    // -- Definitions --

    #[tokio::test]
    async fn test_save_definition_idempotent_and_conflicting() {
        let store = test_store().await;
        let def = two_step_definition();

        store.save_definition(&def).await.unwrap();
        // Identical re-registration is idempotent.
        store.save_definition(&def).await.unwrap();

        // Same id, different content: conflict.
        let mut changed = def.clone();
        changed.steps.get_mut("a").unwrap().max_retries = 7;
        let err = store.save_definition(&changed).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A new version is a new row.
        let mut v2 = def.clone();
        v2.version = 2;
        store.save_definition(&v2).await.unwrap();
        assert_eq!(store.list_definitions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_definition_roundtrip() {
        let store = test_store().await;
        let def = two_step_definition();
        store.save_definition(&def).await.unwrap();

        let loaded = store.get_definition("wf-v1").await.unwrap().unwrap();
        assert_eq!(loaded, def);
        assert!(store.get_definition("missing-v1").await.unwrap().is_none());
    }

    // -- Instances --

    #[tokio::test]
    async fn test_create_instance_enqueues_start_step() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let instance = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.input, json!({"x": 1}));

        let step = store.get_step(instance_id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.input, Some(json!({"x": 1})));
        assert_eq!(store.count_active_work(instance_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_instance_status_terminal_stamps_completed_at() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        store
            .update_instance_status(
                instance_id,
                InstanceStatus::Completed,
                None,
                Some(&json!({"done": true})),
            )
            .await
            .unwrap();

        let instance = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert!(instance.completed_at.is_some());
        assert_eq!(instance.output, Some(json!({"done": true})));

        let err = store
            .update_instance_status(9999, InstanceStatus::Failed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    // -- Queue --

    #[tokio::test]
    async fn test_dequeue_claims_exclusively() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let entry = store.dequeue_one("worker-1").await.unwrap().unwrap();
        assert_eq!(entry.instance_id, instance_id);
        assert_eq!(entry.step_name, "a");
        assert_eq!(entry.claimed_by.as_deref(), Some("worker-1"));

        // A second worker cannot receive the claimed entry.
        assert!(store.dequeue_one("worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_respects_available_at() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        // Push the start step into the future.
        let entry = store.dequeue_one("w").await.unwrap().unwrap();
        store
            .retry_step(entry.id, instance_id, "a", "later", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.dequeue_one("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_step_result_advances_queue() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let entry = store.dequeue_one("w").await.unwrap().unwrap();
        store
            .mark_step_running(instance_id, "a", "key-a")
            .await
            .unwrap()
            .unwrap();

        let applied = store
            .record_step_result(&StepOutcome {
                instance_id,
                step_name: "a".to_string(),
                queue_entry_id: entry.id,
                status: StepStatus::Completed,
                output: Some(json!({"ok": true})),
                error: None,
                successors: vec![Successor::Enqueue {
                    step_name: "b".to_string(),
                    input: json!({"ok": true}),
                    delay: Duration::ZERO,
                }],
            })
            .await
            .unwrap();
        assert!(applied);

        let a = store.get_step(instance_id, "a").await.unwrap().unwrap();
        assert_eq!(a.status, StepStatus::Completed);
        assert!(a.completed_at.is_some());

        // The successor is now the only queued work.
        let next = store.dequeue_one("w").await.unwrap().unwrap();
        assert_eq!(next.step_name, "b");
        let b = store.get_step(instance_id, "b").await.unwrap().unwrap();
        assert_eq!(b.input, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_record_step_result_guard_discards_stale_outcome() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let entry = store.dequeue_one("w").await.unwrap().unwrap();
        store
            .mark_step_running(instance_id, "a", "key-a")
            .await
            .unwrap()
            .unwrap();
        // A rollback skips the running step out from under the worker.
        store.mark_steps_skipped(instance_id).await.unwrap();

        let applied = store
            .record_step_result(&StepOutcome {
                instance_id,
                step_name: "a".to_string(),
                queue_entry_id: entry.id,
                status: StepStatus::Completed,
                output: Some(json!({"late": true})),
                error: None,
                successors: vec![Successor::Enqueue {
                    step_name: "b".to_string(),
                    input: json!({}),
                    delay: Duration::ZERO,
                }],
            })
            .await
            .unwrap();
        assert!(!applied);

        let a = store.get_step(instance_id, "a").await.unwrap().unwrap();
        assert_eq!(a.status, StepStatus::Skipped);
        // No successor was enqueued, and the entry is gone.
        assert_eq!(store.count_active_work(instance_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_step_rearms_entry_and_bumps_retry_count() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let entry = store.dequeue_one("w").await.unwrap().unwrap();
        store
            .mark_step_running(instance_id, "a", "key-a")
            .await
            .unwrap()
            .unwrap();
        store
            .retry_step(entry.id, instance_id, "a", "boom", Duration::ZERO)
            .await
            .unwrap();

        let step = store.get_step(instance_id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 1);
        assert_eq!(step.error.as_deref(), Some("boom"));

        let again = store.dequeue_one("w").await.unwrap().unwrap();
        assert_eq!(again.id, entry.id);
        assert_eq!(again.attempt_count, 1);
    }

    // -- Join arrivals --

    async fn record_arrival(
        store: &SqliteStore,
        instance_id: i64,
        entry_id: i64,
        branch: &str,
        strategy: JoinStrategy,
    ) -> bool {
        store
            .record_step_result(&StepOutcome {
                instance_id,
                step_name: branch.to_string(),
                queue_entry_id: entry_id,
                status: StepStatus::Completed,
                output: Some(json!({"from": branch})),
                error: None,
                successors: vec![Successor::JoinArrival {
                    join_step: "join".to_string(),
                    branch: branch.to_string(),
                    output: json!({"from": branch}),
                    expected: 2,
                    strategy,
                    delay: Duration::ZERO,
                }],
            })
            .await
            .unwrap()
    }

    async fn seed_two_branches(store: &SqliteStore, instance_id: i64) -> (i64, i64) {
        store
            .enqueue(&[
                EnqueueRequest {
                    instance_id,
                    step_name: "x".to_string(),
                    input: json!({}),
                    delay: Duration::ZERO,
                },
                EnqueueRequest {
                    instance_id,
                    step_name: "y".to_string(),
                    input: json!({}),
                    delay: Duration::ZERO,
                },
            ])
            .await
            .unwrap();
        let ex = store.dequeue_one("w").await.unwrap().unwrap();
        let ey = store.dequeue_one("w").await.unwrap().unwrap();
        store.mark_step_running(instance_id, &ex.step_name, "kx").await.unwrap();
        store.mark_step_running(instance_id, &ey.step_name, "ky").await.unwrap();
        if ex.step_name == "x" { (ex.id, ey.id) } else { (ey.id, ex.id) }
    }

    #[tokio::test]
    async fn test_join_all_fires_on_last_arrival() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;
        // Consume the start entry so only branch work remains.
        let start = store.dequeue_one("w").await.unwrap().unwrap();
        store.delete_queue_entry(start.id).await.unwrap();

        let (ex, ey) = seed_two_branches(&store, instance_id).await;

        record_arrival(&store, instance_id, ex, "x", JoinStrategy::All).await;
        let join = store.get_step(instance_id, "join").await.unwrap().unwrap();
        assert_eq!(join.join_arrivals, 1);
        // Not fired yet.
        assert!(store.dequeue_one("w").await.unwrap().is_none());

        record_arrival(&store, instance_id, ey, "y", JoinStrategy::All).await;
        let join = store.get_step(instance_id, "join").await.unwrap().unwrap();
        assert_eq!(join.join_arrivals, 2);
        assert_eq!(
            join.input,
            Some(json!({"x": {"from": "x"}, "y": {"from": "y"}}))
        );

        // Fired exactly once.
        let fired = store.dequeue_one("w").await.unwrap().unwrap();
        assert_eq!(fired.step_name, "join");
        assert!(store.dequeue_one("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_any_fires_on_first_arrival_only() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;
        let start = store.dequeue_one("w").await.unwrap().unwrap();
        store.delete_queue_entry(start.id).await.unwrap();

        let (ex, ey) = seed_two_branches(&store, instance_id).await;

        record_arrival(&store, instance_id, ex, "x", JoinStrategy::Any).await;
        let fired = store.dequeue_one("w").await.unwrap().unwrap();
        assert_eq!(fired.step_name, "join");

        // Second arrival merges but does not re-fire.
        record_arrival(&store, instance_id, ey, "y", JoinStrategy::Any).await;
        let join = store.get_step(instance_id, "join").await.unwrap().unwrap();
        assert_eq!(join.join_arrivals, 2);
    }

    // -- Rollback & cancellation --

    #[tokio::test]
    async fn test_begin_rollback_only_starts_once() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let started = store
            .begin_rollback(instance_id, RollbackKind::Failure, Some("step 'a' failed"), None)
            .await
            .unwrap();
        assert!(started);

        let again = store
            .begin_rollback(instance_id, RollbackKind::Cancel, Some("other"), None)
            .await
            .unwrap();
        assert!(!again);

        let instance = store.get_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.rollback_kind, Some(RollbackKind::Failure));
        // First trigger's error is kept.
        assert_eq!(instance.error.as_deref(), Some("step 'a' failed"));
    }

    #[tokio::test]
    async fn test_begin_rollback_processes_request_atomically() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let request_id = store
            .request_cancellation(instance_id, CancelKind::Cancel, "cli", Some("operator"))
            .await
            .unwrap();
        assert_eq!(store.pending_cancellations().await.unwrap().len(), 1);

        store
            .begin_rollback(instance_id, RollbackKind::Cancel, None, Some(request_id))
            .await
            .unwrap();
        assert!(store.pending_cancellations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_steps_skipped_and_rolled_back() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        let entry = store.dequeue_one("w").await.unwrap().unwrap();
        store
            .mark_step_running(instance_id, "a", "key-a")
            .await
            .unwrap()
            .unwrap();
        store
            .record_step_result(&StepOutcome {
                instance_id,
                step_name: "a".to_string(),
                queue_entry_id: entry.id,
                status: StepStatus::Completed,
                output: None,
                error: None,
                successors: vec![Successor::Enqueue {
                    step_name: "b".to_string(),
                    input: json!({}),
                    delay: Duration::ZERO,
                }],
            })
            .await
            .unwrap();

        // b pending -> skipped; a completed -> rolled back.
        assert_eq!(store.mark_steps_skipped(instance_id).await.unwrap(), 1);
        store.mark_step_rolled_back(instance_id, "a").await.unwrap();

        let a = store.get_step(instance_id, "a").await.unwrap().unwrap();
        assert_eq!(a.status, StepStatus::RolledBack);
        let b = store.get_step(instance_id, "b").await.unwrap().unwrap();
        assert_eq!(b.status, StepStatus::Skipped);

        // rolled_back marking is idempotent and leaves skipped alone.
        store.mark_step_rolled_back(instance_id, "b").await.unwrap();
        let b = store.get_step(instance_id, "b").await.unwrap().unwrap();
        assert_eq!(b.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_completed_steps_newest_first_order() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        for name in ["a", "b"] {
            let entry = if name == "a" {
                store.dequeue_one("w").await.unwrap().unwrap()
            } else {
                store
                    .enqueue(&[EnqueueRequest {
                        instance_id,
                        step_name: "b".to_string(),
                        input: json!({}),
                        delay: Duration::ZERO,
                    }])
                    .await
                    .unwrap();
                store.dequeue_one("w").await.unwrap().unwrap()
            };
            store
                .mark_step_running(instance_id, name, "key")
                .await
                .unwrap()
                .unwrap();
            store
                .record_step_result(&StepOutcome {
                    instance_id,
                    step_name: name.to_string(),
                    queue_entry_id: entry.id,
                    status: StepStatus::Completed,
                    output: None,
                    error: None,
                    successors: vec![],
                })
                .await
                .unwrap();
        }

        let completed = store
            .completed_steps_newest_first(instance_id)
            .await
            .unwrap();
        let names: Vec<&str> = completed.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    // -- Recovery & maintenance --

    #[tokio::test]
    async fn test_recover_orphaned_releases_stale_claims() {
        let store = test_store().await;
        let instance_id = seed_instance(&store).await;

        store.dequeue_one("dead-worker").await.unwrap().unwrap();
        store
            .mark_step_running(instance_id, "a", "key-a")
            .await
            .unwrap()
            .unwrap();

        // A generous timeout recovers nothing.
        assert_eq!(
            store.recover_orphaned(Duration::from_secs(3600)).await.unwrap(),
            0
        );

        // A zero timeout treats the claim as orphaned.
        let recovered = store.recover_orphaned(Duration::ZERO).await.unwrap();
        assert_eq!(recovered, 1);

        let step = store.get_step(instance_id, "a").await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        let entry = store.dequeue_one("live-worker").await.unwrap().unwrap();
        assert_eq!(entry.step_name, "a");
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal_instances() {
        let store = test_store().await;
        let done = seed_instance(&store).await;
        let active = {
            let def = two_step_definition();
            store
                .create_instance(&def.id(), &json!({}), "a")
                .await
                .unwrap()
        };

        store
            .update_instance_status(done, InstanceStatus::Completed, None, None)
            .await
            .unwrap();

        // Nothing old enough yet.
        assert_eq!(
            store
                .cleanup_old_workflows(Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );

        // Zero retention removes the terminal instance, keeps the active one.
        assert_eq!(
            store.cleanup_old_workflows(Duration::ZERO).await.unwrap(),
            1
        );
        assert!(store.get_instance(done).await.unwrap().is_none());
        assert!(store.get_instance(active).await.unwrap().is_some());
        // Dependent rows went with it.
        assert_eq!(store.count_active_work(done).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_summary_stats_counts() {
        let store = test_store().await;
        let first = seed_instance(&store).await;
        let def = two_step_definition();
        store.create_instance(&def.id(), &json!({}), "a").await.unwrap();

        store
            .update_instance_status(first, InstanceStatus::Completed, None, None)
            .await
            .unwrap();
        store
            .request_cancellation(first, CancelKind::Abort, "cli", None)
            .await
            .unwrap();

        let stats = store.summary_stats().await.unwrap();
        assert_eq!(stats.total_instances, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.unprocessed_cancellations, 1);
    }
}
