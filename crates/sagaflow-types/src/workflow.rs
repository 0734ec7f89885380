//! Workflow domain types.
//!
//! `WorkflowDefinition` is the canonical representation of a workflow: an
//! immutable, versioned directed graph of steps keyed by step name. YAML
//! documents and the builder DSL both produce this shape, and it is what the
//! store persists as the definition blob. Execution tracking types
//! (`WorkflowInstance`, `WorkflowStep`) record the durable state of a single
//! run.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An immutable, versioned workflow definition.
///
/// Identified by `(name, version)`; the derived [`WorkflowDefinition::id`]
/// (`"{name}-v{version}"`) is what instances reference. Steps form a directed
/// acyclic graph in the forward direction; compensation steps hang off the
/// graph via `on_failure` and are never reachable from the forward flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: i32,
    /// Name of the entry step.
    pub start: String,
    /// Step name -> step descriptor.
    pub steps: HashMap<String, StepDefinition>,
}

impl WorkflowDefinition {
    /// The stable identifier instances reference: `"{name}-v{version}"`.
    pub fn id(&self) -> String {
        format!("{}-v{}", self.name, self.version)
    }

    /// Look up a step descriptor by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.get(name)
    }
}

/// A single node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Handler name; required for task steps, absent for structural steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Forward successors. For a fork these are the branch heads; for a
    /// condition this is the true branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<String>,
    /// Immediate predecessor, used for branch identification and the
    /// savepoint walk. Absent only on the start step and compensations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    /// Name of the compensation step executed if this step must be undone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    /// For joins: names of the branch-final steps whose completion is awaited.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_strategy: Option<JoinStrategy>,
    /// Condition expression (condition steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// First step of the else branch (condition steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub else_next: Option<String>,
    /// For compensation steps: the forward step this one undoes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_for: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Schedule offset applied when this step is enqueued.
    #[serde(default)]
    pub delay_ms: u64,
    /// Handler invocation timeout; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// When set, a fresh idempotency key is generated per attempt instead of
    /// being reused across retries.
    #[serde(default)]
    pub no_idempotent: bool,
    /// Opaque key/value metadata passed to the handler (cloned per call).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl StepDefinition {
    /// A bare task step with the given handler; other fields take defaults.
    pub fn task(name: impl Into<String>, handler: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            name,
            step_type: StepType::Task,
            handler: Some(handler.into()),
            next: Vec::new(),
            prev: None,
            on_failure: None,
            wait_for: Vec::new(),
            join_strategy: None,
            condition: None,
            else_next: None,
            compensation_for: None,
            max_retries: 0,
            retry_strategy: RetryStrategy::Fixed,
            retry_delay_ms: default_retry_delay_ms(),
            delay_ms: 0,
            timeout_ms: None,
            no_idempotent: false,
            metadata: HashMap::new(),
        }
    }

    /// A structural step (fork, join, condition, savepoint) with no handler.
    pub fn structural(name: impl Into<String>, step_type: StepType) -> Self {
        let mut step = Self::task(name, "");
        step.handler = None;
        step.step_type = step_type;
        step
    }

    /// Whether this step is a compensation attached via `on_failure`.
    pub fn is_compensation(&self) -> bool {
        self.compensation_for.is_some()
    }
}

/// The kind of step in a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Fork,
    Join,
    Condition,
    Savepoint,
}

/// Rule deciding when a join fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Fire when every awaited branch has completed.
    All,
    /// Fire on the first completed branch.
    Any,
}

/// Backoff strategy for re-enqueueing a failed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Status of a workflow instance. Terminal states are `Completed`, `Failed`,
/// `Cancelled`, and `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Aborted,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

/// Status of a per-instance step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// Why a rollback was started. Persisted on the instance row so the terminal
/// status can be finalized after the last compensation, across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackKind {
    Failure,
    Cancel,
    Abort,
}

impl RollbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Cancel => "cancel",
            Self::Abort => "abort",
        }
    }

    /// The terminal instance status this rollback finalizes to.
    pub fn terminal_status(self) -> InstanceStatus {
        match self {
            Self::Failure => InstanceStatus::Failed,
            Self::Cancel => InstanceStatus::Cancelled,
            Self::Abort => InstanceStatus::Aborted,
        }
    }
}

impl FromStr for RollbackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failure" => Ok(Self::Failure),
            "cancel" => Ok(Self::Cancel),
            "abort" => Ok(Self::Abort),
            other => Err(format!("invalid rollback kind: '{other}'")),
        }
    }
}

/// A single durable execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    /// References `WorkflowDefinition::id`.
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub input: serde_json::Value,
    /// Set on completion: the output of the final step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_kind: Option<RollbackKind>,
    /// Reporting hint: the most recently started step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Per-instance step record, created lazily the first time a step is
/// enqueued for that instance. Keyed by `(instance_id, step_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub instance_id: i64,
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of retries performed (0 on the first attempt).
    pub retry_count: u32,
    /// Join steps only: how many awaited branches have arrived.
    pub join_arrivals: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Operational aggregates
// ---------------------------------------------------------------------------

/// Aggregate engine statistics for the control surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total_instances: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub aborted: u64,
    pub queue_depth: u64,
    pub unprocessed_cancellations: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> WorkflowDefinition {
        let mut reserve = StepDefinition::task("reserve", "reserve-handler");
        reserve.next = vec!["charge".to_string()];
        reserve.on_failure = Some("release".to_string());
        reserve.max_retries = 3;
        reserve.retry_strategy = RetryStrategy::Exponential;

        let mut charge = StepDefinition::task("charge", "charge-handler");
        charge.prev = Some("reserve".to_string());
        charge.timeout_ms = Some(30_000);
        charge.metadata.insert("team".to_string(), json!("billing"));

        let mut release = StepDefinition::task("release", "release-handler");
        release.compensation_for = Some("reserve".to_string());

        WorkflowDefinition {
            name: "order".to_string(),
            version: 2,
            start: "reserve".to_string(),
            steps: HashMap::from([
                ("reserve".to_string(), reserve),
                ("charge".to_string(), charge),
                ("release".to_string(), release),
            ]),
        }
    }

    #[test]
    fn test_definition_id_format() {
        let def = sample_definition();
        assert_eq!(def.id(), "order-v2");
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let def = sample_definition();
        let blob = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed, def);
        assert!(parsed.step("release").unwrap().is_compensation());
    }

    #[test]
    fn test_step_definition_defaults() {
        let parsed: StepDefinition = serde_json::from_str(
            r#"{"name": "a", "type": "task", "handler": "h"}"#,
        )
        .unwrap();
        assert_eq!(parsed.max_retries, 0);
        assert_eq!(parsed.retry_strategy, RetryStrategy::Fixed);
        assert_eq!(parsed.retry_delay_ms, 1_000);
        assert!(!parsed.no_idempotent);
        assert!(parsed.next.is_empty());
    }

    #[test]
    fn test_step_type_serde_names() {
        assert_eq!(
            serde_json::to_string(&StepType::Savepoint).unwrap(),
            "\"savepoint\""
        );
        assert_eq!(serde_json::to_string(&StepType::Fork).unwrap(), "\"fork\"");
    }

    #[test]
    fn test_instance_status_terminal() {
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
        for s in [
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
            InstanceStatus::Aborted,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::RolledBack,
            StepStatus::Skipped,
        ] {
            assert_eq!(s.as_str().parse::<StepStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<StepStatus>().is_err());
    }

    #[test]
    fn test_rollback_kind_terminal_status() {
        assert_eq!(
            RollbackKind::Failure.terminal_status(),
            InstanceStatus::Failed
        );
        assert_eq!(
            RollbackKind::Cancel.terminal_status(),
            InstanceStatus::Cancelled
        );
        assert_eq!(
            RollbackKind::Abort.terminal_status(),
            InstanceStatus::Aborted
        );
    }
}
