//! Fluent builder for workflow definitions.
//!
//! ```
//! use sagaflow_core::builder::{Builder, branch};
//! use sagaflow_types::workflow::JoinStrategy;
//!
//! let def = Builder::new("order", 1)
//!     .step("reserve", "reserve-handler")
//!     .on_failure("release", "release-handler")
//!     .savepoint("reserved")
//!     .fork("notify", vec![
//!         branch(|b| b.step("email", "email-handler")),
//!         branch(|b| b.step("sms", "sms-handler")),
//!     ])
//!     .join("notified", JoinStrategy::All)
//!     .then("archive", "archive-handler")
//!     .build()
//!     .unwrap();
//! assert_eq!(def.start, "reserve");
//! ```
//!
//! Errors are deferred: each call is a no-op once an error has been
//! recorded, and `build()` reports the first one along with full definition
//! validation.

use std::collections::HashMap;

use sagaflow_types::workflow::{
    JoinStrategy, RetryStrategy, StepDefinition, StepType, WorkflowDefinition,
};

use crate::definition::{WorkflowError, validate_definition};

/// A closure describing one fork branch.
pub type BranchFn = Box<dyn FnOnce(Builder) -> Builder>;

/// Wrap a branch closure for [`Builder::fork`] / [`Builder::condition`].
pub fn branch(f: impl FnOnce(Builder) -> Builder + 'static) -> BranchFn {
    Box::new(f)
}

struct PendingJoin {
    fork: String,
    branch_tails: Vec<String>,
}

/// Fluent workflow definition builder.
pub struct Builder {
    name: String,
    version: i32,
    steps: HashMap<String, StepDefinition>,
    start: Option<String>,
    tail: Option<String>,
    last_task: Option<String>,
    pending_join: Option<PendingJoin>,
    error: Option<WorkflowError>,
}

impl Builder {
    pub fn new(name: impl Into<String>, version: i32) -> Self {
        Self {
            name: name.into(),
            version,
            steps: HashMap::new(),
            start: None,
            tail: None,
            last_task: None,
            pending_join: None,
            error: None,
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Append a task step to the current chain.
    pub fn step(mut self, name: impl Into<String>, handler: impl Into<String>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let step = StepDefinition::task(name, handler);
        let name = step.name.clone();
        self.push_step(step);
        self.last_task = Some(name);
        self
    }

    /// Alias of [`Builder::step`]; reads better after a join or condition.
    pub fn then(self, name: impl Into<String>, handler: impl Into<String>) -> Self {
        self.step(name, handler)
    }

    /// Append a savepoint: rollback does not cross it.
    pub fn savepoint(mut self, name: impl Into<String>) -> Self {
        if self.error.is_some() {
            return self;
        }
        self.push_step(StepDefinition::structural(name, StepType::Savepoint));
        self.last_task = None;
        self
    }

    /// Attach a compensation step to the most recent task. The compensation
    /// is not part of the forward flow; it runs only during rollback.
    pub fn on_failure(
        mut self,
        compensation: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(owner) = self.last_task.clone() else {
            self.error = Some(WorkflowError::Invalid(
                "on_failure requires a preceding task step".to_string(),
            ));
            return self;
        };

        let mut comp = StepDefinition::task(compensation, handler);
        comp.compensation_for = Some(owner.clone());
        let comp_name = comp.name.clone();
        if self.steps.contains_key(&comp_name) {
            self.error = Some(WorkflowError::DuplicateStep(comp_name));
            return self;
        }
        self.steps.insert(comp_name.clone(), comp);
        if let Some(step) = self.steps.get_mut(&owner) {
            step.on_failure = Some(comp_name);
        }
        self
    }

    // -----------------------------------------------------------------------
    // Fork / join / parallel
    // -----------------------------------------------------------------------

    /// Fan out into parallel branches. Must be closed by
    /// [`Builder::join`].
    pub fn fork(mut self, name: impl Into<String>, branches: Vec<BranchFn>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let fork_name: String = name.into();
        if branches.is_empty() {
            self.error = Some(WorkflowError::Invalid(format!(
                "fork '{fork_name}' has no branches"
            )));
            return self;
        }
        if self.pending_join.is_some() {
            self.error = Some(WorkflowError::UnjoinedFork(fork_name));
            return self;
        }

        self.push_step(StepDefinition::structural(
            fork_name.clone(),
            StepType::Fork,
        ));
        if self.error.is_some() {
            return self;
        }

        let mut branch_tails = Vec::with_capacity(branches.len());
        for build_branch in branches {
            let sub = build_branch(Builder::new(self.name.clone(), self.version));
            if let Some(err) = sub.error {
                self.error = Some(err);
                return self;
            }
            if let Some(pending) = sub.pending_join {
                self.error = Some(WorkflowError::UnjoinedFork(pending.fork));
                return self;
            }
            let (Some(head), Some(tail)) = (sub.start, sub.tail) else {
                self.error = Some(WorkflowError::Invalid(format!(
                    "fork '{fork_name}' has an empty branch"
                )));
                return self;
            };

            for (step_name, step) in sub.steps {
                if self.steps.contains_key(&step_name) {
                    self.error = Some(WorkflowError::DuplicateStep(step_name));
                    return self;
                }
                self.steps.insert(step_name, step);
            }
            if let Some(head_step) = self.steps.get_mut(&head) {
                head_step.prev = Some(fork_name.clone());
            }
            if let Some(fork_step) = self.steps.get_mut(&fork_name) {
                fork_step.next.push(head.clone());
            }
            branch_tails.push(tail);
        }

        self.pending_join = Some(PendingJoin {
            fork: fork_name,
            branch_tails,
        });
        self.last_task = None;
        self
    }

    /// Close the current fork: the join fires per `strategy` and the chain
    /// continues after it.
    pub fn join(mut self, name: impl Into<String>, strategy: JoinStrategy) -> Self {
        if self.error.is_some() {
            return self;
        }
        let join_name: String = name.into();
        let Some(pending) = self.pending_join.take() else {
            self.error = Some(WorkflowError::Invalid(format!(
                "join '{join_name}' has no preceding fork"
            )));
            return self;
        };
        if self.steps.contains_key(&join_name) {
            self.error = Some(WorkflowError::DuplicateStep(join_name));
            return self;
        }

        let mut join = StepDefinition::structural(join_name.clone(), StepType::Join);
        join.prev = Some(pending.fork);
        join.wait_for = pending.branch_tails.clone();
        join.join_strategy = Some(strategy);
        self.steps.insert(join_name.clone(), join);

        for tail in &pending.branch_tails {
            if let Some(step) = self.steps.get_mut(tail) {
                step.next.push(join_name.clone());
            }
        }
        self.tail = Some(join_name);
        self.last_task = None;
        self
    }

    /// Fork into single-task branches and auto-join them with strategy
    /// `all`. The join is named `"{name}_join"`.
    pub fn parallel(self, name: impl Into<String>, tasks: Vec<StepDefinition>) -> Self {
        let fork_name: String = name.into();
        let join_name = format!("{fork_name}_join");
        let branches = tasks
            .into_iter()
            .map(|task| {
                branch(move |mut b: Builder| {
                    if b.error.is_none() {
                        let task_name = task.name.clone();
                        b.push_step(task);
                        b.last_task = Some(task_name);
                    }
                    b
                })
            })
            .collect();
        self.fork(fork_name, branches).join(join_name, JoinStrategy::All)
    }

    // -----------------------------------------------------------------------
    // Condition
    // -----------------------------------------------------------------------

    /// Append a condition step. The next chained step is the true branch;
    /// `else_branch` (when given) builds the false branch.
    pub fn condition(
        mut self,
        name: impl Into<String>,
        expr: impl Into<String>,
        else_branch: Option<BranchFn>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let cond_name: String = name.into();
        let mut cond = StepDefinition::structural(cond_name.clone(), StepType::Condition);
        cond.condition = Some(expr.into());
        self.push_step(cond);
        self.last_task = None;
        if self.error.is_some() {
            return self;
        }

        if let Some(build_else) = else_branch {
            let sub = build_else(Builder::new(self.name.clone(), self.version));
            if let Some(err) = sub.error {
                self.error = Some(err);
                return self;
            }
            let Some(head) = sub.start else {
                self.error = Some(WorkflowError::Invalid(format!(
                    "condition '{cond_name}' has an empty else branch"
                )));
                return self;
            };
            for (step_name, step) in sub.steps {
                if self.steps.contains_key(&step_name) {
                    self.error = Some(WorkflowError::DuplicateStep(step_name));
                    return self;
                }
                self.steps.insert(step_name, step);
            }
            if let Some(head_step) = self.steps.get_mut(&head) {
                head_step.prev = Some(cond_name.clone());
            }
            if let Some(cond_step) = self.steps.get_mut(&cond_name) {
                cond_step.else_next = Some(head);
            }
        }
        self
    }

    // -----------------------------------------------------------------------
    // Step options (apply to the most recent task)
    // -----------------------------------------------------------------------

    pub fn max_retries(self, retries: u32) -> Self {
        self.with_last_task(|step| step.max_retries = retries)
    }

    pub fn retry_strategy(self, strategy: RetryStrategy) -> Self {
        self.with_last_task(|step| step.retry_strategy = strategy)
    }

    pub fn retry_delay_ms(self, delay_ms: u64) -> Self {
        self.with_last_task(|step| step.retry_delay_ms = delay_ms)
    }

    pub fn delay_ms(self, delay_ms: u64) -> Self {
        self.with_last_task(|step| step.delay_ms = delay_ms)
    }

    pub fn timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_last_task(|step| step.timeout_ms = Some(timeout_ms))
    }

    pub fn no_idempotent(self) -> Self {
        self.with_last_task(|step| step.no_idempotent = true)
    }

    pub fn metadata(self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let key = key.into();
        self.with_last_task(move |step| {
            step.metadata.insert(key, value);
        })
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Finish and validate the definition.
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if let Some(pending) = self.pending_join {
            return Err(WorkflowError::UnjoinedFork(pending.fork));
        }
        let start = self.start.ok_or(WorkflowError::Empty)?;

        let def = WorkflowDefinition {
            name: self.name,
            version: self.version,
            start,
            steps: self.steps,
        };
        validate_definition(&def)?;
        Ok(def)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Chain a step after the current tail, making it the start when the
    /// builder is empty.
    fn push_step(&mut self, mut step: StepDefinition) {
        if self.steps.contains_key(&step.name) {
            self.error = Some(WorkflowError::DuplicateStep(step.name.clone()));
            return;
        }
        match &self.tail {
            None => self.start = Some(step.name.clone()),
            Some(tail) => {
                step.prev = Some(tail.clone());
                if let Some(tail_step) = self.steps.get_mut(tail) {
                    tail_step.next.push(step.name.clone());
                }
            }
        }
        self.tail = Some(step.name.clone());
        self.steps.insert(step.name.clone(), step);
    }

    fn with_last_task(mut self, apply: impl FnOnce(&mut StepDefinition)) -> Self {
        if self.error.is_some() {
            return self;
        }
        let target = self
            .last_task
            .clone()
            .and_then(|name| self.steps.get_mut(&name));
        match target {
            Some(step) => apply(step),
            None => {
                self.error = Some(WorkflowError::Invalid(
                    "step option requires a preceding task step".to_string(),
                ));
            }
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
