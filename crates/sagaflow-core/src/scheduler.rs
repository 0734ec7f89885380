//! Scheduler: compute what runs after a successfully completed step.
//!
//! Successor planning is pure -- the store applies the plan atomically with
//! the step result. The rules:
//!
//! 1. task / savepoint: enqueue each `next` with its configured delay
//! 2. fork: enqueue every branch head
//! 3. join: enqueue the join's successor (the join fired as its own step)
//! 4. condition: evaluate the expression against the step's input; true
//!    takes `next[0]`, false takes the else branch
//! 5. a successor that is itself a join becomes a join arrival instead of a
//!    plain enqueue; the store's arrival counter makes the join fire exactly
//!    once regardless of concurrent arrivals
//!
//! A step with no successors ends its path; the instance completes once no
//! active work remains.

use std::time::Duration;

use sagaflow_types::workflow::{
    InstanceStatus, JoinStrategy, StepDefinition, StepType, WorkflowDefinition,
};
use serde_json::Value;

use crate::engine::{Engine, EngineError};
use crate::expression;
use crate::store::{Successor, WorkflowStore};

/// Plan the follow-up work for a completed step.
pub(crate) fn successors(
    def: &WorkflowDefinition,
    step: &StepDefinition,
    output: &Value,
) -> Result<Vec<Successor>, EngineError> {
    let targets: Vec<&str> = match step.step_type {
        StepType::Condition => {
            let expr = step.condition.as_deref().ok_or_else(|| {
                EngineError::Invariant(format!("condition step '{}' has no expression", step.name))
            })?;
            if expression::evaluate(expr, output)? {
                step.next.first().map(String::as_str).into_iter().collect()
            } else {
                step.else_next.as_deref().into_iter().collect()
            }
        }
        _ => step.next.iter().map(String::as_str).collect(),
    };

    let mut plan = Vec::with_capacity(targets.len());
    for target in targets {
        let successor = def.step(target).ok_or_else(|| {
            EngineError::Invariant(format!(
                "step '{}' references unknown successor '{target}'",
                step.name
            ))
        })?;
        let delay = Duration::from_millis(successor.delay_ms);
        if successor.step_type == StepType::Join {
            plan.push(Successor::JoinArrival {
                join_step: successor.name.clone(),
                branch: step.name.clone(),
                output: output.clone(),
                expected: successor.wait_for.len() as u32,
                strategy: successor.join_strategy.unwrap_or(JoinStrategy::All),
                delay,
            });
        } else {
            plan.push(Successor::Enqueue {
                step_name: successor.name.clone(),
                input: output.clone(),
                delay,
            });
        }
    }
    Ok(plan)
}

impl<S: WorkflowStore> Engine<S> {
    /// Complete the instance when its last path has finished: no active work
    /// left, not rolling back, not already terminal. The output of the final
    /// completing step becomes the instance output.
    pub(crate) async fn maybe_complete_instance(
        &self,
        instance_id: i64,
        output: &Value,
    ) -> Result<(), EngineError> {
        if self.store.count_active_work(instance_id).await? > 0 {
            return Ok(());
        }
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            return Ok(());
        };
        if instance.status.is_terminal() || instance.rollback_kind.is_some() {
            return Ok(());
        }

        self.store
            .update_instance_status(instance_id, InstanceStatus::Completed, None, Some(output))
            .await?;
        self.forget_instance(instance_id);
        tracing::info!(instance_id, "workflow instance completed");
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

    fn def_with(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        let start = steps[0].name.clone();
        WorkflowDefinition {
            name: "test".to_string(),
            version: 1,
            start,
            steps: steps.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    #[test]
    fn test_task_successors_enqueue_next() {
        let mut a = StepDefinition::task("a", "h");
        a.next = vec!["b".to_string()];
        let mut b = StepDefinition::task("b", "h");
        b.prev = Some("a".to_string());
        b.delay_ms = 500;
        let def = def_with(vec![a, b]);

        let plan = successors(&def, def.step("a").unwrap(), &json!({"x": 1})).unwrap();
        assert_eq!(plan.len(), 1);
        match &plan[0] {
            Successor::Enqueue {
                step_name,
                input,
                delay,
            } => {
                assert_eq!(step_name, "b");
                assert_eq!(input, &json!({"x": 1}));
                assert_eq!(*delay, Duration::from_millis(500));
            }
            other => panic!("expected enqueue, got {other:?}"),
        }
    }

    #[test]
    fn test_fork_successors_enqueue_all_branches() {
        let mut fork = StepDefinition::structural("fork", StepType::Fork);
        fork.next = vec!["x".to_string(), "y".to_string()];
        let x = StepDefinition::task("x", "h");
        let y = StepDefinition::task("y", "h");
        let def = def_with(vec![fork, x, y]);

        let plan = successors(&def, def.step("fork").unwrap(), &json!({})).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_join_successor_becomes_arrival() {
        let mut x = StepDefinition::task("x", "h");
        x.next = vec!["join".to_string()];
        let mut join = StepDefinition::structural("join", StepType::Join);
        join.wait_for = vec!["x".to_string(), "y".to_string()];
        join.join_strategy = Some(JoinStrategy::All);
        let y = StepDefinition::task("y", "h");
        let def = def_with(vec![x, join, y]);

        let plan = successors(&def, def.step("x").unwrap(), &json!({"from": "x"})).unwrap();
        match &plan[0] {
            Successor::JoinArrival {
                join_step,
                branch,
                expected,
                strategy,
                ..
            } => {
                assert_eq!(join_step, "join");
                assert_eq!(branch, "x");
                assert_eq!(*expected, 2);
                assert_eq!(*strategy, JoinStrategy::All);
            }
            other => panic!("expected join arrival, got {other:?}"),
        }
    }

    #[test]
    fn test_condition_picks_true_branch() {
        let mut cond = StepDefinition::structural("check", StepType::Condition);
        cond.condition = Some("input.total > 10".to_string());
        cond.next = vec!["big".to_string()];
        cond.else_next = Some("small".to_string());
        let big = StepDefinition::task("big", "h");
        let small = StepDefinition::task("small", "h");
        let def = def_with(vec![cond, big, small]);

        let plan = successors(&def, def.step("check").unwrap(), &json!({"total": 50})).unwrap();
        assert!(matches!(
            &plan[0],
            Successor::Enqueue { step_name, .. } if step_name == "big"
        ));

        let plan = successors(&def, def.step("check").unwrap(), &json!({"total": 5})).unwrap();
        assert!(matches!(
            &plan[0],
            Successor::Enqueue { step_name, .. } if step_name == "small"
        ));
    }

    #[test]
    fn test_condition_false_without_else_ends_path() {
        let mut cond = StepDefinition::structural("check", StepType::Condition);
        cond.condition = Some("input.go == true".to_string());
        cond.next = vec!["onward".to_string()];
        let onward = StepDefinition::task("onward", "h");
        let def = def_with(vec![cond, onward]);

        let plan = successors(&def, def.step("check").unwrap(), &json!({"go": false})).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_savepoint_passes_through_to_next() {
        let mut save = StepDefinition::structural("save", StepType::Savepoint);
        save.next = vec!["after".to_string()];
        let after = StepDefinition::task("after", "h");
        let def = def_with(vec![save, after]);

        let plan = successors(&def, def.step("save").unwrap(), &json!({"kept": true})).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(matches!(
            &plan[0],
            Successor::Enqueue { step_name, input, .. }
                if step_name == "after" && input == &json!({"kept": true})
        ));
    }

    #[test]
    fn test_no_successors_for_terminal_step() {
        let a = StepDefinition::task("a", "h");
        let def = def_with(vec![a]);
        let plan = successors(&def, def.step("a").unwrap(), &json!({})).unwrap();
        assert!(plan.is_empty());
    }
}
