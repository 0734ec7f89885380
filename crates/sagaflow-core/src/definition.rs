//! Workflow definition validation.
//!
//! Definitions arrive from the builder DSL, YAML documents, or the store.
//! Whatever the source, [`validate_definition`] enforces the structural
//! invariants the engine relies on:
//!
//! - every `next` / `else` / `on_failure` / `wait_for` / `prev` reference
//!   resolves inside the definition
//! - the forward graph (`next` + `else`) is acyclic
//! - every forward step other than the start has a predecessor
//! - compensation steps are not reachable from the forward flow
//! - task steps name a handler; joins await at least one step; condition
//!   expressions parse

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use sagaflow_types::workflow::{StepDefinition, StepType, WorkflowDefinition};

use crate::expression;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised when a workflow definition violates a structural invariant.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow has no steps")]
    Empty,

    #[error("duplicate step '{0}'")]
    DuplicateStep(String),

    #[error("start step '{0}' not found")]
    UnknownStart(String),

    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownReference { step: String, reference: String },

    #[error("step '{0}' has no predecessor")]
    MissingPrev(String),

    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("compensation step '{0}' is reachable from the forward flow")]
    ReachableCompensation(String),

    #[error("task step '{0}' has no handler")]
    MissingHandler(String),

    #[error("join step '{0}' awaits no steps")]
    EmptyJoin(String),

    #[error("condition step '{step}': {message}")]
    InvalidCondition { step: String, message: String },

    #[error("fork '{0}' has no matching join")]
    UnjoinedFork(String),

    #[error("invalid definition: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow definition against the engine's structural invariants.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.steps.is_empty() {
        return Err(WorkflowError::Empty);
    }
    if !def.steps.contains_key(&def.start) {
        return Err(WorkflowError::UnknownStart(def.start.clone()));
    }

    for step in def.steps.values() {
        check_references(def, step)?;
        check_shape(def, step)?;
    }

    check_forward_acyclic(def)?;

    let reachable = forward_reachable(def);
    for name in &reachable {
        let step = &def.steps[name.as_str()];
        if step.is_compensation() {
            return Err(WorkflowError::ReachableCompensation(name.clone()));
        }
        if *name != def.start && step.prev.is_none() {
            return Err(WorkflowError::MissingPrev(name.clone()));
        }
    }

    Ok(())
}

/// All references inside one step must resolve within the definition.
fn check_references(def: &WorkflowDefinition, step: &StepDefinition) -> Result<(), WorkflowError> {
    let mut refs: Vec<&str> = step.next.iter().map(String::as_str).collect();
    refs.extend(step.wait_for.iter().map(String::as_str));
    refs.extend(step.else_next.as_deref());
    refs.extend(step.on_failure.as_deref());
    refs.extend(step.prev.as_deref());
    refs.extend(step.compensation_for.as_deref());

    for reference in refs {
        if !def.steps.contains_key(reference) {
            return Err(WorkflowError::UnknownReference {
                step: step.name.clone(),
                reference: reference.to_string(),
            });
        }
    }
    Ok(())
}

/// Per-type shape checks.
fn check_shape(def: &WorkflowDefinition, step: &StepDefinition) -> Result<(), WorkflowError> {
    match step.step_type {
        StepType::Task => {
            if step.handler.as_deref().unwrap_or("").is_empty() {
                return Err(WorkflowError::MissingHandler(step.name.clone()));
            }
        }
        StepType::Join => {
            if step.wait_for.is_empty() {
                return Err(WorkflowError::EmptyJoin(step.name.clone()));
            }
        }
        StepType::Condition => {
            let expr = step.condition.as_deref().unwrap_or("");
            expression::parse(expr).map_err(|e| WorkflowError::InvalidCondition {
                step: step.name.clone(),
                message: e.to_string(),
            })?;
        }
        StepType::Fork | StepType::Savepoint => {}
    }

    // on_failure must point at the compensation declared for this step.
    if let Some(comp_name) = &step.on_failure {
        let comp = &def.steps[comp_name.as_str()];
        if comp.compensation_for.as_deref() != Some(step.name.as_str()) {
            return Err(WorkflowError::Invalid(format!(
                "step '{}' names compensation '{}' which does not reference it back",
                step.name, comp_name
            )));
        }
    }
    Ok(())
}

/// Detect cycles in the forward graph (`next` + `else_next` edges).
fn check_forward_acyclic(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    for name in def.steps.keys() {
        indices.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for step in def.steps.values() {
        let from = indices[step.name.as_str()];
        for succ in forward_edges(step) {
            if let Some(&to) = indices.get(succ) {
                graph.add_edge(from, to, ());
            }
        }
    }

    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| WorkflowError::CycleDetected(graph[cycle.node_id()].to_string()))
}

/// Forward successors of a step: `next` plus the condition's else branch.
pub(crate) fn forward_edges(step: &StepDefinition) -> impl Iterator<Item = &str> {
    step.next
        .iter()
        .map(String::as_str)
        .chain(step.else_next.as_deref())
}

/// Set of step names reachable from the start via forward edges.
pub(crate) fn forward_reachable(def: &WorkflowDefinition) -> HashSet<String> {
    let mut visited = HashSet::new();
    let mut stack = vec![def.start.as_str()];
    while let Some(name) = stack.pop() {
        if !visited.insert(name.to_string()) {
            continue;
        }
        if let Some(step) = def.step(name) {
            stack.extend(forward_edges(step));
        }
    }
    visited
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
