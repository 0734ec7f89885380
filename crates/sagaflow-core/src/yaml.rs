//! YAML workflow documents.
//!
//! A document declares handlers (name + exec command for the shell
//! transport) and one or more flows. Flow steps come in four shapes:
//!
//! ```yaml
//! handlers:
//!   - name: reserve_stock
//!     exec: ./scripts/reserve.sh
//!
//! flows:
//!   - name: order
//!     steps:
//!       - reserve_stock                 # shorthand: name == handler
//!       - name: charge
//!         handler: charge_card
//!         on_failure: refund
//!         max_retries: 3
//!         retry_strategy: exponential
//!       - type: savepoint
//!         name: charged
//!       - type: parallel
//!         name: notify
//!         tasks:
//!           - name: email
//!           - name: sms
//!       - type: condition
//!         name: check_total
//!         expr: "input.total > 100"
//!         else:
//!           - name: flag_review
//! ```
//!
//! Parsing produces `WorkflowDefinition`s (built through the same builder
//! DSL, so all validation applies) plus a handler-name -> exec-command
//! table for the process front-end.

use std::collections::HashMap;

use sagaflow_types::workflow::{RetryStrategy, StepDefinition, WorkflowDefinition};
use serde::Deserialize;

use crate::builder::{Builder, branch};
use crate::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading a YAML workflow document.
#[derive(Debug, thiserror::Error)]
pub enum YamlError {
    #[error("yaml parse error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("handlers[{index}]: {message}")]
    InvalidHandler { index: usize, message: String },

    #[error("flow '{flow}': {message}")]
    InvalidFlow { flow: String, message: String },

    #[error("flow '{flow}': {source}")]
    Definition {
        flow: String,
        source: WorkflowError,
    },
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct YamlDocument {
    #[serde(default)]
    handlers: Vec<YamlHandler>,
    #[serde(default)]
    flows: Vec<YamlFlow>,
}

#[derive(Debug, Deserialize)]
struct YamlHandler {
    #[serde(default)]
    name: String,
    #[serde(default)]
    exec: String,
}

#[derive(Debug, Deserialize)]
struct YamlFlow {
    #[serde(default)]
    name: String,
    #[serde(default)]
    steps: Vec<YamlStepNode>,
}

/// A step entry: either the scalar shorthand (`- reserve_stock`, where the
/// name doubles as the handler) or a full mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YamlStepNode {
    Shorthand(String),
    Full(YamlStep),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct YamlStep {
    /// `task` (default), `parallel`, `condition`, or `savepoint`.
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    name: String,

    // task fields
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    on_failure: Option<String>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_strategy: Option<String>,
    /// Milliseconds.
    #[serde(default)]
    retry_delay: Option<u64>,
    /// Milliseconds.
    #[serde(default)]
    delay: Option<u64>,
    /// Milliseconds.
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    no_idempotent: Option<bool>,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,

    // parallel fields
    #[serde(default)]
    tasks: Vec<YamlTask>,

    // condition fields
    #[serde(default)]
    expr: Option<String>,
    /// Alias for `expr`.
    #[serde(default)]
    condition: Option<String>,
    #[serde(default, rename = "else")]
    else_steps: Vec<YamlStepNode>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct YamlTask {
    #[serde(default)]
    name: String,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_strategy: Option<String>,
    #[serde(default)]
    retry_delay: Option<u64>,
    #[serde(default)]
    delay: Option<u64>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    no_idempotent: Option<bool>,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML workflow document into definitions (keyed by flow name) and
/// the handler exec table.
pub fn parse_workflow_yaml(
    data: &str,
    version: i32,
) -> Result<(HashMap<String, WorkflowDefinition>, HashMap<String, String>), YamlError> {
    let doc: YamlDocument = serde_yaml_ng::from_str(data)?;

    let mut handlers_exec = HashMap::with_capacity(doc.handlers.len());
    for (index, handler) in doc.handlers.iter().enumerate() {
        if handler.name.is_empty() {
            return Err(YamlError::InvalidHandler {
                index,
                message: "missing name".to_string(),
            });
        }
        if handler.exec.is_empty() {
            return Err(YamlError::InvalidHandler {
                index,
                message: format!("missing exec for handler '{}'", handler.name),
            });
        }
        if handlers_exec
            .insert(handler.name.clone(), handler.exec.clone())
            .is_some()
        {
            return Err(YamlError::InvalidHandler {
                index,
                message: format!("duplicate handler '{}'", handler.name),
            });
        }
    }

    let mut definitions = HashMap::with_capacity(doc.flows.len());
    for flow in doc.flows {
        if flow.name.is_empty() {
            return Err(YamlError::InvalidFlow {
                flow: String::new(),
                message: "missing flow name".to_string(),
            });
        }
        if flow.steps.is_empty() {
            return Err(YamlError::InvalidFlow {
                flow: flow.name,
                message: "steps are required".to_string(),
            });
        }

        let builder = build_steps(
            Builder::new(flow.name.clone(), version),
            flow.steps,
            &handlers_exec,
        )
        .map_err(|message| YamlError::InvalidFlow {
            flow: flow.name.clone(),
            message,
        })?;
        let def = builder.build().map_err(|source| YamlError::Definition {
            flow: flow.name.clone(),
            source,
        })?;
        definitions.insert(flow.name, def);
    }

    Ok((definitions, handlers_exec))
}

fn build_steps(
    mut builder: Builder,
    steps: Vec<YamlStepNode>,
    handlers_exec: &HashMap<String, String>,
) -> Result<Builder, String> {
    for (index, node) in steps.into_iter().enumerate() {
        let step = match node {
            YamlStepNode::Shorthand(name) => YamlStep {
                name: name.clone(),
                handler: Some(name),
                ..YamlStep::default()
            },
            YamlStepNode::Full(step) => step,
        };

        match step.kind.as_deref().unwrap_or("task") {
            "task" => builder = build_task(builder, index, step, handlers_exec)?,
            "savepoint" => {
                if step.name.is_empty() {
                    return Err(format!("steps[{index}]: savepoint requires name"));
                }
                builder = builder.savepoint(step.name);
            }
            "parallel" => builder = build_parallel(builder, index, step, handlers_exec)?,
            "condition" => builder = build_condition(builder, index, step, handlers_exec)?,
            other => return Err(format!("steps[{index}]: unsupported type '{other}'")),
        }
    }
    Ok(builder)
}

fn build_task(
    mut builder: Builder,
    index: usize,
    step: YamlStep,
    handlers_exec: &HashMap<String, String>,
) -> Result<Builder, String> {
    if step.name.is_empty() {
        return Err(format!("steps[{index}]: task requires name"));
    }
    let handler = step
        .handler
        .clone()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| step.name.clone());

    builder = builder.step(step.name.clone(), handler.clone());
    if let Some(exec) = handlers_exec.get(&handler) {
        builder = builder.metadata("exec", serde_json::Value::String(exec.clone()));
    }
    if let Some(retries) = step.max_retries {
        builder = builder.max_retries(retries);
    }
    if let Some(strategy) = step.retry_strategy.as_deref() {
        builder = builder.retry_strategy(parse_retry_strategy(strategy)?);
    }
    if let Some(ms) = step.retry_delay {
        builder = builder.retry_delay_ms(ms);
    }
    if let Some(ms) = step.delay {
        builder = builder.delay_ms(ms);
    }
    if let Some(ms) = step.timeout {
        builder = builder.timeout_ms(ms);
    }
    if step.no_idempotent == Some(true) {
        builder = builder.no_idempotent();
    }
    if let Some(metadata) = step.metadata {
        for (key, value) in metadata {
            builder = builder.metadata(key, value);
        }
    }

    if let Some(on_failure) = step.on_failure.filter(|c| !c.is_empty()) {
        // The compensation name doubles as its handler name; the front-end
        // resolves it from the same handler table.
        builder = builder.on_failure(on_failure.clone(), on_failure);
    }
    Ok(builder)
}

fn build_parallel(
    builder: Builder,
    index: usize,
    step: YamlStep,
    handlers_exec: &HashMap<String, String>,
) -> Result<Builder, String> {
    if step.name.is_empty() {
        return Err(format!("steps[{index}]: parallel requires name"));
    }
    if step.tasks.len() < 2 {
        return Err(format!(
            "parallel '{}' must contain at least 2 tasks",
            step.name
        ));
    }

    let mut tasks = Vec::with_capacity(step.tasks.len());
    for (task_index, task) in step.tasks.into_iter().enumerate() {
        if task.name.is_empty() {
            return Err(format!(
                "parallel '{}': tasks[{task_index}] missing name",
                step.name
            ));
        }
        let handler = task
            .handler
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| task.name.clone());
        let mut def = StepDefinition::task(task.name, handler.clone());
        if let Some(exec) = handlers_exec.get(&handler) {
            def.metadata
                .insert("exec".to_string(), serde_json::Value::String(exec.clone()));
        }
        if let Some(retries) = task.max_retries {
            def.max_retries = retries;
        }
        if let Some(strategy) = task.retry_strategy.as_deref() {
            def.retry_strategy = parse_retry_strategy(strategy)?;
        }
        if let Some(delay) = task.retry_delay {
            def.retry_delay_ms = delay;
        }
        if let Some(delay) = task.delay {
            def.delay_ms = delay;
        }
        if let Some(timeout) = task.timeout {
            def.timeout_ms = Some(timeout);
        }
        if let Some(no_idempotent) = task.no_idempotent {
            def.no_idempotent = no_idempotent;
        }
        if let Some(metadata) = task.metadata {
            def.metadata.extend(metadata);
        }
        tasks.push(def);
    }
    Ok(builder.parallel(step.name, tasks))
}

fn build_condition(
    builder: Builder,
    index: usize,
    step: YamlStep,
    handlers_exec: &HashMap<String, String>,
) -> Result<Builder, String> {
    if step.name.is_empty() {
        return Err(format!("steps[{index}]: condition requires name"));
    }
    let expr = step
        .expr
        .or(step.condition)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| format!("condition '{}': expr/condition is required", step.name))?;

    let else_branch = if step.else_steps.is_empty() {
        None
    } else {
        let else_steps = step.else_steps;
        let exec = handlers_exec.clone();
        let error_slot = std::rc::Rc::new(std::cell::RefCell::new(None));
        let slot = std::rc::Rc::clone(&error_slot);
        let else_branch = branch(move |b: Builder| match build_steps(b, else_steps, &exec) {
            Ok(built) => built,
            Err(message) => {
                *slot.borrow_mut() = Some(message);
                // An empty builder also fails the condition's own empty-else
                // check; the recorded message wins below.
                Builder::new("", 0)
            }
        });
        let builder = builder.condition(step.name, expr, Some(else_branch));
        if let Some(message) = error_slot.borrow_mut().take() {
            return Err(message);
        }
        return Ok(builder);
    };

    Ok(builder.condition(step.name, expr, else_branch))
}

fn parse_retry_strategy(value: &str) -> Result<RetryStrategy, String> {
    match value {
        "" | "fixed" => Ok(RetryStrategy::Fixed),
        "linear" => Ok(RetryStrategy::Linear),
        "exponential" => Ok(RetryStrategy::Exponential),
        other => Err(format!("unknown retry_strategy '{other}'")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_types::workflow::{JoinStrategy, StepType};

    const ORDER_YAML: &str = r#"
handlers:
  - name: reserve_stock
    exec: ./reserve.sh
  - name: charge_card
    exec: ./charge.sh
  - name: refund
    exec: ./refund.sh

flows:
  - name: order
    steps:
      - reserve_stock
      - name: charge
        handler: charge_card
        on_failure: refund
        max_retries: 3
        retry_strategy: exponential
        retry_delay: 100
        timeout: 5000
      - type: savepoint
        name: charged
      - type: parallel
        name: notify
        tasks:
          - name: email
          - name: sms
            timeout: 1000
      - type: condition
        name: check_total
        expr: "input.total > 100"
        else:
          - name: flag_review
"#;

    #[test]
    fn test_parse_full_document() {
        let (defs, handlers) = parse_workflow_yaml(ORDER_YAML, 1).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(handlers.len(), 3);
        assert_eq!(handlers["reserve_stock"], "./reserve.sh");

        let def = &defs["order"];
        assert_eq!(def.id(), "order-v1");
        assert_eq!(def.start, "reserve_stock");

        // Shorthand: name doubles as handler.
        let reserve = def.step("reserve_stock").unwrap();
        assert_eq!(reserve.handler.as_deref(), Some("reserve_stock"));
        assert_eq!(reserve.metadata["exec"], "./reserve.sh");

        let charge = def.step("charge").unwrap();
        assert_eq!(charge.handler.as_deref(), Some("charge_card"));
        assert_eq!(charge.max_retries, 3);
        assert_eq!(
            charge.retry_strategy,
            sagaflow_types::workflow::RetryStrategy::Exponential
        );
        assert_eq!(charge.retry_delay_ms, 100);
        assert_eq!(charge.timeout_ms, Some(5_000));
        assert_eq!(charge.on_failure.as_deref(), Some("refund"));

        let refund = def.step("refund").unwrap();
        assert_eq!(refund.compensation_for.as_deref(), Some("charge"));

        assert_eq!(def.step("charged").unwrap().step_type, StepType::Savepoint);

        let join = def.step("notify_join").unwrap();
        assert_eq!(join.wait_for, vec!["email", "sms"]);
        assert_eq!(join.join_strategy, Some(JoinStrategy::All));
        assert_eq!(def.step("sms").unwrap().timeout_ms, Some(1_000));

        let check = def.step("check_total").unwrap();
        assert_eq!(check.step_type, StepType::Condition);
        assert_eq!(check.else_next.as_deref(), Some("flag_review"));
    }

    #[test]
    fn test_condition_alias_field() {
        let yaml = r#"
flows:
  - name: flow
    steps:
      - name: a
      - type: condition
        name: check
        condition: "input.x == 1"
"#;
        let (defs, _) = parse_workflow_yaml(yaml, 1).unwrap();
        let check = defs["flow"].step("check").unwrap();
        assert_eq!(check.condition.as_deref(), Some("input.x == 1"));
    }

    #[test]
    fn test_multiple_flows() {
        let yaml = r#"
flows:
  - name: first
    steps: [step_one]
  - name: second
    steps: [step_two]
"#;
        let (defs, _) = parse_workflow_yaml(yaml, 2).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs["first"].id(), "first-v2");
        assert_eq!(defs["second"].id(), "second-v2");
    }

    #[test]
    fn test_handler_without_exec_rejected() {
        let yaml = r#"
handlers:
  - name: broken
flows:
  - name: flow
    steps: [a]
"#;
        let err = parse_workflow_yaml(yaml, 1).unwrap_err();
        assert!(err.to_string().contains("missing exec"));
    }

    #[test]
    fn test_flow_without_steps_rejected() {
        let yaml = r#"
flows:
  - name: hollow
    steps: []
"#;
        let err = parse_workflow_yaml(yaml, 1).unwrap_err();
        assert!(err.to_string().contains("steps are required"));
    }

    #[test]
    fn test_parallel_with_one_task_rejected() {
        let yaml = r#"
flows:
  - name: flow
    steps:
      - type: parallel
        name: solo
        tasks:
          - name: only
"#;
        let err = parse_workflow_yaml(yaml, 1).unwrap_err();
        assert!(err.to_string().contains("at least 2 tasks"));
    }

    #[test]
    fn test_condition_without_expr_rejected() {
        let yaml = r#"
flows:
  - name: flow
    steps:
      - name: a
      - type: condition
        name: check
"#;
        let err = parse_workflow_yaml(yaml, 1).unwrap_err();
        assert!(err.to_string().contains("expr/condition is required"));
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let yaml = r#"
flows:
  - name: flow
    steps:
      - type: rocket
        name: a
"#;
        let err = parse_workflow_yaml(yaml, 1).unwrap_err();
        assert!(err.to_string().contains("unsupported type"));
    }

    #[test]
    fn test_bad_expression_surfaces_definition_error() {
        let yaml = r#"
flows:
  - name: flow
    steps:
      - name: a
      - type: condition
        name: check
        expr: "input.x ~= 1"
"#;
        let err = parse_workflow_yaml(yaml, 1).unwrap_err();
        assert!(matches!(err, YamlError::Definition { .. }));
    }

    #[test]
    fn test_unknown_retry_strategy_rejected() {
        let yaml = r#"
flows:
  - name: flow
    steps:
      - name: a
        retry_strategy: quadratic
"#;
        let err = parse_workflow_yaml(yaml, 1).unwrap_err();
        assert!(err.to_string().contains("unknown retry_strategy"));
    }
}
