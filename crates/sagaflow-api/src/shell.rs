//! Shell handler transport.
//!
//! Runs a handler's exec command through `bash`, passing the step input as
//! the `INPUT` environment variable (plus top-level string/number fields as
//! uppercased variables) and the step context as `SAGAFLOW_*` variables.
//! Stdout is the output payload: JSON when it parses, otherwise wrapped as a
//! JSON string. A non-zero exit is a retryable failure carrying stderr.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use sagaflow_core::handler::{Handler, HandlerError, StepContext};
use serde_json::Value;
use tokio::process::Command;

pub struct ShellHandler {
    name: String,
    exec: String,
    debug: bool,
}

impl ShellHandler {
    pub fn new(name: impl Into<String>, exec: impl Into<String>, debug: bool) -> Self {
        Self {
            name: name.into(),
            exec: exec.into(),
            debug,
        }
    }

    /// Build one shell handler per entry of a YAML document's handler table.
    pub fn from_exec_table(
        handlers_exec: &std::collections::HashMap<String, String>,
        debug: bool,
    ) -> Vec<Arc<dyn Handler>> {
        handlers_exec
            .iter()
            .map(|(name, exec)| {
                Arc::new(ShellHandler::new(name.clone(), exec.clone(), debug)) as Arc<dyn Handler>
            })
            .collect()
    }

    fn script(&self) -> String {
        if self.exec.contains('\n') {
            format!("set -e\n{}", self.exec)
        } else {
            self.exec.clone()
        }
    }
}

#[async_trait]
impl Handler for ShellHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: StepContext, input: Value) -> Result<Value, HandlerError> {
        let input_str = serde_json::to_string(&input)
            .map_err(|e| HandlerError::fatal(format!("serialize input: {e}")))?;

        if self.debug {
            eprintln!("[DEBUG] handler '{}' input: {input_str}", self.name);
        }

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(self.script())
            .env("INPUT", &input_str)
            .env("SAGAFLOW_INSTANCE_ID", ctx.instance_id.to_string())
            .env("SAGAFLOW_STEP_NAME", &ctx.step_name)
            .env("SAGAFLOW_IDEMPOTENCY_KEY", &ctx.idempotency_key)
            .env("SAGAFLOW_RETRY_COUNT", ctx.retry_count.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Top-level scalar fields double as environment variables.
        if let Some(map) = input.as_object() {
            for (key, value) in map {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                command.env(key.to_uppercase(), text);
            }
        }

        let child = command
            .spawn()
            .map_err(|e| HandlerError::retryable(format!("spawn handler command: {e}")))?;

        let output = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                // Dropping the child kills it (kill_on_drop).
                return Err(HandlerError::retryable("handler cancelled"));
            }
            output = child.wait_with_output() => output
                .map_err(|e| HandlerError::retryable(format!("wait for handler command: {e}")))?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if self.debug && !stderr.is_empty() {
            eprintln!("[DEBUG] handler '{}' stderr: {stderr}", self.name);
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(HandlerError::retryable(format!(
                "command exited with code {code}: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Err(HandlerError::retryable("command produced no output"));
        }

        match serde_json::from_str(stdout) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(stdout.to_string())),
        }
    }
}
