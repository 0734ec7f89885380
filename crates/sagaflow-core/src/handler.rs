//! Handler trait, step context, and the handler registry.
//!
//! A handler is a named, single-operation capability: it receives the step
//! context plus the step's input payload and returns an output payload or an
//! error. Handlers must be safe for concurrent invocation across instances
//! and are expected to be idempotent per idempotency key -- the engine
//! guarantees key stability across retries but does not enforce deduplication.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Execution context passed to a handler invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub instance_id: i64,
    pub step_name: String,
    /// Stable across retries of the same `(instance, step)` unless the step
    /// sets `no_idempotent`.
    pub idempotency_key: String,
    /// Number of retries already performed (0 on the first attempt).
    pub retry_count: u32,
    /// Step metadata, cloned per call; mutations do not propagate.
    pub metadata: HashMap<String, Value>,
    /// Cancelled on process shutdown, step timeout, or instance
    /// cancellation. Cancellation is cooperative.
    pub cancellation: CancellationToken,
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Errors a handler can report. The message is persisted verbatim on the
/// step row.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; retried until the step's `max_retries` is reached.
    #[error("{0}")]
    Retryable(String),

    /// Non-recoverable failure; remaining retries are skipped.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// User-supplied callable that performs a task step's work.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Unique handler name, referenced by step definitions.
    fn name(&self) -> &str;

    /// Perform the step's work.
    async fn execute(&self, ctx: StepContext, input: Value) -> Result<Value, HandlerError>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Name -> handler map, populated at startup and read-only during execution.
/// Registration is idempotent on name (last registration wins).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).map(|h| Arc::clone(&h))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _ctx: StepContext, input: Value) -> Result<Value, HandlerError> {
            Ok(input)
        }
    }

    fn test_context() -> StepContext {
        StepContext {
            instance_id: 1,
            step_name: "say-hello".to_string(),
            idempotency_key: "key-1".to_string(),
            retry_count: 0,
            metadata: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_execute() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));

        let handler = registry.get("echo").expect("registered");
        let output = handler
            .execute(test_context(), serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"x": 1}));
    }

    #[test]
    fn test_registration_is_idempotent_on_name() {
        let registry = HandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));
        registry.register(Arc::new(EchoHandler));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("echo"));
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_handler_error_message_is_verbatim() {
        let err = HandlerError::retryable("connection reset");
        assert_eq!(err.to_string(), "connection reset");
        let err = HandlerError::fatal("bad input shape");
        assert_eq!(err.to_string(), "bad input shape");
    }
}
