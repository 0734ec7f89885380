//! Store error type shared between the core port and its implementations.

use thiserror::Error;

/// Errors from store operations (used by the `WorkflowStore` trait defined in
/// `sagaflow-core`).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
