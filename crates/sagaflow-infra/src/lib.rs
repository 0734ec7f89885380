//! SQLite persistence for the sagaflow workflow engine.
//!
//! Implements the `WorkflowStore` port from `sagaflow-core` with sqlx over
//! SQLite: WAL journal mode, split reader/writer pools, and embedded
//! migrations applied on pool construction.

pub mod sqlite;

pub use sqlite::pool::DatabasePool;
pub use sqlite::store::SqliteStore;
