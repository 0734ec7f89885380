//! Tracing setup for sagaflow binaries.

pub mod tracing_setup;
