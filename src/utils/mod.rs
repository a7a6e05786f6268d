//! Shared utilities.
//!
//! Tracing bootstrap, backoff builders, metrics instruments and trace
//! context propagation used across the writer, reader and consumers.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
pub mod trace_context;
