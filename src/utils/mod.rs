//! Shared helpers: tracing bootstrap, backoff schedules, metrics.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
