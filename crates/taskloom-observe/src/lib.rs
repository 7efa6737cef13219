//! Tracing and OpenTelemetry setup for processes embedding Taskloom.

pub mod tracing_setup;
