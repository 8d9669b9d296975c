//! Observability setup for mitigate: structured logging via `tracing`, with
//! optional OpenTelemetry span export.

pub mod tracing_setup;
