//! Observability setup for Weft: tracing subscriber installation and
//! optional OpenTelemetry export.

pub mod tracing_setup;
