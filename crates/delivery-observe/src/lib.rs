//! Observability setup for the delivery service.

pub mod tracing_setup;
