//! Observability setup for Cadence binaries.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};
pub use tracing_setup::filter_for_verbosity;
