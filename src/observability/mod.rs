//! Observability: structured logging setup. Per-pool performance metrics
//! live with the pool engine and surface through the stats endpoint.

pub mod logging;

pub use logging::init_logging;
