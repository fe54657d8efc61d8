//! Routing subsystem: per-pool matching and request dispatch.

pub mod matcher;
pub mod router;

pub use router::{Dispatch, Router, StatsReport, POOL_HEADER};
