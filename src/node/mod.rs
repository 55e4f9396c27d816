//! Node lifecycle operations: readiness checks, cordon/uncordon and the
//! eviction-based drain with bounded retry.

mod controller;
mod drain;

pub use controller::{DrainOptions, DrainRetry, NodeController, DEFAULT_DRAIN_TIMEOUT};
