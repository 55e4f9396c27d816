//! Workload discovery and pod housekeeping on a node.

mod inspector;

pub use inspector::{WorkloadInspector, MAINTENANCE_SELECTOR};
