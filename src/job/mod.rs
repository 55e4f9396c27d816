//! Hook script execution as cluster-native batch jobs.

mod runner;

pub use runner::{HookPhase, JobRunner, JOB_NAME_PREFIX};
