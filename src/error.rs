//! Error types for the maintenance workflows.
//!
//! Failures that happen after a node was already cordoned are wrapped in
//! [`Error::Rescue`] together with the [`RescueStep`] the caller must perform
//! so the node is not left stranded outside the scheduling pool.

use std::fmt;

use thiserror::Error;

/// Remediation the caller must perform after a failed `set-downtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescueStep {
    /// Only the schedulable flag needs to be restored.
    Uncordon,
    /// Pre hooks may have partially run; the node must be uncordoned and the
    /// post hooks executed to bring the workload back to a consistent state.
    UncordonThenPostJob,
}

impl fmt::Display for RescueStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescueStep::Uncordon => write!(f, "uncordon"),
            RescueStep::UncordonThenPostJob => write!(f, "uncordon+post-job"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The node failed the readiness precondition; nothing was mutated.
    #[error("node {0} is not in ready state")]
    NodeNotReady(String),

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0} not found")]
    NotFound(String),

    /// The hook job reached a Failed condition.
    #[error("job {name} failed: {reason}")]
    JobFailed { name: String, reason: String },

    #[error("timed out while {0}")]
    Timeout(String),

    /// A failure observed after the node was cordoned, tagged with the
    /// remediation the caller must perform.
    #[error("{source} (rescue step: {step})")]
    Rescue {
        step: RescueStep,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Tag an error with the rescue step the caller must perform.
    pub fn rescue(step: RescueStep, source: Error) -> Self {
        Error::Rescue {
            step,
            source: Box::new(source),
        }
    }

    /// The rescue step to perform, if this error carries one.
    pub fn rescue_step(&self) -> Option<RescueStep> {
        match self {
            Error::Rescue { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn is_node_not_ready(&self) -> bool {
        matches!(self, Error::NodeNotReady(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
