//! Cordon/uncordon and drain of a single node.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::drain;
use crate::cluster::ClusterOps;
use crate::error::{Error, Result};

/// Per-attempt drain timeout used when the caller does not override it.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

/// Delay between drain attempts, long enough for a load balancer to settle
/// when a master node is being rotated out.
const DRAIN_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainRetry {
    pub enabled: bool,
    pub max_attempts: u32,
}

impl Default for DrainRetry {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOptions {
    /// Timeout for one drain attempt.
    pub timeout: Duration,
    pub retry: DrainRetry,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DRAIN_TIMEOUT,
            retry: DrainRetry::default(),
        }
    }
}

pub struct NodeController<C> {
    cluster: Arc<C>,
}

impl<C: ClusterOps> NodeController<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    /// True iff the node reports a `Ready` condition with status `True`.
    pub async fn is_ready(&self, node_name: &str) -> Result<bool> {
        let node = self.cluster.get_node(node_name).await?;
        Ok(node_is_ready(&node))
    }

    /// Mark the node unschedulable. A no-op when it already is.
    pub async fn cordon(&self, node_name: &str) -> Result<()> {
        self.set_unschedulable(node_name, true).await
    }

    /// Mark the node schedulable again. A no-op when it already is.
    pub async fn uncordon(&self, node_name: &str) -> Result<()> {
        self.set_unschedulable(node_name, false).await
    }

    async fn set_unschedulable(&self, node_name: &str, desired: bool) -> Result<()> {
        let node = self.cluster.get_node(node_name).await?;
        let current = node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false);
        if current == desired {
            debug!(
                node = node_name,
                "node already {}",
                if desired { "cordoned" } else { "uncordoned" }
            );
            return Ok(());
        }
        self.cluster
            .set_node_unschedulable(node_name, desired)
            .await
    }

    /// Evict all evictable pods from the node.
    ///
    /// Each attempt is bounded by `opts.timeout`; a timed-out attempt leaves
    /// a partially drained node behind, which is safe to retry because
    /// evictions are idempotent. With retry enabled the whole operation is
    /// re-run up to `max_attempts` times, short-circuiting on the first
    /// success; the final failure is what propagates.
    pub async fn drain(&self, node_name: &str, opts: &DrainOptions) -> Result<()> {
        let max_attempts = if opts.retry.enabled {
            opts.retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                opts.timeout,
                drain::drain_node(self.cluster.as_ref(), node_name),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("draining node {node_name}"))),
            };

            match result {
                Ok(()) => {
                    info!(node = node_name, attempt, "node drained");
                    return Ok(());
                }
                Err(err) if attempt < max_attempts => {
                    warn!(
                        node = node_name,
                        attempt,
                        error = %err,
                        "drain attempt failed, retrying in a few seconds"
                    );
                    sleep(DRAIN_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}
