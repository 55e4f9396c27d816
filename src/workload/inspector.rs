//! Pod discovery and housekeeping for one node.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Pod;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::cluster::ClusterOps;
use crate::error::Result;

/// Pods opt into the maintenance workflow with this label; everything else is
/// invisible to hook discovery.
pub const MAINTENANCE_SELECTOR: &str = "patchmanagement=true";

const POD_READY_POLL: Duration = Duration::from_secs(5);

pub struct WorkloadInspector<C> {
    cluster: Arc<C>,
}

impl<C: ClusterOps> WorkloadInspector<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    /// Namespaces that have maintenance-aware pods scheduled on the node,
    /// deduplicated.
    pub async fn namespaces_with_maintenance_pods(
        &self,
        node_name: &str,
    ) -> Result<BTreeSet<String>> {
        let pods = self
            .cluster
            .list_pods(
                None,
                Some(&format!("spec.nodeName={node_name}")),
                Some(MAINTENANCE_SELECTOR),
            )
            .await?;

        let mut namespaces = BTreeSet::new();
        for pod in &pods {
            debug!(
                pod = pod.metadata.name.as_deref(),
                node = node_name,
                "found maintenance-aware pod"
            );
            if let Some(namespace) = pod.metadata.namespace.clone() {
                namespaces.insert(namespace);
            }
        }
        Ok(namespaces)
    }

    /// Block until every pod on the node reports ready or has completed.
    ///
    /// There is no internal timeout; the caller bounds the wait with its own
    /// deadline.
    pub async fn await_pods_ready(&self, node_name: &str) -> Result<()> {
        loop {
            let pods = self
                .cluster
                .list_pods(None, Some(&format!("spec.nodeName={node_name}")), None)
                .await?;

            match pods.iter().find(|pod| !pod_is_settled(pod)) {
                None => {
                    debug!(node = node_name, "all pods are ready");
                    return Ok(());
                }
                Some(pod) => {
                    debug!(
                        pod = pod.metadata.name.as_deref(),
                        node = node_name,
                        "waiting for pod to become ready"
                    );
                    sleep(POD_READY_POLL).await;
                }
            }
        }
    }

    /// Delete every pod that failed with reason `Evicted`, cluster-wide.
    pub async fn clean_evicted_pods(&self) -> Result<usize> {
        let pods = self.cluster.list_pods(None, None, None).await?;
        let mut deleted = 0;
        for pod in &pods {
            if !pod_is_evicted(pod) {
                continue;
            }
            let (Some(namespace), Some(name)) =
                (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref())
            else {
                continue;
            };
            debug!(namespace, pod = name, "found evicted pod to clean");
            self.cluster.delete_pod(namespace, name, None).await?;
            info!(namespace, pod = name, "deleted evicted pod");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Force-delete pods on the node stuck in Terminating past their grace
    /// period (or `max_age` for pods without one).
    pub async fn delete_stuck_terminating(
        &self,
        node_name: &str,
        max_age: Duration,
    ) -> Result<usize> {
        let pods = self
            .cluster
            .list_pods(None, Some(&format!("spec.nodeName={node_name}")), None)
            .await?;

        let now = Utc::now();
        let mut deleted = 0;
        for pod in &pods {
            let Some(deletion_timestamp) = pod.metadata.deletion_timestamp.as_ref() else {
                continue;
            };
            let grace = pod
                .spec
                .as_ref()
                .and_then(|spec| spec.termination_grace_period_seconds)
                .filter(|seconds| *seconds > 0)
                .map(ChronoDuration::seconds)
                .unwrap_or_else(|| {
                    ChronoDuration::seconds(max_age.as_secs().min(i64::MAX as u64) as i64)
                });
            if deletion_timestamp.0 + grace >= now {
                continue;
            }
            let (Some(namespace), Some(name)) =
                (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref())
            else {
                continue;
            };
            debug!(namespace, pod = name, "force deleting stuck pod");
            self.cluster.delete_pod(namespace, name, Some(0)).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// A pod counts as settled when its `Ready` condition is `True` or carries
/// the terminal `PodCompleted` reason. Pods without a `Ready` condition do
/// not block the wait.
fn pod_is_settled(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .filter(|condition| condition.type_ == "Ready")
                .all(|condition| {
                    condition.status == "True"
                        || condition.reason.as_deref() == Some("PodCompleted")
                })
        })
        .unwrap_or(true)
}

fn pod_is_evicted(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .map(|status| {
            status.phase.as_deref() == Some("Failed")
                && status.reason.as_deref() == Some("Evicted")
        })
        .unwrap_or(false)
}
