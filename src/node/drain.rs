//! Eviction-based node drain.
//!
//! Kubernetes has no server-side drain; like `kubectl drain` this lists the
//! pods scheduled on the node and removes them through the eviction
//! subresource so PodDisruptionBudgets are respected. DaemonSet pods are
//! skipped (their controller ignores cordons), as are static mirror pods and
//! pods that already reached a terminal phase.

use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::debug;

use crate::cluster::ClusterOps;
use crate::error::{Error, Result};

/// Evictions running at once. Waiting for the evicted pod to disappear counts
/// against this limit, which keeps the request rate to the API server low.
const CONCURRENT_EVICTIONS: usize = 5;

/// Fixed wait between eviction attempts while a PodDisruptionBudget refuses
/// the eviction; `kubectl drain` uses the same interval.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const NUM_RETRIES: usize = 10;

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
        .max_delay(RETRY_MAX_DELAY)
        .map(jitter)
        .take(NUM_RETRIES)
}

/// Evict every drainable pod from `node_name` and wait for each to be gone.
///
/// Fails on the first pod whose eviction cannot be completed; the operation
/// is idempotent, so the caller may simply re-run it.
pub(crate) async fn drain_node<C: ClusterOps>(cluster: &C, node_name: &str) -> Result<()> {
    let pods = cluster
        .list_pods(None, Some(&format!("spec.nodeName={node_name}")), None)
        .await?;
    let targets: Vec<Pod> = pods.into_iter().filter(is_drain_target).collect();
    debug!(node = node_name, pods = targets.len(), "starting eviction pass");

    stream::iter(targets)
        .map(Ok)
        .try_for_each_concurrent(CONCURRENT_EVICTIONS, |pod| async move {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            let name = pod.metadata.name.clone().unwrap_or_default();
            evict_pod(cluster, &namespace, &name).await?;
            wait_for_deletion(cluster, &namespace, &name).await
        })
        .await
}

fn is_drain_target(pod: &Pod) -> bool {
    if let Some(phase) = pod.status.as_ref().and_then(|status| status.phase.as_deref()) {
        if phase == "Succeeded" || phase == "Failed" {
            return false;
        }
    }

    // The DaemonSet controller does not respect cordons, so evicting its pods
    // only makes it reschedule them.
    if let Some(owners) = pod.metadata.owner_references.as_ref() {
        if owners
            .iter()
            .any(|owner| owner.controller == Some(true) && owner.kind == "DaemonSet")
        {
            debug!(pod = pod.metadata.name.as_deref(), "skipping DaemonSet pod");
            return false;
        }
    }

    // Static mirror pods cannot be controlled through the API.
    if let Some(annotations) = pod.metadata.annotations.as_ref() {
        if annotations.contains_key("kubernetes.io/config.mirror") {
            debug!(pod = pod.metadata.name.as_deref(), "skipping mirror pod");
            return false;
        }
    }

    true
}

/// Evict one pod, retrying transient failures with exponential backoff.
///
/// A 429 or 500 means a PodDisruptionBudget is not yet satisfied; those wait
/// a fixed interval inside the current attempt. A 404 means the pod is
/// already gone. 403 aborts, everything else goes through the backoff.
async fn evict_pod<C: ClusterOps>(cluster: &C, namespace: &str, name: &str) -> Result<()> {
    RetryIf::spawn(
        retry_strategy(),
        || async move {
            loop {
                match cluster.evict_pod(namespace, name).await {
                    Ok(()) => {
                        debug!(pod = name, "pod evicted");
                        return Ok(());
                    }
                    Err(Error::Kube(kube::Error::Api(response))) => match response.code {
                        404 => {
                            debug!(pod = name, "pod already gone");
                            return Ok(());
                        }
                        429 | 500 => {
                            debug!(
                                pod = name,
                                code = response.code,
                                "eviction refused, waiting for the disruption budget"
                            );
                            sleep(EVICTION_RETRY_INTERVAL).await;
                        }
                        _ => return Err(Error::Kube(kube::Error::Api(response))),
                    },
                    Err(err) => return Err(err),
                }
            }
        },
        is_transient_eviction_error,
    )
    .await
}

fn is_transient_eviction_error(err: &Error) -> bool {
    match err {
        Error::Kube(kube::Error::Api(response)) => response.code != 403 && response.code != 404,
        Error::Kube(_) => true,
        _ => false,
    }
}

async fn wait_for_deletion<C: ClusterOps>(cluster: &C, namespace: &str, name: &str) -> Result<()> {
    while cluster.get_pod(namespace, name).await?.is_some() {
        debug!(pod = name, "waiting for evicted pod to be deleted");
        sleep(DELETION_CHECK_INTERVAL).await;
    }
    Ok(())
}
