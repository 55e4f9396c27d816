//! Cluster access layer.
//!
//! [`ClusterOps`] is the capability interface every component is written
//! against: node get/list/patch, pod list/evict/delete, batch job lifecycle,
//! ConfigMap lookup and pod log streaming. [`ClusterHandle`] is the only
//! implementation backed by a real cluster; tests substitute an in-memory
//! fake so the workflows can be exercised without an API server.

mod handle;

#[cfg(test)]
pub(crate) mod fake;

pub use handle::ClusterHandle;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};

use crate::error::Result;

/// A followed pod log, one line per item.
pub type LogLines = BoxStream<'static, std::io::Result<String>>;

/// The slice of the Kubernetes API the maintenance workflows need.
///
/// Gets of namespaced objects map HTTP 404 to `Ok(None)`; absence is a normal
/// state for hook ConfigMaps and stale jobs. `get_node` treats a missing node
/// as an error because every workflow addresses one concrete node.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>>;

    /// Patch the schedulable flag. Callers are expected to check the current
    /// state first; this always issues the patch.
    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()>;

    /// `namespace == None` lists across all namespaces.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        field_selector: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Evict through the eviction subresource so PodDisruptionBudgets are
    /// respected.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    /// Foreground-cascading delete, so the job's pods are gone once the job
    /// itself no longer exists.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn follow_pod_logs(&self, namespace: &str, pod: &str) -> Result<LogLines>;
}
