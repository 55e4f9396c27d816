//! [`ClusterOps`] implementation over a real Kubernetes cluster.

use std::path::Path;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, LogParams, Patch, PatchParams};
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::debug;

use super::{ClusterOps, LogLines};
use crate::error::{Error, Result};

/// Thin façade over [`kube::Client`]; owns no workflow logic.
#[derive(Clone)]
pub struct ClusterHandle {
    client: Client,
}

impl ClusterHandle {
    /// Connect using an explicit kubeconfig, or the inferred configuration
    /// (in-cluster service account, `KUBECONFIG`, `~/.kube/config`) when no
    /// path is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = match kubeconfig {
            None => Client::try_default().await?,
            Some(path) => {
                debug!(kubeconfig = %path.display(), "loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
                Client::try_from(config)?
            }
        };

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Map a 404 to `None`; propagate everything else.
fn ok_or_absent<T>(result: kube::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ClusterOps for ClusterHandle {
    async fn get_node(&self, name: &str) -> Result<Node> {
        Ok(self.nodes().get(name).await?)
    }

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.nodes().list(&params).await?.items)
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "unschedulable": unschedulable
            }
        });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        field_selector: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let mut params = ListParams::default();
        if let Some(selector) = field_selector {
            params = params.fields(selector);
        }
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        ok_or_absent(self.pods(Some(namespace)).get(name).await)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(Some(namespace))
            .evict(name, &EvictParams::default())
            .await?;
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        let mut params = DeleteParams::default();
        if let Some(grace) = grace_period_seconds {
            params = params.grace_period(grace as u32);
        }
        self.pods(Some(namespace)).delete(name, &params).await?;
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        ok_or_absent(api.get(name).await)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&Default::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn follow_pod_logs(&self, namespace: &str, pod: &str) -> Result<LogLines> {
        let params = LogParams {
            follow: true,
            ..LogParams::default()
        };
        let reader = self.pods(Some(namespace)).log_stream(pod, &params).await?;
        Ok(reader.lines().boxed())
    }
}
