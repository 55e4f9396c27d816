//! Cluster node inventory.
//!
//! Nodes are classified by the `master=true` label convention. The Rundeck
//! export turns the inventory into the resource-model JSON document Rundeck
//! consumes to drive per-node maintenance jobs over SSH.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use serde::Serialize;

use crate::cluster::ClusterOps;
use crate::error::Result;

const MASTER_SELECTOR: &str = "master=true";
const WORKER_SELECTOR: &str = "master!=true";

pub async fn master_nodes<C: ClusterOps>(cluster: &C) -> Result<Vec<String>> {
    Ok(node_names(cluster.list_nodes(Some(MASTER_SELECTOR)).await?))
}

pub async fn worker_nodes<C: ClusterOps>(cluster: &C) -> Result<Vec<String>> {
    Ok(node_names(cluster.list_nodes(Some(WORKER_SELECTOR)).await?))
}

pub async fn all_nodes<C: ClusterOps>(cluster: &C) -> Result<Vec<String>> {
    Ok(node_names(cluster.list_nodes(None).await?))
}

fn node_names(nodes: Vec<Node>) -> Vec<String> {
    nodes
        .into_iter()
        .filter_map(|node| node.metadata.name)
        .collect()
}

/// One node entry of the Rundeck resource model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RundeckNodeEntry {
    #[serde(rename = "nodename")]
    pub node_name: String,
    #[serde(rename = "hostname", skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(rename = "username", skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(rename = "tags", skip_serializing_if = "String::is_empty")]
    pub tags: String,
    #[serde(rename = "ssh-key-storage-path", skip_serializing_if = "String::is_empty")]
    pub ssh_key_storage_path: String,
    #[serde(
        rename = "ssh-password-storage-path",
        skip_serializing_if = "String::is_empty"
    )]
    pub ssh_password_storage_path: String,
    #[serde(rename = "ssh-authentication", skip_serializing_if = "String::is_empty")]
    pub ssh_authentication: String,
}

#[derive(Debug, Clone, Default)]
pub struct RundeckOptions {
    pub username: String,
    /// Prepended to each node's tags so Rundeck can filter by cluster.
    pub cluster_name: String,
    pub ssh_key_storage_path: String,
    pub ssh_password_storage_path: String,
    pub ssh_authentication: String,
}

impl RundeckOptions {
    fn entry(&self, node_name: &str, role: &str) -> RundeckNodeEntry {
        RundeckNodeEntry {
            node_name: node_name.to_string(),
            hostname: node_name.to_string(),
            username: self.username.clone(),
            tags: format!("{},{role}", self.cluster_name),
            ssh_key_storage_path: self.ssh_key_storage_path.clone(),
            ssh_password_storage_path: self.ssh_password_storage_path.clone(),
            ssh_authentication: self.ssh_authentication.clone(),
        }
    }
}

/// Master and worker nodes keyed by name, tagged with their role.
pub async fn rundeck_inventory<C: ClusterOps>(
    cluster: &C,
    opts: &RundeckOptions,
) -> Result<BTreeMap<String, RundeckNodeEntry>> {
    let mut inventory = BTreeMap::new();

    for node in master_nodes(cluster).await? {
        let entry = opts.entry(&node, "master");
        inventory.insert(node, entry);
    }
    for node in worker_nodes(cluster).await? {
        let entry = opts.entry(&node, "worker");
        inventory.insert(node, entry);
    }

    Ok(inventory)
}
