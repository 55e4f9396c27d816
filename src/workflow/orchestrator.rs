//! Sequences the node controller, workload discovery, hook resolver and job
//! runner into the set-downtime and unset-downtime operations.
//!
//! Failures observed after the node was cordoned are tagged with the rescue
//! step the caller must perform; the library never performs the rescue on its
//! own and never exits the process. Unset-downtime is itself the terminal
//! remediation, so its failures propagate untagged.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;

use crate::cluster::ClusterOps;
use crate::error::{Error, RescueStep, Result};
use crate::hooks::{HookResolver, HookSpec};
use crate::job::{HookPhase, JobRunner};
use crate::node::{DrainOptions, NodeController};
use crate::workload::WorkloadInspector;

/// Deadline for one hook job, delete-and-replace included.
pub const HOOK_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const NODE_READY_POLL: Duration = Duration::from_secs(10);

/// Grace period after uncordon before pods are expected back.
const SETTLE_DELAY: Duration = Duration::from_secs(30);

pub struct PatchWorkflow<C> {
    nodes: NodeController<C>,
    workloads: WorkloadInspector<C>,
    hooks: HookResolver<C>,
    jobs: JobRunner<C>,
}

impl<C: ClusterOps + 'static> PatchWorkflow<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self {
            nodes: NodeController::new(Arc::clone(&cluster)),
            workloads: WorkloadInspector::new(Arc::clone(&cluster)),
            hooks: HookResolver::new(Arc::clone(&cluster)),
            jobs: JobRunner::new(cluster),
        }
    }

    /// Take the node out of service: cordon it, run the pre hooks of every
    /// namespace with maintenance-aware pods on it, then drain it.
    ///
    /// On success the node is left cordoned and drained, ready for external
    /// maintenance. Failures after the cordon carry a [`RescueStep`]; the
    /// caller decides whether to apply it via [`Self::rescue`].
    pub async fn set_downtime(&self, node_name: &str, drain: &DrainOptions) -> Result<()> {
        if !self.nodes.is_ready(node_name).await? {
            return Err(Error::NodeNotReady(node_name.to_string()));
        }

        self.nodes
            .cordon(node_name)
            .await
            .map_err(|err| Error::rescue(RescueStep::Uncordon, err))?;
        info!(node = node_name, "node cordoned");

        let namespaces = self
            .workloads
            .namespaces_with_maintenance_pods(node_name)
            .await
            .map_err(|err| Error::rescue(RescueStep::Uncordon, err))?;

        for namespace in &namespaces {
            let hooks = self
                .hooks
                .resolve(namespace)
                .await
                .map_err(|err| Error::rescue(RescueStep::UncordonThenPostJob, err))?;
            if hooks.pre_script.is_empty() {
                continue;
            }
            info!(namespace, "pre hook found, running it");
            self.run_hook_job(namespace, HookPhase::Pre, &hooks)
                .await
                .map_err(|err| Error::rescue(RescueStep::UncordonThenPostJob, err))?;
            info!(namespace, "pre hook ran successfully");
        }

        self.nodes
            .drain(node_name, drain)
            .await
            .map_err(|err| Error::rescue(RescueStep::UncordonThenPostJob, err))?;

        info!(node = node_name, "node is ready to be patched");
        Ok(())
    }

    /// Bring the node back into service: wait for it to be ready, uncordon
    /// it, wait for its pods to settle and run the post hooks.
    ///
    /// This is the terminal remediation; there is no rescue beyond it and
    /// every failure propagates, including discovery and resolve failures.
    pub async fn unset_downtime(&self, node_name: &str) -> Result<()> {
        loop {
            if self.nodes.is_ready(node_name).await? {
                break;
            }
            info!(node = node_name, "node is not ready yet, waiting");
            sleep(NODE_READY_POLL).await;
        }

        self.nodes.uncordon(node_name).await?;
        info!(node = node_name, "node uncordoned");

        sleep(SETTLE_DELAY).await;
        self.workloads.await_pods_ready(node_name).await?;

        let namespaces = self
            .workloads
            .namespaces_with_maintenance_pods(node_name)
            .await?;
        for namespace in &namespaces {
            let hooks = self.hooks.resolve(namespace).await?;
            if hooks.post_script.is_empty() {
                continue;
            }
            info!(namespace, "post hook found, running it");
            self.run_hook_job(namespace, HookPhase::Post, &hooks).await?;
            info!(namespace, "post hook ran successfully");
        }

        info!(node = node_name, "node restored to service");
        Ok(())
    }

    /// Apply the remediation a failed [`Self::set_downtime`] asked for.
    pub async fn rescue(&self, node_name: &str, step: RescueStep) -> Result<()> {
        match step {
            RescueStep::Uncordon => self.nodes.uncordon(node_name).await,
            RescueStep::UncordonThenPostJob => self.unset_downtime(node_name).await,
        }
    }

    /// Run a single namespace's hook on demand. Unlike the workflow loops,
    /// a missing hook script is an error here: the caller asked for it.
    pub async fn run_hook(&self, namespace: &str, phase: HookPhase) -> Result<()> {
        let hooks = self.hooks.resolve(namespace).await?;
        if hooks.script_for(phase).is_empty() {
            return Err(Error::NotFound(format!(
                "{phase} hook in namespace {namespace}"
            )));
        }
        self.run_hook_job(namespace, phase, &hooks).await
    }

    async fn run_hook_job(
        &self,
        namespace: &str,
        phase: HookPhase,
        hooks: &HookSpec,
    ) -> Result<()> {
        let run = self.jobs.run(
            namespace,
            phase,
            hooks.script_for(phase),
            &hooks.image,
            &hooks.secret_names,
        );
        match tokio::time::timeout(HOOK_JOB_TIMEOUT, run).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "running {phase} hook job in namespace {namespace}"
            ))),
        }
    }
}
