//! Runs a hook script as a namespaced batch job and waits for its terminal
//! state.
//!
//! Batch jobs are immutable and their names unique per namespace, so the
//! runner first deletes any stale job of the same name and waits for the
//! deletion to finish. While the new job runs, a completion poll and a log
//! streamer run concurrently: the job's pods are short-lived, so logs must be
//! read while they exist, but completion must be observed even if streaming
//! stalls.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretEnvSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::cluster::ClusterOps;
use crate::error::{Error, Result};

/// Every hook job is named `patchmanagement-<phase>`, which caps the jobs at
/// one per phase per namespace.
pub const JOB_NAME_PREFIX: &str = "patchmanagement";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_LIMIT: i32 = 4;
const HOOK_CPU: &str = "1000m";
const HOOK_MEMORY: &str = "512Mi";

/// Which side of the maintenance window a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn job_suffix(self) -> &'static str {
        match self {
            HookPhase::Pre => "pre-job",
            HookPhase::Post => "post-job",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_suffix())
    }
}

pub struct JobRunner<C> {
    cluster: Arc<C>,
}

impl<C: ClusterOps + 'static> JobRunner<C> {
    pub fn new(cluster: Arc<C>) -> Self {
        Self { cluster }
    }

    /// Run `script` as a batch job in `namespace` and wait for its terminal
    /// state. An empty script is a successful no-op; hooks are optional.
    ///
    /// The call has no internal deadline; the caller bounds it with a
    /// timeout. Dropping the returned future also stops the log streamer,
    /// because the stop channel's sender is dropped with it.
    pub async fn run(
        &self,
        namespace: &str,
        phase: HookPhase,
        script: &str,
        image: &str,
        secrets: &[String],
    ) -> Result<()> {
        if script.is_empty() {
            info!(namespace, phase = %phase, "empty hook script, nothing to run");
            return Ok(());
        }

        let name = format!("{JOB_NAME_PREFIX}-{}", phase.job_suffix());
        self.remove_stale_job(namespace, &name).await?;

        let job = build_job(&name, phase.job_suffix(), script, image, secrets);
        self.cluster.create_job(namespace, &job).await?;
        info!(namespace, job = %name, "job created");

        let (stop_tx, stop_rx) = oneshot::channel();
        let streamer = tokio::spawn(stream_job_logs(
            Arc::clone(&self.cluster),
            namespace.to_string(),
            name.clone(),
            stop_rx,
        ));

        let result = self.await_terminal(namespace, &name).await;

        let _ = stop_tx.send(());
        match streamer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(namespace, job = %name, error = %err, "log streaming failed"),
            Err(err) => warn!(namespace, job = %name, error = %err, "log streamer panicked"),
        }

        result
    }

    async fn remove_stale_job(&self, namespace: &str, name: &str) -> Result<()> {
        if self.cluster.get_job(namespace, name).await?.is_none() {
            debug!(namespace, job = name, "no stale job found");
            return Ok(());
        }

        debug!(namespace, job = name, "found stale job, removing it");
        self.cluster.delete_job(namespace, name).await?;
        while self.cluster.get_job(namespace, name).await?.is_some() {
            debug!(namespace, job = name, "waiting for stale job to be deleted");
            sleep(POLL_INTERVAL).await;
        }
        debug!(namespace, job = name, "stale job deleted");
        Ok(())
    }

    async fn await_terminal(&self, namespace: &str, name: &str) -> Result<()> {
        loop {
            let job = self
                .cluster
                .get_job(namespace, name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("job {namespace}/{name}")))?;

            let conditions = job
                .status
                .as_ref()
                .and_then(|status| status.conditions.as_ref());
            if let Some(conditions) = conditions {
                for condition in conditions {
                    if condition.status != "True" {
                        continue;
                    }
                    match condition.type_.as_str() {
                        "Failed" => {
                            return Err(Error::JobFailed {
                                name: name.to_string(),
                                reason: condition.reason.clone().unwrap_or_default(),
                            });
                        }
                        "Complete" => {
                            debug!(namespace, job = name, "job completed successfully");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }

            sleep(POLL_INTERVAL).await;
        }
    }
}

fn hook_resources() -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(HOOK_CPU.to_string())),
        ("memory".to_string(), Quantity(HOOK_MEMORY.to_string())),
    ])
}

fn build_job(
    name: &str,
    container_name: &str,
    script: &str,
    image: &str,
    secrets: &[String],
) -> Job {
    let env_from: Vec<EnvFromSource> = secrets
        .iter()
        .map(|secret| EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: Some(secret.clone()),
                ..SecretEnvSource::default()
            }),
            ..EnvFromSource::default()
        })
        .collect();

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(container_name.to_string()),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: container_name.to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec!["/bin/sh".to_string()]),
                        args: Some(vec!["-c".to_string(), script.to_string()]),
                        env_from: (!env_from.is_empty()).then_some(env_from),
                        resources: Some(ResourceRequirements {
                            limits: Some(hook_resources()),
                            requests: Some(hook_resources()),
                            ..ResourceRequirements::default()
                        }),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// Discover the job's pods and forward their log lines as they arrive.
///
/// Runs until `stop` fires (or its sender is dropped). Streaming failures are
/// reported to the caller through the task's result, never by interrupting
/// the job wait.
async fn stream_job_logs<C: ClusterOps>(
    cluster: Arc<C>,
    namespace: String,
    job_name: String,
    mut stop: oneshot::Receiver<()>,
) -> Result<()> {
    let selector = format!("job-name={job_name}");
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut streams = FuturesUnordered::new();
    let mut poll = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut stop => return Ok(()),
            _ = poll.tick() => {
                let pods = cluster
                    .list_pods(Some(&namespace), None, Some(&selector))
                    .await?;
                for pod in pods {
                    let Some(pod_name) = pod.metadata.name.clone() else {
                        continue;
                    };
                    if seen.contains(&pod_name) || pod_is_pending(&pod) {
                        continue;
                    }
                    seen.insert(pod_name.clone());
                    streams.push(forward_pod_logs(
                        Arc::clone(&cluster),
                        namespace.clone(),
                        pod_name,
                    ));
                }
            }
            Some(()) = streams.next() => {}
        }
    }
}

fn pod_is_pending(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Pending")
}

async fn forward_pod_logs<C: ClusterOps>(cluster: Arc<C>, namespace: String, pod_name: String) {
    let mut lines = match cluster.follow_pod_logs(&namespace, &pod_name).await {
        Ok(lines) => lines,
        Err(err) => {
            warn!(pod = %pod_name, error = %err, "cannot stream pod logs");
            return;
        }
    };
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => info!(pod = %pod_name, "{line}"),
            Err(err) => {
                warn!(pod = %pod_name, error = %err, "log stream interrupted");
                return;
            }
        }
    }
    debug!(pod = %pod_name, "log stream ended");
}
