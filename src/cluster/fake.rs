//! In-memory [`ClusterOps`] implementation for tests.
//!
//! Every call is recorded as a `"<verb> <target>"` string so tests can assert
//! call counts and ordering. Builders configure the seeded objects and the
//! failure behavior (eviction failures, readiness flips, job outcomes).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodCondition, PodSpec, PodStatus,
};
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;

use super::{ClusterOps, LogLines};
use crate::error::{Error, Result};

/// Terminal state the fake job controller drives created jobs into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    #[default]
    Complete,
    Failed(String),
    /// The job never reaches a terminal condition.
    Pending,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    pods: Vec<Pod>,
    config_maps: BTreeMap<(String, String), ConfigMap>,
    jobs: BTreeMap<(String, String), Job>,
    calls: Vec<String>,
    /// Per node: how many `get_node` calls still report NotReady.
    not_ready_checks: BTreeMap<String, u32>,
    /// While > 0, listed pods report Ready=False; decremented per pod list.
    pods_pending_lists: u32,
    /// The first N evictions fail with HTTP 403.
    evict_failures: u32,
    fail_pod_lists: bool,
    job_outcome: JobOutcome,
    /// How many `get_job` calls return a non-terminal status first.
    job_gets_before_terminal: u32,
    pod_log_lines: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

fn api_error(code: u16, message: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: message.to_string(),
        code,
    }))
}

fn make_node(name: &str, ready: bool, unschedulable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(NodeSpec {
            unschedulable: Some(unschedulable),
            ..NodeSpec::default()
        }),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..NodeCondition::default()
            }]),
            ..NodeStatus::default()
        }),
    }
}

fn make_pod(
    namespace: &str,
    name: &str,
    node: Option<&str>,
    labels: &[(&str, &str)],
    ready: bool,
) -> Pod {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        }),
    }
}

fn not_ready(pod: &Pod) -> Pod {
    let mut pod = pod.clone();
    if let Some(conditions) = pod
        .status
        .as_mut()
        .and_then(|status| status.conditions.as_mut())
    {
        for condition in conditions.iter_mut() {
            if condition.type_ == "Ready" {
                condition.status = "False".to_string();
                condition.reason = Some("ContainersNotReady".to_string());
            }
        }
    }
    pod
}

fn with_terminal_condition(job: &Job, outcome: &JobOutcome) -> Job {
    let mut job = job.clone();
    let condition = match outcome {
        JobOutcome::Complete => JobCondition {
            type_: "Complete".to_string(),
            status: "True".to_string(),
            ..JobCondition::default()
        },
        JobOutcome::Failed(reason) => JobCondition {
            type_: "Failed".to_string(),
            status: "True".to_string(),
            reason: Some(reason.clone()),
            ..JobCondition::default()
        },
        JobOutcome::Pending => return job,
    };
    job.status = Some(JobStatus {
        conditions: Some(vec![condition]),
        ..JobStatus::default()
    });
    job
}

fn matches_label(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    if let Some((key, value)) = selector.split_once("!=") {
        return labels
            .and_then(|labels| labels.get(key))
            .map(|found| found != value)
            .unwrap_or(true);
    }
    if let Some((key, value)) = selector.split_once('=') {
        return labels
            .and_then(|labels| labels.get(key))
            .map(|found| found == value)
            .unwrap_or(false);
    }
    true
}

fn matches_field(pod: &Pod, selector: &str) -> bool {
    match selector.split_once('=') {
        Some(("spec.nodeName", node)) => {
            pod.spec
                .as_ref()
                .and_then(|spec| spec.node_name.as_deref())
                == Some(node)
        }
        _ => true,
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, name: &str, ready: bool, unschedulable: bool) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .nodes
                .insert(name.to_string(), make_node(name, ready, unschedulable));
        }
        self
    }

    pub fn with_labeled_node(self, name: &str, labels: &[(&str, &str)]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let mut node = make_node(name, true, false);
            node.metadata.labels = Some(
                labels
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            );
            state.nodes.insert(name.to_string(), node);
        }
        self
    }

    /// The first `checks` readiness probes of `node` report NotReady.
    pub fn with_not_ready_checks(self, node: &str, checks: u32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.not_ready_checks.insert(node.to_string(), checks);
        }
        self
    }

    pub fn with_pod(
        self,
        namespace: &str,
        name: &str,
        node: &str,
        labels: &[(&str, &str)],
        ready: bool,
    ) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .pods
                .push(make_pod(namespace, name, Some(node), labels, ready));
        }
        self
    }

    pub fn with_raw_pod(self, pod: Pod) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.pods.push(pod);
        }
        self
    }

    pub fn with_config_map(self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let config_map = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..ObjectMeta::default()
                },
                data: Some(
                    data.iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                ),
                ..ConfigMap::default()
            };
            state
                .config_maps
                .insert((namespace.to_string(), name.to_string()), config_map);
        }
        self
    }

    pub fn with_existing_job(self, namespace: &str, name: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let job = Job {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..ObjectMeta::default()
                },
                ..Job::default()
            };
            state
                .jobs
                .insert((namespace.to_string(), name.to_string()), job);
        }
        self
    }

    pub fn with_job_outcome(self, outcome: JobOutcome) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.job_outcome = outcome;
        }
        self
    }

    pub fn with_job_gets_before_terminal(self, gets: u32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.job_gets_before_terminal = gets;
        }
        self
    }

    pub fn with_evict_failures(self, failures: u32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.evict_failures = failures;
        }
        self
    }

    pub fn with_failing_pod_lists(self) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.fail_pod_lists = true;
        }
        self
    }

    /// The first `lists` pod listings report every pod as not ready.
    pub fn with_pods_pending_lists(self, lists: u32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.pods_pending_lists = lists;
        }
        self
    }

    pub fn with_pod_log_lines(self, lines: &[&str]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.pod_log_lines = lines.iter().map(|line| line.to_string()).collect();
        }
        self
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Index of the first recorded call starting with `prefix`.
    pub fn call_index(&self, prefix: &str) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .position(|call| call.starts_with(prefix))
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter_map(|pod| pod.metadata.name.clone())
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.record(format!("get-node {name}"));
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| api_error(404, "node not found"))?;
        if let Some(remaining) = state.not_ready_checks.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(make_node(name, false, false));
            }
        }
        Ok(node)
    }

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>> {
        self.record("list-nodes".to_string());
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .values()
            .filter(|node| match label_selector {
                Some(selector) => matches_label(node.metadata.labels.as_ref(), selector),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let verb = if unschedulable { "cordon" } else { "uncordon" };
        self.record(format!("{verb} {name}"));
        let mut state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| api_error(404, "node not found"))?;
        node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(unschedulable);
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        field_selector: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        self.record("list-pods".to_string());
        let mut state = self.state.lock().unwrap();
        if state.fail_pod_lists {
            return Err(api_error(500, "pod list failed"));
        }
        let pending = if state.pods_pending_lists > 0 {
            state.pods_pending_lists -= 1;
            true
        } else {
            false
        };
        Ok(state
            .pods
            .iter()
            .filter(|pod| match namespace {
                Some(namespace) => pod.metadata.namespace.as_deref() == Some(namespace),
                None => true,
            })
            .filter(|pod| match field_selector {
                Some(selector) => matches_field(pod, selector),
                None => true,
            })
            .filter(|pod| match label_selector {
                Some(selector) => matches_label(pod.metadata.labels.as_ref(), selector),
                None => true,
            })
            .map(|pod| if pending { not_ready(pod) } else { pod.clone() })
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.record(format!("get-pod {namespace}/{name}"));
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .find(|pod| {
                pod.metadata.namespace.as_deref() == Some(namespace)
                    && pod.metadata.name.as_deref() == Some(name)
            })
            .cloned())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(format!("evict {namespace}/{name}"));
        let mut state = self.state.lock().unwrap();
        if state.evict_failures > 0 {
            state.evict_failures -= 1;
            return Err(api_error(403, "eviction forbidden"));
        }
        state.pods.retain(|pod| {
            pod.metadata.namespace.as_deref() != Some(namespace)
                || pod.metadata.name.as_deref() != Some(name)
        });
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<i64>,
    ) -> Result<()> {
        self.record(format!("delete-pod {namespace}/{name}"));
        let mut state = self.state.lock().unwrap();
        state.pods.retain(|pod| {
            pod.metadata.namespace.as_deref() != Some(namespace)
                || pod.metadata.name.as_deref() != Some(name)
        });
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.record(format!("get-configmap {namespace}/{name}"));
        let state = self.state.lock().unwrap();
        Ok(state
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.record(format!("get-job {namespace}/{name}"));
        let mut state = self.state.lock().unwrap();
        let Some(job) = state
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
        else {
            return Ok(None);
        };
        if state.job_gets_before_terminal > 0 {
            state.job_gets_before_terminal -= 1;
            return Ok(Some(job));
        }
        let outcome = state.job_outcome.clone();
        Ok(Some(with_terminal_condition(&job, &outcome)))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.record(format!("create-job {namespace}/{name}"));
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .insert((namespace.to_string(), name.clone()), job.clone());
        // The job controller would schedule a pod for the job; seed one so the
        // log streamer has something to discover.
        state.pods.push(make_pod(
            namespace,
            &format!("{name}-1"),
            None,
            &[("job-name", name.as_str())],
            true,
        ));
        Ok(job.clone())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.record(format!("delete-job {namespace}/{name}"));
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .remove(&(namespace.to_string(), name.to_string()));
        // Foreground cascade removes the job's pods with it.
        state.pods.retain(|pod| {
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get("job-name"))
                .map(|job| job != name)
                .unwrap_or(true)
        });
        Ok(())
    }

    async fn follow_pod_logs(&self, namespace: &str, pod: &str) -> Result<LogLines> {
        self.record(format!("follow-logs {namespace}/{pod}"));
        let lines = self.state.lock().unwrap().pod_log_lines.clone();
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}
