use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kubepatch::cluster::ClusterHandle;
use kubepatch::config::Settings;
use kubepatch::job::HookPhase;
use kubepatch::node::{DrainOptions, DrainRetry};
use kubepatch::workflow::PatchWorkflow;
use kubepatch::workload::WorkloadInspector;
use kubepatch::{inventory, Error, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// The node was skipped but left in a safe, schedulable state.
const EXIT_SKIPPED: u8 = 1;
/// The node is in an unknown state and needs manual intervention.
const EXIT_UNSAFE: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about = "Safe node maintenance workflows for Kubernetes clusters", long_about = None)]
struct Cli {
    /// Load default option values from a YAML file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// The kubeconfig file (in-cluster configuration when omitted)
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Overall timeout in seconds (0 disables it)
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Display debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run pre hooks on a node, cordon and drain it
    SetDowntime(SetDowntimeArgs),
    /// Uncordon a node, wait for its workload and run post hooks
    UnsetDowntime(NodeArgs),
    /// Run the pre hook job of the given namespace
    RunPreJob(NamespaceArgs),
    /// Run the post hook job of the given namespace
    RunPostJob(NamespaceArgs),
    /// List the master nodes of the cluster
    ListMasterNodes,
    /// List the worker nodes of the cluster
    ListWorkerNodes,
    /// List all nodes as a Rundeck resource-model JSON document
    ListNodesRundeck(RundeckArgs),
    /// Delete all failed pods with reason Evicted
    CleanEvictedPods,
    /// Force delete pods stuck in Terminating on a node
    DeleteTerminatingPods(DeleteTerminatingArgs),
}

#[derive(Args, Debug)]
struct SetDowntimeArgs {
    /// The node name
    #[arg(long)]
    node_name: String,

    /// Retry when the drain fails
    #[arg(long)]
    retry_on_drain_failed: bool,

    /// How many drain attempts when retry is enabled
    #[arg(long, default_value_t = 3)]
    number_retry: u32,

    /// Timeout in seconds for one drain attempt
    #[arg(long, default_value_t = 600)]
    drain_timeout: u64,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// The node name
    #[arg(long)]
    node_name: String,
}

#[derive(Args, Debug)]
struct NamespaceArgs {
    /// Namespace holding the hook configuration
    #[arg(long)]
    namespace: String,
}

#[derive(Args, Debug)]
struct RundeckArgs {
    /// Username to connect on the nodes with SSH
    #[arg(long, default_value = "")]
    username: String,

    /// Cluster name appended to the tags, useful to filter nodes in Rundeck
    #[arg(long, default_value = "")]
    cluster_name: String,

    /// SSH key storage path to connect on the nodes
    #[arg(long, default_value = "")]
    ssh_key_storage_path: String,

    /// SSH password storage path to connect on the nodes
    #[arg(long, default_value = "")]
    ssh_password_storage_path: String,

    /// SSH authentication mode
    #[arg(long, default_value = "password")]
    ssh_authentication: String,
}

#[derive(Args, Debug)]
struct DeleteTerminatingArgs {
    /// The node name
    #[arg(long)]
    node_name: String,

    /// Age in seconds past which a terminating pod without a grace period is
    /// considered stuck
    #[arg(long, default_value_t = 300)]
    max_age: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();

    run(cli).await
}

async fn run(cli: Cli) -> ExitCode {
    let settings = match &cli.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                error!(error = %err, "cannot load the configuration file");
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };
    let kubeconfig = cli.kubeconfig.clone().or(settings.kubeconfig);
    let timeout = cli.timeout.or(settings.timeout).unwrap_or(0);

    let cluster = match ClusterHandle::connect(kubeconfig.as_deref()).await {
        Ok(cluster) => Arc::new(cluster),
        Err(err) => {
            error!(error = %err, "cannot connect to the Kubernetes cluster");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::SetDowntime(args) => set_downtime(cluster, args, timeout).await,
        Commands::UnsetDowntime(args) => unset_downtime(cluster, args, timeout).await,
        Commands::RunPreJob(args) => run_hook(cluster, args, HookPhase::Pre, timeout).await,
        Commands::RunPostJob(args) => run_hook(cluster, args, HookPhase::Post, timeout).await,
        Commands::ListMasterNodes => {
            report(with_timeout(timeout, "listing master nodes", async {
                println!("{}", inventory::master_nodes(cluster.as_ref()).await?.join(";"));
                Ok(())
            })
            .await)
        }
        Commands::ListWorkerNodes => {
            report(with_timeout(timeout, "listing worker nodes", async {
                println!("{}", inventory::worker_nodes(cluster.as_ref()).await?.join(";"));
                Ok(())
            })
            .await)
        }
        Commands::ListNodesRundeck(args) => {
            report(with_timeout(timeout, "listing nodes for Rundeck", async {
                let opts = inventory::RundeckOptions {
                    username: args.username,
                    cluster_name: args.cluster_name,
                    ssh_key_storage_path: args.ssh_key_storage_path,
                    ssh_password_storage_path: args.ssh_password_storage_path,
                    ssh_authentication: args.ssh_authentication,
                };
                let nodes = inventory::rundeck_inventory(cluster.as_ref(), &opts).await?;
                println!(
                    "{}",
                    serde_json::to_string(&nodes)
                        .map_err(|err| Error::Config(err.to_string()))?
                );
                Ok(())
            })
            .await)
        }
        Commands::CleanEvictedPods => {
            report(with_timeout(timeout, "cleaning evicted pods", async {
                let workloads = WorkloadInspector::new(cluster);
                let deleted = workloads.clean_evicted_pods().await?;
                info!(deleted, "clean of evicted pods finished successfully");
                Ok(())
            })
            .await)
        }
        Commands::DeleteTerminatingPods(args) => {
            report(with_timeout(timeout, "deleting terminating pods", async {
                let workloads = WorkloadInspector::new(cluster);
                let deleted = workloads
                    .delete_stuck_terminating(
                        &args.node_name,
                        Duration::from_secs(args.max_age),
                    )
                    .await?;
                info!(node = %args.node_name, deleted, "stuck terminating pods deleted");
                Ok(())
            })
            .await)
        }
    }
}

/// Take the node out of service.
///
/// On failure the rescue step carried by the error is applied here, in the
/// command layer: exit 0 when everything worked, 1 when the node was skipped
/// but safely restored, 2 when the node is left in an unknown state.
async fn set_downtime(
    cluster: Arc<ClusterHandle>,
    args: SetDowntimeArgs,
    timeout: u64,
) -> ExitCode {
    let workflow = PatchWorkflow::new(cluster);
    let drain = DrainOptions {
        timeout: Duration::from_secs(args.drain_timeout),
        retry: DrainRetry {
            enabled: args.retry_on_drain_failed,
            max_attempts: args.number_retry,
        },
    };

    let result = with_timeout(
        timeout,
        "setting the node downtime",
        workflow.set_downtime(&args.node_name, &drain),
    )
    .await;

    let Err(err) = result else {
        return ExitCode::SUCCESS;
    };
    error!(node = %args.node_name, error = %err, "set-downtime failed");

    match err.rescue_step() {
        Some(step) => match workflow.rescue(&args.node_name, step).await {
            Ok(()) => {
                warn!(node = %args.node_name, %step, "node successfully rescued, skipping it");
                ExitCode::from(EXIT_SKIPPED)
            }
            Err(rescue_err) => {
                error!(
                    node = %args.node_name,
                    error = %rescue_err,
                    "rescue failed, the node needs manual intervention"
                );
                ExitCode::from(EXIT_UNSAFE)
            }
        },
        // Nothing was mutated (readiness precondition or a failure before the
        // cordon); the node is safe to skip.
        None => ExitCode::from(EXIT_SKIPPED),
    }
}

async fn unset_downtime(cluster: Arc<ClusterHandle>, args: NodeArgs, timeout: u64) -> ExitCode {
    let workflow = PatchWorkflow::new(cluster);
    match with_timeout(
        timeout,
        "unsetting the node downtime",
        workflow.unset_downtime(&args.node_name),
    )
    .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // This phase is the terminal remediation; failing it leaves the
            // node in an unknown state.
            error!(node = %args.node_name, error = %err, "unset-downtime failed");
            ExitCode::from(EXIT_UNSAFE)
        }
    }
}

async fn run_hook(
    cluster: Arc<ClusterHandle>,
    args: NamespaceArgs,
    phase: HookPhase,
    timeout: u64,
) -> ExitCode {
    let workflow = PatchWorkflow::new(cluster);
    let result = with_timeout(
        timeout,
        "running the hook job",
        workflow.run_hook(&args.namespace, phase),
    )
    .await;
    match result {
        Ok(()) => {
            info!(namespace = %args.namespace, phase = %phase, "hook job ran successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(namespace = %args.namespace, error = %err, "hook job failed");
            ExitCode::FAILURE
        }
    }
}

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn with_timeout<T>(
    secs: u64,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    if secs == 0 {
        return fut.await;
    }
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}
