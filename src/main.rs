//! Cluster Orchestrator - offline planning and validation tools
//!
//! The lifecycle workflows need live IaaS services and are driven through
//! the library. This binary exposes the pure parts against local files.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_orchestrator::config::OrchestratorConfig;
use cluster_orchestrator::model::{node_name, ClusterNode, ManagedCluster, NodeRole};
use cluster_orchestrator::network::{desired_rules, NetworkInfo, RuleSettings};
use cluster_orchestrator::planner::{plan_placement, units_for, HostCapacity, PlacementConstraints};

/// Cluster Orchestrator - lifecycle management for managed clusters
#[derive(Parser, Debug)]
#[command(name = "cluster-orchestrator", version, about, long_about = None)]
struct Cli {
    /// Orchestrator configuration file (defaults apply when omitted)
    #[arg(long, global = true, env = "CLUSTER_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Format of printed plans and rule sets
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Yaml)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

impl OutputFormat {
    fn render<T: Serialize>(self, value: &T) -> anyhow::Result<String> {
        Ok(match self {
            Self::Yaml => serde_yaml::to_string(value)?,
            Self::Json => serde_json::to_string_pretty(value)?,
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that a cluster's nodes fit a host inventory
    ///
    /// Prints the per-host reservations and exits non-zero when some node
    /// has no host.
    Plan {
        /// Cluster definition (YAML)
        #[arg(long)]
        cluster: PathBuf,
        /// Host inventory (YAML list)
        #[arg(long)]
        hosts: PathBuf,
    },

    /// Validate a cluster definition against the configuration
    Validate {
        /// Cluster definition (YAML)
        #[arg(long)]
        cluster: PathBuf,
    },

    /// Print the network rules a cluster needs on a network
    Rules {
        /// Cluster definition (YAML)
        #[arg(long)]
        cluster: PathBuf,
        /// Network description (YAML)
        #[arg(long)]
        network: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)
            .await
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    match cli.command {
        Commands::Plan { cluster, hosts } => run_plan(&config, cli.output, &cluster, &hosts).await,
        Commands::Validate { cluster } => run_validate(&config, &cluster).await,
        Commands::Rules { cluster, network } => {
            run_rules(&config, cli.output, &cluster, &network).await
        }
    }
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

async fn run_validate(config: &OrchestratorConfig, cluster: &Path) -> anyhow::Result<()> {
    let cluster: ManagedCluster = read_yaml(cluster).await?;
    cluster.validate(config.limits.max_nodes_per_cluster)?;
    info!(cluster = %cluster.name, nodes = cluster.desired_node_count(), "cluster definition is valid");
    println!("{}: ok", cluster.name);
    Ok(())
}

async fn run_plan(
    config: &OrchestratorConfig,
    output: OutputFormat,
    cluster: &Path,
    hosts: &Path,
) -> anyhow::Result<()> {
    let cluster: ManagedCluster = read_yaml(cluster).await?;
    let hosts: Vec<HostCapacity> = read_yaml(hosts).await?;
    cluster.validate(config.limits.max_nodes_per_cluster)?;

    let units = units_for(
        &cluster,
        cluster.control_nodes,
        cluster.etcd_nodes,
        cluster.worker_nodes,
    );
    let constraints = PlacementConstraints::from(&config.planner);
    let plan = plan_placement(&hosts, &units, &constraints);
    info!(
        cluster = %cluster.name,
        hosts = hosts.len(),
        requested = plan.requested,
        placed = plan.placed(),
        "placement planned"
    );
    println!("{}", output.render(&plan)?);

    plan.into_result(&cluster.name)?;
    Ok(())
}

async fn run_rules(
    config: &OrchestratorConfig,
    output: OutputFormat,
    cluster: &Path,
    network: &Path,
) -> anyhow::Result<()> {
    let cluster: ManagedCluster = read_yaml(cluster).await?;
    let network: NetworkInfo = read_yaml(network).await?;
    cluster.validate(config.limits.max_nodes_per_cluster)?;

    let members = planned_members(&cluster);
    let rules = desired_rules(&network, &members, &RuleSettings::from(config));
    info!(cluster = %cluster.name, network = %network.id, rules = rules.len(), "rules derived");
    println!("{}", output.render(&rules)?);
    Ok(())
}

/// Membership records the cluster would have right after creation
fn planned_members(cluster: &ManagedCluster) -> Vec<ClusterNode> {
    let version = cluster.version.node_version();
    let mut members = Vec::new();
    for (role, count) in [
        (NodeRole::Control, cluster.control_nodes),
        (NodeRole::Etcd, cluster.etcd_nodes),
        (NodeRole::Worker, cluster.worker_nodes),
    ] {
        for index in 1..=count {
            let ordinal = members.len() as u32;
            let name = node_name(&cluster.name, role, index);
            members.push(ClusterNode::new(
                cluster.id,
                format!("planned-{ordinal}"),
                name,
                role,
                ordinal,
                version.clone(),
            ));
        }
    }
    members
}
