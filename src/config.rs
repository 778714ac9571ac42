//! Orchestrator configuration
//!
//! Loaded from a YAML file; every field has a default so an empty document
//! is a valid configuration. Durations are stored as whole seconds and
//! exposed as [`Duration`] accessors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{Error, DEFAULT_API_PORT, DEFAULT_NODE_SSH_PORT, DEFAULT_SSH_BASE_PORT};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "CLUSTER_ORCHESTRATOR_CONFIG";

/// Top-level orchestrator configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Remote access over SSH
    pub ssh: SshConfig,
    /// Reachability rules
    pub network: NetworkConfig,
    /// Workflow deadlines
    pub timeouts: TimeoutConfig,
    /// Placement filters
    pub planner: PlannerConfig,
    /// Bootstrap payload settings
    pub bootstrap: BootstrapConfig,
    /// Autoscaler agent
    pub autoscaler: AutoscalerConfig,
    /// Orchestrator-wide limits
    pub limits: LimitsConfig,
}

/// SSH access settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SshConfig {
    /// First public SSH port; node `i` is reached on `base_port + i`
    pub base_port: u16,
    /// SSH port inside each node
    pub node_port: u16,
    /// User the management key logs in as
    pub management_user: String,
    /// Private key used for every remote call
    pub management_key_path: PathBuf,
    /// Public half installed on every node
    pub management_public_key: String,
    /// TCP connect timeout
    pub connect_timeout_secs: u64,
    /// Per-command timeout
    pub command_timeout_secs: u64,
    /// Attempts for transient SSH failures
    pub retry_attempts: u32,
    /// Pause between attempts
    pub retry_delay_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_SSH_BASE_PORT,
            node_port: DEFAULT_NODE_SSH_PORT,
            management_user: "cloud".to_string(),
            management_key_path: PathBuf::from("/var/lib/cluster-orchestrator/ssh/id_rsa"),
            management_public_key: String::new(),
            connect_timeout_secs: 10,
            command_timeout_secs: 120,
            retry_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

impl SshConfig {
    /// Retry policy for remote exec
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_secs(self.retry_delay_secs))
    }

    /// TCP connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Per-command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Network rule settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Public API port
    pub api_port: u16,
    /// CIDRs allowed to reach the SSH range
    pub ssh_source_cidrs: Vec<String>,
    /// CIDRs allowed to reach the API port
    pub api_source_cidrs: Vec<String>,
    /// First ACL rule number used for cluster entries
    pub acl_rule_number_base: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            ssh_source_cidrs: vec!["0.0.0.0/0".to_string()],
            api_source_cidrs: vec!["0.0.0.0/0".to_string()],
            acl_rule_number_base: 100,
        }
    }
}

/// Per-workflow deadlines
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Create, from payload attach to ready nodes
    pub create_secs: u64,
    /// Start or stop of every member
    pub start_secs: u64,
    /// Scale up until new nodes are ready
    pub scale_secs: u64,
    /// Whole upgrade across all nodes
    pub upgrade_secs: u64,
    /// Admission of external nodes
    pub add_node_secs: u64,
    /// Interval between polls
    pub poll_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_secs: 3600,
            start_secs: 1800,
            scale_secs: 3600,
            upgrade_secs: 7200,
            add_node_secs: 1800,
            poll_interval_secs: 15,
        }
    }
}

impl TimeoutConfig {
    /// Create deadline budget
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_secs)
    }

    /// Start/stop deadline budget
    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    /// Scale deadline budget
    pub fn scale(&self) -> Duration {
        Duration::from_secs(self.scale_secs)
    }

    /// Upgrade deadline budget
    pub fn upgrade(&self) -> Duration {
        Duration::from_secs(self.upgrade_secs)
    }

    /// Add-node deadline budget
    pub fn add_node(&self) -> Duration {
        Duration::from_secs(self.add_node_secs)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Placement filters for the planner
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PlannerConfig {
    /// Only consider hosts of this hypervisor family
    pub hypervisor: Option<String>,
    /// Only consider hosts carrying this tag
    pub host_tag: Option<String>,
}

/// Bootstrap payload settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Lifetime of one join-token window
    pub join_window_secs: u64,
    /// Namespace the dashboard is deployed into
    pub dashboard_namespace: String,
    /// Wait for the dashboard before marking a new cluster Running
    pub verify_dashboard: bool,
    /// DNS domain of the orchestrated cluster
    pub cluster_domain: String,
    /// Local upgrade script copied to nodes instead of the one on the payload medium
    pub upgrade_script: Option<PathBuf>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            join_window_secs: 86_400,
            dashboard_namespace: "kubernetes-dashboard".to_string(),
            verify_dashboard: true,
            cluster_domain: "cluster.local".to_string(),
            upgrade_script: None,
        }
    }
}

impl BootstrapConfig {
    /// Join window as a duration
    pub fn join_window(&self) -> Duration {
        Duration::from_secs(self.join_window_secs)
    }
}

/// Autoscaler agent settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoscalerConfig {
    /// Container image of the autoscaler
    pub image: String,
    /// Upper bound accepted for `max_size`
    pub max_cluster_size: u32,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            image: "registry.k8s.io/autoscaling/cluster-autoscaler:v1.29.0".to_string(),
            max_cluster_size: 50,
        }
    }
}

/// Orchestrator-wide limits
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitsConfig {
    /// Maximum provisioned nodes in one cluster
    pub max_nodes_per_cluster: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_cluster: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a configuration document
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Reject values no workflow can run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.ssh.retry_attempts == 0 {
            return Err(Error::config("ssh.retryAttempts must be at least 1"));
        }
        if self.ssh.base_port == 0 {
            return Err(Error::config("ssh.basePort must be non-zero"));
        }
        let highest = u32::from(self.ssh.base_port) + self.limits.max_nodes_per_cluster;
        if highest > u32::from(u16::MAX) {
            return Err(Error::config(format!(
                "ssh.basePort {} leaves no room for {} nodes",
                self.ssh.base_port, self.limits.max_nodes_per_cluster
            )));
        }
        if (self.ssh.base_port..=highest as u16).contains(&self.network.api_port) {
            return Err(Error::config(format!(
                "network.apiPort {} overlaps the SSH port range",
                self.network.api_port
            )));
        }
        if self.timeouts.poll_interval_secs == 0 {
            return Err(Error::config("timeouts.pollIntervalSecs must be non-zero"));
        }
        if self.bootstrap.join_window_secs < self.timeouts.poll_interval_secs {
            return Err(Error::config(
                "bootstrap.joinWindowSecs is shorter than the poll interval",
            ));
        }
        if self.limits.max_nodes_per_cluster == 0 {
            return Err(Error::config("limits.maxNodesPerCluster must be non-zero"));
        }
        if self.autoscaler.max_cluster_size > self.limits.max_nodes_per_cluster {
            return Err(Error::config(format!(
                "autoscaler.maxClusterSize {} exceeds limits.maxNodesPerCluster {}",
                self.autoscaler.max_cluster_size, self.limits.max_nodes_per_cluster
            )));
        }
        Ok(())
    }
}
