//! Supporting types for managed clusters

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// Cluster record exists, nothing provisioned yet
    #[default]
    Created,
    /// Instances are being created or started
    Starting,
    /// Cluster is operational
    Running,
    /// Instances are being stopped
    Stopping,
    /// All instances are stopped
    Stopped,
    /// Node count, offering or autoscaler is being changed
    Scaling,
    /// Nodes are being upgraded to a new version
    Upgrading,
    /// Cluster is degraded but recoverable by reconciliation
    Alert,
    /// A workflow failed; manual recovery or destroy required
    Error,
    /// Cluster resources are being torn down
    Destroying,
    /// All resources are gone (terminal)
    Destroyed,
}

impl ClusterState {
    /// Returns true for the terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Returns true while a workflow owns the cluster
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Stopping | Self::Scaling | Self::Upgrading | Self::Destroying
        )
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Scaling => "Scaling",
            Self::Upgrading => "Upgrading",
            Self::Alert => "Alert",
            Self::Error => "Error",
            Self::Destroying => "Destroying",
            Self::Destroyed => "Destroyed",
        };
        f.write_str(s)
    }
}

/// Event that drives a cluster state transition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ClusterEvent {
    /// Create or start the cluster
    StartRequested,
    /// Stop all instances
    StopRequested,
    /// Add nodes or grow the offering
    ScaleUpRequested,
    /// Remove nodes
    ScaleDownRequested,
    /// Upgrade the node software version
    UpgradeRequested,
    /// Enable, disable or resize the autoscaler
    AutoscaleRequested,
    /// Tear the cluster down
    DestroyRequested,
    /// The running workflow completed
    OperationSucceeded,
    /// The running workflow failed
    OperationFailed,
    /// Initial creation failed
    CreateFailed,
    /// Reconciliation found a degraded member
    FaultsDetected,
    /// Reconciliation found the cluster healthy again
    Recovered,
}

impl std::fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Role of a cluster member
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs the control plane / API server
    Control,
    /// Dedicated consensus-store node
    Etcd,
    /// Runs workloads only
    Worker,
}

impl NodeRole {
    /// Name fragment used in node hostnames
    pub fn name_fragment(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Etcd => "etcd",
            Self::Worker => "node",
        }
    }

    /// Returns true if the node registers with the orchestrated cluster
    ///
    /// Dedicated etcd nodes never show up in the cluster's node list.
    pub fn is_cluster_member(&self) -> bool {
        !matches!(self, Self::Etcd)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Etcd => write!(f, "etcd"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// CPU/RAM sizing of an instance
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceOffering {
    /// Offering identifier in the compute service
    pub id: String,
    /// Display name
    pub name: String,
    /// Number of vCPUs
    pub cpu_cores: u32,
    /// Speed per vCPU in MHz
    pub cpu_speed_mhz: u32,
    /// Memory in MiB
    pub memory_mb: u64,
}

impl ServiceOffering {
    /// Total CPU requirement in MHz
    pub fn cpu_mhz(&self) -> u64 {
        u64::from(self.cpu_cores) * u64::from(self.cpu_speed_mhz)
    }

    /// Returns true if any dimension of `self` is below `other`
    pub fn is_smaller_than(&self, other: &ServiceOffering) -> bool {
        self.cpu_cores < other.cpu_cores
            || self.cpu_speed_mhz < other.cpu_speed_mhz
            || self.memory_mb < other.memory_mb
    }
}

/// Software version a cluster runs, with its bootstrap medium
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KubernetesVersion {
    /// Version record identifier
    pub id: String,
    /// Semantic version (e.g. 1.29.4)
    pub semantic_version: semver::Version,
    /// Read-only medium carrying binaries and scripts for this version
    pub payload_image_id: String,
    /// Minimum vCPUs per node
    #[serde(default = "default_min_cpu")]
    pub min_cpu_cores: u32,
    /// Minimum memory per node in MiB
    #[serde(default = "default_min_memory")]
    pub min_memory_mb: u64,
    /// Whether multiple control nodes are supported
    #[serde(default)]
    pub ha_capable: bool,
}

fn default_min_cpu() -> u32 {
    2
}

fn default_min_memory() -> u64 {
    2048
}

impl KubernetesVersion {
    /// Version string as reported by nodes (`v1.29.4`)
    pub fn node_version(&self) -> String {
        format!("v{}", self.semantic_version)
    }
}

/// Autoscaling settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AutoscalingSpec {
    /// Whether the autoscaler agent is installed
    pub enabled: bool,
    /// Minimum worker count
    pub min_size: u32,
    /// Maximum worker count
    pub max_size: u32,
}

/// Private container registry credentials
///
/// The password never shows up in `Debug` output.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Registry URL
    pub url: String,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
