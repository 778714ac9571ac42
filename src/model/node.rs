//! ClusterNode membership record

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::NodeRole;

/// Membership of one compute instance in a cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterNode {
    /// Record identity
    pub id: Uuid,
    /// Owning cluster
    pub cluster_id: Uuid,
    /// Compute instance backing this node
    pub instance_id: String,
    /// Hostname, also the node name inside the orchestrated cluster
    pub name: String,
    /// Role of the node
    pub role: NodeRole,
    /// Supplied by the tenant rather than provisioned
    #[serde(default)]
    pub is_external: bool,
    /// External node needs a manual upgrade to the cluster version
    #[serde(default)]
    pub manual_upgrade_pending: bool,
    /// Node software version (`v1.29.4`)
    pub version: String,
    /// Ordinal position; SSH port is `base + ssh_port_offset`
    pub ssh_port_offset: u32,
    /// Private address on the cluster network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_address: Option<IpAddr>,
    /// Login user recorded at bootstrap, used when the management user fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_user: Option<String>,
    /// The node completed bootstrap at least once
    #[serde(default)]
    pub bootstrapped: bool,
}

impl ClusterNode {
    /// Create a membership record for a provisioned node
    pub fn new(
        cluster_id: Uuid,
        instance_id: impl Into<String>,
        name: impl Into<String>,
        role: NodeRole,
        ordinal: u32,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            instance_id: instance_id.into(),
            name: name.into(),
            role,
            is_external: false,
            manual_upgrade_pending: false,
            version: version.into(),
            ssh_port_offset: ordinal,
            private_address: None,
            login_user: None,
            bootstrapped: false,
        }
    }

    /// Mark the record as tenant-supplied
    pub fn external(mut self) -> Self {
        self.is_external = true;
        self
    }

    /// Set the private address
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.private_address = Some(address);
        self
    }
}

/// Hostname of the `index`-th (1-based) node of a role
pub fn node_name(cluster_name: &str, role: NodeRole, index: u32) -> String {
    format!("{}-{}-{}", cluster_name, role.name_fragment(), index)
}

/// Sort membership records by ordinal
pub fn sort_by_ordinal(nodes: &mut [ClusterNode]) {
    nodes.sort_by_key(|n| n.ssh_port_offset);
}

/// The provisioned control node with the lowest ordinal
///
/// This node initialised the control plane and is the target of every
/// cluster-level remote command.
pub fn primary_control_node(nodes: &[ClusterNode]) -> Option<&ClusterNode> {
    nodes
        .iter()
        .filter(|n| n.role == NodeRole::Control && !n.is_external)
        .min_by_key(|n| n.ssh_port_offset)
}

/// Next free ordinal after the current membership
pub fn next_ordinal(nodes: &[ClusterNode]) -> u32 {
    nodes
        .iter()
        .map(|n| n.ssh_port_offset + 1)
        .max()
        .unwrap_or(0)
}

/// Reassign ordinals so they are contiguous from zero, keeping order
///
/// Returns the records whose ordinal changed.
pub fn compact_ordinals(nodes: &mut [ClusterNode]) -> Vec<ClusterNode> {
    sort_by_ordinal(nodes);
    let mut changed = Vec::new();
    for (ordinal, node) in nodes.iter_mut().enumerate() {
        let ordinal = ordinal as u32;
        if node.ssh_port_offset != ordinal {
            node.ssh_port_offset = ordinal;
            changed.push(node.clone());
        }
    }
    changed
}
