//! ManagedCluster record
//!
//! The cluster record is the single source of truth for a tenant's cluster
//! shape and lifecycle state. Workers mutate it only through the state
//! machine and the persistence layer.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::ClusterNode;
use super::types::{
    AutoscalingSpec, ClusterState, KubernetesVersion, NodeRole, RegistryCredentials,
    ServiceOffering,
};
use crate::Error;

/// A tenant's managed cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ManagedCluster {
    /// Cluster identity
    pub id: Uuid,
    /// Display name, also the hostname prefix of every node
    pub name: String,
    /// Owning account
    pub account_id: String,
    /// Zone the cluster is deployed in
    pub zone_id: String,
    /// Network the nodes attach to
    pub network_id: String,

    /// Desired number of control nodes
    pub control_nodes: u32,
    /// Desired number of worker nodes
    pub worker_nodes: u32,
    /// Desired number of dedicated etcd nodes (0 = colocated with control)
    #[serde(default)]
    pub etcd_nodes: u32,

    /// Sizing for worker nodes (and every role without an override)
    pub offering: ServiceOffering,
    /// Sizing override for control nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_offering: Option<ServiceOffering>,
    /// Sizing override for etcd nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_offering: Option<ServiceOffering>,
    /// Root disk size override in GiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk_gb: Option<u64>,

    /// Software version
    pub version: KubernetesVersion,
    /// Tenant SSH public key installed on every node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<String>,
    /// Autoscaling settings
    #[serde(default)]
    pub autoscaling: AutoscalingSpec,
    /// Private registry credentials passed to every node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryCredentials>,

    /// Lifecycle state
    #[serde(default)]
    pub state: ClusterState,
    /// Reason for the last failure transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// API endpoint once known (`https://addr:port/`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Public address used for API and SSH access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<IpAddr>,

    /// Allocated vCPUs across all members
    #[serde(default)]
    pub cores: u64,
    /// Allocated memory across all members in MiB
    #[serde(default)]
    pub memory_mb: u64,
    /// Number of membership records
    #[serde(default)]
    pub node_count: u32,

    /// Flagged for deferred garbage collection
    #[serde(default)]
    pub gc_pending: bool,
    /// Soft-delete timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<DateTime<Utc>>,
}

impl ManagedCluster {
    /// Offering used for nodes of the given role
    pub fn offering_for(&self, role: NodeRole) -> &ServiceOffering {
        match role {
            NodeRole::Control => self.control_offering.as_ref().unwrap_or(&self.offering),
            NodeRole::Etcd => self.etcd_offering.as_ref().unwrap_or(&self.offering),
            NodeRole::Worker => &self.offering,
        }
    }

    /// Total number of provisioned (non-external) nodes the shape asks for
    pub fn desired_node_count(&self) -> u32 {
        self.control_nodes + self.etcd_nodes + self.worker_nodes
    }

    /// Number of nodes expected in the orchestrated cluster's node list
    pub fn expected_ready_nodes(&self) -> u32 {
        self.control_nodes + self.worker_nodes
    }

    /// Returns true if the version supports more than one control node
    pub fn is_ha(&self) -> bool {
        self.control_nodes > 1
    }

    /// Recompute the accounting fields from the membership records
    pub fn sync_accounting(&mut self, nodes: &[ClusterNode]) {
        let mut cores = 0u64;
        let mut memory = 0u64;
        for node in nodes.iter().filter(|n| !n.is_external) {
            let offering = self.offering_for(node.role);
            cores += u64::from(offering.cpu_cores);
            memory += offering.memory_mb;
        }
        self.cores = cores;
        self.memory_mb = memory;
        self.node_count = nodes.len() as u32;
    }

    /// Validate the cluster shape
    ///
    /// `max_nodes` is the orchestrator-wide cap on provisioned nodes.
    pub fn validate(&self, max_nodes: u32) -> Result<(), Error> {
        let fail = |msg: String| Err(Error::validation_for(&self.name, msg));

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            || self.name.starts_with('-')
        {
            return fail(format!(
                "cluster name '{}' must be non-empty alphanumerics and dashes",
                self.name
            ));
        }
        if self.control_nodes == 0 {
            return fail("control node count must be at least 1".to_string());
        }
        if self.control_nodes > 1 && !self.version.ha_capable {
            return fail(format!(
                "version {} does not support multiple control nodes",
                self.version.semantic_version
            ));
        }
        if self.desired_node_count() > max_nodes {
            return fail(format!(
                "cluster asks for {} nodes, limit is {}",
                self.desired_node_count(),
                max_nodes
            ));
        }
        for role in [NodeRole::Control, NodeRole::Etcd, NodeRole::Worker] {
            let offering = self.offering_for(role);
            if offering.cpu_cores < self.version.min_cpu_cores
                || offering.memory_mb < self.version.min_memory_mb
            {
                return fail(format!(
                    "offering {} for {} nodes is below the minimum of {} vCPU / {} MiB",
                    offering.name, role, self.version.min_cpu_cores, self.version.min_memory_mb
                ));
            }
        }
        if self.autoscaling.enabled {
            validate_autoscaling_bounds(
                &self.name,
                self.autoscaling.min_size,
                self.autoscaling.max_size,
                max_nodes,
            )?;
        }
        Ok(())
    }
}

/// Validate autoscaler bounds against the node cap
pub fn validate_autoscaling_bounds(
    cluster: &str,
    min_size: u32,
    max_size: u32,
    max_nodes: u32,
) -> Result<(), Error> {
    if min_size < 1 {
        return Err(Error::validation_for(
            cluster,
            "autoscaling minimum size must be at least 1",
        ));
    }
    if max_size < min_size {
        return Err(Error::validation_for(
            cluster,
            format!("autoscaling maximum {max_size} is below minimum {min_size}"),
        ));
    }
    if max_size > max_nodes {
        return Err(Error::validation_for(
            cluster,
            format!("autoscaling maximum {max_size} exceeds limit {max_nodes}"),
        ));
    }
    Ok(())
}
