//! Cluster and membership records
//!
//! - [`ManagedCluster`] - desired shape, version and lifecycle state
//! - [`ClusterNode`] - membership of one compute instance

mod cluster;
mod node;
mod types;

pub use cluster::{validate_autoscaling_bounds, ManagedCluster};
pub use node::{
    compact_ordinals, next_ordinal, node_name, primary_control_node, sort_by_ordinal, ClusterNode,
};
pub use types::{
    AutoscalingSpec, ClusterEvent, ClusterState, KubernetesVersion, NodeRole, RegistryCredentials,
    ServiceOffering,
};

#[cfg(test)]
pub(crate) use cluster::fixtures;
