//! Persistence of cluster and membership records

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::model::{ClusterEvent, ClusterNode, ClusterState, ManagedCluster};
use crate::Error;

/// Durable storage of cluster and node records
///
/// Implementations must make `transition` an atomic compare-and-set on the
/// stored state. `update_cluster` persists everything except `state`, which
/// only moves through `transition`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Insert a new cluster record
    async fn insert_cluster(&self, cluster: &ManagedCluster) -> Result<(), Error>;

    /// Load a cluster that has not been removed
    async fn get_cluster(&self, id: Uuid) -> Result<ManagedCluster, Error>;

    /// List clusters that have not been removed
    async fn list_clusters(&self) -> Result<Vec<ManagedCluster>, Error>;

    /// Persist every field but `state`
    async fn update_cluster(&self, cluster: &ManagedCluster) -> Result<(), Error>;

    /// Soft-delete a cluster record
    async fn remove_cluster(&self, id: Uuid) -> Result<(), Error>;

    /// Move the cluster from `from` to `to` if it is still in `from`
    ///
    /// `reason` replaces the stored failure message. Returns the stored
    /// record after the change.
    async fn transition(
        &self,
        id: Uuid,
        from: ClusterState,
        to: ClusterState,
        event: ClusterEvent,
        reason: Option<String>,
    ) -> Result<ManagedCluster, Error>;

    /// Membership records of a cluster
    async fn list_nodes(&self, cluster_id: Uuid) -> Result<Vec<ClusterNode>, Error>;

    /// Insert a membership record
    async fn insert_node(&self, node: &ClusterNode) -> Result<(), Error>;

    /// Replace a membership record
    async fn update_node(&self, node: &ClusterNode) -> Result<(), Error>;

    /// Delete a membership record
    async fn remove_node(&self, node_id: Uuid) -> Result<(), Error>;

    /// Store the admin credentials fetched from the control plane
    async fn store_cluster_config(&self, cluster_id: Uuid, config: &str) -> Result<(), Error>;

    /// Stored admin credentials, if any
    async fn cluster_config(&self, cluster_id: Uuid) -> Result<Option<String>, Error>;

    /// Clusters flagged for deferred garbage collection
    async fn clusters_pending_gc(&self) -> Result<Vec<ManagedCluster>, Error>;
}

/// One persisted state change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    /// State before
    pub from: ClusterState,
    /// State after
    pub to: ClusterState,
    /// Event that caused it
    pub event: ClusterEvent,
    /// Failure reason, if any
    pub reason: Option<String>,
}

/// In-process store backed by concurrent maps
///
/// Each map entry is locked for the duration of a read-modify-write, which
/// gives the per-cluster consistency the workers rely on.
#[derive(Default)]
pub struct InMemoryClusterStore {
    clusters: DashMap<Uuid, ManagedCluster>,
    nodes: DashMap<Uuid, ClusterNode>,
    configs: DashMap<Uuid, String>,
    history: DashMap<Uuid, Vec<TransitionRecord>>,
}

impl InMemoryClusterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitions recorded for a cluster, oldest first
    pub fn history(&self, cluster_id: Uuid) -> Vec<TransitionRecord> {
        self.history
            .get(&cluster_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Load a cluster including soft-deleted ones
    pub fn get_any(&self, id: Uuid) -> Option<ManagedCluster> {
        self.clusters.get(&id).map(|c| c.clone())
    }

    /// Number of membership records across all clusters
    pub fn node_record_count(&self) -> usize {
        self.nodes.len()
    }
}

#[async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn insert_cluster(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        if self.clusters.contains_key(&cluster.id) {
            return Err(Error::persistence(format!(
                "cluster {} already exists",
                cluster.id
            )));
        }
        self.clusters.insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn get_cluster(&self, id: Uuid) -> Result<ManagedCluster, Error> {
        self.clusters
            .get(&id)
            .filter(|c| c.removed_at.is_none())
            .map(|c| c.clone())
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))
    }

    async fn list_clusters(&self) -> Result<Vec<ManagedCluster>, Error> {
        Ok(self
            .clusters
            .iter()
            .filter(|c| c.removed_at.is_none())
            .map(|c| c.clone())
            .collect())
    }

    async fn update_cluster(&self, cluster: &ManagedCluster) -> Result<(), Error> {
        let mut entry = self
            .clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| Error::not_found("cluster", cluster.id.to_string()))?;
        let state = entry.state;
        *entry = cluster.clone();
        entry.state = state;
        Ok(())
    }

    async fn remove_cluster(&self, id: Uuid) -> Result<(), Error> {
        let mut entry = self
            .clusters
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))?;
        entry.removed_at = Some(Utc::now());
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ClusterState,
        to: ClusterState,
        event: ClusterEvent,
        reason: Option<String>,
    ) -> Result<ManagedCluster, Error> {
        let updated = {
            let mut entry = self
                .clusters
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("cluster", id.to_string()))?;
            if entry.state != from {
                return Err(Error::illegal_transition(id.to_string(), entry.state, event));
            }
            entry.state = to;
            entry.message = reason.clone();
            entry.clone()
        };

        self.history.entry(id).or_default().push(TransitionRecord {
            from,
            to,
            event,
            reason,
        });
        Ok(updated)
    }

    async fn list_nodes(&self, cluster_id: Uuid) -> Result<Vec<ClusterNode>, Error> {
        let mut nodes: Vec<ClusterNode> = self
            .nodes
            .iter()
            .filter(|n| n.cluster_id == cluster_id)
            .map(|n| n.clone())
            .collect();
        crate::model::sort_by_ordinal(&mut nodes);
        Ok(nodes)
    }

    async fn insert_node(&self, node: &ClusterNode) -> Result<(), Error> {
        self.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn update_node(&self, node: &ClusterNode) -> Result<(), Error> {
        let mut entry = self
            .nodes
            .get_mut(&node.id)
            .ok_or_else(|| Error::not_found("node", node.id.to_string()))?;
        *entry = node.clone();
        Ok(())
    }

    async fn remove_node(&self, node_id: Uuid) -> Result<(), Error> {
        self.nodes
            .remove(&node_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("node", node_id.to_string()))
    }

    async fn store_cluster_config(&self, cluster_id: Uuid, config: &str) -> Result<(), Error> {
        self.configs.insert(cluster_id, config.to_string());
        Ok(())
    }

    async fn cluster_config(&self, cluster_id: Uuid) -> Result<Option<String>, Error> {
        Ok(self.configs.get(&cluster_id).map(|c| c.clone()))
    }

    async fn clusters_pending_gc(&self) -> Result<Vec<ManagedCluster>, Error> {
        Ok(self
            .clusters
            .iter()
            .filter(|c| c.gc_pending && c.removed_at.is_none())
            .map(|c| c.clone())
            .collect())
    }
}
