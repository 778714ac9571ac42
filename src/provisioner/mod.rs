//! Node provisioning
//!
//! [`NodeProvisioner`] drives one instance from nothing to a running,
//! recorded cluster member, and manages the payload medium nodes bootstrap
//! from. A [`PayloadAttachments`] value is returned for every successful
//! attach and has to be handed back to [`NodeProvisioner::detach_payloads`],
//! which consumes it so each medium is detached exactly once.

mod compute;

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::BootstrapPayload;
use crate::model::{ClusterNode, ManagedCluster, NodeRole, ServiceOffering};
use crate::state::ClusterStore;
use crate::Error;

pub use compute::{ComputeService, InstanceInfo, InstanceSpec, PayloadService, PowerState};

#[cfg(test)]
pub use compute::{MockComputeService, MockPayloadService};

/// One node to provision
#[derive(Debug)]
pub struct NodeRequest {
    /// Hostname
    pub name: String,
    /// Role in the cluster
    pub role: NodeRole,
    /// Ordinal position (SSH port offset)
    pub ordinal: u32,
    /// Bootstrap document handed over as user data
    pub payload: Option<BootstrapPayload>,
}

/// Payload media currently attached for a cluster
///
/// Must be passed to [`NodeProvisioner::detach_payloads`].
#[must_use = "attached payloads must be detached"]
#[derive(Debug)]
pub struct PayloadAttachments {
    cluster: String,
    instance_ids: Vec<String>,
}

impl PayloadAttachments {
    /// Instances that have the payload attached
    pub fn instance_ids(&self) -> &[String] {
        &self.instance_ids
    }

    /// Number of attached instances
    pub fn len(&self) -> usize {
        self.instance_ids.len()
    }

    /// Returns true if nothing is attached
    pub fn is_empty(&self) -> bool {
        self.instance_ids.is_empty()
    }
}

/// Creates, starts, stops and destroys cluster members
#[derive(Clone)]
pub struct NodeProvisioner {
    compute: Arc<dyn ComputeService>,
    payloads: Arc<dyn PayloadService>,
    store: Arc<dyn ClusterStore>,
}

impl NodeProvisioner {
    /// Create a provisioner
    pub fn new(
        compute: Arc<dyn ComputeService>,
        payloads: Arc<dyn PayloadService>,
        store: Arc<dyn ClusterStore>,
    ) -> Self {
        Self {
            compute,
            payloads,
            store,
        }
    }

    /// The compute service
    pub fn compute(&self) -> &Arc<dyn ComputeService> {
        &self.compute
    }

    /// Create, record, resize and start one node
    ///
    /// The membership record is persisted as soon as the instance exists so
    /// a failure later on still leaves it discoverable for cleanup. The node
    /// must report `Running` after start; anything else is a
    /// `ProvisioningFailure`.
    #[instrument(skip(self, cluster, request), fields(cluster = %cluster.name, node = %request.name, role = %request.role))]
    pub async fn provision_node(
        &self,
        cluster: &ManagedCluster,
        request: NodeRequest,
    ) -> Result<ClusterNode, Error> {
        let offering = cluster.offering_for(request.role);
        let spec = InstanceSpec {
            name: request.name.clone(),
            zone_id: cluster.zone_id.clone(),
            network_id: cluster.network_id.clone(),
            offering_id: offering.id.clone(),
            user_data: request.payload.as_ref().map(BootstrapPayload::encoded),
            account_id: cluster.account_id.clone(),
        };

        let instance = self
            .compute
            .create_instance(&spec)
            .await
            .map_err(|e| provisioning_error(cluster, &request.name, "create instance", e))?;
        debug!(instance = %instance.id, state = %instance.state, "instance created");

        let mut node = ClusterNode::new(
            cluster.id,
            &instance.id,
            &request.name,
            request.role,
            request.ordinal,
            cluster.version.node_version(),
        );
        node.private_address = instance.private_address;
        self.store.insert_node(&node).await?;

        if let Some(size_gb) = cluster.root_disk_gb {
            self.compute
                .resize_root_volume(&instance.id, size_gb)
                .await
                .map_err(|e| provisioning_error(cluster, &node.name, "resize root volume", e))?;
        }

        if instance.state != PowerState::Running {
            self.compute
                .start_instance(&instance.id)
                .await
                .map_err(|e| provisioning_error(cluster, &node.name, "start instance", e))?;
        }
        let running = self.expect_state(cluster, &node, PowerState::Running).await?;

        if node.private_address.is_none() && running.private_address.is_some() {
            node.private_address = running.private_address;
            self.store.update_node(&node).await?;
        }

        info!(instance = %node.instance_id, ordinal = node.ssh_port_offset, address = ?node.private_address, "node provisioned");
        Ok(node)
    }

    async fn expect_state(
        &self,
        cluster: &ManagedCluster,
        node: &ClusterNode,
        expected: PowerState,
    ) -> Result<InstanceInfo, Error> {
        let info = self
            .compute
            .get_instance(&node.instance_id)
            .await
            .map_err(|e| provisioning_error(cluster, &node.name, "describe instance", e))?
            .ok_or_else(|| {
                Error::provisioning(
                    &cluster.name,
                    &node.name,
                    format!("instance {} no longer exists", node.instance_id),
                )
            })?;
        if info.state != expected {
            return Err(Error::provisioning(
                &cluster.name,
                &node.name,
                format!("instance is {}, expected {}", info.state, expected),
            ));
        }
        Ok(info)
    }

    /// Attach the version's payload medium to every provisioned node
    ///
    /// External nodes are skipped. If one attach fails, the media attached
    /// by this call are detached again before the error is returned.
    #[instrument(skip(self, cluster, nodes), fields(cluster = %cluster.name, nodes = nodes.len()))]
    pub async fn attach_payloads(
        &self,
        cluster: &ManagedCluster,
        nodes: &[ClusterNode],
    ) -> Result<PayloadAttachments, Error> {
        let image = &cluster.version.payload_image_id;
        let mut attached = PayloadAttachments {
            cluster: cluster.name.clone(),
            instance_ids: Vec::new(),
        };

        for node in nodes.iter().filter(|n| !n.is_external) {
            if let Err(e) = self.payloads.attach(image, &node.instance_id).await {
                warn!(node = %node.name, error = %e, attached = attached.len(), "payload attach failed, rolling back");
                self.detach_payloads(attached).await;
                return Err(provisioning_error(cluster, &node.name, "attach payload", e));
            }
            attached.instance_ids.push(node.instance_id.clone());
        }

        info!(image = %image, attached = attached.len(), "payloads attached");
        Ok(attached)
    }

    /// Detach every medium in `attachments`
    ///
    /// Best-effort: failures are logged and the remaining media are still
    /// detached. Returns how many were detached.
    pub async fn detach_payloads(&self, attachments: PayloadAttachments) -> usize {
        let mut detached = 0;
        for instance_id in &attachments.instance_ids {
            match self.payloads.detach(instance_id).await {
                Ok(()) => detached += 1,
                Err(e) => {
                    warn!(cluster = %attachments.cluster, instance = %instance_id, error = %e, "payload detach failed")
                }
            }
        }
        debug!(cluster = %attachments.cluster, detached, total = attachments.len(), "payloads detached");
        detached
    }

    /// Destroy a node's instance and confirm it is gone
    ///
    /// An instance that no longer exists counts as destroyed, so the call
    /// is safe to repeat.
    #[instrument(skip(self, cluster, node), fields(cluster = %cluster.name, node = %node.name))]
    pub async fn destroy_node(&self, cluster: &ManagedCluster, node: &ClusterNode) -> Result<(), Error> {
        let current = self
            .compute
            .get_instance(&node.instance_id)
            .await
            .map_err(|e| provisioning_error(cluster, &node.name, "describe instance", e))?;
        if is_gone(current.as_ref()) {
            debug!("instance already gone");
            return Ok(());
        }

        self.compute
            .destroy_instance(&node.instance_id)
            .await
            .map_err(|e| provisioning_error(cluster, &node.name, "destroy instance", e))?;

        let after = self
            .compute
            .get_instance(&node.instance_id)
            .await
            .map_err(|e| provisioning_error(cluster, &node.name, "describe instance", e))?;
        if !is_gone(after.as_ref()) {
            return Err(Error::provisioning(
                &cluster.name,
                &node.name,
                format!("instance {} still exists after destroy", node.instance_id),
            ));
        }
        info!(instance = %node.instance_id, "instance destroyed");
        Ok(())
    }

    /// Start or stop every provisioned node and verify the outcome
    ///
    /// Nodes are driven concurrently. Nodes already in `desired` are left
    /// alone. Any node not ending in `desired` fails the whole call.
    #[instrument(skip(self, cluster, nodes), fields(cluster = %cluster.name, desired = %desired))]
    pub async fn ensure_power_state(
        &self,
        cluster: &ManagedCluster,
        nodes: &[ClusterNode],
        desired: PowerState,
    ) -> Result<(), Error> {
        if !matches!(desired, PowerState::Running | PowerState::Stopped) {
            return Err(Error::validation_for(
                &cluster.name,
                format!("cannot drive instances to {desired}"),
            ));
        }
        let members = nodes.iter().filter(|n| !n.is_external);
        try_join_all(members.map(|node| self.ensure_node_power(cluster, node, desired))).await?;
        Ok(())
    }

    async fn ensure_node_power(
        &self,
        cluster: &ManagedCluster,
        node: &ClusterNode,
        desired: PowerState,
    ) -> Result<(), Error> {
        let current = self
            .compute
            .get_instance(&node.instance_id)
            .await
            .map_err(|e| provisioning_error(cluster, &node.name, "describe instance", e))?;
        if current.as_ref().map(|i| i.state) == Some(desired) {
            return Ok(());
        }

        let result = if desired == PowerState::Running {
            self.compute.start_instance(&node.instance_id).await
        } else {
            self.compute.stop_instance(&node.instance_id).await
        };
        result.map_err(|e| provisioning_error(cluster, &node.name, "change power state", e))?;
        self.expect_state(cluster, node, desired).await?;
        debug!(node = %node.name, state = %desired, "power state reached");
        Ok(())
    }

    /// Move a node to a different offering
    pub async fn scale_node(
        &self,
        cluster: &ManagedCluster,
        node: &ClusterNode,
        offering: &ServiceOffering,
    ) -> Result<(), Error> {
        self.compute
            .scale_instance(&node.instance_id, &offering.id)
            .await
            .map_err(|e| provisioning_error(cluster, &node.name, "scale instance", e))?;
        info!(cluster = %cluster.name, node = %node.name, offering = %offering.name, "node scaled");
        Ok(())
    }

    /// Describe every instance on the cluster's network
    pub async fn network_instances(&self, cluster: &ManagedCluster) -> Result<Vec<InstanceInfo>, Error> {
        self.compute
            .list_network_instances(&cluster.network_id)
            .await
            .map_err(|e| provisioning_error(cluster, &cluster.network_id, "list network instances", e))
    }
}

fn is_gone(instance: Option<&InstanceInfo>) -> bool {
    instance.map_or(true, |i| i.state == PowerState::Destroyed)
}

fn provisioning_error(cluster: &ManagedCluster, node: &str, action: &str, e: Error) -> Error {
    match e {
        Error::ProvisioningFailure { .. } => e,
        other => Error::provisioning(&cluster.name, node, format!("{action}: {other}")),
    }
}
