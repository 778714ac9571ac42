//! Vertical and horizontal scaling

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    free_name_index, join_endpoint, load, persist_accounting, primary, reason, resync_accounting,
    Context, PayloadContext,
};
use crate::bootstrap::PayloadKind;
use crate::model::{
    compact_ordinals, next_ordinal, node_name, ClusterEvent, ClusterNode, ManagedCluster,
    NodeRole, ServiceOffering,
};
use crate::network::NetworkInfo;
use crate::planner::units_for;
use crate::provisioner::{NodeRequest, PayloadAttachments};
use crate::retry::Deadline;
use crate::Error;

/// Requested change of a running cluster
#[derive(Clone, Debug, Default)]
pub struct ScaleRequest {
    /// New offering for nodes sized by the cluster's default offering
    pub offering: Option<ServiceOffering>,
    /// New worker count
    pub worker_nodes: Option<u32>,
}

/// Change the offering and/or worker count of a cluster
///
/// Downscaling removes the highest-ordinal workers first. Upscaling
/// provisions new workers and re-applies the full rule set so the SSH range
/// stays contiguous. A smaller offering is rejected, as is a node-count
/// change while the autoscaler owns the count. Failures leave the cluster
/// in `Alert`.
#[instrument(skip(ctx, request), fields(cluster = %cluster_id))]
pub async fn scale_cluster(
    ctx: &Context,
    cluster_id: Uuid,
    request: ScaleRequest,
) -> Result<ManagedCluster, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    let target = validate_request(ctx, &cluster, &request)?;

    let event = if target.worker_nodes < cluster.worker_nodes {
        ClusterEvent::ScaleDownRequested
    } else {
        ClusterEvent::ScaleUpRequested
    };
    ctx.state.transition(&mut cluster, event, None).await?;

    let mut attached = None;
    let result = apply_scale(ctx, &mut cluster, nodes, &target, &mut attached).await;
    if let Some(attachments) = attached.take() {
        ctx.provisioner.detach_payloads(attachments).await;
    }

    match result {
        Ok(()) => {
            ctx.state
                .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
                .await?;
            info!(
                cluster = %cluster.name,
                workers = cluster.worker_nodes,
                offering = %cluster.offering.name,
                "cluster scaled"
            );
            Ok(cluster)
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "scaling failed");
            resync_accounting(ctx, &mut cluster).await;
            ctx.state
                .fail(&mut cluster, ClusterEvent::OperationFailed, reason("scale", &e))
                .await;
            Err(e)
        }
    }
}

/// Cluster as it should look after the request
fn validate_request(
    ctx: &Context,
    cluster: &ManagedCluster,
    request: &ScaleRequest,
) -> Result<ManagedCluster, Error> {
    let mut target = cluster.clone();
    let mut changed = false;

    if let Some(count) = request.worker_nodes {
        if count != cluster.worker_nodes {
            if cluster.autoscaling.enabled {
                return Err(Error::validation_for(
                    &cluster.name,
                    "node count is managed by the autoscaler; disable autoscaling first",
                ));
            }
            target.worker_nodes = count;
            changed = true;
        }
    }

    if let Some(offering) = &request.offering {
        if offering.is_smaller_than(&cluster.offering) {
            return Err(Error::validation_for(
                &cluster.name,
                format!(
                    "offering {} is smaller than the current {}; scaling down an offering is not supported",
                    offering.name, cluster.offering.name
                ),
            ));
        }
        if offering.id != cluster.offering.id {
            target.offering = offering.clone();
            changed = true;
        }
    }

    if !changed {
        return Err(Error::validation_for(&cluster.name, "nothing to scale"));
    }
    target.validate(ctx.config.limits.max_nodes_per_cluster)?;
    Ok(target)
}

async fn apply_scale(
    ctx: &Context,
    cluster: &mut ManagedCluster,
    mut nodes: Vec<ClusterNode>,
    target: &ManagedCluster,
    attached: &mut Option<PayloadAttachments>,
) -> Result<(), Error> {
    let deadline = Deadline::after(ctx.config.timeouts.scale());
    let network = ctx.network.network(&cluster.network_id).await?;

    if target.offering.id != cluster.offering.id {
        let old = cluster.offering.id.clone();
        for node in nodes
            .iter()
            .filter(|n| !n.is_external && cluster.offering_for(n.role).id == old)
        {
            ctx.provisioner
                .scale_node(cluster, node, &target.offering)
                .await?;
        }
        cluster.offering = target.offering.clone();
        persist_accounting(ctx, cluster, &nodes).await?;
    }

    let current = provisioned_workers(&nodes).len() as u32;
    if target.worker_nodes < current {
        nodes = shrink(ctx, cluster, &network, nodes, current - target.worker_nodes).await?;
    } else if target.worker_nodes > current {
        grow(
            ctx,
            cluster,
            &network,
            &mut nodes,
            target.worker_nodes - current,
            &deadline,
            attached,
        )
        .await?;
    }

    cluster.worker_nodes = target.worker_nodes;
    persist_accounting(ctx, cluster, &nodes).await
}

fn provisioned_workers(nodes: &[ClusterNode]) -> Vec<&ClusterNode> {
    nodes
        .iter()
        .filter(|n| n.role == NodeRole::Worker && !n.is_external)
        .collect()
}

/// Remove the `count` highest-ordinal workers
async fn shrink(
    ctx: &Context,
    cluster: &ManagedCluster,
    network: &NetworkInfo,
    mut nodes: Vec<ClusterNode>,
    count: u32,
) -> Result<Vec<ClusterNode>, Error> {
    let access = ctx.network.access(network, &nodes)?;
    let control = primary(cluster, &nodes)?;

    let mut victims: Vec<ClusterNode> = provisioned_workers(&nodes).into_iter().cloned().collect();
    victims.sort_by_key(|n| std::cmp::Reverse(n.ssh_port_offset));
    victims.truncate(count as usize);

    for victim in victims {
        info!(cluster = %cluster.name, node = %victim.name, ordinal = victim.ssh_port_offset, "removing worker");
        ctx.remote
            .drain_and_cordon(&access, &control, &victim.name)
            .await?;
        ctx.remote
            .delete_node(&access, &control, &victim.name)
            .await?;
        ctx.provisioner.destroy_node(cluster, &victim).await?;

        nodes.retain(|n| n.id != victim.id);
        ctx.network.release_node(network, &nodes, &victim).await?;
        ctx.store.remove_node(victim.id).await?;
    }

    for moved in compact_ordinals(&mut nodes) {
        debug!(node = %moved.name, ordinal = moved.ssh_port_offset, "ordinal compacted");
        ctx.store.update_node(&moved).await?;
    }
    ctx.network.apply(network, &nodes).await?;
    Ok(nodes)
}

/// Provision `count` new workers and join them
async fn grow(
    ctx: &Context,
    cluster: &ManagedCluster,
    network: &NetworkInfo,
    nodes: &mut Vec<ClusterNode>,
    count: u32,
    deadline: &Deadline,
    attached: &mut Option<PayloadAttachments>,
) -> Result<(), Error> {
    ctx.planner
        .plan(cluster, &units_for(cluster, 0, 0, count))
        .await?;

    let access = ctx.network.access(network, nodes)?;
    let control = primary(cluster, nodes)?;
    let (token, _) = ctx.join_credentials(cluster);
    ctx.remote
        .create_join_token(&access, &control, &token, ctx.config.bootstrap.join_window())
        .await?;

    let endpoint = join_endpoint(ctx, network, &control.name, control.private_address);
    let payloads = PayloadContext {
        cluster,
        token: &token,
        certificate_key: None,
        tls: None,
        cert_sans: Vec::new(),
    };

    let mut added = Vec::new();
    for _ in 0..count {
        let name = node_name(
            &cluster.name,
            NodeRole::Worker,
            free_name_index(cluster, nodes, NodeRole::Worker),
        );
        let payload = payloads.render(ctx, &name, PayloadKind::Worker, &endpoint)?;
        let node = ctx
            .provisioner
            .provision_node(
                cluster,
                NodeRequest {
                    name,
                    role: NodeRole::Worker,
                    ordinal: next_ordinal(nodes),
                    payload: Some(payload),
                },
            )
            .await?;
        nodes.push(node.clone());
        added.push(node);
    }

    // Always the full membership, so the range is re-derived from scratch
    let access = ctx.network.apply(network, nodes).await?;
    *attached = Some(ctx.provisioner.attach_payloads(cluster, &added).await?);

    let expected = nodes.iter().filter(|n| n.role != NodeRole::Etcd).count() as u32;
    ctx.remote
        .wait_ready_node_count(&access, &control, expected, deadline)
        .await?;

    if let Some(attachments) = attached.take() {
        ctx.provisioner.detach_payloads(attachments).await;
    }
    for node in added.iter_mut() {
        node.bootstrapped = true;
        ctx.store.update_node(node).await?;
        if let Some(stored) = nodes.iter_mut().find(|n| n.id == node.id) {
            stored.bootstrapped = true;
        }
    }
    Ok(())
}
