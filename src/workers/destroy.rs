//! Cluster teardown

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{load, reason, Context};
use crate::model::{ClusterEvent, ClusterNode, ManagedCluster};
use crate::provisioner::PowerState;
use crate::Error;

/// Options of a destroy
#[derive(Clone, Copy, Debug, Default)]
pub struct DestroyRequest {
    /// Delete the network itself rather than only the cluster's rules
    pub cleanup_network: bool,
}

/// Destroy every member instance, then the rules, then the record
///
/// When the network is to be deleted, instances on it that are not
/// members block the destroy before anything is touched. If any instance
/// or rule cannot be removed, the cluster is flagged for garbage
/// collection and left in `Error` with its record intact.
#[instrument(skip(ctx), fields(cluster = %cluster_id, cleanup_network = request.cleanup_network))]
pub async fn destroy_cluster(
    ctx: &Context,
    cluster_id: Uuid,
    request: DestroyRequest,
) -> Result<ManagedCluster, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    if request.cleanup_network {
        ensure_network_unshared(ctx, &cluster, &nodes).await?;
    }

    ctx.state
        .transition(&mut cluster, ClusterEvent::DestroyRequested, None)
        .await?;

    if let Err(e) = teardown(ctx, &cluster, &nodes, request).await {
        warn!(cluster = %cluster.name, error = %e, "destroy incomplete, flagging for garbage collection");
        cluster.gc_pending = true;
        if let Err(update) = ctx.store.update_cluster(&cluster).await {
            warn!(cluster = %cluster.name, error = %update, "failed to flag cluster for garbage collection");
        }
        ctx.state
            .fail(&mut cluster, ClusterEvent::OperationFailed, reason("destroy", &e))
            .await;
        return Err(e);
    }

    for node in &nodes {
        ctx.store.remove_node(node.id).await?;
    }
    cluster.gc_pending = false;
    cluster.node_count = 0;
    cluster.cores = 0;
    cluster.memory_mb = 0;
    ctx.store.update_cluster(&cluster).await?;
    ctx.state
        .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
        .await?;
    ctx.store.remove_cluster(cluster.id).await?;

    info!(cluster = %cluster.name, "cluster destroyed");
    Ok(cluster)
}

/// Fail if an instance that is not a member lives on the cluster's network
async fn ensure_network_unshared(
    ctx: &Context,
    cluster: &ManagedCluster,
    nodes: &[ClusterNode],
) -> Result<(), Error> {
    let foreign: Vec<String> = ctx
        .provisioner
        .network_instances(cluster)
        .await?
        .into_iter()
        .filter(|i| i.state != PowerState::Destroyed)
        .filter(|i| !nodes.iter().any(|n| n.instance_id == i.id))
        .map(|i| i.id)
        .collect();

    if foreign.is_empty() {
        return Ok(());
    }
    Err(Error::validation_for(
        &cluster.name,
        format!(
            "network {} is used by instances outside the cluster: {}",
            cluster.network_id,
            foreign.join(", ")
        ),
    ))
}

async fn teardown(
    ctx: &Context,
    cluster: &ManagedCluster,
    nodes: &[ClusterNode],
    request: DestroyRequest,
) -> Result<(), Error> {
    // Keep going past failures so one stuck instance does not strand the rest
    let mut first_error = None;
    for node in nodes.iter().filter(|n| !n.is_external) {
        if let Err(e) = ctx.provisioner.destroy_node(cluster, node).await {
            warn!(node = %node.name, error = %e, "instance destroy failed");
            first_error.get_or_insert(e);
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let network = ctx.network.network(&cluster.network_id).await?;
    ctx.network.revoke_all(&network).await?;
    if request.cleanup_network {
        ctx.network.delete_network(&cluster.network_id).await?;
        info!(network = %cluster.network_id, "network deleted");
    }
    Ok(())
}
