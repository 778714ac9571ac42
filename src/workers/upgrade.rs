//! Rolling version upgrade

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{load, primary, reason, Context};
use crate::model::{ClusterEvent, ClusterNode, KubernetesVersion, ManagedCluster, NodeRole};
use crate::network::ClusterAccess;
use crate::provisioner::PayloadAttachments;
use crate::retry::Deadline;
use crate::Error;

/// Target version of an upgrade
#[derive(Clone, Debug)]
pub struct UpgradeRequest {
    /// Version to move every node to
    pub version: KubernetesVersion,
}

/// Upgrade every node, control nodes first
///
/// Each node is drained, upgraded, uncordoned and checked for the target
/// version before the next one starts; control nodes must also report
/// Ready. The first failing step aborts the upgrade and leaves the cluster
/// in `Error`. Nodes already upgraded stay upgraded. External nodes are
/// flagged for a manual upgrade instead.
#[instrument(skip(ctx, request), fields(cluster = %cluster_id, version = %request.version.semantic_version))]
pub async fn upgrade_cluster(
    ctx: &Context,
    cluster_id: Uuid,
    request: UpgradeRequest,
) -> Result<ManagedCluster, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    let target = validate_upgrade(ctx, &cluster, &request.version)?;

    ctx.state
        .transition(&mut cluster, ClusterEvent::UpgradeRequested, None)
        .await?;

    let mut attached = None;
    let result = upgrade_nodes(ctx, &target, nodes, &mut attached).await;
    if let Some(attachments) = attached.take() {
        ctx.provisioner.detach_payloads(attachments).await;
    }

    match result {
        Ok(()) => {
            cluster.version = target.version;
            ctx.store.update_cluster(&cluster).await?;
            ctx.state
                .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
                .await?;
            info!(cluster = %cluster.name, version = %cluster.version.semantic_version, "cluster upgraded");
            Ok(cluster)
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "upgrade aborted, upgraded nodes are not rolled back");
            ctx.state
                .fail(&mut cluster, ClusterEvent::OperationFailed, reason("upgrade", &e))
                .await;
            Err(e)
        }
    }
}

/// Cluster as it will look on the new version
fn validate_upgrade(
    ctx: &Context,
    cluster: &ManagedCluster,
    version: &KubernetesVersion,
) -> Result<ManagedCluster, Error> {
    let current = &cluster.version.semantic_version;
    let next = &version.semantic_version;

    if next <= current {
        return Err(Error::validation_for(
            &cluster.name,
            format!("cannot upgrade from {current} to {next}: target is not newer"),
        ));
    }
    if next.major != current.major || next.minor > current.minor + 1 {
        return Err(Error::validation_for(
            &cluster.name,
            format!("cannot upgrade from {current} to {next}: minor versions cannot be skipped"),
        ));
    }

    let mut target = cluster.clone();
    target.version = version.clone();
    target.validate(ctx.config.limits.max_nodes_per_cluster)?;
    Ok(target)
}

async fn upgrade_nodes(
    ctx: &Context,
    target: &ManagedCluster,
    nodes: Vec<ClusterNode>,
    attached: &mut Option<PayloadAttachments>,
) -> Result<(), Error> {
    let deadline = Deadline::after(ctx.config.timeouts.upgrade());
    let network = ctx.network.network(&target.network_id).await?;
    let access = ctx.network.access(&network, &nodes)?;
    let control = primary(target, &nodes)?;

    *attached = Some(ctx.provisioner.attach_payloads(target, &nodes).await?);

    let version = target.version.node_version();
    let mut order: Vec<ClusterNode> = nodes
        .into_iter()
        .filter(|n| n.role != NodeRole::Etcd)
        .collect();
    order.sort_by_key(|n| (n.role != NodeRole::Control, n.ssh_port_offset));

    let mut first_control = true;
    for mut node in order {
        if node.is_external {
            node.manual_upgrade_pending = true;
            ctx.store.update_node(&node).await?;
            info!(node = %node.name, "external node flagged for manual upgrade");
            continue;
        }

        let first = node.role == NodeRole::Control && first_control;
        upgrade_node(ctx, &access, &control, &node, &version, first, &deadline).await?;
        if node.role == NodeRole::Control {
            first_control = false;
        }

        node.version = version.clone();
        ctx.store.update_node(&node).await?;
        info!(node = %node.name, version = %version, "node upgraded");
    }
    Ok(())
}

async fn upgrade_node(
    ctx: &Context,
    access: &ClusterAccess,
    control: &ClusterNode,
    node: &ClusterNode,
    version: &str,
    first_control: bool,
    deadline: &Deadline,
) -> Result<(), Error> {
    ctx.remote
        .drain_and_cordon(access, control, &node.name)
        .await?;
    ctx.remote
        .run_upgrade(access, node, version, first_control)
        .await?;
    ctx.remote.uncordon(access, control, &node.name).await?;
    if node.role == NodeRole::Control {
        ctx.remote
            .wait_node_ready(access, control, &node.name, deadline)
            .await?;
    }
    ctx.remote
        .wait_node_version(access, control, &node.name, version, deadline)
        .await
}
