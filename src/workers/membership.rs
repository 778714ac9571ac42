//! Admitting and evicting externally supplied nodes
//!
//! External nodes are instances the tenant created on the cluster's
//! network. They join as workers, get their own SSH forward like any other
//! member, and never change the cluster's provisioned node counts. A node
//! that fails validation or joining is rejected and the batch continues.

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    join_endpoint, load, persist_accounting, primary, reason, resync_accounting, Context,
};
use crate::bootstrap::JoinToken;
use crate::model::{
    compact_ordinals, next_ordinal, ClusterEvent, ClusterNode, ManagedCluster, NodeRole,
};
use crate::network::{ClusterAccess, NetworkInfo};
use crate::provisioner::PowerState;
use crate::retry::Deadline;
use crate::Error;

/// An instance offered as a cluster member
#[derive(Clone, Debug)]
pub struct ExternalNode {
    /// Compute instance id
    pub instance_id: String,
    /// Login user to fall back to when the management user is refused
    pub login_user: Option<String>,
}

/// A node the batch skipped, and why
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedNode {
    /// Compute instance id
    pub instance_id: String,
    /// Human-readable reason
    pub reason: String,
}

/// Result of an add or remove batch
#[derive(Clone, Debug)]
pub struct MembershipOutcome {
    /// Cluster after the batch
    pub cluster: ManagedCluster,
    /// Nodes admitted or removed
    pub changed: Vec<ClusterNode>,
    /// Nodes skipped
    pub rejected: Vec<RejectedNode>,
}

/// Admit external nodes as workers
#[instrument(skip(ctx, offered), fields(cluster = %cluster_id, offered = offered.len()))]
pub async fn add_nodes(
    ctx: &Context,
    cluster_id: Uuid,
    offered: Vec<ExternalNode>,
) -> Result<MembershipOutcome, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    ctx.state
        .transition(&mut cluster, ClusterEvent::ScaleUpRequested, None)
        .await?;

    let result = admit_all(ctx, &mut cluster, nodes, offered).await;
    finish(ctx, cluster, result, "add nodes").await
}

/// Evict external nodes by instance id
#[instrument(skip(ctx, instance_ids), fields(cluster = %cluster_id, requested = instance_ids.len()))]
pub async fn remove_nodes(
    ctx: &Context,
    cluster_id: Uuid,
    instance_ids: Vec<String>,
) -> Result<MembershipOutcome, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    ctx.state
        .transition(&mut cluster, ClusterEvent::ScaleDownRequested, None)
        .await?;

    let result = evict_all(ctx, &mut cluster, nodes, instance_ids).await;
    finish(ctx, cluster, result, "remove nodes").await
}

type Batch = (Vec<ClusterNode>, Vec<RejectedNode>);

async fn finish(
    ctx: &Context,
    mut cluster: ManagedCluster,
    result: Result<Batch, Error>,
    action: &str,
) -> Result<MembershipOutcome, Error> {
    match result {
        Ok((changed, rejected)) => {
            ctx.state
                .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
                .await?;
            info!(
                cluster = %cluster.name,
                changed = changed.len(),
                rejected = rejected.len(),
                "{action} finished"
            );
            Ok(MembershipOutcome {
                cluster,
                changed,
                rejected,
            })
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "{action} failed");
            resync_accounting(ctx, &mut cluster).await;
            ctx.state
                .fail(&mut cluster, ClusterEvent::OperationFailed, reason(action, &e))
                .await;
            Err(e)
        }
    }
}

fn reject(instance_id: &str, error: &Error) -> RejectedNode {
    warn!(instance = %instance_id, error = %error, "node rejected");
    RejectedNode {
        instance_id: instance_id.to_string(),
        reason: error.to_string(),
    }
}

async fn admit_all(
    ctx: &Context,
    cluster: &mut ManagedCluster,
    mut nodes: Vec<ClusterNode>,
    offered: Vec<ExternalNode>,
) -> Result<Batch, Error> {
    let deadline = Deadline::after(ctx.config.timeouts.add_node());
    let network = ctx.network.network(&cluster.network_id).await?;
    let control = primary(cluster, &nodes)?;
    let access = ctx.network.access(&network, &nodes)?;
    let (token, _) = ctx.join_credentials(cluster);
    ctx.remote
        .create_join_token(&access, &control, &token, ctx.config.bootstrap.join_window())
        .await?;
    let endpoint = join_endpoint(ctx, &network, &control.name, control.private_address);

    let mut admitted = Vec::new();
    let mut rejected = Vec::new();
    for external in offered {
        let candidate = match qualify(ctx, cluster, &nodes, &external).await {
            Ok(candidate) => candidate,
            Err(e) => {
                rejected.push(reject(&external.instance_id, &e));
                continue;
            }
        };

        let join = Join {
            network: &network,
            control: &control,
            endpoint: &endpoint,
            token: &token,
            deadline: &deadline,
        };
        match admit(ctx, &join, &nodes, candidate.clone()).await {
            Ok(node) => {
                info!(node = %node.name, ordinal = node.ssh_port_offset, "external node admitted");
                nodes.push(node.clone());
                admitted.push(node);
            }
            Err(e) => {
                if let Err(release) = ctx.network.release_node(&network, &nodes, &candidate).await {
                    warn!(node = %candidate.name, error = %release, "failed to release rejected node's rules");
                }
                rejected.push(reject(&external.instance_id, &e));
            }
        }
    }

    persist_accounting(ctx, cluster, &nodes).await?;
    Ok((admitted, rejected))
}

/// Membership record for an offered instance, if it qualifies
async fn qualify(
    ctx: &Context,
    cluster: &ManagedCluster,
    nodes: &[ClusterNode],
    external: &ExternalNode,
) -> Result<ClusterNode, Error> {
    let invalid = |msg: String| Error::validation_for(&cluster.name, msg);

    if nodes.iter().any(|n| n.instance_id == external.instance_id) {
        return Err(invalid(format!(
            "instance {} is already a member",
            external.instance_id
        )));
    }
    let info = ctx
        .provisioner
        .compute()
        .get_instance(&external.instance_id)
        .await?
        .ok_or_else(|| Error::not_found("instance", &external.instance_id))?;
    if info.network_id != cluster.network_id {
        return Err(invalid(format!(
            "instance {} is on network {}, not {}",
            info.id, info.network_id, cluster.network_id
        )));
    }
    if info.state != PowerState::Running {
        return Err(invalid(format!("instance {} is {}", info.id, info.state)));
    }
    let address = info
        .private_address
        .ok_or_else(|| invalid(format!("instance {} has no address", info.id)))?;

    let mut node = ClusterNode::new(
        cluster.id,
        &info.id,
        &info.name,
        NodeRole::Worker,
        next_ordinal(nodes),
        cluster.version.node_version(),
    )
    .external()
    .with_address(address);
    node.login_user = external.login_user.clone();
    Ok(node)
}

struct Join<'a> {
    network: &'a NetworkInfo,
    control: &'a ClusterNode,
    endpoint: &'a str,
    token: &'a JoinToken,
    deadline: &'a Deadline,
}

async fn admit(
    ctx: &Context,
    join: &Join<'_>,
    nodes: &[ClusterNode],
    mut node: ClusterNode,
) -> Result<ClusterNode, Error> {
    let mut members = nodes.to_vec();
    members.push(node.clone());
    let access: ClusterAccess = ctx.network.apply(join.network, &members).await?;

    ctx.remote.validate_node_dependencies(&access, &node).await?;
    ctx.remote
        .join_node(&access, &node, join.endpoint, join.token, None)
        .await?;
    ctx.remote
        .wait_node_ready(&access, join.control, &node.name, join.deadline)
        .await?;

    node.bootstrapped = true;
    ctx.store.insert_node(&node).await?;
    Ok(node)
}

async fn evict_all(
    ctx: &Context,
    cluster: &mut ManagedCluster,
    mut nodes: Vec<ClusterNode>,
    instance_ids: Vec<String>,
) -> Result<Batch, Error> {
    let network = ctx.network.network(&cluster.network_id).await?;
    let control = primary(cluster, &nodes)?;
    let access = ctx.network.access(&network, &nodes)?;

    let mut removed = Vec::new();
    let mut rejected = Vec::new();
    for instance_id in instance_ids {
        let Some(node) = nodes
            .iter()
            .find(|n| n.is_external && n.instance_id == instance_id)
            .cloned()
        else {
            let e = Error::validation_for(
                &cluster.name,
                format!("instance {instance_id} is not an external member"),
            );
            rejected.push(reject(&instance_id, &e));
            continue;
        };

        let remaining: Vec<ClusterNode> = nodes.iter().filter(|n| n.id != node.id).cloned().collect();
        match evict(ctx, &network, &access, &control, &remaining, &node).await {
            Ok(()) => {
                info!(node = %node.name, "external node removed");
                nodes = remaining;
                removed.push(node);
            }
            Err(e) => rejected.push(reject(&instance_id, &e)),
        }
    }

    if !removed.is_empty() {
        for moved in compact_ordinals(&mut nodes) {
            ctx.store.update_node(&moved).await?;
        }
        ctx.network.apply(&network, &nodes).await?;
    }
    persist_accounting(ctx, cluster, &nodes).await?;
    Ok((removed, rejected))
}

async fn evict(
    ctx: &Context,
    network: &NetworkInfo,
    access: &ClusterAccess,
    control: &ClusterNode,
    remaining: &[ClusterNode],
    node: &ClusterNode,
) -> Result<(), Error> {
    ctx.remote
        .drain_and_cordon(access, control, &node.name)
        .await?;
    ctx.remote.delete_node(access, control, &node.name).await?;
    if let Err(e) = ctx.remote.reset_node(access, node).await {
        warn!(node = %node.name, error = %e, "node reset failed, the instance keeps its old configuration");
    }
    ctx.network.release_node(network, remaining, node).await?;
    ctx.store.remove_node(node.id).await
}
