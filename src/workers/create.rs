//! Cluster creation

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    join_endpoint, persist_accounting, primary, reason, resync_accounting, Context, PayloadContext,
};
use crate::bootstrap::PayloadKind;
use crate::model::{node_name, ClusterEvent, ClusterNode, ManagedCluster, NodeRole};
use crate::planner::units_for;
use crate::provisioner::{NodeRequest, PayloadAttachments};
use crate::retry::Deadline;
use crate::Error;

/// Provision and bootstrap a cluster from its `Created` record
///
/// Any failure after planning detaches payloads still attached and moves
/// the cluster to `Error` through `CreateFailed`. Instances and rules that
/// were created are left for a later destroy.
#[instrument(skip(ctx), fields(cluster = %cluster_id))]
pub async fn create_cluster(ctx: &Context, cluster_id: Uuid) -> Result<ManagedCluster, Error> {
    let mut cluster = ctx.store.get_cluster(cluster_id).await?;
    cluster.validate(ctx.config.limits.max_nodes_per_cluster)?;
    ctx.state
        .transition(&mut cluster, ClusterEvent::StartRequested, None)
        .await?;

    let mut attached = None;
    let result = provision_cluster(ctx, &mut cluster, &mut attached).await;
    if let Some(attachments) = attached.take() {
        ctx.provisioner.detach_payloads(attachments).await;
    }

    match result {
        Ok(()) => {
            ctx.state
                .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
                .await?;
            info!(cluster = %cluster.name, endpoint = ?cluster.endpoint, "cluster created");
            Ok(cluster)
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "cluster creation failed");
            resync_accounting(ctx, &mut cluster).await;
            ctx.state
                .fail(&mut cluster, ClusterEvent::CreateFailed, reason("create", &e))
                .await;
            Err(e)
        }
    }
}

async fn provision_cluster(
    ctx: &Context,
    cluster: &mut ManagedCluster,
    attached: &mut Option<PayloadAttachments>,
) -> Result<(), Error> {
    let deadline = Deadline::after(ctx.config.timeouts.create());

    let units = units_for(
        cluster,
        cluster.control_nodes,
        cluster.etcd_nodes,
        cluster.worker_nodes,
    );
    ctx.planner.plan(cluster, &units).await?;

    let network = ctx.network.implement(&cluster.network_id).await?;

    let (token, certificate_key) = ctx.join_credentials(cluster);
    let control_names: Vec<String> = (1..=cluster.control_nodes)
        .map(|i| node_name(&cluster.name, NodeRole::Control, i))
        .collect();
    let cert_request =
        super::control_cert_request(ctx, cluster, &network, control_names.clone(), Vec::new());
    let tls = ctx.ca.issue_control_plane_bundle(&cert_request)?;
    let mut cert_sans = control_names;
    cert_sans.extend(cert_request.addresses.iter().map(|a| a.to_string()));

    let payloads = PayloadContext {
        cluster,
        token: &token,
        certificate_key: certificate_key.as_ref(),
        tls: Some(&tls),
        cert_sans,
    };

    // The primary initialises the control plane; everyone else joins it
    let mut nodes: Vec<ClusterNode> = Vec::new();
    let primary_name = node_name(&cluster.name, NodeRole::Control, 1);
    let init_endpoint = join_endpoint(ctx, &network, &primary_name, None);
    let payload = payloads.render(ctx, &primary_name, PayloadKind::ControlInit, &init_endpoint)?;
    let first = ctx
        .provisioner
        .provision_node(
            cluster,
            NodeRequest {
                name: primary_name.clone(),
                role: NodeRole::Control,
                ordinal: 0,
                payload: Some(payload),
            },
        )
        .await?;
    let endpoint = join_endpoint(ctx, &network, &first.name, first.private_address);
    nodes.push(first);

    let rest = (2..=cluster.control_nodes)
        .map(|i| (NodeRole::Control, i, PayloadKind::ControlJoin))
        .chain((1..=cluster.etcd_nodes).map(|i| (NodeRole::Etcd, i, PayloadKind::Etcd)))
        .chain((1..=cluster.worker_nodes).map(|i| (NodeRole::Worker, i, PayloadKind::Worker)));
    for (role, index, kind) in rest {
        let name = node_name(&cluster.name, role, index);
        let payload = payloads.render(ctx, &name, kind, &endpoint)?;
        let node = ctx
            .provisioner
            .provision_node(
                cluster,
                NodeRequest {
                    name,
                    role,
                    ordinal: nodes.len() as u32,
                    payload: Some(payload),
                },
            )
            .await?;
        nodes.push(node);
    }
    info!(cluster = %cluster.name, nodes = nodes.len(), "nodes provisioned");

    let access = ctx.network.apply(&network, &nodes).await?;
    cluster.endpoint = Some(access.endpoint());
    cluster.public_address = network.public_address;
    persist_accounting(ctx, cluster, &nodes).await?;

    *attached = Some(ctx.provisioner.attach_payloads(cluster, &nodes).await?);

    ctx.remote
        .wait_control_plane_reachable(&access, &deadline)
        .await?;
    let control = primary(cluster, &nodes)?;
    ctx.remote
        .wait_ready_node_count(&access, &control, cluster.expected_ready_nodes(), &deadline)
        .await?;

    if let Some(attachments) = attached.take() {
        ctx.provisioner.detach_payloads(attachments).await;
    }

    let admin_config = ctx.remote.fetch_admin_config(&access, &control).await?;
    ctx.store
        .store_cluster_config(cluster.id, &admin_config)
        .await?;

    if ctx.config.bootstrap.verify_dashboard {
        ctx.remote
            .wait_dashboard_running(
                &access,
                &control,
                &ctx.config.bootstrap.dashboard_namespace,
                &deadline,
            )
            .await?;
    }

    if cluster.autoscaling.enabled {
        let spec = &cluster.autoscaling;
        if let Err(e) = ctx
            .remote
            .deploy_autoscaler(
                &access,
                &control,
                &cluster.name,
                &ctx.config.autoscaler.image,
                spec.min_size,
                spec.max_size,
            )
            .await
        {
            warn!(cluster = %cluster.name, error = %e, "autoscaler deployment failed, continuing without it");
        }
    }

    for node in nodes.iter_mut() {
        node.bootstrapped = true;
        ctx.store.update_node(node).await?;
    }
    Ok(())
}
