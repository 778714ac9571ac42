//! Start and stop

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{create_cluster, load, primary, reason, Context};
use crate::model::{ClusterEvent, ClusterState, ManagedCluster};
use crate::provisioner::PowerState;
use crate::retry::Deadline;
use crate::Error;

/// Start a cluster
///
/// A cluster that was never created runs the create workflow. A stopped
/// cluster has every member started, its rules re-applied and its nodes
/// waited on. Any member not reaching `Running` fails the whole start and
/// leaves the cluster in `Alert`.
#[instrument(skip(ctx), fields(cluster = %cluster_id))]
pub async fn start_cluster(ctx: &Context, cluster_id: Uuid) -> Result<ManagedCluster, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    if cluster.state == ClusterState::Created {
        return create_cluster(ctx, cluster_id).await;
    }

    ctx.state
        .transition(&mut cluster, ClusterEvent::StartRequested, None)
        .await?;
    let deadline = Deadline::after(ctx.config.timeouts.start());

    let result = async {
        ctx.provisioner
            .ensure_power_state(&cluster, &nodes, PowerState::Running)
            .await?;
        let network = ctx.network.network(&cluster.network_id).await?;
        let access = ctx.network.apply(&network, &nodes).await?;
        ctx.remote
            .wait_control_plane_reachable(&access, &deadline)
            .await?;
        let control = primary(&cluster, &nodes)?;
        ctx.remote
            .wait_ready_node_count(&access, &control, cluster.expected_ready_nodes(), &deadline)
            .await?;
        Ok::<_, Error>(access)
    }
    .await;

    match result {
        Ok(access) => {
            cluster.endpoint = Some(access.endpoint());
            ctx.store.update_cluster(&cluster).await?;
            ctx.state
                .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
                .await?;
            info!(cluster = %cluster.name, "cluster started");
            Ok(cluster)
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "cluster start failed");
            ctx.state
                .fail(&mut cluster, ClusterEvent::OperationFailed, reason("start", &e))
                .await;
            Err(e)
        }
    }
}

/// Stop every member of a running cluster
///
/// Succeeds only when every member reports `Stopped`; otherwise the
/// cluster moves to `Alert`.
#[instrument(skip(ctx), fields(cluster = %cluster_id))]
pub async fn stop_cluster(ctx: &Context, cluster_id: Uuid) -> Result<ManagedCluster, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    ctx.state
        .transition(&mut cluster, ClusterEvent::StopRequested, None)
        .await?;

    match ctx
        .provisioner
        .ensure_power_state(&cluster, &nodes, PowerState::Stopped)
        .await
    {
        Ok(()) => {
            ctx.state
                .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
                .await?;
            info!(cluster = %cluster.name, nodes = nodes.len(), "cluster stopped");
            Ok(cluster)
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "cluster stop failed");
            ctx.state
                .fail(&mut cluster, ClusterEvent::OperationFailed, reason("stop", &e))
                .await;
            Err(e)
        }
    }
}
