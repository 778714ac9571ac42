//! Autoscaler toggle

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{load, primary, Context};
use crate::model::{validate_autoscaling_bounds, AutoscalingSpec, ClusterEvent, ManagedCluster};
use crate::Error;

/// Desired autoscaler settings
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoscaleRequest {
    /// Run the autoscaler
    pub enabled: bool,
    /// Fewest workers it may scale to
    pub min_size: u32,
    /// Most workers it may scale to
    pub max_size: u32,
}

/// Install, resize or remove the autoscaler agent
///
/// The agent is an add-on: when installing or removing it fails, the
/// cluster goes back to `Running` with the failure as its message, the
/// stored settings stay as they were and the error is returned.
#[instrument(skip(ctx), fields(cluster = %cluster_id, enabled = request.enabled))]
pub async fn update_autoscaling(
    ctx: &Context,
    cluster_id: Uuid,
    request: AutoscaleRequest,
) -> Result<ManagedCluster, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    if request.enabled {
        let cap = ctx
            .config
            .limits
            .max_nodes_per_cluster
            .min(ctx.config.autoscaler.max_cluster_size);
        validate_autoscaling_bounds(&cluster.name, request.min_size, request.max_size, cap)?;
    }

    ctx.state
        .transition(&mut cluster, ClusterEvent::AutoscaleRequested, None)
        .await?;

    let result = async {
        let network = ctx.network.network(&cluster.network_id).await?;
        let access = ctx.network.access(&network, &nodes)?;
        let control = primary(&cluster, &nodes)?;
        if request.enabled {
            ctx.remote
                .deploy_autoscaler(
                    &access,
                    &control,
                    &cluster.name,
                    &ctx.config.autoscaler.image,
                    request.min_size,
                    request.max_size,
                )
                .await
        } else {
            ctx.remote.remove_autoscaler(&access, &control).await
        }
    }
    .await;

    match result {
        Ok(()) => {
            cluster.autoscaling = AutoscalingSpec {
                enabled: request.enabled,
                min_size: request.min_size,
                max_size: request.max_size,
            };
            ctx.store.update_cluster(&cluster).await?;
            ctx.state
                .transition(&mut cluster, ClusterEvent::OperationSucceeded, None)
                .await?;
            info!(cluster = %cluster.name, enabled = request.enabled, min = request.min_size, max = request.max_size, "autoscaling updated");
            Ok(cluster)
        }
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "autoscaler update failed, cluster keeps running");
            ctx.state
                .transition(
                    &mut cluster,
                    ClusterEvent::OperationSucceeded,
                    Some(format!("autoscaler update failed: {e}")),
                )
                .await?;
            Err(e)
        }
    }
}
