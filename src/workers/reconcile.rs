//! Health reconciliation and deferred garbage collection

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{destroy_cluster, load, Context, DestroyRequest};
use crate::model::{ClusterEvent, ClusterState, ManagedCluster};
use crate::provisioner::PowerState;
use crate::retry::Deadline;
use crate::Error;

/// Compare a cluster's members with its recorded state
///
/// A `Running` cluster with a member that is not running raises
/// `FaultsDetected`. An `Alert` cluster whose members all run and whose
/// API answers is `Recovered`. Other states are left alone.
#[instrument(skip(ctx), fields(cluster = %cluster_id))]
pub async fn reconcile_cluster(ctx: &Context, cluster_id: Uuid) -> Result<ManagedCluster, Error> {
    let (mut cluster, nodes) = load(ctx, cluster_id).await?;
    if !matches!(cluster.state, ClusterState::Running | ClusterState::Alert) {
        debug!(state = %cluster.state, "nothing to reconcile");
        return Ok(cluster);
    }

    let mut faults = Vec::new();
    for node in nodes.iter().filter(|n| !n.is_external) {
        let state = ctx
            .provisioner
            .compute()
            .get_instance(&node.instance_id)
            .await?
            .map(|i| i.state);
        if state != Some(PowerState::Running) {
            let seen = state.map_or_else(|| "missing".to_string(), |s| s.to_string());
            faults.push(format!("{} is {}", node.name, seen));
        }
    }

    match cluster.state {
        ClusterState::Running if !faults.is_empty() => {
            let reason = format!("unhealthy members: {}", faults.join(", "));
            warn!(cluster = %cluster.name, %reason, "faults detected");
            ctx.state
                .transition(&mut cluster, ClusterEvent::FaultsDetected, Some(reason))
                .await?;
        }
        ClusterState::Alert if faults.is_empty() => {
            let network = ctx.network.network(&cluster.network_id).await?;
            let access = ctx.network.access(&network, &nodes)?;
            let deadline = Deadline::after(ctx.config.timeouts.poll_interval());
            match ctx
                .remote
                .wait_control_plane_reachable(&access, &deadline)
                .await
            {
                Ok(()) => {
                    ctx.state
                        .transition(&mut cluster, ClusterEvent::Recovered, None)
                        .await?;
                    info!(cluster = %cluster.name, "cluster recovered");
                }
                Err(e) => debug!(cluster = %cluster.name, error = %e, "members running, API still unreachable"),
            }
        }
        _ => {}
    }
    Ok(cluster)
}

/// Reconcile every cluster, logging failures
///
/// Returns the number of clusters whose state changed.
pub async fn reconcile_all(ctx: &Context) -> Result<usize, Error> {
    let mut changed = 0;
    for cluster in ctx.store.list_clusters().await? {
        match reconcile_cluster(ctx, cluster.id).await {
            Ok(after) if after.state != cluster.state => changed += 1,
            Ok(_) => {}
            Err(e) => warn!(cluster = %cluster.name, error = %e, "reconcile failed"),
        }
    }
    Ok(changed)
}

/// Outcome of one garbage collection pass
#[derive(Clone, Debug, Default)]
pub struct GcReport {
    /// Clusters fully destroyed
    pub collected: Vec<Uuid>,
    /// Clusters still flagged, with the reason
    pub failed: Vec<(Uuid, String)>,
}

/// Retry the destroy of every cluster flagged for garbage collection
///
/// The network is kept; only the cluster's own rules are revoked.
#[instrument(skip(ctx))]
pub async fn collect_garbage(ctx: &Context) -> Result<GcReport, Error> {
    let mut report = GcReport::default();
    for cluster in ctx.store.clusters_pending_gc().await? {
        if cluster.state != ClusterState::Error {
            debug!(cluster = %cluster.name, state = %cluster.state, "flagged cluster not in Error, skipping");
            continue;
        }
        match destroy_cluster(ctx, cluster.id, DestroyRequest::default()).await {
            Ok(_) => {
                info!(cluster = %cluster.name, "garbage collected");
                report.collected.push(cluster.id);
            }
            Err(e) => report.failed.push((cluster.id, e.to_string())),
        }
    }
    Ok(report)
}
