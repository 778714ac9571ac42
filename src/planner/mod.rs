//! Deployment planning
//!
//! A feasibility check for a set of nodes against the hosts of a zone. The
//! planner does not bind placements; the compute service picks the real
//! host at creation time. It therefore uses the same overcommit model as
//! the compute service so it never reports a placement the compute service
//! would refuse.

mod capacity;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::PlannerConfig;
use crate::model::{ManagedCluster, NodeRole, ServiceOffering};
use crate::Error;

pub use capacity::HostCapacity;

/// Source of candidate hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapacityInventory: Send + Sync {
    /// Hosts of a zone with their current usage
    async fn list_hosts(&self, zone_id: &str) -> Result<Vec<HostCapacity>, Error>;
}

/// One node to place
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementUnit {
    /// Role of the node
    pub role: NodeRole,
    /// Sizing of the node
    pub offering: ServiceOffering,
}

/// Units for the given per-role counts, sized from the cluster's offerings
pub fn units_for(
    cluster: &ManagedCluster,
    control: u32,
    etcd: u32,
    workers: u32,
) -> Vec<PlacementUnit> {
    [
        (NodeRole::Control, control),
        (NodeRole::Etcd, etcd),
        (NodeRole::Worker, workers),
    ]
    .into_iter()
    .flat_map(|(role, count)| {
        let offering = cluster.offering_for(role).clone();
        (0..count).map(move |_| PlacementUnit {
            role,
            offering: offering.clone(),
        })
    })
    .collect()
}

/// Capacity held back on one host by the plan
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HostReservation {
    /// Units placed on the host
    pub units: u32,
    /// Reserved CPU in MHz
    pub cpu_mhz: u64,
    /// Reserved memory in MiB
    pub memory_mb: u64,
}

/// Result of a planning call
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeploymentPlan {
    /// Reservations keyed by host id
    pub reservations: BTreeMap<String, HostReservation>,
    /// Units the plan was asked to place
    pub requested: u32,
    /// Whether every unit found a host
    pub feasible: bool,
    /// Why the plan failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeploymentPlan {
    /// Number of units placed before the plan stopped
    pub fn placed(&self) -> u32 {
        self.reservations.values().map(|r| r.units).sum()
    }

    /// Turn an infeasible plan into `InsufficientCapacity`
    pub fn into_result(self, cluster: &str) -> Result<Self, Error> {
        if self.feasible {
            Ok(self)
        } else {
            let reason = self
                .reason
                .unwrap_or_else(|| "no feasible placement".to_string());
            Err(Error::insufficient_capacity(cluster, reason))
        }
    }
}

/// Host filters applied before packing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementConstraints {
    /// Required hypervisor family
    pub hypervisor: Option<String>,
    /// Required host tag
    pub host_tag: Option<String>,
}

impl From<&PlannerConfig> for PlacementConstraints {
    fn from(config: &PlannerConfig) -> Self {
        Self {
            hypervisor: config.hypervisor.clone(),
            host_tag: config.host_tag.clone(),
        }
    }
}

impl PlacementConstraints {
    fn admits(&self, host: &HostCapacity) -> bool {
        if !host.enabled {
            return false;
        }
        if let Some(hv) = &self.hypervisor {
            if !host.hypervisor.eq_ignore_ascii_case(hv) {
                return false;
            }
        }
        if let Some(tag) = &self.host_tag {
            if !host.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

/// Greedy first-fit packing of `units` onto `hosts`
///
/// Each unit goes to the first admitted host that can still take it after
/// counting everything already reserved there. The first unit without a
/// host ends planning; there is no partial success.
pub fn plan_placement(
    hosts: &[HostCapacity],
    units: &[PlacementUnit],
    constraints: &PlacementConstraints,
) -> DeploymentPlan {
    let candidates: Vec<&HostCapacity> = hosts.iter().filter(|h| constraints.admits(h)).collect();
    let mut plan = DeploymentPlan {
        requested: units.len() as u32,
        ..Default::default()
    };

    if units.is_empty() {
        plan.feasible = true;
        return plan;
    }
    if candidates.is_empty() {
        plan.reason = Some(format!(
            "no enabled host matches hypervisor {:?} and tag {:?}",
            constraints.hypervisor, constraints.host_tag
        ));
        return plan;
    }

    for (index, unit) in units.iter().enumerate() {
        let chosen = candidates.iter().find(|host| {
            let reserved = plan.reservations.get(&host.id);
            host.fits(unit, reserved)
        });

        match chosen {
            Some(host) => {
                let entry = plan.reservations.entry(host.id.clone()).or_default();
                entry.units += 1;
                entry.cpu_mhz += unit.offering.cpu_mhz();
                entry.memory_mb += unit.offering.memory_mb;
                debug!(host = %host.name, role = %unit.role, reserved = entry.units, "unit placed");
            }
            None => {
                plan.reason = Some(format!(
                    "no host can fit {} unit {} of {} ({} vCPU x {} MHz, {} MiB)",
                    unit.role,
                    index + 1,
                    units.len(),
                    unit.offering.cpu_cores,
                    unit.offering.cpu_speed_mhz,
                    unit.offering.memory_mb
                ));
                return plan;
            }
        }
    }

    plan.feasible = true;
    plan
}

/// Planner bound to an inventory and host filters
pub struct DeploymentPlanner {
    inventory: Arc<dyn CapacityInventory>,
    constraints: PlacementConstraints,
}

impl DeploymentPlanner {
    /// Create a planner
    pub fn new(inventory: Arc<dyn CapacityInventory>, constraints: PlacementConstraints) -> Self {
        Self {
            inventory,
            constraints,
        }
    }

    /// Plan `units` in the cluster's zone
    ///
    /// Fails with `InsufficientCapacity` when the units do not fit.
    pub async fn plan(
        &self,
        cluster: &ManagedCluster,
        units: &[PlacementUnit],
    ) -> Result<DeploymentPlan, Error> {
        let hosts = self.inventory.list_hosts(&cluster.zone_id).await?;
        let plan = plan_placement(&hosts, units, &self.constraints);
        if plan.feasible {
            info!(
                cluster = %cluster.name,
                units = units.len(),
                hosts = plan.reservations.len(),
                "placement feasible"
            );
        } else {
            warn!(
                cluster = %cluster.name,
                placed = plan.placed(),
                requested = plan.requested,
                reason = plan.reason.as_deref().unwrap_or_default(),
                "placement infeasible"
            );
        }
        plan.into_result(&cluster.name)
    }
}
