//! Host capacity records

use serde::{Deserialize, Serialize};

use super::{HostReservation, PlacementUnit};

/// Capacity and current usage of one host
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostCapacity {
    /// Host id
    pub id: String,
    /// Host name
    pub name: String,
    /// Physical cores
    pub cpu_cores: u32,
    /// Speed per core in MHz
    pub cpu_speed_mhz: u32,
    /// Physical memory in MiB
    pub memory_mb: u64,
    /// CPU already allocated in MHz
    #[serde(default)]
    pub used_cpu_mhz: u64,
    /// Memory already allocated in MiB
    #[serde(default)]
    pub used_memory_mb: u64,
    /// Hypervisor family
    pub hypervisor: String,
    /// Host tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// CPU overcommit ratio of the host's cluster
    #[serde(default = "one")]
    pub cpu_overcommit: f64,
    /// Memory overcommit ratio of the host's cluster
    #[serde(default = "one")]
    pub ram_overcommit: f64,
    /// Host accepts new instances
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn one() -> f64 {
    1.0
}

fn enabled() -> bool {
    true
}

impl HostCapacity {
    /// CPU capacity in MHz after overcommit
    pub fn cpu_capacity_mhz(&self) -> u64 {
        let raw = u64::from(self.cpu_cores) * u64::from(self.cpu_speed_mhz);
        (raw as f64 * self.cpu_overcommit.max(0.0)).floor() as u64
    }

    /// Memory capacity in MiB after overcommit
    pub fn memory_capacity_mb(&self) -> u64 {
        (self.memory_mb as f64 * self.ram_overcommit.max(0.0)).floor() as u64
    }

    /// Whether one more `unit` fits on top of `reserved`
    pub(super) fn fits(&self, unit: &PlacementUnit, reserved: Option<&HostReservation>) -> bool {
        let offering = &unit.offering;
        if self.cpu_cores < offering.cpu_cores || self.cpu_speed_mhz < offering.cpu_speed_mhz {
            return false;
        }

        let (reserved_cpu, reserved_mem) = reserved
            .map(|r| (r.cpu_mhz, r.memory_mb))
            .unwrap_or((0, 0));
        let cpu_needed = self.used_cpu_mhz + reserved_cpu + offering.cpu_mhz();
        let mem_needed = self.used_memory_mb + reserved_mem + offering.memory_mb;

        cpu_needed <= self.cpu_capacity_mhz() && mem_needed <= self.memory_capacity_mb()
    }
}
