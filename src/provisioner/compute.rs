//! Compute and payload service contracts

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Power state reported by the compute service
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum PowerState {
    /// Instance is being created or started
    Starting,
    /// Instance is up
    Running,
    /// Instance is being stopped
    Stopping,
    /// Instance is down
    Stopped,
    /// Instance is being or has been destroyed
    Destroyed,
    /// Instance is in an error state
    Error,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// What to create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Hostname
    pub name: String,
    /// Zone to deploy in
    pub zone_id: String,
    /// Network to attach to
    pub network_id: String,
    /// Sizing
    pub offering_id: String,
    /// Base64 bootstrap document handed to the instance at first boot
    pub user_data: Option<String>,
    /// Owning account
    pub account_id: String,
}

/// A compute instance as reported by the compute service
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    /// Instance id
    pub id: String,
    /// Hostname
    pub name: String,
    /// Network the instance is attached to
    pub network_id: String,
    /// Address on that network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_address: Option<IpAddr>,
    /// Current power state
    pub state: PowerState,
}

/// Compute provisioning service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Create an instance; it may or may not be started yet
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, Error>;

    /// Describe an instance, `None` once it no longer exists
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, Error>;

    /// Start an instance
    async fn start_instance(&self, instance_id: &str) -> Result<InstanceInfo, Error>;

    /// Stop an instance
    async fn stop_instance(&self, instance_id: &str) -> Result<InstanceInfo, Error>;

    /// Destroy an instance and expunge it
    async fn destroy_instance(&self, instance_id: &str) -> Result<(), Error>;

    /// Grow the root volume
    async fn resize_root_volume(&self, instance_id: &str, size_gb: u64) -> Result<(), Error>;

    /// Change the offering of an instance
    async fn scale_instance(&self, instance_id: &str, offering_id: &str) -> Result<(), Error>;

    /// Every instance attached to a network
    async fn list_network_instances(&self, network_id: &str) -> Result<Vec<InstanceInfo>, Error>;
}

/// Image/payload service that attaches read-only media to instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayloadService: Send + Sync {
    /// Attach an image to an instance
    async fn attach(&self, image_id: &str, instance_id: &str) -> Result<(), Error>;

    /// Detach whatever image is attached to an instance
    async fn detach(&self, instance_id: &str) -> Result<(), Error>;
}
