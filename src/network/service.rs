//! Network rule service contract

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::rules::{
    AclEntry, AclEntrySpec, FirewallRule, FirewallRuleSpec, LoadBalancerRule, LoadBalancerSpec,
    NetworkInfo, PortForward, PortForwardSpec,
};
use crate::Error;

/// CRUD of reachability rules on the cloud's networks
///
/// Every rule can be found again by listing the network's rules and
/// matching on attributes, so callers never depend on ids they remembered
/// from an earlier, possibly interrupted, workflow.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NetworkRuleService: Send + Sync {
    /// Describe a network
    async fn get_network(&self, network_id: &str) -> Result<NetworkInfo, Error>;

    /// Bring a network up and acquire its public address if it has one
    async fn implement_network(&self, network_id: &str) -> Result<NetworkInfo, Error>;

    /// Delete a network
    async fn delete_network(&self, network_id: &str) -> Result<(), Error>;

    /// Firewall rules on a network's public addresses
    async fn list_firewall_rules(&self, network_id: &str) -> Result<Vec<FirewallRule>, Error>;

    /// Create a firewall rule
    async fn create_firewall_rule(&self, spec: &FirewallRuleSpec) -> Result<FirewallRule, Error>;

    /// Revoke a firewall rule
    async fn revoke_firewall_rule(&self, rule_id: &str) -> Result<(), Error>;

    /// Port forwards on a network's public addresses
    async fn list_port_forwards(&self, network_id: &str) -> Result<Vec<PortForward>, Error>;

    /// Create a port forward
    async fn create_port_forward(&self, spec: &PortForwardSpec) -> Result<PortForward, Error>;

    /// Revoke a port forward
    async fn revoke_port_forward(&self, rule_id: &str) -> Result<(), Error>;

    /// Load balancer rules on a network's public addresses
    async fn list_load_balancers(&self, network_id: &str)
        -> Result<Vec<LoadBalancerRule>, Error>;

    /// Create a load balancer rule with its members
    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
    ) -> Result<LoadBalancerRule, Error>;

    /// Replace the members of a load balancer rule
    async fn set_load_balancer_members(
        &self,
        rule_id: &str,
        members: Vec<String>,
    ) -> Result<(), Error>;

    /// Revoke a load balancer rule
    async fn revoke_load_balancer(&self, rule_id: &str) -> Result<(), Error>;

    /// ACL entries of a tier's ACL
    async fn list_acl_entries(&self, network_id: &str) -> Result<Vec<AclEntry>, Error>;

    /// Create an ACL entry
    async fn create_acl_entry(&self, spec: &AclEntrySpec) -> Result<AclEntry, Error>;

    /// Revoke an ACL entry
    async fn revoke_acl_entry(&self, rule_id: &str) -> Result<(), Error>;
}
