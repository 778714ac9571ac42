//! Rule shapes and derivation of the desired rule set
//!
//! Everything here is pure. [`desired_rules`] maps a network topology and
//! the current membership to the rules that must exist; the coordinator
//! then reconciles the service against that set.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::model::{primary_control_node, ClusterNode, NodeRole};

/// How a network connects to the outside
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NetworkKind {
    /// Owns a source-NAT address; firewall, load balancer and forwards
    Isolated,
    /// Tier of a VPC; ACLs and forwards
    VpcTier,
    /// Nodes get direct addresses; nothing to program
    Shared,
}

/// A network as reported by the network rule service
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Network id
    pub id: String,
    /// Topology
    pub kind: NetworkKind,
    /// Source-NAT address (isolated) or tier public address (VPC)
    #[serde(default)]
    pub public_address: Option<IpAddr>,
    /// ACL of a VPC tier
    #[serde(default)]
    pub acl_id: Option<String>,
    /// The tier ACL allows all ingress already
    #[serde(default)]
    pub acl_default_allow: bool,
}

/// Why a rule exists
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum RulePurpose {
    /// Reaching the control plane API
    ApiAccess,
    /// Reaching nodes over SSH
    SshAccess,
}

impl std::fmt::Display for RulePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiAccess => write!(f, "api-access"),
            Self::SshAccess => write!(f, "ssh-access"),
        }
    }
}

/// Ingress firewall rule on a public address
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRuleSpec {
    /// Network the address belongs to
    pub network_id: String,
    /// Public address
    pub address: IpAddr,
    /// Purpose tag
    pub purpose: RulePurpose,
    /// First port
    pub port_start: u16,
    /// Last port (inclusive)
    pub port_end: u16,
    /// Allowed sources
    pub source_cidrs: Vec<String>,
}

/// Public port forwarded to one instance
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardSpec {
    /// Network the address belongs to
    pub network_id: String,
    /// Public address
    pub address: IpAddr,
    /// Purpose tag
    pub purpose: RulePurpose,
    /// Port on the public address
    pub public_port: u16,
    /// Port on the instance
    pub private_port: u16,
    /// Target instance
    pub instance_id: String,
}

/// Load balancer spreading a public port over instances
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Network the address belongs to
    pub network_id: String,
    /// Public address
    pub address: IpAddr,
    /// Purpose tag
    pub purpose: RulePurpose,
    /// Port on the public address
    pub public_port: u16,
    /// Port on the members
    pub private_port: u16,
    /// Member instances, sorted
    pub members: Vec<String>,
}

/// ACL action
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AclAction {
    /// Let traffic through
    Allow,
    /// Drop traffic
    Deny,
}

/// Ingress entry of a VPC tier ACL
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AclEntrySpec {
    /// Tier network
    pub network_id: String,
    /// ACL list the entry belongs to
    pub acl_id: String,
    /// Purpose tag
    pub purpose: RulePurpose,
    /// Rule number within the ACL
    pub number: u32,
    /// First port
    pub port_start: u16,
    /// Last port (inclusive)
    pub port_end: u16,
    /// Allowed sources
    pub source_cidrs: Vec<String>,
    /// Action
    pub action: AclAction,
}

/// A rule as stored by the network rule service
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Rule<S> {
    /// Service-assigned id
    pub id: String,
    /// What the rule does
    #[serde(flatten)]
    pub spec: S,
}

/// Stored firewall rule
pub type FirewallRule = Rule<FirewallRuleSpec>;
/// Stored port forward
pub type PortForward = Rule<PortForwardSpec>;
/// Stored load balancer rule
pub type LoadBalancerRule = Rule<LoadBalancerSpec>;
/// Stored ACL entry
pub type AclEntry = Rule<AclEntrySpec>;

/// Ports and sources the rules are built from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSettings {
    /// First public SSH port
    pub ssh_base_port: u16,
    /// SSH port inside nodes
    pub node_ssh_port: u16,
    /// API port, public and private
    pub api_port: u16,
    /// Sources allowed on the SSH range
    pub ssh_source_cidrs: Vec<String>,
    /// Sources allowed on the API port
    pub api_source_cidrs: Vec<String>,
    /// First ACL rule number
    pub acl_rule_number_base: u32,
}

impl From<&crate::config::OrchestratorConfig> for RuleSettings {
    fn from(config: &crate::config::OrchestratorConfig) -> Self {
        Self {
            ssh_base_port: config.ssh.base_port,
            node_ssh_port: config.ssh.node_port,
            api_port: config.network.api_port,
            ssh_source_cidrs: config.network.ssh_source_cidrs.clone(),
            api_source_cidrs: config.network.api_source_cidrs.clone(),
            acl_rule_number_base: config.network.acl_rule_number_base,
        }
    }
}

impl RuleSettings {
    /// Public SSH port of the node at `ordinal`
    pub fn ssh_port(&self, ordinal: u32) -> u16 {
        self.ssh_base_port.saturating_add(ordinal as u16)
    }

    /// SSH range `[base, base + count - 1]`, or `None` for zero nodes
    pub fn ssh_range(&self, count: u32) -> Option<(u16, u16)> {
        (count > 0).then(|| (self.ssh_base_port, self.ssh_port(count - 1)))
    }
}

/// Every rule a cluster needs on its network
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DesiredRules {
    /// Firewall rules
    pub firewall: Vec<FirewallRuleSpec>,
    /// Port forwards
    pub port_forwards: Vec<PortForwardSpec>,
    /// Load balancers
    pub load_balancers: Vec<LoadBalancerSpec>,
    /// ACL entries
    pub acl: Vec<AclEntrySpec>,
}

impl DesiredRules {
    /// Total number of rules
    pub fn len(&self) -> usize {
        self.firewall.len() + self.port_forwards.len() + self.load_balancers.len() + self.acl.len()
    }

    /// Returns true if nothing needs to be programmed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How workers reach nodes over SSH
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum SshAccess {
    /// One public address, node `i` on `base_port + i`
    Forwarded {
        /// Public address
        address: IpAddr,
        /// Port of ordinal 0
        base_port: u16,
    },
    /// Each node on its own address
    Direct {
        /// SSH port on every node
        port: u16,
    },
}

impl SshAccess {
    /// Socket address of a node, if it can be reached
    pub fn target(&self, node: &ClusterNode) -> Option<SocketAddr> {
        match self {
            Self::Forwarded { address, base_port } => Some(SocketAddr::new(
                *address,
                base_port.saturating_add(node.ssh_port_offset as u16),
            )),
            Self::Direct { port } => node.private_address.map(|a| SocketAddr::new(a, *port)),
        }
    }
}

/// Where the cluster's API and nodes are reachable
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAccess {
    /// Address serving the API
    pub api_address: IpAddr,
    /// API port
    pub api_port: u16,
    /// SSH access mode
    pub ssh: SshAccess,
}

impl ClusterAccess {
    /// API endpoint URL
    pub fn endpoint(&self) -> String {
        match self.api_address {
            IpAddr::V4(a) => format!("https://{}:{}/", a, self.api_port),
            IpAddr::V6(a) => format!("https://[{}]:{}/", a, self.api_port),
        }
    }

    /// API socket address
    pub fn api_socket(&self) -> SocketAddr {
        SocketAddr::new(self.api_address, self.api_port)
    }
}

/// Derive access paths for a network and membership
///
/// Returns `None` when there is neither a public address nor a primary
/// control node with a private address.
pub fn cluster_access(
    network: &NetworkInfo,
    members: &[ClusterNode],
    settings: &RuleSettings,
) -> Option<ClusterAccess> {
    let public = match network.kind {
        NetworkKind::Shared => None,
        NetworkKind::Isolated | NetworkKind::VpcTier => network.public_address,
    };
    match public {
        Some(address) => Some(ClusterAccess {
            api_address: address,
            api_port: settings.api_port,
            ssh: SshAccess::Forwarded {
                address,
                base_port: settings.ssh_base_port,
            },
        }),
        None => {
            let primary = primary_control_node(members)?;
            Some(ClusterAccess {
                api_address: primary.private_address?,
                api_port: settings.api_port,
                ssh: SshAccess::Direct {
                    port: settings.node_ssh_port,
                },
            })
        }
    }
}

/// Number of SSH ports the membership occupies
///
/// Ordinals are contiguous once a workflow completes, so this equals the
/// member count; the highest ordinal wins while a gap exists.
pub fn ssh_span(members: &[ClusterNode]) -> u32 {
    members
        .iter()
        .map(|n| n.ssh_port_offset + 1)
        .max()
        .unwrap_or(0)
        .max(members.len() as u32)
}

/// Rules required for `members` on `network`
pub fn desired_rules(
    network: &NetworkInfo,
    members: &[ClusterNode],
    settings: &RuleSettings,
) -> DesiredRules {
    let mut rules = DesiredRules::default();
    let span = ssh_span(members);

    match network.kind {
        NetworkKind::Shared => {}
        NetworkKind::Isolated => {
            let Some(address) = network.public_address else {
                return rules;
            };
            rules.firewall.push(FirewallRuleSpec {
                network_id: network.id.clone(),
                address,
                purpose: RulePurpose::ApiAccess,
                port_start: settings.api_port,
                port_end: settings.api_port,
                source_cidrs: settings.api_source_cidrs.clone(),
            });
            if let Some((start, end)) = settings.ssh_range(span) {
                rules.firewall.push(FirewallRuleSpec {
                    network_id: network.id.clone(),
                    address,
                    purpose: RulePurpose::SshAccess,
                    port_start: start,
                    port_end: end,
                    source_cidrs: settings.ssh_source_cidrs.clone(),
                });
            }

            let mut control: Vec<String> = members
                .iter()
                .filter(|n| n.role == NodeRole::Control)
                .map(|n| n.instance_id.clone())
                .collect();
            control.sort();
            if !control.is_empty() {
                rules.load_balancers.push(LoadBalancerSpec {
                    network_id: network.id.clone(),
                    address,
                    purpose: RulePurpose::ApiAccess,
                    public_port: settings.api_port,
                    private_port: settings.api_port,
                    members: control,
                });
            }
            rules.port_forwards = ssh_forwards(network, address, members, settings);
        }
        NetworkKind::VpcTier => {
            if let Some(address) = network.public_address {
                if let Some(primary) = primary_control_node(members) {
                    rules.port_forwards.push(PortForwardSpec {
                        network_id: network.id.clone(),
                        address,
                        purpose: RulePurpose::ApiAccess,
                        public_port: settings.api_port,
                        private_port: settings.api_port,
                        instance_id: primary.instance_id.clone(),
                    });
                }
                rules
                    .port_forwards
                    .extend(ssh_forwards(network, address, members, settings));
            }

            if let (false, Some(acl_id)) = (network.acl_default_allow, &network.acl_id) {
                let ssh_ports = match network.public_address {
                    Some(_) => settings.ssh_range(span),
                    None => Some((settings.node_ssh_port, settings.node_ssh_port)),
                };
                let entry = |number: u32, purpose, (start, end): (u16, u16), cidrs: &[String]| {
                    AclEntrySpec {
                        network_id: network.id.clone(),
                        acl_id: acl_id.clone(),
                        purpose,
                        number,
                        port_start: start,
                        port_end: end,
                        source_cidrs: cidrs.to_vec(),
                        action: AclAction::Allow,
                    }
                };
                rules.acl.push(entry(
                    settings.acl_rule_number_base,
                    RulePurpose::ApiAccess,
                    (settings.api_port, settings.api_port),
                    &settings.api_source_cidrs,
                ));
                if let Some(range) = ssh_ports {
                    rules.acl.push(entry(
                        settings.acl_rule_number_base + 1,
                        RulePurpose::SshAccess,
                        range,
                        &settings.ssh_source_cidrs,
                    ));
                }
            }
        }
    }
    rules
}

fn ssh_forwards(
    network: &NetworkInfo,
    address: IpAddr,
    members: &[ClusterNode],
    settings: &RuleSettings,
) -> Vec<PortForwardSpec> {
    members
        .iter()
        .map(|node| PortForwardSpec {
            network_id: network.id.clone(),
            address,
            purpose: RulePurpose::SshAccess,
            public_port: settings.ssh_port(node.ssh_port_offset),
            private_port: settings.node_ssh_port,
            instance_id: node.instance_id.clone(),
        })
        .collect()
}
