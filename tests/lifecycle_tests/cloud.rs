//! In-memory IaaS and orchestrated cluster
//!
//! One [`Cloud`] plays every external system a workflow talks to. The
//! node list the remote side reports is derived from the running
//! instances, so provisioning, scaling and destroying show up there without
//! any extra wiring.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use cluster_orchestrator::bootstrap::TokenSecret;
use cluster_orchestrator::config::OrchestratorConfig;
use cluster_orchestrator::model::{
    AutoscalingSpec, ClusterState, KubernetesVersion, ManagedCluster, ServiceOffering,
};
use cluster_orchestrator::network::{
    AclEntry, AclEntrySpec, FirewallRule, FirewallRuleSpec, LoadBalancerRule, LoadBalancerSpec,
    NetworkInfo, NetworkKind, NetworkRuleService, PortForward, PortForwardSpec, Rule,
    RulePurpose,
};
use cluster_orchestrator::planner::{CapacityInventory, HostCapacity};
use cluster_orchestrator::provisioner::{
    ComputeService, InstanceInfo, InstanceSpec, PayloadService, PowerState,
};
use cluster_orchestrator::remote::commands::RemoteCommand;
use cluster_orchestrator::remote::{CommandOutput, RemoteTransport, SshTarget};
use cluster_orchestrator::state::{ClusterStore, InMemoryClusterStore};
use cluster_orchestrator::workers::Context;
use cluster_orchestrator::Error;

// =============================================================================
// Fixtures
// =============================================================================

pub fn offering(name: &str, cores: u32, memory_mb: u64) -> ServiceOffering {
    ServiceOffering {
        id: format!("offering-{name}"),
        name: name.to_string(),
        cpu_cores: cores,
        cpu_speed_mhz: 2000,
        memory_mb,
    }
}

pub fn version(minor: u64) -> KubernetesVersion {
    KubernetesVersion {
        id: format!("k8s-1.{minor}"),
        semantic_version: semver::Version::new(1, minor, 0),
        payload_image_id: format!("iso-1.{minor}"),
        min_cpu_cores: 2,
        min_memory_mb: 2048,
        ha_capable: true,
    }
}

/// A 1 control + 2 worker cluster on `net-1`, not yet created
pub fn tenant_cluster(name: &str) -> ManagedCluster {
    ManagedCluster {
        id: Uuid::new_v4(),
        name: name.to_string(),
        account_id: "acct-42".to_string(),
        zone_id: "zone-a".to_string(),
        network_id: "net-1".to_string(),
        control_nodes: 1,
        worker_nodes: 2,
        etcd_nodes: 0,
        offering: offering("medium", 2, 4096),
        control_offering: None,
        etcd_offering: None,
        root_disk_gb: None,
        version: version(29),
        key_pair: Some("ssh-ed25519 AAAATENANT tenant@laptop".to_string()),
        autoscaling: AutoscalingSpec::default(),
        registry: None,
        state: ClusterState::Created,
        message: None,
        endpoint: None,
        public_address: None,
        cores: 0,
        memory_mb: 0,
        node_count: 0,
        gc_pending: false,
        removed_at: None,
    }
}

pub fn host(id: &str, cores: u32, memory_mb: u64) -> HostCapacity {
    HostCapacity {
        id: id.to_string(),
        name: id.to_string(),
        cpu_cores: cores,
        cpu_speed_mhz: 2000,
        memory_mb,
        used_cpu_mhz: 0,
        used_memory_mb: 0,
        hypervisor: "kvm".to_string(),
        tags: Vec::new(),
        cpu_overcommit: 1.0,
        ram_overcommit: 1.0,
        enabled: true,
    }
}

/// Hosts with room for any cluster in these stories
pub fn plenty() -> Vec<HostCapacity> {
    vec![host("hv-1", 64, 262_144), host("hv-2", 64, 262_144)]
}

// =============================================================================
// Cloud
// =============================================================================

#[derive(Default)]
pub struct Cloud {
    pub hosts: Mutex<Vec<HostCapacity>>,
    pub network: Mutex<Option<NetworkInfo>>,
    pub instances: Mutex<BTreeMap<String, InstanceInfo>>,
    created: Mutex<u32>,
    rule_ids: Mutex<u32>,
    /// Instance ids whose destroy fails
    pub undeletable: Mutex<Vec<String>>,
    /// Instance id to attached image id
    pub attached: Mutex<HashMap<String, String>>,
    /// Every detach call, in order
    pub detaches: Mutex<Vec<String>>,
    pub firewall: Mutex<Vec<FirewallRule>>,
    pub forwards: Mutex<Vec<PortForward>>,
    pub balancers: Mutex<Vec<LoadBalancerRule>>,
    pub acl: Mutex<Vec<AclEntry>>,
    /// Node versions reported by the orchestrated cluster
    pub versions: Mutex<HashMap<String, String>>,
    /// Nodes whose version never changes
    pub frozen: Mutex<Vec<String>>,
    /// Nodes that never report Ready
    pub not_ready: Mutex<Vec<String>>,
    /// Labels of every remote command, in order
    pub commands: Mutex<Vec<String>>,
}

impl Cloud {
    /// An isolated network with a source-NAT address
    pub fn isolated(hosts: Vec<HostCapacity>) -> Arc<Self> {
        let cloud = Self::default();
        *cloud.hosts.lock().unwrap() = hosts;
        *cloud.network.lock().unwrap() = Some(NetworkInfo {
            id: "net-1".to_string(),
            kind: NetworkKind::Isolated,
            public_address: Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))),
            acl_id: None,
            acl_default_allow: false,
        });
        Arc::new(cloud)
    }

    /// Ports of the SSH firewall rule, if one exists
    pub fn ssh_range(&self) -> Option<(u16, u16)> {
        self.firewall
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.spec.purpose == RulePurpose::SshAccess)
            .map(|r| (r.spec.port_start, r.spec.port_end))
    }

    /// Public ports of every port forward, sorted
    pub fn forwarded_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .forwards
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.spec.public_port)
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn rule_count(&self) -> usize {
        self.firewall.lock().unwrap().len()
            + self.forwards.lock().unwrap().len()
            + self.balancers.lock().unwrap().len()
            + self.acl.lock().unwrap().len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    fn rule_id(&self) -> String {
        let mut next = self.rule_ids.lock().unwrap();
        *next += 1;
        format!("rule-{next}")
    }

    fn current_network(&self, network_id: &str) -> Result<NetworkInfo, Error> {
        self.network
            .lock()
            .unwrap()
            .clone()
            .filter(|n| n.id == network_id)
            .ok_or_else(|| Error::not_found("network", network_id))
    }

    fn set_power(&self, instance_id: &str, state: PowerState) -> Result<InstanceInfo, Error> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::not_found("instance", instance_id))?;
        instance.state = state;
        Ok(instance.clone())
    }

    /// `kubectl get nodes` as the orchestrated cluster would print it
    fn node_list(&self) -> String {
        let versions = self.versions.lock().unwrap();
        let not_ready = self.not_ready.lock().unwrap();
        self.instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.state == PowerState::Running && !i.name.contains("-etcd-"))
            .map(|i| {
                let status = if not_ready.contains(&i.name) { "NotReady" } else { "Ready" };
                let version = versions
                    .get(&i.name)
                    .cloned()
                    .unwrap_or_else(|| "v1.29.0".to_string());
                format!("{} {status} <none> 5m {version}\n", i.name)
            })
            .collect()
    }

    fn upgrade_to(&self, version: &str) {
        let frozen = self.frozen.lock().unwrap().clone();
        let names: Vec<String> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .map(|i| i.name.clone())
            .collect();
        let mut versions = self.versions.lock().unwrap();
        for name in names.into_iter().filter(|n| !frozen.contains(n)) {
            versions.insert(name, version.to_string());
        }
    }
}

fn store<S: Clone>(rules: &Mutex<Vec<Rule<S>>>, id: String, spec: &S) -> Rule<S> {
    let rule = Rule { id, spec: spec.clone() };
    rules.lock().unwrap().push(rule.clone());
    rule
}

fn revoke<S>(rules: &Mutex<Vec<Rule<S>>>, id: &str) {
    rules.lock().unwrap().retain(|r| r.id != id);
}

#[async_trait]
impl CapacityInventory for Cloud {
    async fn list_hosts(&self, _zone_id: &str) -> Result<Vec<HostCapacity>, Error> {
        Ok(self.hosts.lock().unwrap().clone())
    }
}

#[async_trait]
impl ComputeService for Cloud {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, Error> {
        let n = {
            let mut created = self.created.lock().unwrap();
            *created += 1;
            *created
        };
        let info = InstanceInfo {
            id: format!("vm-{n}"),
            name: spec.name.clone(),
            network_id: spec.network_id.clone(),
            private_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + n as u8))),
            state: PowerState::Stopped,
        };
        self.instances
            .lock()
            .unwrap()
            .insert(info.id.clone(), info.clone());
        Ok(info)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceInfo>, Error> {
        Ok(self.instances.lock().unwrap().get(instance_id).cloned())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<InstanceInfo, Error> {
        self.set_power(instance_id, PowerState::Running)
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<InstanceInfo, Error> {
        self.set_power(instance_id, PowerState::Stopped)
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<(), Error> {
        if self.undeletable.lock().unwrap().iter().any(|id| id == instance_id) {
            return Err(Error::provisioning("cloud", instance_id, "volume still attached"));
        }
        self.instances.lock().unwrap().remove(instance_id);
        Ok(())
    }

    async fn resize_root_volume(&self, _instance_id: &str, _size_gb: u64) -> Result<(), Error> {
        Ok(())
    }

    async fn scale_instance(&self, _instance_id: &str, _offering_id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn list_network_instances(&self, network_id: &str) -> Result<Vec<InstanceInfo>, Error> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.network_id == network_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PayloadService for Cloud {
    async fn attach(&self, image_id: &str, instance_id: &str) -> Result<(), Error> {
        self.attached
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), image_id.to_string());
        Ok(())
    }

    async fn detach(&self, instance_id: &str) -> Result<(), Error> {
        self.detaches.lock().unwrap().push(instance_id.to_string());
        self.attached.lock().unwrap().remove(instance_id);
        Ok(())
    }
}

#[async_trait]
impl NetworkRuleService for Cloud {
    async fn get_network(&self, network_id: &str) -> Result<NetworkInfo, Error> {
        self.current_network(network_id)
    }

    async fn implement_network(&self, network_id: &str) -> Result<NetworkInfo, Error> {
        self.current_network(network_id)
    }

    async fn delete_network(&self, network_id: &str) -> Result<(), Error> {
        self.current_network(network_id)?;
        *self.network.lock().unwrap() = None;
        Ok(())
    }

    async fn list_firewall_rules(&self, _network_id: &str) -> Result<Vec<FirewallRule>, Error> {
        Ok(self.firewall.lock().unwrap().clone())
    }

    async fn create_firewall_rule(&self, spec: &FirewallRuleSpec) -> Result<FirewallRule, Error> {
        Ok(store(&self.firewall, self.rule_id(), spec))
    }

    async fn revoke_firewall_rule(&self, rule_id: &str) -> Result<(), Error> {
        revoke(&self.firewall, rule_id);
        Ok(())
    }

    async fn list_port_forwards(&self, _network_id: &str) -> Result<Vec<PortForward>, Error> {
        Ok(self.forwards.lock().unwrap().clone())
    }

    async fn create_port_forward(&self, spec: &PortForwardSpec) -> Result<PortForward, Error> {
        Ok(store(&self.forwards, self.rule_id(), spec))
    }

    async fn revoke_port_forward(&self, rule_id: &str) -> Result<(), Error> {
        revoke(&self.forwards, rule_id);
        Ok(())
    }

    async fn list_load_balancers(
        &self,
        _network_id: &str,
    ) -> Result<Vec<LoadBalancerRule>, Error> {
        Ok(self.balancers.lock().unwrap().clone())
    }

    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
    ) -> Result<LoadBalancerRule, Error> {
        Ok(store(&self.balancers, self.rule_id(), spec))
    }

    async fn set_load_balancer_members(
        &self,
        rule_id: &str,
        members: Vec<String>,
    ) -> Result<(), Error> {
        let mut balancers = self.balancers.lock().unwrap();
        let rule = balancers
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| Error::not_found("load balancer", rule_id))?;
        rule.spec.members = members;
        Ok(())
    }

    async fn revoke_load_balancer(&self, rule_id: &str) -> Result<(), Error> {
        revoke(&self.balancers, rule_id);
        Ok(())
    }

    async fn list_acl_entries(&self, _network_id: &str) -> Result<Vec<AclEntry>, Error> {
        Ok(self.acl.lock().unwrap().clone())
    }

    async fn create_acl_entry(&self, spec: &AclEntrySpec) -> Result<AclEntry, Error> {
        Ok(store(&self.acl, self.rule_id(), spec))
    }

    async fn revoke_acl_entry(&self, rule_id: &str) -> Result<(), Error> {
        revoke(&self.acl, rule_id);
        Ok(())
    }
}

#[async_trait]
impl RemoteTransport for Cloud {
    async fn exec(
        &self,
        _target: &SshTarget,
        command: &RemoteCommand,
        _timeout: Duration,
    ) -> Result<CommandOutput, Error> {
        let label = command.label().to_string();
        self.commands.lock().unwrap().push(label.clone());

        let stdout = if label == "list nodes" {
            self.node_list()
        } else if label == "read admin config" {
            "apiVersion: v1\nclusters:\n- cluster:\n    server: https://10.0.0.11:6443\n  name: tenant\n"
                .to_string()
        } else if label.starts_with("list pods") {
            "kubernetes-dashboard-5c8bd 1/1 Running 0 2m\n".to_string()
        } else if let Some(version) = label.strip_prefix("upgrade to ") {
            self.upgrade_to(version);
            String::new()
        } else {
            String::new()
        };

        Ok(CommandOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    async fn copy(&self, _target: &SshTarget, _local: &Path, _remote: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn probe(&self, _address: SocketAddr, _timeout: Duration) -> bool {
        true
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.ssh.retry_attempts = 1;
    config.ssh.retry_delay_secs = 0;
    config.ssh.management_public_key = "ssh-ed25519 AAAAORCH orchestrator".to_string();
    config.timeouts.poll_interval_secs = 5;
    config
}

pub struct Orchestrator {
    pub ctx: Context,
    pub store: Arc<InMemoryClusterStore>,
    pub cloud: Arc<Cloud>,
}

impl Orchestrator {
    pub fn new(cloud: Arc<Cloud>) -> Self {
        let store = Arc::new(InMemoryClusterStore::new());
        let ctx = Context::builder(test_config())
            .store(store.clone())
            .inventory(cloud.clone())
            .compute(cloud.clone())
            .payload_service(cloud.clone())
            .network_service(cloud.clone())
            .transport(cloud.clone())
            .token_secret(TokenSecret::from_bytes(b"integration-test-token-secret!!!"))
            .build()
            .expect("context builds");
        Self { ctx, store, cloud }
    }

    /// Record a cluster the way the API layer would before creating it
    pub async fn register(&self, cluster: &ManagedCluster) {
        self.store.insert_cluster(cluster).await.unwrap();
    }
}
