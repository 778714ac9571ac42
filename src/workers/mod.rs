//! Lifecycle workflows
//!
//! One free async function per operation. Each loads the cluster, records
//! intent through the [`ClusterStateMachine`], drives the components in a
//! fixed order and, on failure, runs its compensating actions before the
//! failure transition. Only this module decides cluster-state transitions.
//!
//! Workflows for different clusters share nothing but the [`Context`] and
//! may run concurrently; the guarded transitions reject a second workflow
//! on the same cluster.

mod autoscale;
mod create;
mod destroy;
mod membership;
mod power;
mod reconcile;
mod scale;
mod upgrade;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::bootstrap::{
    BootstrapPayload, BootstrapPayloadBuilder, CertificateKey, JoinToken, JoinWindow,
    PayloadKind, PayloadRequest, TokenSecret,
};
use crate::config::OrchestratorConfig;
use crate::model::{primary_control_node, ClusterNode, ManagedCluster, NodeRole};
use crate::network::{NetworkInfo, NetworkRuleCoordinator, NetworkRuleService, RuleSettings};
use crate::pki::{CertificateAuthority, ControlPlaneCertRequest, TlsBundle};
use crate::planner::{CapacityInventory, DeploymentPlanner, PlacementConstraints};
use crate::provisioner::{ComputeService, NodeProvisioner, PayloadService};
use crate::remote::{OpenSshTransport, RemoteOrchestrator, RemoteSettings, RemoteTransport};
use crate::state::{ClusterStateMachine, ClusterStore, InMemoryClusterStore};
use crate::Error;

pub use autoscale::{update_autoscaling, AutoscaleRequest};
pub use create::create_cluster;
pub use destroy::{destroy_cluster, DestroyRequest};
pub use membership::{add_nodes, remove_nodes, ExternalNode, MembershipOutcome, RejectedNode};
pub use power::{start_cluster, stop_cluster};
pub use reconcile::{collect_garbage, reconcile_all, reconcile_cluster, GcReport};
pub use scale::{scale_cluster, ScaleRequest};
pub use upgrade::{upgrade_cluster, UpgradeRequest};

/// Shared collaborators of every workflow
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(config)
///     .inventory(inventory)
///     .compute(compute)
///     .payload_service(payloads)
///     .network_service(rules)
///     .build()?;
/// ```
pub struct Context {
    /// Cluster and membership records
    pub store: Arc<dyn ClusterStore>,
    /// Guarded state transitions
    pub state: ClusterStateMachine,
    /// Capacity feasibility
    pub planner: DeploymentPlanner,
    /// Reachability rules
    pub network: NetworkRuleCoordinator,
    /// Instances and payload media
    pub provisioner: NodeProvisioner,
    /// Commands on nodes
    pub remote: RemoteOrchestrator,
    /// Bootstrap documents
    pub payloads: BootstrapPayloadBuilder,
    /// Issues API server certificates
    pub ca: Arc<CertificateAuthority>,
    /// Key material join tokens derive from
    pub token_secret: TokenSecret,
    /// Orchestrator configuration
    pub config: Arc<OrchestratorConfig>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(config: OrchestratorConfig) -> ContextBuilder {
        ContextBuilder::new(config)
    }

    /// Join window tokens are derived for
    pub fn join_window(&self) -> JoinWindow {
        JoinWindow::new(self.config.bootstrap.join_window())
    }

    /// Current join token of a cluster, plus the certificate key on HA versions
    pub fn join_credentials(&self, cluster: &ManagedCluster) -> (JoinToken, Option<CertificateKey>) {
        let window = self.join_window().current();
        let token = JoinToken::derive(&self.token_secret, cluster.id, window);
        let key = cluster
            .version
            .ha_capable
            .then(|| CertificateKey::derive(&self.token_secret, cluster.id, window));
        (token, key)
    }
}

/// Builder for constructing [`Context`] instances
///
/// The inventory, compute, payload and network services have no default
/// and must be set. The store defaults to an in-memory one, the transport
/// to OpenSSH, and the CA and token secret are generated when not given.
pub struct ContextBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn ClusterStore>>,
    inventory: Option<Arc<dyn CapacityInventory>>,
    compute: Option<Arc<dyn ComputeService>>,
    payload_service: Option<Arc<dyn PayloadService>>,
    network_service: Option<Arc<dyn NetworkRuleService>>,
    transport: Option<Arc<dyn RemoteTransport>>,
    ca: Option<CertificateAuthority>,
    token_secret: Option<TokenSecret>,
}

impl ContextBuilder {
    fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            inventory: None,
            compute: None,
            payload_service: None,
            network_service: None,
            transport: None,
            ca: None,
            token_secret: None,
        }
    }

    /// Set the persistence layer
    pub fn store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the capacity inventory
    pub fn inventory(mut self, inventory: Arc<dyn CapacityInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Set the compute service
    pub fn compute(mut self, compute: Arc<dyn ComputeService>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Set the payload service
    pub fn payload_service(mut self, payloads: Arc<dyn PayloadService>) -> Self {
        self.payload_service = Some(payloads);
        self
    }

    /// Set the network rule service
    pub fn network_service(mut self, rules: Arc<dyn NetworkRuleService>) -> Self {
        self.network_service = Some(rules);
        self
    }

    /// Override the remote transport (primarily for testing)
    pub fn transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use an existing certificate authority
    pub fn certificate_authority(mut self, ca: CertificateAuthority) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Use existing token key material
    pub fn token_secret(mut self, secret: TokenSecret) -> Self {
        self.token_secret = Some(secret);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        self.config.validate()?;
        let required = |name: &str| Error::config(format!("{name} service is required"));

        let inventory = self.inventory.ok_or_else(|| required("capacity inventory"))?;
        let compute = self.compute.ok_or_else(|| required("compute"))?;
        let payload_service = self.payload_service.ok_or_else(|| required("payload"))?;
        let network_service = self.network_service.ok_or_else(|| required("network rule"))?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryClusterStore::new()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(OpenSshTransport::new(self.config.ssh.connect_timeout())));
        let ca = match self.ca {
            Some(ca) => ca,
            None => CertificateAuthority::new("cluster-orchestrator CA")?,
        };
        let token_secret = match self.token_secret {
            Some(secret) => secret,
            None => TokenSecret::generate()?,
        };

        Ok(Context {
            state: ClusterStateMachine::new(store.clone()),
            planner: DeploymentPlanner::new(
                inventory,
                PlacementConstraints::from(&self.config.planner),
            ),
            network: NetworkRuleCoordinator::new(network_service, RuleSettings::from(&self.config)),
            provisioner: NodeProvisioner::new(compute, payload_service, store.clone()),
            remote: RemoteOrchestrator::new(transport, RemoteSettings::from(&self.config)),
            payloads: BootstrapPayloadBuilder::new()?,
            ca: Arc::new(ca),
            token_secret,
            config: Arc::new(self.config),
            store,
        })
    }
}

// =============================================================================
// Helpers shared by the workflows
// =============================================================================

/// Load a cluster and its membership, sorted by ordinal
pub(crate) async fn load(
    ctx: &Context,
    cluster_id: Uuid,
) -> Result<(ManagedCluster, Vec<ClusterNode>), Error> {
    let cluster = ctx.store.get_cluster(cluster_id).await?;
    let nodes = ctx.store.list_nodes(cluster_id).await?;
    Ok((cluster, nodes))
}

/// The primary control node, required by every cluster-level command
pub(crate) fn primary(cluster: &ManagedCluster, nodes: &[ClusterNode]) -> Result<ClusterNode, Error> {
    primary_control_node(nodes)
        .cloned()
        .ok_or_else(|| Error::not_found("control node", &cluster.name))
}

/// Recompute accounting from the membership and persist the cluster
pub(crate) async fn persist_accounting(
    ctx: &Context,
    cluster: &mut ManagedCluster,
    nodes: &[ClusterNode],
) -> Result<(), Error> {
    cluster.sync_accounting(nodes);
    ctx.store.update_cluster(cluster).await
}

/// Re-derive the accounting fields from the stored membership
///
/// Runs on failure paths, where a workflow may stop between membership
/// changes. Store errors are logged so the failure transition still runs.
pub(crate) async fn resync_accounting(ctx: &Context, cluster: &mut ManagedCluster) {
    let nodes = match ctx.store.list_nodes(cluster.id).await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(cluster = %cluster.name, error = %e, "failed to reload membership");
            return;
        }
    };
    if let Err(e) = persist_accounting(ctx, cluster, &nodes).await {
        warn!(cluster = %cluster.name, error = %e, "failed to persist accounting");
    }
}

/// Failure reason stored with a failure transition
pub(crate) fn reason(action: &str, error: &Error) -> String {
    format!("{action} failed: {error}")
}

/// `host:port` string, bracketing IPv6 addresses
pub(crate) fn host_port(address: IpAddr, port: u16) -> String {
    SocketAddr::new(address, port).to_string()
}

/// Endpoint nodes join through
///
/// The primary control node's private address when known, else the
/// cluster's public address, else the primary's hostname.
pub(crate) fn join_endpoint(
    ctx: &Context,
    network: &NetworkInfo,
    primary_name: &str,
    primary_address: Option<IpAddr>,
) -> String {
    let port = ctx.config.network.api_port;
    match (primary_address, network.public_address) {
        (Some(address), _) => host_port(address, port),
        (None, Some(public)) => host_port(public, port),
        (None, None) => format!("{primary_name}:{port}"),
    }
}

/// Certificate request covering every control hostname and the public address
pub(crate) fn control_cert_request(
    ctx: &Context,
    cluster: &ManagedCluster,
    network: &NetworkInfo,
    control_names: Vec<String>,
    control_addresses: Vec<IpAddr>,
) -> ControlPlaneCertRequest {
    let mut addresses = control_addresses;
    if let Some(public) = network.public_address {
        addresses.push(public);
    }
    ControlPlaneCertRequest {
        cluster_name: cluster.name.clone(),
        hostnames: control_names,
        addresses,
        cluster_domain: ctx.config.bootstrap.cluster_domain.clone(),
        extra_sans: Vec::new(),
    }
}

/// Everything needed to render payloads for one batch of nodes
pub(crate) struct PayloadContext<'a> {
    pub cluster: &'a ManagedCluster,
    pub token: &'a JoinToken,
    pub certificate_key: Option<&'a CertificateKey>,
    pub tls: Option<&'a TlsBundle>,
    pub cert_sans: Vec<String>,
}

impl PayloadContext<'_> {
    /// Render the payload of one node
    pub fn render(
        &self,
        ctx: &Context,
        node_name: &str,
        kind: PayloadKind,
        join_endpoint: &str,
    ) -> Result<BootstrapPayload, Error> {
        let tls = match kind {
            PayloadKind::ControlInit | PayloadKind::ControlJoin => self.tls,
            PayloadKind::Worker | PayloadKind::Etcd => None,
        };
        ctx.payloads.build(&PayloadRequest {
            cluster: self.cluster,
            node_name: node_name.to_string(),
            kind,
            join_endpoint: join_endpoint.to_string(),
            token: self.token,
            certificate_key: self.certificate_key,
            tls,
            ssh_user: &ctx.config.ssh.management_user,
            management_key: &ctx.config.ssh.management_public_key,
            cluster_domain: &ctx.config.bootstrap.cluster_domain,
            cert_sans: self.cert_sans.clone(),
            token_ttl: ctx.config.bootstrap.join_window(),
        })
    }
}

/// Smallest unused hostname index of a role
pub(crate) fn free_name_index(cluster: &ManagedCluster, nodes: &[ClusterNode], role: NodeRole) -> u32 {
    (1..)
        .find(|i| {
            let name = crate::model::node_name(&cluster.name, role, *i);
            !nodes.iter().any(|n| n.name == name)
        })
        .unwrap_or(1)
}
