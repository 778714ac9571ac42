//! Bootstrap payload rendering
//!
//! Each node boots from a cloud-config document rendered from a role
//! template. The builder is pure: it takes the cluster, the node, the join
//! token and (for control nodes) the TLS bundle and returns the document.
//! Callers pass [`BootstrapPayload::encoded`] to the compute service as the
//! instance's user data.
//!
//! Secrets in the payload (join token, certificate key, private key,
//! registry password) never appear in `Debug` output.

mod token;

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{context, Environment, UndefinedBehavior};
use zeroize::Zeroizing;

use crate::model::{node_name, ManagedCluster, NodeRole, RegistryCredentials};
use crate::pki::TlsBundle;
use crate::Error;

pub use token::{CertificateKey, JoinToken, JoinWindow, TokenError, TokenSecret};

const CONTROL_INIT_TEMPLATE: &str = include_str!("../../templates/control-init.yaml.j2");
const CONTROL_JOIN_TEMPLATE: &str = include_str!("../../templates/control-join.yaml.j2");
const WORKER_TEMPLATE: &str = include_str!("../../templates/worker.yaml.j2");
const ETCD_TEMPLATE: &str = include_str!("../../templates/etcd.yaml.j2");

/// Port etcd serves clients on
pub const ETCD_CLIENT_PORT: u16 = 2379;
/// Port etcd peers talk on
pub const ETCD_PEER_PORT: u16 = 2380;

/// Which template a node boots from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// First control node; initialises the control plane
    ControlInit,
    /// Additional control node joining the control plane
    ControlJoin,
    /// Worker joining the data plane
    Worker,
    /// Dedicated etcd member
    Etcd,
}

impl PayloadKind {
    /// Template for a node of `role`; `primary` marks the first control node
    pub fn for_node(role: NodeRole, primary: bool) -> Self {
        match role {
            NodeRole::Control if primary => Self::ControlInit,
            NodeRole::Control => Self::ControlJoin,
            NodeRole::Worker => Self::Worker,
            NodeRole::Etcd => Self::Etcd,
        }
    }

    fn template_name(&self) -> &'static str {
        match self {
            Self::ControlInit => "control-init",
            Self::ControlJoin => "control-join",
            Self::Worker => "worker",
            Self::Etcd => "etcd",
        }
    }
}

/// Everything a node's payload is rendered from
#[derive(Debug)]
pub struct PayloadRequest<'a> {
    /// Owning cluster
    pub cluster: &'a ManagedCluster,
    /// Hostname of the node
    pub node_name: String,
    /// Template to use
    pub kind: PayloadKind,
    /// `host:port` the node joins through
    pub join_endpoint: String,
    /// Cluster join token
    pub token: &'a JoinToken,
    /// Certificate-sharing key (HA versions only)
    pub certificate_key: Option<&'a CertificateKey>,
    /// API server certificate bundle (control nodes only)
    pub tls: Option<&'a TlsBundle>,
    /// Login user for the management key
    pub ssh_user: &'a str,
    /// Management public key
    pub management_key: &'a str,
    /// DNS domain of the orchestrated cluster
    pub cluster_domain: &'a str,
    /// Names covered by the API certificate
    pub cert_sans: Vec<String>,
    /// Token lifetime written into the init configuration
    pub token_ttl: std::time::Duration,
}

/// A rendered bootstrap document
pub struct BootstrapPayload {
    /// Node the payload is for
    pub node_name: String,
    /// Template it was rendered from
    pub kind: PayloadKind,
    document: Zeroizing<String>,
}

impl BootstrapPayload {
    /// The rendered document
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Base64 of the document, the form instance user data takes
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.document.as_bytes())
    }
}

impl std::fmt::Debug for BootstrapPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapPayload")
            .field("node_name", &self.node_name)
            .field("kind", &self.kind)
            .field("len", &self.document.len())
            .finish()
    }
}

/// Hostnames and client URLs of the cluster's dedicated etcd nodes
pub fn etcd_endpoints(cluster: &ManagedCluster) -> Vec<String> {
    (1..=cluster.etcd_nodes)
        .map(|i| {
            format!(
                "https://{}:{}",
                node_name(&cluster.name, NodeRole::Etcd, i),
                ETCD_CLIENT_PORT
            )
        })
        .collect()
}

fn etcd_initial_cluster(cluster: &ManagedCluster) -> String {
    (1..=cluster.etcd_nodes)
        .map(|i| {
            let name = node_name(&cluster.name, NodeRole::Etcd, i);
            format!("{name}=https://{name}:{ETCD_PEER_PORT}")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// SSH keys installed on every node: the management key and the tenant key
pub fn authorized_keys(management_key: &str, cluster: &ManagedCluster) -> Vec<String> {
    [Some(management_key), cluster.key_pair.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn registry_context(registry: Option<&RegistryCredentials>) -> minijinja::Value {
    match registry {
        Some(r) => context! {
            url => r.url,
            username_b64 => STANDARD.encode(r.username.as_bytes()),
            password_b64 => STANDARD.encode(r.password.as_bytes()),
        },
        None => minijinja::Value::from(()),
    }
}

/// Renders role templates into bootstrap payloads
pub struct BootstrapPayloadBuilder {
    env: Environment<'static>,
}

impl BootstrapPayloadBuilder {
    /// Load the role templates
    pub fn new() -> Result<Self, Error> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        for (name, source) in [
            ("control-init", CONTROL_INIT_TEMPLATE),
            ("control-join", CONTROL_JOIN_TEMPLATE),
            ("worker", WORKER_TEMPLATE),
            ("etcd", ETCD_TEMPLATE),
        ] {
            env.add_template(name, source)
                .map_err(|e| Error::bootstrap("template", format!("{name}: {e}")))?;
        }
        Ok(Self { env })
    }

    /// Render the payload for one node
    pub fn build(&self, request: &PayloadRequest<'_>) -> Result<BootstrapPayload, Error> {
        let cluster = request.cluster;
        let kind = request.kind;

        let tls = match kind {
            PayloadKind::ControlInit | PayloadKind::ControlJoin => {
                let bundle = request.tls.ok_or_else(|| {
                    Error::bootstrap(
                        "template",
                        format!("control node {} needs a TLS bundle", request.node_name),
                    )
                })?;
                context! {
                    cert_pem => bundle.cert_pem.trim_end(),
                    key_pem => bundle.key_pem.trim_end(),
                    ca_cert_pem => bundle.ca_cert_pem.trim_end(),
                }
            }
            PayloadKind::Worker | PayloadKind::Etcd => minijinja::Value::from(()),
        };

        let certificate_key = match (kind, request.certificate_key) {
            (PayloadKind::ControlJoin, None) => {
                return Err(Error::bootstrap(
                    "template",
                    format!(
                        "control node {} cannot join without a certificate key",
                        request.node_name
                    ),
                ));
            }
            (PayloadKind::ControlInit | PayloadKind::ControlJoin, Some(key)) => {
                Some(key.expose().to_string())
            }
            _ => None,
        };

        let token = request.token.expose();
        let ctx = context! {
            cluster_name => cluster.name,
            node_name => request.node_name,
            ssh_user => request.ssh_user,
            ssh_keys => authorized_keys(request.management_key, cluster),
            join_endpoint => request.join_endpoint,
            join_token => token.as_str(),
            token_ttl => format!("{}s", request.token_ttl.as_secs()),
            certificate_key => certificate_key,
            tls => tls,
            version => cluster.version.node_version(),
            cluster_domain => request.cluster_domain,
            cert_sans => request.cert_sans,
            etcd_endpoints => etcd_endpoints(cluster),
            etcd_initial_cluster => etcd_initial_cluster(cluster),
            registry => registry_context(cluster.registry.as_ref()),
        };

        let document = self
            .env
            .get_template(kind.template_name())
            .and_then(|t| t.render(ctx))
            .map_err(|e| Error::bootstrap("template", format!("{}: {}", request.node_name, e)))?;

        Ok(BootstrapPayload {
            node_name: request.node_name.clone(),
            kind,
            document: Zeroizing::new(document),
        })
    }
}
