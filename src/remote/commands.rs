//! Remote command builders and output parsers
//!
//! Everything here is pure. Commands run as the login user and escalate
//! with `sudo`; cluster-level commands use the admin kubeconfig on the
//! primary control node.

use minijinja::{context, Environment};
use zeroize::Zeroizing;

use crate::bootstrap::{CertificateKey, JoinToken};
use crate::Error;

const KUBECTL: &str = "sudo kubectl --kubeconfig /etc/kubernetes/admin.conf";
const ADMIN_CONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

/// Upgrade script shipped on the payload medium
pub const PAYLOAD_UPGRADE_SCRIPT: &str = "/opt/bin/upgrade-kubernetes";
/// Where a local upgrade script is copied to
pub const COPIED_UPGRADE_SCRIPT: &str = "/tmp/upgrade-kubernetes.sh";

const AUTOSCALER_TEMPLATE: &str = include_str!("../../templates/autoscaler.yaml.j2");

/// A command to run on a node
///
/// The script may contain secrets; only the label is ever logged.
#[derive(Clone)]
pub struct RemoteCommand {
    label: String,
    script: Zeroizing<String>,
    stdin: Option<Zeroizing<String>>,
}

impl RemoteCommand {
    /// Command with a log label
    pub fn new(label: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            script: Zeroizing::new(script.into()),
            stdin: None,
        }
    }

    /// Feed `input` to the command's standard input
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(Zeroizing::new(input.into()));
        self
    }

    /// Log label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Shell script to run
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Standard input, if any
    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref().map(String::as_str)
    }
}

impl std::fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("label", &self.label)
            .field("stdin", &self.stdin.as_ref().map(|s| s.len()))
            .finish()
    }
}

/// Quote a value for a POSIX shell
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// List the cluster's nodes
pub fn list_nodes() -> RemoteCommand {
    RemoteCommand::new("list nodes", format!("{KUBECTL} get nodes --no-headers"))
}

/// Cordon a node, then evict its workloads
pub fn drain(node: &str) -> RemoteCommand {
    let quoted = quote(node);
    RemoteCommand::new(
        format!("drain {node}"),
        format!(
            "{KUBECTL} cordon {quoted} && {KUBECTL} drain {quoted} --ignore-daemonsets --delete-emptydir-data --timeout=300s"
        ),
    )
}

/// Make a node schedulable again
pub fn uncordon(node: &str) -> RemoteCommand {
    RemoteCommand::new(format!("uncordon {node}"), format!("{KUBECTL} uncordon {}", quote(node)))
}

/// Remove a node object from the cluster
pub fn delete_node(node: &str) -> RemoteCommand {
    RemoteCommand::new(
        format!("delete node {node}"),
        format!("{KUBECTL} delete node {} --ignore-not-found", quote(node)),
    )
}

/// Check a node has the binaries and services a member needs
pub fn check_dependencies() -> RemoteCommand {
    RemoteCommand::new(
        "check node dependencies",
        "for bin in kubeadm kubelet kubectl containerd; do \
command -v \"$bin\" >/dev/null 2>&1 || { echo \"missing $bin\" >&2; exit 1; }; done; \
sudo systemctl is-enabled kubelet >/dev/null 2>&1 || { echo 'kubelet not enabled' >&2; exit 1; }",
    )
}

/// Print the admin kubeconfig
pub fn admin_config() -> RemoteCommand {
    RemoteCommand::new("read admin config", format!("sudo cat {ADMIN_CONFIG_PATH}"))
}

/// List pods of a namespace
pub fn list_pods(namespace: &str) -> RemoteCommand {
    RemoteCommand::new(
        format!("list pods in {namespace}"),
        format!("{KUBECTL} get pods -n {} --no-headers", quote(namespace)),
    )
}

/// Register `token` with the control plane unless it already exists
pub fn create_token(token: &JoinToken, ttl_secs: u64) -> RemoteCommand {
    let full = token.expose();
    RemoteCommand::new(
        format!("create join token {}", token.id()),
        format!(
            "sudo kubeadm token list 2>/dev/null | grep -q '^{id}\\.' || sudo kubeadm token create {token} --ttl {ttl_secs}s",
            id = token.id(),
            token = quote(&full),
        ),
    )
}

/// Join a node to the cluster
///
/// With a certificate key the node joins the control plane.
pub fn join(endpoint: &str, token: &JoinToken, certificate_key: Option<&CertificateKey>) -> RemoteCommand {
    let full = token.expose();
    let mut script = format!(
        "sudo kubeadm join {} --token {} --discovery-token-unsafe-skip-ca-verification",
        quote(endpoint),
        quote(&full)
    );
    if let Some(key) = certificate_key {
        script.push_str(&format!(" --control-plane --certificate-key {}", quote(key.expose())));
    }
    RemoteCommand::new(format!("join {endpoint}"), script)
}

/// Wipe a node's cluster state
pub fn reset() -> RemoteCommand {
    RemoteCommand::new("reset node", "sudo kubeadm reset -f && sudo rm -rf /etc/cni/net.d")
}

/// Run the upgrade script
///
/// `first` marks the control node that upgrades the control plane itself.
pub fn upgrade(script: &str, version: &str, control: bool, first: bool) -> RemoteCommand {
    RemoteCommand::new(
        format!("upgrade to {version}"),
        format!(
            "sudo chmod +x {script} && sudo {script} {} {control} {first}",
            quote(version),
            script = quote(script),
        ),
    )
}

/// Apply a manifest fed on standard input
pub fn apply_manifest(label: &str, manifest: String) -> RemoteCommand {
    RemoteCommand::new(label, format!("{KUBECTL} apply -f -")).with_stdin(manifest)
}

/// Remove the autoscaler deployment
pub fn remove_autoscaler() -> RemoteCommand {
    RemoteCommand::new(
        "remove autoscaler",
        format!(
            "{KUBECTL} delete -n kube-system deployment/cluster-autoscaler serviceaccount/cluster-autoscaler --ignore-not-found"
        ),
    )
}

/// Render the autoscaler manifest
pub fn autoscaler_manifest(
    cluster_name: &str,
    image: &str,
    min_size: u32,
    max_size: u32,
) -> Result<String, Error> {
    let mut env = Environment::new();
    env.add_template("autoscaler", AUTOSCALER_TEMPLATE)
        .map_err(|e| Error::bootstrap("template", format!("autoscaler: {e}")))?;
    env.get_template("autoscaler")
        .and_then(|t| {
            t.render(context! {
                cluster_name => cluster_name,
                image => image,
                min_size => min_size,
                max_size => max_size,
            })
        })
        .map_err(|e| Error::bootstrap("template", format!("autoscaler: {e}")))
}

/// One row of `kubectl get nodes`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node name
    pub name: String,
    /// Ready condition is true
    pub ready: bool,
    /// Kubelet version
    pub version: String,
}

/// Parse `kubectl get nodes --no-headers`
///
/// Columns are NAME STATUS ROLES AGE VERSION; STATUS may carry extra flags
/// such as `Ready,SchedulingDisabled`.
pub fn parse_nodes(output: &str) -> Vec<NodeStatus> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return None;
            }
            Some(NodeStatus {
                name: cols[0].to_string(),
                ready: cols[1].split(',').any(|s| s == "Ready"),
                version: cols[4].to_string(),
            })
        })
        .collect()
}

/// Number of Ready nodes
pub fn ready_count(output: &str) -> u32 {
    parse_nodes(output).iter().filter(|n| n.ready).count() as u32
}

/// Returns true if at least one pod is listed and every pod is Running
pub fn all_pods_running(output: &str) -> bool {
    let statuses: Vec<&str> = output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .collect();
    !statuses.is_empty() && statuses.iter().all(|s| *s == "Running" || *s == "Completed")
}

/// Point every `server:` entry of a kubeconfig at `endpoint`
pub fn rewrite_server(config: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    let mut out: Vec<String> = config
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("server:") {
                let indent = &line[..line.len() - trimmed.len()];
                format!("{indent}server: {endpoint}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if config.ends_with('\n') {
        out.push(String::new());
    }
    out.join("\n")
}
