//! Remote orchestration over SSH
//!
//! [`RemoteOrchestrator`] runs commands on cluster nodes through a
//! [`RemoteTransport`]. Every command is tried as the management user
//! first and, when that login fails, as the node's recorded login user.
//! Transient failures are retried a fixed number of times with a fixed
//! delay; waits poll against a [`Deadline`] fixed by the calling workflow.

pub mod commands;
mod transport;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::bootstrap::{CertificateKey, JoinToken};
use crate::config::OrchestratorConfig;
use crate::model::ClusterNode;
use crate::network::ClusterAccess;
use crate::retry::{poll_until, retry_fixed, Deadline, RetryPolicy};
use crate::Error;

use commands::{NodeStatus, RemoteCommand};

pub use transport::{CommandOutput, OpenSshTransport, RemoteTransport, SshTarget};

#[cfg(test)]
pub use transport::MockRemoteTransport;

const MAX_STDERR_IN_ERROR: usize = 512;

/// How remote calls are made
#[derive(Clone, Debug)]
pub struct RemoteSettings {
    /// Management login user
    pub user: String,
    /// Management private key
    pub key_path: PathBuf,
    /// Attempts and delay for transient failures
    pub retry: RetryPolicy,
    /// Per-command timeout
    pub command_timeout: Duration,
    /// TCP probe timeout
    pub probe_timeout: Duration,
    /// Pause between poll attempts
    pub poll_interval: Duration,
    /// Local upgrade script to copy instead of using the payload's
    pub upgrade_script: Option<PathBuf>,
}

impl From<&OrchestratorConfig> for RemoteSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            user: config.ssh.management_user.clone(),
            key_path: config.ssh.management_key_path.clone(),
            retry: config.ssh.retry_policy(),
            command_timeout: config.ssh.command_timeout(),
            probe_timeout: config.ssh.connect_timeout(),
            poll_interval: config.timeouts.poll_interval(),
            upgrade_script: config.bootstrap.upgrade_script.clone(),
        }
    }
}

/// Runs lifecycle operations on cluster nodes
#[derive(Clone)]
pub struct RemoteOrchestrator {
    transport: Arc<dyn RemoteTransport>,
    settings: RemoteSettings,
}

impl RemoteOrchestrator {
    /// Create an orchestrator
    pub fn new(transport: Arc<dyn RemoteTransport>, settings: RemoteSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Settings in use
    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    fn address(access: &ClusterAccess, node: &ClusterNode) -> Result<SocketAddr, Error> {
        access.ssh.target(node).ok_or_else(|| {
            Error::remote_exec(&node.name, 0, "node has no address to connect to")
        })
    }

    /// Login users to try, management user first
    fn users(&self, node: &ClusterNode) -> Vec<String> {
        let mut users = vec![self.settings.user.clone()];
        if let Some(login) = &node.login_user {
            if login != &self.settings.user {
                users.push(login.clone());
            }
        }
        users
    }

    fn target(&self, address: SocketAddr, user: &str) -> SshTarget {
        SshTarget {
            address,
            user: user.to_string(),
            key_path: self.settings.key_path.clone(),
        }
    }

    /// One attempt: each user in turn until a login succeeds
    ///
    /// A command that ran and failed is not retried as another user.
    async fn try_users(
        &self,
        address: SocketAddr,
        users: &[String],
        command: &RemoteCommand,
    ) -> Result<String, AttemptError> {
        let mut last = None;
        for user in users {
            let target = self.target(address, user);
            match self
                .transport
                .exec(&target, command, self.settings.command_timeout)
                .await
            {
                Ok(output) if output.success() => return Ok(output.stdout),
                Ok(output) => {
                    let mut stderr = output.stderr.trim().to_string();
                    stderr.truncate(MAX_STDERR_IN_ERROR);
                    return Err(AttemptError::Exited(format!(
                        "{} exited with {:?}: {}",
                        command.label(),
                        output.exit_code,
                        stderr
                    )));
                }
                Err(e) => {
                    debug!(target = %target, command = %command.label(), error = %e, "login failed");
                    last = Some(e);
                }
            }
        }
        Err(AttemptError::Unreachable(last.unwrap_or_else(|| {
            Error::remote_exec(address.to_string(), 0, "no login user")
        })))
    }

    /// Run a command on `node`, retrying transient failures
    ///
    /// Only failures to reach the node are retried. A command that ran and
    /// exited unsuccessfully fails at once.
    pub async fn run(
        &self,
        access: &ClusterAccess,
        node: &ClusterNode,
        command: &RemoteCommand,
    ) -> Result<String, Error> {
        let address = Self::address(access, node)?;
        let users = self.users(node);
        let users = users.as_slice();

        retry_fixed(
            &self.settings.retry,
            command.label(),
            AttemptError::is_transient,
            move || self.try_users(address, users, command),
        )
        .await
        .map_err(|exhausted| exhausted.last_error.into_error(address, exhausted.attempts))
    }

    /// Copy a local script to `node`
    pub async fn copy_script(
        &self,
        access: &ClusterAccess,
        node: &ClusterNode,
        local: &Path,
        remote: &str,
    ) -> Result<(), Error> {
        let address = Self::address(access, node)?;
        let users = self.users(node);
        let users = users.as_slice();
        let label = format!("copy {}", local.display());

        retry_fixed(&self.settings.retry, &label, |_: &Error| true, move || async move {
            let mut last = None;
            for user in users {
                match self.transport.copy(&self.target(address, user), local, remote).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e),
                }
            }
            Err(last.unwrap_or_else(|| Error::remote_exec(address.to_string(), 0, "no login user")))
        })
        .await
        .map_err(|exhausted| {
            Error::remote_exec(
                address.to_string(),
                exhausted.attempts,
                failure_message(exhausted.last_error),
            )
        })
    }

    async fn poll_command<T, F>(
        &self,
        access: &ClusterAccess,
        node: &ClusterNode,
        command: &RemoteCommand,
        deadline: &Deadline,
        operation: &str,
        check: F,
    ) -> Result<T, Error>
    where
        F: Fn(&str) -> Option<T>,
    {
        let address = Self::address(access, node)?;
        let users = self.users(node);
        let users = users.as_slice();
        let check = &check;

        poll_until(deadline, self.settings.poll_interval, operation, move || async move {
            let output = self
                .try_users(address, users, command)
                .await
                .map_err(|e| e.into_error(address, 1))?;
            Ok::<_, Error>(check(&output))
        })
        .await
    }

    /// Wait until the API port accepts connections
    #[instrument(skip(self, access, deadline), fields(endpoint = %access.endpoint()))]
    pub async fn wait_control_plane_reachable(
        &self,
        access: &ClusterAccess,
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let socket = access.api_socket();
        let probe_timeout = self.settings.probe_timeout;
        poll_until(
            deadline,
            self.settings.poll_interval,
            "control plane reachable",
            move || async move {
                Ok::<_, Error>(self.transport.probe(socket, probe_timeout).await.then_some(()))
            },
        )
        .await?;
        info!("control plane reachable");
        Ok(())
    }

    /// Wait until at least `expected` nodes report Ready
    ///
    /// Returns the ready count observed. On timeout the error is returned
    /// and nothing is torn down; the nodes may still come up.
    #[instrument(skip(self, access, control, deadline), fields(control = %control.name))]
    pub async fn wait_ready_node_count(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        expected: u32,
        deadline: &Deadline,
    ) -> Result<u32, Error> {
        let command = commands::list_nodes();
        let ready = self
            .poll_command(
                access,
                control,
                &command,
                deadline,
                &format!("{expected} ready nodes"),
                |output| {
                    let ready = commands::ready_count(output);
                    debug!(ready, expected, "ready nodes");
                    (ready >= expected).then_some(ready)
                },
            )
            .await?;
        info!(ready, "cluster nodes ready");
        Ok(ready)
    }

    /// Current node list of the cluster
    pub async fn node_statuses(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
    ) -> Result<Vec<NodeStatus>, Error> {
        let output = self.run(access, control, &commands::list_nodes()).await?;
        Ok(commands::parse_nodes(&output))
    }

    /// Cordon `node_name` and evict its workloads
    pub async fn drain_and_cordon(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        node_name: &str,
    ) -> Result<(), Error> {
        self.run(access, control, &commands::drain(node_name)).await?;
        info!(node = %node_name, "node drained");
        Ok(())
    }

    /// Make `node_name` schedulable again
    pub async fn uncordon(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        node_name: &str,
    ) -> Result<(), Error> {
        self.run(access, control, &commands::uncordon(node_name)).await?;
        debug!(node = %node_name, "node uncordoned");
        Ok(())
    }

    /// Check an external node before admitting it
    pub async fn validate_node_dependencies(
        &self,
        access: &ClusterAccess,
        node: &ClusterNode,
    ) -> Result<(), Error> {
        self.run(access, node, &commands::check_dependencies())
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(node = %node.name, error = %e, "node failed dependency check");
                e
            })
    }

    /// Fetch the admin kubeconfig, pointed at the public endpoint
    pub async fn fetch_admin_config(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
    ) -> Result<Zeroizing<String>, Error> {
        let raw = Zeroizing::new(self.run(access, control, &commands::admin_config()).await?);
        if raw.trim().is_empty() {
            return Err(Error::remote_exec(
                &control.name,
                1,
                "admin config is empty",
            ));
        }
        Ok(Zeroizing::new(commands::rewrite_server(&raw, &access.endpoint())))
    }

    /// Wait until every pod in `namespace` runs
    pub async fn wait_dashboard_running(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        namespace: &str,
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let command = commands::list_pods(namespace);
        self.poll_command(
            access,
            control,
            &command,
            deadline,
            &format!("pods in {namespace} running"),
            |output| commands::all_pods_running(output).then_some(()),
        )
        .await?;
        info!(namespace = %namespace, "dashboard running");
        Ok(())
    }

    /// Make sure `token` is registered with the control plane
    pub async fn create_join_token(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        token: &JoinToken,
        ttl: Duration,
    ) -> Result<(), Error> {
        self.run(access, control, &commands::create_token(token, ttl.as_secs()))
            .await?;
        debug!(token_id = %token.id(), "join token registered");
        Ok(())
    }

    /// Join `node` to the cluster through `endpoint`
    pub async fn join_node(
        &self,
        access: &ClusterAccess,
        node: &ClusterNode,
        endpoint: &str,
        token: &JoinToken,
        certificate_key: Option<&CertificateKey>,
    ) -> Result<(), Error> {
        self.run(access, node, &commands::join(endpoint, token, certificate_key))
            .await?;
        info!(node = %node.name, "node joined");
        Ok(())
    }

    /// Remove `node_name` from the cluster's node list
    pub async fn delete_node(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        node_name: &str,
    ) -> Result<(), Error> {
        self.run(access, control, &commands::delete_node(node_name)).await?;
        info!(node = %node_name, "node deleted from cluster");
        Ok(())
    }

    /// Wipe cluster state from a node leaving the cluster
    pub async fn reset_node(&self, access: &ClusterAccess, node: &ClusterNode) -> Result<(), Error> {
        self.run(access, node, &commands::reset()).await?;
        debug!(node = %node.name, "node reset");
        Ok(())
    }

    /// Upgrade the node software on `node` to `version`
    ///
    /// `first_control` marks the node that upgrades the control plane.
    pub async fn run_upgrade(
        &self,
        access: &ClusterAccess,
        node: &ClusterNode,
        version: &str,
        first_control: bool,
    ) -> Result<(), Error> {
        let script = match &self.settings.upgrade_script {
            Some(local) => {
                self.copy_script(access, node, local, commands::COPIED_UPGRADE_SCRIPT)
                    .await?;
                commands::COPIED_UPGRADE_SCRIPT
            }
            None => commands::PAYLOAD_UPGRADE_SCRIPT,
        };
        let control = node.role == crate::model::NodeRole::Control;
        self.run(access, node, &commands::upgrade(script, version, control, first_control))
            .await?;
        info!(node = %node.name, version = %version, "upgrade script finished");
        Ok(())
    }

    /// Wait until `node_name` reports Ready
    pub async fn wait_node_ready(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        node_name: &str,
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let command = commands::list_nodes();
        self.poll_command(
            access,
            control,
            &command,
            deadline,
            &format!("node {node_name} ready"),
            |output| {
                commands::parse_nodes(output)
                    .iter()
                    .any(|n| n.name == node_name && n.ready)
                    .then_some(())
            },
        )
        .await
    }

    /// Wait until `node_name` reports `version`
    pub async fn wait_node_version(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        node_name: &str,
        version: &str,
        deadline: &Deadline,
    ) -> Result<(), Error> {
        let command = commands::list_nodes();
        self.poll_command(
            access,
            control,
            &command,
            deadline,
            &format!("node {node_name} version {version}"),
            |output| {
                commands::parse_nodes(output)
                    .iter()
                    .any(|n| n.name == node_name && n.version == version)
                    .then_some(())
            },
        )
        .await
    }

    /// Install or reconfigure the autoscaler agent
    pub async fn deploy_autoscaler(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
        cluster_name: &str,
        image: &str,
        min_size: u32,
        max_size: u32,
    ) -> Result<(), Error> {
        let manifest = commands::autoscaler_manifest(cluster_name, image, min_size, max_size)?;
        self.run(access, control, &commands::apply_manifest("apply autoscaler", manifest))
            .await?;
        info!(cluster = %cluster_name, min_size, max_size, "autoscaler deployed");
        Ok(())
    }

    /// Remove the autoscaler agent
    pub async fn remove_autoscaler(
        &self,
        access: &ClusterAccess,
        control: &ClusterNode,
    ) -> Result<(), Error> {
        self.run(access, control, &commands::remove_autoscaler()).await?;
        info!("autoscaler removed");
        Ok(())
    }
}

/// Why a single attempt to run a command failed
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    /// No login user got a session on the node
    #[error(transparent)]
    Unreachable(Error),
    /// The command ran and exited unsuccessfully
    #[error("{0}")]
    Exited(String),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Unreachable(_))
    }

    fn into_error(self, address: SocketAddr, attempts: u32) -> Error {
        let message = match self {
            AttemptError::Unreachable(e) => failure_message(e),
            AttemptError::Exited(message) => message,
        };
        Error::remote_exec(address.to_string(), attempts, message)
    }
}

fn failure_message(e: Error) -> String {
    match e {
        Error::RemoteExecFailure { message, .. } => message,
        other => other.to_string(),
    }
}
