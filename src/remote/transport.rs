//! SSH transport

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::commands::RemoteCommand;
use crate::Error;

/// Who to log in as, where
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    /// Address and port to connect to
    pub address: SocketAddr,
    /// Login user
    pub user: String,
    /// Private key file
    pub key_path: PathBuf,
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.address)
    }
}

/// Result of a remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, `None` if the command was killed
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Remote execution transport
///
/// `exec` returns `Err` only when the command could not be run at all; a
/// command that ran and failed is an `Ok` output with a non-zero status.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command
    async fn exec(
        &self,
        target: &SshTarget,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, Error>;

    /// Copy a local file to the node
    async fn copy(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<(), Error>;

    /// Returns true if a TCP connection to `address` succeeds within `timeout`
    async fn probe(&self, address: SocketAddr, timeout: Duration) -> bool;
}

/// Transport shelling out to the OpenSSH client
#[derive(Clone, Debug)]
pub struct OpenSshTransport {
    connect_timeout: Duration,
}

impl OpenSshTransport {
    /// Create a transport with the given connect timeout
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn common_options(&self, key_path: &Path) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-i".to_string(),
            key_path.display().to_string(),
        ]
    }
}

#[async_trait]
impl RemoteTransport for OpenSshTransport {
    async fn exec(
        &self,
        target: &SshTarget,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<CommandOutput, Error> {
        let host = target.address.to_string();
        debug!(target = %target, command = %command.label(), "running remote command");

        let mut child = Command::new("ssh")
            .args(self.common_options(&target.key_path))
            .arg("-p")
            .arg(target.address.port().to_string())
            .arg(format!("{}@{}", target.user, target.address.ip()))
            .arg("--")
            .arg(command.script())
            .stdin(if command.stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::remote_exec(&host, 1, format!("failed to spawn ssh: {e}")))?;

        if let (Some(input), Some(mut stdin)) = (command.stdin(), child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| Error::remote_exec(&host, 1, format!("failed to write stdin: {e}")))?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::remote_exec(&host, 1, format!("{} timed out after {:?}", command.label(), timeout))
            })?
            .map_err(|e| Error::remote_exec(&host, 1, format!("ssh failed: {e}")))?;

        let output = CommandOutput::from(output);
        // 255 is ssh's own failure status, not the remote command's
        if output.exit_code == Some(255) {
            return Err(Error::remote_exec(
                &host,
                1,
                format!("ssh connection failed: {}", output.stderr.trim()),
            ));
        }
        Ok(output)
    }

    async fn copy(&self, target: &SshTarget, local: &Path, remote: &str) -> Result<(), Error> {
        let host = target.address.to_string();
        debug!(target = %target, local = %local.display(), remote = %remote, "copying file");

        let output = Command::new("scp")
            .args(self.common_options(&target.key_path))
            .arg("-P")
            .arg(target.address.port().to_string())
            .arg(local)
            .arg(format!("{}@{}:{}", target.user, target.address.ip(), remote))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::remote_exec(&host, 1, format!("failed to spawn scp: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::remote_exec(
                &host,
                1,
                format!(
                    "copy of {} failed: {}",
                    local.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }

    async fn probe(&self, address: SocketAddr, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }
}
