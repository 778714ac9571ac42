//! Error types for cluster lifecycle orchestration
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant maps to one failure category of the orchestrator and carries the
//! context (cluster, node, network, command) needed to act on it. Component
//! errors bubble up unchanged to the lifecycle worker that owns the
//! workflow; only workers decide cluster-state transitions.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ClusterEvent, ClusterState};

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No feasible placement for the requested nodes
    #[error("insufficient capacity for {cluster}: {message}")]
    InsufficientCapacity {
        /// Cluster being planned
        cluster: String,
        /// Which unit could not be placed and why
        message: String,
    },

    /// Instance create/start/resize/destroy failed
    #[error("provisioning failure for {cluster} [{node}]: {message}")]
    ProvisioningFailure {
        /// Cluster owning the node
        cluster: String,
        /// Node or instance name
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Firewall, port-forward, load-balancer or ACL operation failed
    #[error("network rule failure on {network}: {message}")]
    NetworkRuleFailure {
        /// Network the rule belongs to
        network: String,
        /// Description of what failed
        message: String,
    },

    /// Remote command or copy failed after all retries
    #[error("remote execution failed on {host} after {attempts} attempt(s): {message}")]
    RemoteExecFailure {
        /// Target host (address:port)
        host: String,
        /// Number of attempts made
        attempts: u32,
        /// Description of what failed (never contains secrets)
        message: String,
    },

    /// A deadline-bounded poll ran out of time
    #[error("timed out after {timeout:?} waiting for {operation}")]
    TimeoutExceeded {
        /// What was being waited for
        operation: String,
        /// Total time budget of the wait
        timeout: Duration,
    },

    /// The requested event is not allowed from the cluster's current state
    #[error("illegal transition for {cluster}: {event} not allowed in state {state}")]
    IllegalStateTransition {
        /// Cluster identifier
        cluster: String,
        /// State observed when the event was requested
        state: ClusterState,
        /// Rejected event
        event: ClusterEvent,
    },

    /// Invalid request or cluster definition
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// Referenced record or resource does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of record (cluster, node, instance, network)
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Persistence layer error
    #[error("persistence error: {message}")]
    Persistence {
        /// Description of what failed
        message: String,
    },

    /// Bootstrap payload, token or certificate generation error
    #[error("bootstrap error [{context}]: {message}")]
    Bootstrap {
        /// Where the error occurred (template, pki, token)
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid orchestrator configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create an insufficient-capacity error for a cluster
    pub fn insufficient_capacity(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InsufficientCapacity {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a provisioning failure for a node of a cluster
    pub fn provisioning(
        cluster: impl Into<String>,
        node: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ProvisioningFailure {
            cluster: cluster.into(),
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a network rule failure
    pub fn network_rule(network: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NetworkRuleFailure {
            network: network.into(),
            message: msg.into(),
        }
    }

    /// Create a remote execution failure
    pub fn remote_exec(host: impl Into<String>, attempts: u32, msg: impl Into<String>) -> Self {
        Self::RemoteExecFailure {
            host: host.into(),
            attempts,
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutExceeded {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create an illegal-transition error
    pub fn illegal_transition(
        cluster: impl Into<String>,
        state: ClusterState,
        event: ClusterEvent,
    ) -> Self {
        Self::IllegalStateTransition {
            cluster: cluster.into(),
            state,
            event,
        }
    }

    /// Create a validation error without cluster context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence {
            message: msg.into(),
        }
    }

    /// Create a bootstrap error with context
    pub fn bootstrap(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Check if retrying the whole operation later could succeed
    ///
    /// Capacity, validation, illegal transitions and bad configuration need
    /// a change before a retry makes sense. Infrastructure and remote
    /// failures may recover on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InsufficientCapacity { .. } => false,
            Error::ProvisioningFailure { .. } => true,
            Error::NetworkRuleFailure { .. } => true,
            Error::RemoteExecFailure { .. } => true,
            Error::TimeoutExceeded { .. } => true,
            Error::IllegalStateTransition { .. } => false,
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::Persistence { .. } => true,
            Error::Bootstrap { .. } => false,
            Error::Config(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        let cluster = match self {
            Error::InsufficientCapacity { cluster, .. }
            | Error::ProvisioningFailure { cluster, .. }
            | Error::IllegalStateTransition { cluster, .. }
            | Error::Validation { cluster, .. } => cluster.as_str(),
            _ => return None,
        };
        (cluster != UNKNOWN_CONTEXT).then_some(cluster)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
