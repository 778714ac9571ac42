//! Cluster Orchestrator - lifecycle management for managed Kubernetes clusters
//!
//! Provisions clusters on top of an IaaS compute platform, keeps their
//! reachability rules in step with their membership, bootstraps and upgrades
//! them over SSH, and tears them down again.
//!
//! # Architecture
//!
//! Every lifecycle operation is a workflow in [`workers`] that composes the
//! components below in a fixed order with explicit compensating actions:
//! - [`planner`] checks that the requested nodes fit the zone's capacity
//! - [`network`] derives and programs firewall, forwarding, load balancer and ACL rules
//! - [`bootstrap`] renders per-node bootstrap documents, backed by [`pki`]
//! - [`provisioner`] creates, powers and destroys instances and payload media
//! - [`remote`] runs commands on nodes and polls for readiness
//! - [`state`] guards and persists every cluster state transition
//!
//! The IaaS services, persistence and SSH are reached through traits, so the
//! orchestration core carries no wire format of its own.

#![warn(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod model;
pub mod network;
pub mod pki;
pub mod planner;
pub mod provisioner;
pub mod remote;
pub mod retry;
pub mod state;
pub mod workers;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default public port of the first node's SSH forward
///
/// Node `i` (by ordinal) is reachable on `DEFAULT_SSH_BASE_PORT + i`.
pub const DEFAULT_SSH_BASE_PORT: u16 = 2222;

/// Default port of the Kubernetes API server
pub const DEFAULT_API_PORT: u16 = 6443;

/// Default SSH port on the nodes themselves
pub const DEFAULT_NODE_SSH_PORT: u16 = 22;
