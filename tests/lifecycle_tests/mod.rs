//! Lifecycle stories
//!
//! # Test Organization
//!
//! - `scenarios`: a tenant's cluster from create through scale, upgrade
//!   and destroy, including the failure paths operators run into
//!
//! - `properties`: guarantees that hold for any input, such as idempotent
//!   rule application and the state-machine guards
//!
//! `cloud` holds the in-memory IaaS every story runs against.

mod cloud;
mod properties;
mod scenarios;
