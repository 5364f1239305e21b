//! Cluster access lifecycle for Fleet
//!
//! Takes a user-supplied kubeconfig for a member cluster and turns it into a
//! managed, health-reported cluster:
//!
//! - [`bootstrap`] classifies the cluster as directly reachable or overlay-only
//! - [`direct`] and [`overlay_controller`] provision the remote footprint and
//!   rotate the scoped bearer token for their mode
//! - [`status`] re-derives health conditions from the credential and nodes
//!
//! Remote clusters, the management API and the overlay control API are all
//! reached through traits so each loop can be tested with mocks.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod context;
pub mod credentials;
pub mod direct;
pub mod footprint;
pub mod outcome;
pub mod overlay;
pub mod overlay_controller;
pub mod remote;
pub mod status;
pub mod token;

#[cfg(test)]
mod scenarios;

pub use context::{Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use outcome::{error_policy, Outcome};
