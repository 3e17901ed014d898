//! strata - Kubernetes control-plane provisioning and convergence
//!
//! strata provisions a production k3s control plane across heterogeneous
//! backends (AWS, Hetzner Cloud, Proxmox VE) and brings it to a converged,
//! externally reachable state: the cluster's TLS identity and advertised
//! endpoint are rewritten to the load-balancer or virtual-IP address that
//! only exists once provisioning has completed.
//!
//! # Architecture
//!
//! - [`runner`] - the single subprocess boundary (terraform, aws, ssh, kubectl)
//! - [`terraform`] - declarative provisioning driver over a per-cluster state dir
//! - [`remote`] - remote command channels (async-poll SSM, sync-direct SSH)
//!   and fleet dispatch with per-node failure isolation
//! - [`provider`] - backend abstraction and factory
//! - [`bootstrap`] - the phase sequencer
//!   (Provisioning -> ConvergingIdentity -> ReconnectingFleet -> Ready)
//! - [`kubeconfig`] - endpoint resolution target: line-oriented server patch
//! - [`validate`] - ordered health checks with fail/warn aggregation
//! - [`ops`] - the caller-facing contract consumed by the CLI

pub mod bootstrap;
pub mod cluster;
pub mod error;
pub mod kubeconfig;
pub mod ops;
pub mod poll;
pub mod provider;
pub mod remote;
pub mod runner;
pub mod terraform;
pub mod validate;

pub use error::{Error, Result};
