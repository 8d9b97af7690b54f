//! Nodenet API types and CRDs for Kubernetes integration
//!
//! This library defines the declarative records the per-node agent watches:
//! - NodeNetwork: per-node management network topology (backend type, device)
//! - NetworkAttachment: a workload attachment to a VLAN, optionally with a
//!   layer-3 subnet carried in an annotation
//!
//! It also carries the payload types parsed out of those records (`NetConf`,
//! `Layer3NetworkConf`) and the well-known label/annotation keys.

pub mod netconf;
pub mod v1alpha1;

pub use netconf::{Layer3NetworkConf, NetConf};
pub use v1alpha1::{MgmtNetworkType, NetworkAttachment, NodeNetwork};
