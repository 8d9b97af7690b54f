//! Kernel networking core for the nodenet agent
//!
//! This library provides:
//! - a uniform link abstraction over kernel network interfaces
//! - the VLAN trunk bridge lifecycle manager
//! - management-network backends (plain device, overlay tunnel)
//! - per-VLAN local-area operations on the trunk bridge
//!
//! Everything is written against the [`link::LinkOps`] trait: the rtnetlink
//! implementation talks to the live kernel, and an in-memory model (feature
//! `testing`) backs the test suites.

pub mod bridge;
pub mod error;
pub mod link;
pub mod mgmt;
pub mod vlan;

pub use bridge::{Bridge, BRIDGE_NAME};
pub use error::{NetworkError, Result};
pub use link::LinkOps;
pub use mgmt::MgmtNetwork;
pub use vlan::{get_vlan, Vlan};
