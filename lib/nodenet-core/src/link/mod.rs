//! Uniform read/mutate surface over kernel network interfaces.

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod netlink;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;

use crate::error::Result;

/// Sysctl key for the bridge-netfilter hook into iptables. Read and zeroed
/// before the bridge is created, so early bridged traffic is never run
/// through the host firewall.
pub const BRIDGE_NF_CALL_IPTABLES: &str = "net/bridge/bridge-nf-call-iptables";

/// Kind of a kernel link, as reported by its link info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkKind {
    /// Physical or otherwise plain device carrying no link info
    Device,
    Bridge,
    Vxlan,
    Other(String),
}

/// Projection of one kernel link's attributes.
#[derive(Clone, Debug)]
pub struct LinkAttrs {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    /// Index of the enslaving master link, if any
    pub master: Option<u32>,
    /// Operational state is up
    pub up: bool,
    pub promisc: bool,
    /// Bridges only: whether VLAN filtering is enabled
    pub vlan_filtering: Option<bool>,
    /// Vxlan only: index of the underlying device the tunnel is bound to
    pub vxlan_link: Option<u32>,
}

/// One IPv4 address on a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkAddr {
    pub net: Ipv4Network,
    pub label: Option<String>,
}

/// One IPv4 route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkRoute {
    pub dst: Ipv4Network,
    pub gateway: Option<Ipv4Addr>,
    /// Output link index
    pub oif: u32,
}

/// Read/mutate surface over the kernel's links, addresses, routes, bridge
/// VLAN tables and networking sysctls. All bridge and VLAN logic is written
/// against this trait, never against a concrete backend, so new link kinds
/// can be added without touching reconciliation logic.
///
/// Mutations are idempotent at this surface: adds treat already-present
/// state as success and deletes treat already-absent state as success. The
/// one exception is [`add_bridge`](LinkOps::add_bridge), which reports
/// `AlreadyExists` as a distinguishable kind and leaves the decision to the
/// caller.
#[async_trait]
pub trait LinkOps: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<LinkAttrs>;
    async fn link_by_index(&self, index: u32) -> Result<LinkAttrs>;

    async fn add_bridge(&self, name: &str) -> Result<()>;

    async fn set_up(&self, index: u32) -> Result<()>;
    async fn set_promiscuous(&self, index: u32, on: bool) -> Result<()>;
    async fn set_master(&self, index: u32, master: u32) -> Result<()>;
    /// Toggle VLAN filtering on a bridge.
    async fn set_vlan_filtering(&self, name: &str, on: bool) -> Result<()>;

    /// IPv4 addresses currently on the link.
    async fn addresses(&self, index: u32) -> Result<Vec<LinkAddr>>;
    async fn add_address(&self, index: u32, addr: &LinkAddr) -> Result<()>;
    async fn del_address(&self, index: u32, addr: &LinkAddr) -> Result<()>;

    /// IPv4 routes leaving through the given link.
    async fn routes(&self, index: u32) -> Result<Vec<LinkRoute>>;
    async fn add_route(&self, route: &LinkRoute) -> Result<()>;
    async fn del_route(&self, route: &LinkRoute) -> Result<()>;

    /// Add a VLAN id to the bridge VLAN table of the given port.
    async fn bridge_vlan_add(&self, index: u32, vid: u16) -> Result<()>;
    async fn bridge_vlan_del(&self, index: u32, vid: u16) -> Result<()>;

    /// Read a networking sysctl (key slash-separated, relative to /proc/sys).
    async fn get_sysctl(&self, key: &str) -> Result<i64>;
    async fn set_sysctl(&self, key: &str, value: i64) -> Result<()>;
}

/// Ensure IPv4 forwarding is enabled on the named link.
pub async fn ensure_ipv4_forward(ops: &dyn LinkOps, name: &str) -> Result<()> {
    let key = format!("net/ipv4/conf/{}/forwarding", name);
    if ops.get_sysctl(&key).await? != 1 {
        ops.set_sysctl(&key, 1).await?;
    }
    Ok(())
}
