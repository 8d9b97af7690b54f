//! Management-network backends: strategies that locate the uplink a node's
//! overlay or underlay traffic uses.

mod cilium;
mod flannel;

pub use cilium::CiliumNetwork;
pub use flannel::FlannelNetwork;

use crate::bridge::Bridge;
use crate::error::Result;
use crate::link::LinkAttrs;

/// Polymorphic management network. One variant per backend kind; selection
/// happens in a single switch at construction time.
pub enum MgmtNetwork {
    /// flannel/canal style: the uplink is a directly named kernel device
    Flannel(FlannelNetwork),
    /// overlay-tunnel style: the uplink is resolved through a vxlan tunnel
    /// endpoint device
    Cilium(CiliumNetwork),
}

impl MgmtNetwork {
    pub fn kind(&self) -> &'static str {
        match self {
            MgmtNetwork::Flannel(_) => "flannel",
            MgmtNetwork::Cilium(_) => "cilium",
        }
    }

    /// Resolve the uplink interface. Resolution happens on every call; the
    /// handle is never cached across reconciles.
    pub async fn nic(&self) -> Result<LinkAttrs> {
        match self {
            MgmtNetwork::Flannel(n) => n.nic().await,
            MgmtNetwork::Cilium(n) => n.nic().await,
        }
    }

    pub async fn setup(&self, bridge: &mut Bridge) -> Result<()> {
        match self {
            MgmtNetwork::Flannel(n) => n.setup(bridge).await,
            MgmtNetwork::Cilium(n) => n.setup(bridge).await,
        }
    }

    pub async fn teardown(&self, bridge: &mut Bridge) -> Result<()> {
        match self {
            MgmtNetwork::Flannel(n) => n.teardown(bridge).await,
            MgmtNetwork::Cilium(n) => n.teardown(bridge).await,
        }
    }
}
