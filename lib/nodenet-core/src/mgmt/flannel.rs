use std::sync::Arc;

use tracing::info;

use crate::bridge::Bridge;
use crate::error::Result;
use crate::link::{LinkAttrs, LinkOps};

/// Plain-device backend: the management network's uplink is a directly
/// named kernel device. Serves the flannel and canal network types.
pub struct FlannelNetwork {
    device: String,
    ops: Arc<dyn LinkOps>,
}

impl FlannelNetwork {
    pub fn new(device: &str, ops: Arc<dyn LinkOps>) -> Self {
        Self {
            device: device.to_string(),
            ops,
        }
    }

    pub async fn nic(&self) -> Result<LinkAttrs> {
        self.ops.link_by_name(&self.device).await
    }

    /// Ensure the trunk bridge, enslave the uplink to it, and mirror the
    /// uplink's IPv4 addresses onto the bridge.
    pub async fn setup(&self, bridge: &mut Bridge) -> Result<()> {
        bridge.ensure().await?;

        let nic = self.nic().await?;
        let bridge_index = bridge.index()?;
        if nic.master != Some(bridge_index) {
            self.ops.set_master(nic.index, bridge_index).await?;
            info!(device = %nic.name, bridge = %bridge.name(), "enslaved uplink to bridge");
        }

        let addrs = self.ops.addresses(nic.index).await?;
        bridge.sync_ipv4_addr(&addrs).await
    }

    pub async fn teardown(&self, bridge: &mut Bridge) -> Result<()> {
        bridge.clear_addr().await
    }
}
