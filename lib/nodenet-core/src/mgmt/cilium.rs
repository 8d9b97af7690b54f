use std::sync::Arc;

use crate::bridge::Bridge;
use crate::error::{NetworkError, Result};
use crate::link::{LinkAttrs, LinkKind, LinkOps};

/// Overlay-tunnel backend: the uplink is whatever device the named vxlan
/// tunnel endpoint is bound to. The tunnel itself stays untouched, so setup
/// and teardown are no-ops.
pub struct CiliumNetwork {
    device: String,
    ops: Arc<dyn LinkOps>,
}

impl CiliumNetwork {
    pub fn new(device: &str, ops: Arc<dyn LinkOps>) -> Self {
        Self {
            device: device.to_string(),
            ops,
        }
    }

    pub async fn nic(&self) -> Result<LinkAttrs> {
        let vtep = self.ops.link_by_name(&self.device).await?;
        if vtep.kind != LinkKind::Vxlan {
            return Err(NetworkError::UnexpectedKind {
                name: vtep.name,
                expected: "vxlan",
            });
        }
        let underlying = vtep.vxlan_link.ok_or_else(|| {
            NetworkError::LinkNotFound(format!("device bound to vxlan {}", self.device))
        })?;
        self.ops.link_by_index(underlying).await
    }

    pub async fn setup(&self, _bridge: &mut Bridge) -> Result<()> {
        Ok(())
    }

    pub async fn teardown(&self, _bridge: &mut Bridge) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::memory::MemoryLinks;

    #[tokio::test]
    async fn resolves_the_device_behind_the_tunnel_endpoint() {
        let links = Arc::new(MemoryLinks::new());
        let eth0 = links.add_device("eth0", &["192.168.1.10/24"]);
        links.add_vxlan("cilium_vxlan", eth0);

        let mgmt = CiliumNetwork::new("cilium_vxlan", links.clone());
        let nic = mgmt.nic().await.unwrap();
        assert_eq!(nic.index, eth0);
        assert_eq!(nic.name, "eth0");
    }

    #[tokio::test]
    async fn rejects_a_non_vxlan_endpoint() {
        let links = Arc::new(MemoryLinks::new());
        links.add_device("eth0", &[]);

        let mgmt = CiliumNetwork::new("eth0", links.clone());
        let err = mgmt.nic().await.unwrap_err();
        assert!(matches!(err, NetworkError::UnexpectedKind { .. }));
    }

    #[tokio::test]
    async fn missing_endpoint_reports_link_not_found() {
        let links = Arc::new(MemoryLinks::new());
        let mgmt = CiliumNetwork::new("cilium_vxlan", links.clone());
        let err = mgmt.nic().await.unwrap_err();
        assert!(err.is_not_ready());
    }
}
