//! Lifecycle of the per-node VLAN trunk bridge.

use std::sync::Arc;

use tracing::info;

use crate::error::{NetworkError, Result};
use crate::link::{
    ensure_ipv4_forward, LinkAddr, LinkAttrs, LinkKind, LinkOps, LinkRoute,
    BRIDGE_NF_CALL_IPTABLES,
};

/// Default name of the per-node VLAN trunk bridge.
pub const BRIDGE_NAME: &str = "nodenet-br0";

/// Projection of the node's VLAN trunk bridge.
///
/// The projection is a read-through cache with no write-back: every mutation
/// is followed by a [`fetch`](Bridge::fetch) before the cached state is
/// trusted again, because other host actors (a VIP manager, for one) mutate
/// the same link out-of-band.
pub struct Bridge {
    name: String,
    ops: Arc<dyn LinkOps>,
    attrs: Option<LinkAttrs>,
    addrs: Vec<LinkAddr>,
    routes: Vec<LinkRoute>,
}

impl Bridge {
    pub fn new(name: &str, ops: Arc<dyn LinkOps>) -> Self {
        Self {
            name: name.to_string(),
            ops,
            attrs: None,
            addrs: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Idempotently drive the bridge to its required state: created,
    /// promiscuous, VLAN filtering on, IPv4 forwarding enabled, up. Safe to
    /// re-invoke after partial completion.
    pub async fn ensure(&mut self) -> Result<()> {
        // Must happen before the bridge exists: traffic bridged in the
        // window between creation and the sysctl write would hit iptables.
        self.disable_bridge_nf().await?;

        match self.ops.add_bridge(&self.name).await {
            Ok(()) => info!(bridge = %self.name, "created bridge"),
            Err(NetworkError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        // Re-fetch: if the link pre-existed, make sure it really is a bridge.
        let attrs = self.ops.link_by_name(&self.name).await?;
        if attrs.kind != LinkKind::Bridge {
            return Err(NetworkError::UnexpectedKind {
                name: self.name.clone(),
                expected: "bridge",
            });
        }

        if !attrs.promisc {
            self.ops.set_promiscuous(attrs.index, true).await?;
        }
        if attrs.vlan_filtering != Some(true) {
            self.ops.set_vlan_filtering(&self.name, true).await?;
        }
        ensure_ipv4_forward(self.ops.as_ref(), &self.name).await?;
        if !attrs.up {
            self.ops.set_up(attrs.index).await?;
        }

        self.fetch().await
    }

    async fn disable_bridge_nf(&self) -> Result<()> {
        if self.ops.get_sysctl(BRIDGE_NF_CALL_IPTABLES).await? != 0 {
            self.ops.set_sysctl(BRIDGE_NF_CALL_IPTABLES, 0).await?;
        }
        Ok(())
    }

    /// Mirror every IPv4 address of the enslaved uplink onto the bridge,
    /// with the label rewritten to the bridge's own name. Already-present
    /// addresses are success.
    pub async fn sync_ipv4_addr(&mut self, slave: &[LinkAddr]) -> Result<()> {
        let index = self.index()?;
        for addr in slave {
            let mirrored = LinkAddr {
                net: addr.net,
                label: Some(self.name.clone()),
            };
            self.ops.add_address(index, &mirrored).await?;
            info!(bridge = %self.name, addr = %mirrored.net, "mirrored IPv4 address");
        }
        self.fetch().await
    }

    /// Delete every IPv4 address currently on the bridge. Fetches first:
    /// addresses may have been injected since the last look.
    pub async fn clear_addr(&mut self) -> Result<()> {
        self.fetch().await?;
        let index = self.index()?;
        for addr in std::mem::take(&mut self.addrs) {
            self.ops.del_address(index, &addr).await?;
            info!(bridge = %self.name, addr = %addr.net, "deleted IPv4 address");
        }
        self.fetch().await
    }

    /// Replace the projection with the kernel's current view.
    pub async fn fetch(&mut self) -> Result<()> {
        let attrs = self.ops.link_by_name(&self.name).await?;
        self.addrs = self.ops.addresses(attrs.index).await?;
        self.routes = self.ops.routes(attrs.index).await?;
        self.attrs = Some(attrs);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel index of the bridge; requires a prior successful fetch.
    pub fn index(&self) -> Result<u32> {
        self.attrs
            .as_ref()
            .map(|a| a.index)
            .ok_or_else(|| NetworkError::LinkNotFound(self.name.clone()))
    }

    pub fn attrs(&self) -> Option<&LinkAttrs> {
        self.attrs.as_ref()
    }

    pub fn addrs(&self) -> &[LinkAddr] {
        &self.addrs
    }

    pub fn routes(&self) -> &[LinkRoute] {
        &self.routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::memory::MemoryLinks;

    fn harness() -> (Arc<MemoryLinks>, Bridge) {
        let links = Arc::new(MemoryLinks::new());
        let bridge = Bridge::new(BRIDGE_NAME, links.clone());
        (links, bridge)
    }

    #[tokio::test]
    async fn ensure_creates_a_configured_bridge() {
        let (links, mut bridge) = harness();
        bridge.ensure().await.unwrap();

        let attrs = links.link(BRIDGE_NAME).unwrap();
        assert_eq!(attrs.kind, LinkKind::Bridge);
        assert!(attrs.up);
        assert!(attrs.promisc);
        assert_eq!(attrs.vlan_filtering, Some(true));
        assert_eq!(
            links.sysctl(&format!("net/ipv4/conf/{}/forwarding", BRIDGE_NAME)),
            Some(1)
        );
    }

    #[tokio::test]
    async fn ensure_twice_is_idempotent() {
        let (links, mut bridge) = harness();
        bridge.ensure().await.unwrap();
        let mutations = links.mutation_count();

        bridge.ensure().await.unwrap();
        assert_eq!(links.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn ensure_zeroes_bridge_nf_before_creation() {
        let (links, mut bridge) = harness();
        links.seed_sysctl(BRIDGE_NF_CALL_IPTABLES, 1);
        bridge.ensure().await.unwrap();
        assert_eq!(links.sysctl(BRIDGE_NF_CALL_IPTABLES), Some(0));
    }

    #[tokio::test]
    async fn ensure_rejects_a_non_bridge_of_the_same_name() {
        let (links, mut bridge) = harness();
        links.add_device(BRIDGE_NAME, &[]);
        let err = bridge.ensure().await.unwrap_err();
        assert!(matches!(err, NetworkError::UnexpectedKind { .. }));
    }

    #[tokio::test]
    async fn sync_mirrors_slave_addresses_with_bridge_label() {
        let (links, mut bridge) = harness();
        let eth0 = links.add_device("eth0", &["192.168.1.10/24", "10.1.0.2/16"]);
        bridge.ensure().await.unwrap();

        let slave = links.addrs_of(eth0);
        bridge.sync_ipv4_addr(&slave).await.unwrap();

        let bridged = links.addrs_of(bridge.index().unwrap());
        let mirrored: Vec<_> = bridged.iter().map(|a| a.net).collect();
        let expected: Vec<_> = slave.iter().map(|a| a.net).collect();
        assert_eq!(mirrored, expected);
        assert!(bridged
            .iter()
            .all(|a| a.label.as_deref() == Some(BRIDGE_NAME)));

        // unchanged slave addresses make a second sync a no-op
        let mutations = links.mutation_count();
        bridge.sync_ipv4_addr(&slave).await.unwrap();
        assert_eq!(links.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn clear_addr_strips_every_address() {
        let (links, mut bridge) = harness();
        let eth0 = links.add_device("eth0", &["192.168.1.10/24"]);
        bridge.ensure().await.unwrap();
        let slave = links.addrs_of(eth0);
        bridge.sync_ipv4_addr(&slave).await.unwrap();

        // an out-of-band actor injects an address behind our back
        let index = bridge.index().unwrap();
        links
            .add_address(
                index,
                &LinkAddr {
                    net: "172.31.0.1/32".parse().unwrap(),
                    label: None,
                },
            )
            .await
            .unwrap();

        bridge.clear_addr().await.unwrap();
        assert!(links.addrs_of(index).is_empty());
        assert!(bridge.addrs().is_empty());
    }
}
