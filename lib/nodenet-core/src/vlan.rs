//! Per-VLAN local-area operations on the trunk bridge.

use std::sync::Arc;

use ipnetwork::Ipv4Network;
use tracing::info;

use crate::bridge::Bridge;
use crate::error::{NetworkError, Result};
use crate::link::{LinkAttrs, LinkKind, LinkOps, LinkRoute};
use crate::mgmt::MgmtNetwork;

const VLAN_ID_MAX: u16 = 4094;

/// A VLAN network: the trunk bridge composed with the resolved management
/// uplink. A VLAN's local area (trunk-port membership plus an optional
/// routed subnet) is added and removed through this.
pub struct Vlan {
    bridge: Bridge,
    uplink: LinkAttrs,
    ops: Arc<dyn LinkOps>,
}

impl std::fmt::Debug for Vlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vlan")
            .field("uplink", &self.uplink)
            .finish_non_exhaustive()
    }
}

/// Resolve the VLAN network bound to the management network's uplink.
///
/// The two "not provisioned yet" conditions keep their own error kinds:
/// a missing uplink surfaces as `LinkNotFound` and an uplink without an
/// enslaving bridge as `SlaveNotFound`. Callers skip on those and fail on
/// everything else.
pub async fn get_vlan(mgmt: &MgmtNetwork, ops: Arc<dyn LinkOps>) -> Result<Vlan> {
    let uplink = mgmt.nic().await?;
    let master = uplink
        .master
        .ok_or_else(|| NetworkError::SlaveNotFound(uplink.name.clone()))?;

    let bridge_attrs = ops.link_by_index(master).await?;
    if bridge_attrs.kind != LinkKind::Bridge {
        return Err(NetworkError::UnexpectedKind {
            name: bridge_attrs.name,
            expected: "bridge",
        });
    }

    let mut bridge = Bridge::new(&bridge_attrs.name, ops.clone());
    bridge.fetch().await?;

    Ok(Vlan {
        bridge,
        uplink,
        ops,
    })
}

impl Vlan {
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn uplink(&self) -> &LinkAttrs {
        &self.uplink
    }

    /// Make the VLAN's local segment exist on this node and, when a CIDR is
    /// given, routable through the bridge. Converges under repetition:
    /// membership and route adds tolerate already-present state.
    pub async fn add_local_area(&mut self, vlan_id: u16, cidr: &str) -> Result<()> {
        if let Some(vid) = check_vlan_id(vlan_id)? {
            self.ops.bridge_vlan_add(self.uplink.index, vid).await?;
            info!(vlan = vid, port = %self.uplink.name, "added VLAN to trunk port");
        }

        if !cidr.is_empty() {
            let route = self.local_area_route(cidr)?;
            self.ops.add_route(&route).await?;
            info!(vlan = vlan_id, cidr = %route.dst, "added local area route");
        }

        self.bridge.fetch().await
    }

    /// Reverse of [`add_local_area`](Vlan::add_local_area). Safe to call on
    /// a local area that was never fully established.
    pub async fn remove_local_area(&mut self, vlan_id: u16, cidr: &str) -> Result<()> {
        if !cidr.is_empty() {
            let route = self.local_area_route(cidr)?;
            self.ops.del_route(&route).await?;
            info!(vlan = vlan_id, cidr = %route.dst, "deleted local area route");
        }

        if let Some(vid) = check_vlan_id(vlan_id)? {
            self.ops.bridge_vlan_del(self.uplink.index, vid).await?;
            info!(vlan = vid, port = %self.uplink.name, "removed VLAN from trunk port");
        }

        self.bridge.fetch().await
    }

    /// The annotation may carry a host address like 172.16.0.1/24; the
    /// local-area route is for the containing network.
    fn local_area_route(&self, cidr: &str) -> Result<LinkRoute> {
        let parse_err = |source| NetworkError::InvalidCidr {
            cidr: cidr.to_string(),
            source,
        };
        let net: Ipv4Network = cidr.parse().map_err(parse_err)?;
        let dst = Ipv4Network::new(net.network(), net.prefix()).map_err(parse_err)?;
        Ok(LinkRoute {
            dst,
            gateway: None,
            oif: self.bridge.index()?,
        })
    }
}

fn check_vlan_id(vlan_id: u16) -> Result<Option<u16>> {
    match vlan_id {
        0 => Ok(None),
        1..=VLAN_ID_MAX => Ok(Some(vlan_id)),
        _ => Err(NetworkError::InvalidVlanId(vlan_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BRIDGE_NAME;
    use crate::link::memory::MemoryLinks;
    use crate::mgmt::FlannelNetwork;

    async fn enslaved_harness() -> (Arc<MemoryLinks>, MgmtNetwork) {
        let links = Arc::new(MemoryLinks::new());
        links.add_device("eth0", &["192.168.1.10/24"]);
        let mgmt = MgmtNetwork::Flannel(FlannelNetwork::new("eth0", links.clone()));
        let mut bridge = Bridge::new(BRIDGE_NAME, links.clone());
        mgmt.setup(&mut bridge).await.unwrap();
        (links, mgmt)
    }

    #[tokio::test]
    async fn get_vlan_requires_an_enslaved_uplink() {
        let links = Arc::new(MemoryLinks::new());
        links.add_device("eth0", &[]);
        let mgmt = MgmtNetwork::Flannel(FlannelNetwork::new("eth0", links.clone()));

        let err = get_vlan(&mgmt, links.clone()).await.unwrap_err();
        assert!(matches!(err, NetworkError::SlaveNotFound(_)));
        assert!(err.is_not_ready());
    }

    #[tokio::test]
    async fn get_vlan_reports_a_missing_uplink() {
        let links = Arc::new(MemoryLinks::new());
        let mgmt = MgmtNetwork::Flannel(FlannelNetwork::new("eth0", links.clone()));

        let err = get_vlan(&mgmt, links.clone()).await.unwrap_err();
        assert!(matches!(err, NetworkError::LinkNotFound(_)));
        assert!(err.is_not_ready());
    }

    #[tokio::test]
    async fn add_then_remove_restores_the_prior_state() {
        let (links, mgmt) = enslaved_harness().await;
        let uplink = links.link("eth0").unwrap();
        let bridge_index = links.link(BRIDGE_NAME).unwrap().index;

        let routes_before = links.routes_of(bridge_index);
        let vlans_before = links.vlans_of(uplink.index);

        let mut vlan = get_vlan(&mgmt, links.clone()).await.unwrap();
        vlan.add_local_area(100, "10.0.0.1/24").await.unwrap();
        assert_eq!(links.vlans_of(uplink.index), vec![100]);
        assert_eq!(links.routes_of(bridge_index).len(), 1);
        assert_eq!(
            links.routes_of(bridge_index)[0].dst,
            "10.0.0.0/24".parse().unwrap()
        );

        vlan.remove_local_area(100, "10.0.0.1/24").await.unwrap();
        assert_eq!(links.vlans_of(uplink.index), vlans_before);
        assert_eq!(links.routes_of(bridge_index), routes_before);
    }

    #[tokio::test]
    async fn repeated_adds_do_not_duplicate_state() {
        let (links, mgmt) = enslaved_harness().await;
        let bridge_index = links.link(BRIDGE_NAME).unwrap().index;

        let mut vlan = get_vlan(&mgmt, links.clone()).await.unwrap();
        vlan.add_local_area(200, "10.1.0.0/16").await.unwrap();
        let mutations = links.mutation_count();
        vlan.add_local_area(200, "10.1.0.0/16").await.unwrap();

        assert_eq!(links.mutation_count(), mutations);
        assert_eq!(links.routes_of(bridge_index).len(), 1);
    }

    #[tokio::test]
    async fn zero_vlan_id_skips_membership_bookkeeping() {
        let (links, mgmt) = enslaved_harness().await;
        let uplink = links.link("eth0").unwrap();

        let mut vlan = get_vlan(&mgmt, links.clone()).await.unwrap();
        vlan.add_local_area(0, "").await.unwrap();
        assert!(links.vlans_of(uplink.index).is_empty());
    }

    #[tokio::test]
    async fn out_of_range_vlan_id_is_rejected() {
        let (links, mgmt) = enslaved_harness().await;
        let mut vlan = get_vlan(&mgmt, links.clone()).await.unwrap();
        let err = vlan.add_local_area(4095, "").await.unwrap_err();
        assert!(matches!(err, NetworkError::InvalidVlanId(4095)));
    }

    #[tokio::test]
    async fn remove_tolerates_a_never_established_local_area() {
        let (links, mgmt) = enslaved_harness().await;
        let mut vlan = get_vlan(&mgmt, links.clone()).await.unwrap();
        vlan.remove_local_area(300, "10.2.0.0/24").await.unwrap();
    }

    #[tokio::test]
    async fn malformed_cidr_is_rejected() {
        let (links, mgmt) = enslaved_harness().await;
        let mut vlan = get_vlan(&mgmt, links.clone()).await.unwrap();
        let err = vlan.add_local_area(100, "not-a-cidr").await.unwrap_err();
        assert!(matches!(err, NetworkError::InvalidCidr { .. }));
    }
}
