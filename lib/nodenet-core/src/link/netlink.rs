//! rtnetlink-backed implementation of [`LinkOps`].

use std::net::IpAddr;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use ipnetwork::Ipv4Network;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{
    AfSpecBridge, BridgeVlanInfo, InfoBridge, InfoData, InfoKind, InfoVxlan, LinkAttribute,
    LinkFlag, LinkInfo, LinkMessage, State,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteScope,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use rtnetlink::{Handle, IpVersion};

use super::{LinkAddr, LinkAttrs, LinkKind, LinkOps, LinkRoute};
use crate::error::{NetworkError, Result};

/// Persistent netlink handle wrapping rtnetlink. One per process, shared by
/// every component that touches kernel state; the connection task lives for
/// the life of the process.
#[derive(Clone)]
pub struct NetlinkHandle {
    handle: Handle,
}

impl NetlinkHandle {
    pub fn new() -> std::io::Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);
        Ok(Self { handle })
    }

    fn err(op: &'static str, object: impl Into<String>, source: rtnetlink::Error) -> NetworkError {
        NetworkError::Netlink {
            op,
            object: object.into(),
            source,
        }
    }

    /// Send a raw AF_BRIDGE link message; rtnetlink has no high-level
    /// request for bridge VLAN table edits.
    async fn bridge_vlan_request(
        &self,
        payload: RouteNetlinkMessage,
        op: &'static str,
        object: String,
        absent_ok: bool,
    ) -> Result<()> {
        let mut req = NetlinkMessage::from(payload);
        req.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        let mut handle = self.handle.clone();
        let mut response = handle
            .request(req)
            .map_err(|e| Self::err(op, object.clone(), e))?;
        while let Some(message) = response.next().await {
            if let NetlinkPayload::Error(e) = message.payload {
                match e.raw_code() {
                    0 => continue, // ack
                    code if code == -libc::EEXIST => return Ok(()),
                    code if absent_ok && (code == -libc::ENOENT || code == -libc::EINVAL) => {
                        return Ok(())
                    }
                    _ => {
                        return Err(Self::err(
                            op,
                            object,
                            rtnetlink::Error::NetlinkError(e),
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

fn raw_code(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(e) => Some(e.raw_code()),
        _ => None,
    }
}

fn attrs_from_message(msg: &LinkMessage) -> LinkAttrs {
    let mut attrs = LinkAttrs {
        index: msg.header.index,
        name: String::new(),
        kind: LinkKind::Device,
        master: None,
        up: false,
        promisc: msg
            .header
            .flags
            .iter()
            .any(|f| matches!(f, LinkFlag::Promisc)),
        vlan_filtering: None,
        vxlan_link: None,
    };

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => attrs.name = name.clone(),
            LinkAttribute::Controller(master) => attrs.master = Some(*master),
            LinkAttribute::OperState(state) => attrs.up = matches!(state, State::Up),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(InfoKind::Bridge) => attrs.kind = LinkKind::Bridge,
                        LinkInfo::Kind(InfoKind::Vxlan) => attrs.kind = LinkKind::Vxlan,
                        LinkInfo::Kind(kind) => {
                            attrs.kind = LinkKind::Other(format!("{:?}", kind).to_lowercase())
                        }
                        LinkInfo::Data(InfoData::Bridge(data)) => {
                            for item in data {
                                if let InfoBridge::VlanFiltering(v) = item {
                                    attrs.vlan_filtering = Some(*v != 0);
                                }
                            }
                        }
                        LinkInfo::Data(InfoData::Vxlan(data)) => {
                            for item in data {
                                if let InfoVxlan::Link(index) = item {
                                    attrs.vxlan_link = Some(*index);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    attrs
}

fn bridge_vlan_message(index: u32, vid: u16) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.header.interface_family = AddressFamily::Bridge;
    msg.header.index = index;
    let mut vlan_info = BridgeVlanInfo::default();
    vlan_info.flags = 0;
    vlan_info.vid = vid;
    msg.attributes
        .push(LinkAttribute::AfSpecBridge(vec![AfSpecBridge::VlanInfo(
            vlan_info,
        )]));
    msg
}

#[async_trait]
impl LinkOps for NetlinkHandle {
    async fn link_by_name(&self, name: &str) -> Result<LinkAttrs> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(attrs_from_message(&msg)),
            Ok(None) => Err(NetworkError::LinkNotFound(name.to_string())),
            Err(e) if raw_code(&e) == Some(-libc::ENODEV) => {
                Err(NetworkError::LinkNotFound(name.to_string()))
            }
            Err(e) => Err(Self::err("lookup link", name, e)),
        }
    }

    async fn link_by_index(&self, index: u32) -> Result<LinkAttrs> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(attrs_from_message(&msg)),
            Ok(None) => Err(NetworkError::LinkNotFound(format!("index {}", index))),
            Err(e) if raw_code(&e) == Some(-libc::ENODEV) => {
                Err(NetworkError::LinkNotFound(format!("index {}", index)))
            }
            Err(e) => Err(Self::err("lookup link", format!("index {}", index), e)),
        }
    }

    async fn add_bridge(&self, name: &str) -> Result<()> {
        match self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if raw_code(&e) == Some(-libc::EEXIST) => {
                Err(NetworkError::AlreadyExists(format!("link {}", name)))
            }
            Err(e) => Err(Self::err("add bridge", name, e)),
        }
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| Self::err("set up", format!("link index {}", index), e))
    }

    async fn set_promiscuous(&self, index: u32, on: bool) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .promiscuous(on)
            .execute()
            .await
            .map_err(|e| Self::err("set promiscuous", format!("link index {}", index), e))
    }

    async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .controller(master)
            .execute()
            .await
            .map_err(|e| Self::err("set master", format!("link index {}", index), e))
    }

    async fn set_vlan_filtering(&self, name: &str, on: bool) -> Result<()> {
        let path = format!("/sys/class/net/{}/bridge/vlan_filtering", name);
        tokio::fs::write(&path, if on { "1" } else { "0" })
            .await
            .map_err(|source| NetworkError::Sysctl { path, source })
    }

    async fn addresses(&self, index: u32) -> Result<Vec<LinkAddr>> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut out = Vec::new();
        loop {
            let msg = match stream.try_next().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => return Err(Self::err("list addresses", format!("link index {}", index), e)),
            };
            if msg.header.family != AddressFamily::Inet {
                continue;
            }
            let mut ip = None;
            let mut label = None;
            for attr in &msg.attributes {
                match attr {
                    AddressAttribute::Address(IpAddr::V4(v4)) => ip = Some(*v4),
                    AddressAttribute::Label(l) => label = Some(l.clone()),
                    _ => {}
                }
            }
            if let Some(ip) = ip {
                let net = Ipv4Network::new(ip, msg.header.prefix_len).map_err(|source| {
                    NetworkError::InvalidCidr {
                        cidr: format!("{}/{}", ip, msg.header.prefix_len),
                        source,
                    }
                })?;
                out.push(LinkAddr { net, label });
            }
        }
        Ok(out)
    }

    async fn add_address(&self, index: u32, addr: &LinkAddr) -> Result<()> {
        let mut req =
            self.handle
                .address()
                .add(index, IpAddr::V4(addr.net.ip()), addr.net.prefix());
        if let Some(label) = &addr.label {
            req.message_mut()
                .attributes
                .push(AddressAttribute::Label(label.clone()));
        }
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(e) if raw_code(&e) == Some(-libc::EEXIST) => Ok(()),
            Err(e) => Err(Self::err("add address", format!("{}", addr.net), e)),
        }
    }

    async fn del_address(&self, index: u32, addr: &LinkAddr) -> Result<()> {
        // The kernel wants the full address message back, so find it first.
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        loop {
            let msg = match stream.try_next().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()), // already absent
                Err(e) => return Err(Self::err("list addresses", format!("link index {}", index), e)),
            };
            if msg.header.family != AddressFamily::Inet
                || msg.header.prefix_len != addr.net.prefix()
            {
                continue;
            }
            let matches = msg.attributes.iter().any(
                |a| matches!(a, AddressAttribute::Address(IpAddr::V4(v4)) if *v4 == addr.net.ip()),
            );
            if !matches {
                continue;
            }
            return match self.handle.address().del(msg).execute().await {
                Ok(()) => Ok(()),
                Err(e) if raw_code(&e) == Some(-libc::EADDRNOTAVAIL) => Ok(()),
                Err(e) => Err(Self::err("delete address", format!("{}", addr.net), e)),
            };
        }
    }

    async fn routes(&self, index: u32) -> Result<Vec<LinkRoute>> {
        let mut stream = self.handle.route().get(IpVersion::V4).execute();
        let mut out = Vec::new();
        loop {
            let route = match stream.try_next().await {
                Ok(Some(route)) => route,
                Ok(None) => break,
                Err(e) => return Err(Self::err("list routes", format!("link index {}", index), e)),
            };
            let mut oif = None;
            let mut dst = None;
            let mut gateway = None;
            for attr in &route.attributes {
                match attr {
                    RouteAttribute::Oif(i) => oif = Some(*i),
                    RouteAttribute::Destination(RouteAddress::Inet(v4)) => dst = Some(*v4),
                    RouteAttribute::Gateway(RouteAddress::Inet(v4)) => gateway = Some(*v4),
                    _ => {}
                }
            }
            if oif != Some(index) {
                continue;
            }
            let dst_ip = dst.unwrap_or(Ipv4Addr::UNSPECIFIED);
            let prefix = route.header.destination_prefix_length;
            let net = Ipv4Network::new(dst_ip, prefix).map_err(|source| {
                NetworkError::InvalidCidr {
                    cidr: format!("{}/{}", dst_ip, prefix),
                    source,
                }
            })?;
            out.push(LinkRoute {
                dst: net,
                gateway,
                oif: index,
            });
        }
        Ok(out)
    }

    async fn add_route(&self, route: &LinkRoute) -> Result<()> {
        let mut req = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(route.dst.ip(), route.dst.prefix())
            .output_interface(route.oif);
        match route.gateway {
            Some(gw) => req = req.gateway(gw),
            // A directly attached subnet; without this the kernel rejects a
            // gateway-less unicast route.
            None => req.message_mut().header.scope = RouteScope::Link,
        }
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(e) if raw_code(&e) == Some(-libc::EEXIST) => Ok(()),
            Err(e) => Err(Self::err("add route", format!("{}", route.dst), e)),
        }
    }

    async fn del_route(&self, route: &LinkRoute) -> Result<()> {
        let mut message = RouteMessage::default();
        message.header.address_family = AddressFamily::Inet;
        message.header.destination_prefix_length = route.dst.prefix();
        message.header.table = RouteHeader::RT_TABLE_MAIN;
        message
            .attributes
            .push(RouteAttribute::Destination(RouteAddress::Inet(
                route.dst.ip(),
            )));
        message.attributes.push(RouteAttribute::Oif(route.oif));
        if let Some(gw) = route.gateway {
            message
                .attributes
                .push(RouteAttribute::Gateway(RouteAddress::Inet(gw)));
        }
        match self.handle.route().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(e) if raw_code(&e) == Some(-libc::ESRCH) => Ok(()),
            Err(e) => Err(Self::err("delete route", format!("{}", route.dst), e)),
        }
    }

    async fn bridge_vlan_add(&self, index: u32, vid: u16) -> Result<()> {
        let msg = bridge_vlan_message(index, vid);
        self.bridge_vlan_request(
            RouteNetlinkMessage::SetLink(msg),
            "add bridge vlan",
            format!("vlan {} on link index {}", vid, index),
            false,
        )
        .await
    }

    async fn bridge_vlan_del(&self, index: u32, vid: u16) -> Result<()> {
        let msg = bridge_vlan_message(index, vid);
        self.bridge_vlan_request(
            RouteNetlinkMessage::DelLink(msg),
            "delete bridge vlan",
            format!("vlan {} on link index {}", vid, index),
            true,
        )
        .await
    }

    async fn get_sysctl(&self, key: &str) -> Result<i64> {
        let path = format!("/proc/sys/{}", key);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| NetworkError::Sysctl {
                path: path.clone(),
                source,
            })?;
        raw.trim().parse::<i64>().map_err(|e| NetworkError::Sysctl {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    async fn set_sysctl(&self, key: &str, value: i64) -> Result<()> {
        let path = format!("/proc/sys/{}", key);
        tokio::fs::write(&path, format!("{}\n", value))
            .await
            .map_err(|source| NetworkError::Sysctl { path, source })
    }
}
