//! In-memory kernel model backing the test suites. Mirrors the idempotence
//! semantics of the netlink implementation: adds tolerate already-present
//! state, deletes tolerate already-absent state, and `add_bridge` reports
//! `AlreadyExists`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{LinkAddr, LinkAttrs, LinkKind, LinkOps, LinkRoute};
use crate::error::{NetworkError, Result};

#[derive(Default)]
struct State {
    links: Vec<LinkAttrs>,
    addrs: HashMap<u32, Vec<LinkAddr>>,
    routes: Vec<LinkRoute>,
    bridge_vlans: HashMap<u32, BTreeSet<u16>>,
    sysctls: HashMap<String, i64>,
    next_index: u32,
    mutations: u64,
}

impl State {
    fn link_mut(&mut self, index: u32) -> Result<&mut LinkAttrs> {
        self.links
            .iter_mut()
            .find(|l| l.index == index)
            .ok_or(NetworkError::LinkNotFound(format!("index {}", index)))
    }
}

pub struct MemoryLinks {
    state: Mutex<State>,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_index: 1,
                ..State::default()
            }),
        }
    }

    fn push_link(&self, mut attrs: LinkAttrs) -> u32 {
        let mut state = self.state.lock().unwrap();
        attrs.index = state.next_index;
        state.next_index += 1;
        let index = attrs.index;
        state.links.push(attrs);
        index
    }

    /// Seed a plain device carrying the given IPv4 addresses.
    pub fn add_device(&self, name: &str, addrs: &[&str]) -> u32 {
        let index = self.push_link(LinkAttrs {
            index: 0,
            name: name.to_string(),
            kind: LinkKind::Device,
            master: None,
            up: true,
            promisc: false,
            vlan_filtering: None,
            vxlan_link: None,
        });
        let mut state = self.state.lock().unwrap();
        state.addrs.insert(
            index,
            addrs
                .iter()
                .map(|a| LinkAddr {
                    net: a.parse().unwrap(),
                    label: Some(name.to_string()),
                })
                .collect(),
        );
        index
    }

    /// Seed a vxlan tunnel endpoint bound to an underlying device.
    pub fn add_vxlan(&self, name: &str, underlying: u32) -> u32 {
        self.push_link(LinkAttrs {
            index: 0,
            name: name.to_string(),
            kind: LinkKind::Vxlan,
            master: None,
            up: true,
            promisc: false,
            vlan_filtering: None,
            vxlan_link: Some(underlying),
        })
    }

    pub fn seed_sysctl(&self, key: &str, value: i64) {
        self.state
            .lock()
            .unwrap()
            .sysctls
            .insert(key.to_string(), value);
    }

    pub fn link(&self, name: &str) -> Option<LinkAttrs> {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .find(|l| l.name == name)
            .cloned()
    }

    pub fn addrs_of(&self, index: u32) -> Vec<LinkAddr> {
        self.state
            .lock()
            .unwrap()
            .addrs
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn routes_of(&self, index: u32) -> Vec<LinkRoute> {
        self.state
            .lock()
            .unwrap()
            .routes
            .iter()
            .filter(|r| r.oif == index)
            .cloned()
            .collect()
    }

    pub fn vlans_of(&self, index: u32) -> Vec<u16> {
        self.state
            .lock()
            .unwrap()
            .bridge_vlans
            .get(&index)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn sysctl(&self, key: &str) -> Option<i64> {
        self.state.lock().unwrap().sysctls.get(key).copied()
    }

    /// Number of state-changing kernel calls observed so far. Tolerated
    /// no-ops (adding a present address, deleting an absent route) do not
    /// count, which is what "no kernel mutation occurs" assertions measure.
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().unwrap().mutations
    }
}

impl Default for MemoryLinks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkOps for MemoryLinks {
    async fn link_by_name(&self, name: &str) -> Result<LinkAttrs> {
        self.link(name)
            .ok_or(NetworkError::LinkNotFound(name.to_string()))
    }

    async fn link_by_index(&self, index: u32) -> Result<LinkAttrs> {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .find(|l| l.index == index)
            .cloned()
            .ok_or(NetworkError::LinkNotFound(format!("index {}", index)))
    }

    async fn add_bridge(&self, name: &str) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.links.iter().any(|l| l.name == name) {
                return Err(NetworkError::AlreadyExists(format!("link {}", name)));
            }
        }
        self.push_link(LinkAttrs {
            index: 0,
            name: name.to_string(),
            kind: LinkKind::Bridge,
            master: None,
            up: false,
            promisc: false,
            vlan_filtering: Some(false),
            vxlan_link: None,
        });
        self.state.lock().unwrap().mutations += 1;
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let link = state.link_mut(index)?;
        if !link.up {
            link.up = true;
            state.mutations += 1;
        }
        Ok(())
    }

    async fn set_promiscuous(&self, index: u32, on: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let link = state.link_mut(index)?;
        if link.promisc != on {
            link.promisc = on;
            state.mutations += 1;
        }
        Ok(())
    }

    async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let link = state.link_mut(index)?;
        if link.master != Some(master) {
            link.master = Some(master);
            state.mutations += 1;
        }
        Ok(())
    }

    async fn set_vlan_filtering(&self, name: &str, on: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or(NetworkError::LinkNotFound(name.to_string()))?;
        if link.kind != LinkKind::Bridge {
            return Err(NetworkError::UnexpectedKind {
                name: name.to_string(),
                expected: "bridge",
            });
        }
        if link.vlan_filtering != Some(on) {
            link.vlan_filtering = Some(on);
            state.mutations += 1;
        }
        Ok(())
    }

    async fn addresses(&self, index: u32) -> Result<Vec<LinkAddr>> {
        Ok(self.addrs_of(index))
    }

    async fn add_address(&self, index: u32, addr: &LinkAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.link_mut(index)?;
        let addrs = state.addrs.entry(index).or_default();
        if addrs.iter().any(|a| a.net == addr.net) {
            return Ok(());
        }
        addrs.push(addr.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn del_address(&self, index: u32, addr: &LinkAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.link_mut(index)?;
        let addrs = state.addrs.entry(index).or_default();
        let before = addrs.len();
        addrs.retain(|a| a.net != addr.net);
        if addrs.len() != before {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn routes(&self, index: u32) -> Result<Vec<LinkRoute>> {
        Ok(self.routes_of(index))
    }

    async fn add_route(&self, route: &LinkRoute) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state
            .routes
            .iter()
            .any(|r| r.dst == route.dst && r.oif == route.oif)
        {
            return Ok(());
        }
        state.routes.push(route.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn del_route(&self, route: &LinkRoute) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.routes.len();
        state
            .routes
            .retain(|r| !(r.dst == route.dst && r.oif == route.oif));
        if state.routes.len() != before {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn bridge_vlan_add(&self, index: u32, vid: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.link_mut(index)?;
        if state.bridge_vlans.entry(index).or_default().insert(vid) {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn bridge_vlan_del(&self, index: u32, vid: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.link_mut(index)?;
        if state.bridge_vlans.entry(index).or_default().remove(&vid) {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn get_sysctl(&self, key: &str) -> Result<i64> {
        Ok(self.sysctl(key).unwrap_or(0))
    }

    async fn set_sysctl(&self, key: &str, value: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.sysctls.get(key).copied() != Some(value) {
            state.sysctls.insert(key.to_string(), value);
            state.mutations += 1;
        }
        Ok(())
    }
}
