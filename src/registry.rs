// Interface and peer model as seen by the capture path, the iteration
// contracts the rest of the daemon provides, and a simple in-memory registry
// backing them.

use std::fmt;

use serde::Deserialize;

use crate::address::{Address, ETH_P_IP};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    /// One of this host's own addresses.
    Local,
    /// Configured.
    Static,
    /// Learned via registration.
    Dynamic,
    /// Learned via resolution.
    Cached,
}

impl PeerType {
    pub const fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerType::Local => "local",
            PeerType::Static => "static",
            PeerType::Dynamic => "dynamic",
            PeerType::Cached => "cached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_type: PeerType,
    pub protocol_address: Address,
    pub protocol_type: u16,
    pub prefix_length: u8,
    pub next_hop_address: Address,
    pub up: bool,
    /// Index of the owning interface.
    pub interface: u32,
}

/// Which peers a `for_each_peer` walk visits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSelector {
    pub interface: Option<u32>,
    /// OR of [`PeerType::bit`] values; zero selects every type.
    pub type_mask: u8,
    pub up_only: bool,
}

impl PeerSelector {
    pub fn types(types: &[PeerType]) -> Self {
        Self {
            type_mask: types.iter().fold(0, |m, t| m | t.bit()),
            ..Default::default()
        }
    }

    /// Local addresses, as used by the capture filter.
    pub fn local() -> Self {
        Self::types(&[PeerType::Local])
    }

    /// Up peers on `interface` that multicast traffic is replicated to.
    pub fn multicast_targets(interface: u32) -> Self {
        Self {
            interface: Some(interface),
            up_only: true,
            ..Self::types(&[PeerType::Static, PeerType::Dynamic, PeerType::Cached])
        }
    }

    pub fn matches(&self, peer: &Peer) -> bool {
        if self.interface.is_some_and(|idx| idx != peer.interface) {
            return false;
        }
        if self.type_mask != 0 && self.type_mask & peer.peer_type.bit() == 0 {
            return false;
        }
        !self.up_only || peer.up
    }
}

pub trait InterfaceRegistry {
    fn for_each_interface(&self, visit: &mut dyn FnMut(&Interface));

    fn interface_by_index(&self, index: u32) -> Option<Interface>;
}

pub trait PeerRegistry {
    fn for_each_peer(&self, selector: &PeerSelector, visit: &mut dyn FnMut(&Peer));
}

/// Everything the capture path reads about the current topology.
pub trait Topology: InterfaceRegistry + PeerRegistry {}

impl<T: InterfaceRegistry + PeerRegistry> Topology for T {}

/// Vec-backed registry; iteration order is insertion order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    interfaces: Vec<Interface>,
    peers: Vec<Peer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interface(&mut self, iface: Interface) {
        self.interfaces.retain(|i| i.index != iface.index);
        self.interfaces.push(iface);
    }

    pub fn add_peer(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }
}

impl InterfaceRegistry for Registry {
    fn for_each_interface(&self, visit: &mut dyn FnMut(&Interface)) {
        self.interfaces.iter().for_each(visit);
    }

    fn interface_by_index(&self, index: u32) -> Option<Interface> {
        self.interfaces.iter().find(|i| i.index == index).cloned()
    }
}

impl PeerRegistry for Registry {
    fn for_each_peer(&self, selector: &PeerSelector, visit: &mut dyn FnMut(&Peer)) {
        self.peers
            .iter()
            .filter(|p| selector.matches(p))
            .for_each(visit);
    }
}

/// Build a peer entry for an IPv4 protocol address.
pub fn ipv4_peer(
    peer_type: PeerType,
    interface: u32,
    protocol_address: [u8; 4],
    prefix_length: u8,
    next_hop: Address,
    up: bool,
) -> Peer {
    Peer {
        peer_type,
        protocol_address: Address::from_ip(
            crate::address::AddressFamily::Protocol,
            std::net::Ipv4Addr::from(protocol_address).into(),
        ),
        protocol_type: ETH_P_IP,
        prefix_length,
        next_hop_address: next_hop,
        up,
        interface,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressFamily;

    fn nbma(last: u8) -> Address {
        Address::nbma(&[192, 0, 2, last], &[]).unwrap()
    }

    fn sample() -> Registry {
        let mut reg = Registry::new();
        reg.add_interface(Interface {
            index: 5,
            name: "gre1".into(),
        });
        reg.add_interface(Interface {
            index: 9,
            name: "gre2".into(),
        });
        reg.add_peer(ipv4_peer(
            PeerType::Local,
            5,
            [10, 0, 0, 1],
            24,
            Address::none(AddressFamily::Nbma),
            true,
        ));
        reg.add_peer(ipv4_peer(PeerType::Static, 5, [10, 0, 0, 2], 32, nbma(2), true));
        reg.add_peer(ipv4_peer(PeerType::Dynamic, 5, [10, 0, 0, 3], 32, nbma(3), false));
        reg.add_peer(ipv4_peer(PeerType::Cached, 9, [10, 0, 1, 4], 32, nbma(4), true));
        reg
    }

    fn collect(reg: &Registry, sel: PeerSelector) -> Vec<[u8; 4]> {
        let mut out = Vec::new();
        reg.for_each_peer(&sel, &mut |p| {
            let mut a = [0u8; 4];
            a.copy_from_slice(p.protocol_address.addr());
            out.push(a);
        });
        out
    }

    #[test]
    fn local_selector() {
        assert_eq!(collect(&sample(), PeerSelector::local()), vec![[10, 0, 0, 1]]);
    }

    #[test]
    fn multicast_selector_filters_interface_and_up() {
        let reg = sample();
        assert_eq!(
            collect(&reg, PeerSelector::multicast_targets(5)),
            vec![[10, 0, 0, 2]]
        );
        assert_eq!(
            collect(&reg, PeerSelector::multicast_targets(9)),
            vec![[10, 0, 1, 4]]
        );
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert_eq!(collect(&sample(), PeerSelector::default()).len(), 4);
    }

    #[test]
    fn interface_lookup_and_replace() {
        let mut reg = sample();
        assert_eq!(reg.interface_by_index(9).unwrap().name, "gre2");
        assert!(reg.interface_by_index(1).is_none());
        reg.add_interface(Interface {
            index: 9,
            name: "gre9".into(),
        });
        assert_eq!(reg.interfaces().len(), 2);
        assert_eq!(reg.interface_by_index(9).unwrap().name, "gre9");
    }
}
