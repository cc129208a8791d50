//! Daemon configuration file.
//!
//! A JSON document listing the capture interfaces and the peers the capture
//! path needs to know about, plus overrides for the resource bounds.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::address::{Address, AddressFamily, ETH_P_IP, ETH_P_IPV6};
use crate::bpf::filter::BPF_MAXINSNS;
use crate::bpf::policy::DEFAULT_MAX_FILTER_INSNS;
use crate::error::NhrpError;
use crate::forward::{DEFAULT_CAPTURE_BUFFER, DEFAULT_RETRY_INTERVAL, ForwardSettings};
use crate::packet::MAX_PDU_SIZE;
use crate::registry::{Interface, InterfaceRegistry, Peer, PeerType, Registry};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub max_filter_insns: usize,
    pub retry_interval_ms: u64,
    pub capture_buffer: usize,
    pub interfaces: Vec<InterfaceConfig>,
    pub peers: Vec<PeerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_filter_insns: DEFAULT_MAX_FILTER_INSNS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            capture_buffer: DEFAULT_CAPTURE_BUFFER,
            interfaces: Vec::new(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub name: String,
    /// Kernel interface index; looked up by name when absent.
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    #[serde(rename = "type")]
    pub peer_type: PeerType,
    pub interface: String,
    pub protocol_address: IpAddr,
    /// Defaults to a host prefix.
    #[serde(default)]
    pub prefix_length: Option<u8>,
    #[serde(default)]
    pub next_hop: Option<IpAddr>,
    #[serde(default = "default_up")]
    pub up: bool,
}

fn default_up() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, NhrpError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NhrpError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text).map_err(|e| match e {
            NhrpError::Config(msg) => NhrpError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, NhrpError> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| NhrpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), NhrpError> {
        if self.max_filter_insns == 0 || self.max_filter_insns > BPF_MAXINSNS {
            return Err(NhrpError::Config(format!(
                "max_filter_insns must be between 1 and {BPF_MAXINSNS}"
            )));
        }
        if self.capture_buffer < MAX_PDU_SIZE {
            return Err(NhrpError::Config(format!(
                "capture_buffer must be at least {MAX_PDU_SIZE} bytes"
            )));
        }
        if self.retry_interval_ms == 0 {
            return Err(NhrpError::Config("retry_interval_ms must be positive".into()));
        }

        let mut names = HashSet::new();
        for iface in &self.interfaces {
            if !names.insert(iface.name.as_str()) {
                return Err(NhrpError::Config(format!(
                    "interface {} listed twice",
                    iface.name
                )));
            }
        }
        for peer in &self.peers {
            if !names.contains(peer.interface.as_str()) {
                return Err(NhrpError::Config(format!(
                    "peer {} refers to unknown interface {}",
                    peer.protocol_address, peer.interface
                )));
            }
            let max = host_prefix(&peer.protocol_address);
            if peer.prefix_length.is_some_and(|len| len > max) {
                return Err(NhrpError::Config(format!(
                    "peer {}: prefix length above {max}",
                    peer.protocol_address
                )));
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> ForwardSettings {
        ForwardSettings {
            max_filter_insns: self.max_filter_insns,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            capture_buffer: self.capture_buffer,
        }
    }

    /// Build the topology, resolving interface names without an explicit
    /// index through `resolve`.
    pub fn to_registry<F>(&self, mut resolve: F) -> Result<Registry, NhrpError>
    where
        F: FnMut(&str) -> Result<u32, NhrpError>,
    {
        let mut reg = Registry::new();
        let mut index_of = HashMap::new();

        for iface in &self.interfaces {
            let index = match iface.index {
                Some(index) => index,
                None => resolve(&iface.name)?,
            };
            if let Some(other) = reg.interface_by_index(index) {
                return Err(NhrpError::Config(format!(
                    "interfaces {} and {} share index {index}",
                    other.name, iface.name
                )));
            }
            log::debug!("Interface {} has index {}", iface.name, index);
            reg.add_interface(Interface {
                index,
                name: iface.name.clone(),
            });
            index_of.insert(iface.name.as_str(), index);
        }

        for peer in &self.peers {
            let interface = index_of
                .get(peer.interface.as_str())
                .copied()
                .ok_or_else(|| NhrpError::Config(format!("unknown interface {}", peer.interface)))?;
            reg.add_peer(Peer {
                peer_type: peer.peer_type,
                protocol_address: Address::from_ip(AddressFamily::Protocol, peer.protocol_address),
                protocol_type: match peer.protocol_address {
                    IpAddr::V4(_) => ETH_P_IP,
                    IpAddr::V6(_) => ETH_P_IPV6,
                },
                prefix_length: peer
                    .prefix_length
                    .unwrap_or_else(|| host_prefix(&peer.protocol_address)),
                next_hop_address: match peer.next_hop {
                    Some(ip) => Address::from_ip(AddressFamily::Nbma, ip),
                    None => Address::none(AddressFamily::Nbma),
                },
                up: peer.up,
                interface,
            });
        }
        Ok(reg)
    }
}

fn host_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}
