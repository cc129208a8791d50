// Address descriptors and the small address utilities the capture path needs:
// parsing a captured network-layer packet into source/destination addresses,
// multicast classification and diagnostic formatting.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::NhrpError;

/// Address lengths are carried in single-byte fields on the wire.
pub const MAX_ADDRESS_LEN: usize = u8::MAX as usize;

// Link-layer protocol numbers (ETH_P_*)
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

// IPv6
const IPV6_HLEN: usize = 40;
const IPV6_SRC_OFFSET: usize = 8;
const IPV6_DST_OFFSET: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Nbma,
    Protocol,
}

/// A variable-length NBMA or protocol address.
///
/// Only NBMA addresses carry a subaddress. Both byte sequences are bounded by
/// [`MAX_ADDRESS_LEN`] so their lengths always fit the one-byte wire fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    family: AddressFamily,
    addr: Vec<u8>,
    subaddr: Vec<u8>,
}

impl Address {
    pub fn nbma(addr: &[u8], subaddr: &[u8]) -> Result<Self, NhrpError> {
        check_len(addr)?;
        check_len(subaddr)?;
        Ok(Self {
            family: AddressFamily::Nbma,
            addr: addr.to_vec(),
            subaddr: subaddr.to_vec(),
        })
    }

    pub fn protocol(addr: &[u8]) -> Result<Self, NhrpError> {
        check_len(addr)?;
        Ok(Self {
            family: AddressFamily::Protocol,
            addr: addr.to_vec(),
            subaddr: Vec::new(),
        })
    }

    /// An empty address of the given family.
    pub fn none(family: AddressFamily) -> Self {
        Self {
            family,
            addr: Vec::new(),
            subaddr: Vec::new(),
        }
    }

    pub fn from_ip(family: AddressFamily, ip: IpAddr) -> Self {
        let addr = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Self {
            family,
            addr,
            subaddr: Vec::new(),
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn addr(&self) -> &[u8] {
        &self.addr
    }

    pub fn subaddr(&self) -> &[u8] {
        &self.subaddr
    }

    pub fn addr_len(&self) -> u8 {
        self.addr.len() as u8
    }

    pub fn subaddr_len(&self) -> u8 {
        self.subaddr.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.addr.is_empty()
    }

    /// Interpret the address bytes as an IP address, if they have an IP length.
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self.addr.len() {
            4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&self.addr);
                Some(IpAddr::V4(Ipv4Addr::from(b)))
            }
            16 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(&self.addr);
                Some(IpAddr::V6(Ipv6Addr::from(b)))
            }
            _ => None,
        }
    }

    /// The address as a host-order IPv4 word, for filter immediates.
    pub fn to_ipv4_u32(&self) -> Option<u32> {
        match self.to_ip()? {
            IpAddr::V4(v4) => Some(u32::from(v4)),
            IpAddr::V6(_) => None,
        }
    }

    pub fn is_multicast(&self) -> bool {
        self.to_ip().is_some_and(|ip| ip.is_multicast())
    }
}

fn check_len(bytes: &[u8]) -> Result<(), NhrpError> {
    if bytes.len() > MAX_ADDRESS_LEN {
        return Err(NhrpError::AddressTooLong {
            len: bytes.len(),
            max: MAX_ADDRESS_LEN,
        });
    }
    Ok(())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_ip() {
            Some(ip) => write!(f, "{ip}")?,
            None if self.addr.is_empty() => f.write_str("(none)")?,
            None => write_hex(f, &self.addr)?,
        }
        if !self.subaddr.is_empty() {
            f.write_str("/")?;
            write_hex(f, &self.subaddr)?;
        }
        Ok(())
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            f.write_str(":")?;
        }
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

/// Extract source and destination protocol addresses from a captured
/// network-layer packet (no link-layer header, as delivered by a
/// `SOCK_DGRAM` packet socket).
pub fn parse_packet(protocol: u16, data: &[u8]) -> Result<(Address, Address), NhrpError> {
    match protocol {
        ETH_P_IP => {
            if data.len() < IPV4_MIN_HLEN {
                return Err(NhrpError::MalformedFrame(format!(
                    "IPv4 packet truncated at {} bytes",
                    data.len()
                )));
            }
            if data[0] >> 4 != 4 {
                return Err(NhrpError::MalformedFrame(format!(
                    "IP version {} in IPv4 frame",
                    data[0] >> 4
                )));
            }
            let src = Address::protocol(&data[IPV4_SRC_OFFSET..IPV4_SRC_OFFSET + 4])?;
            let dst = Address::protocol(&data[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4])?;
            Ok((src, dst))
        }
        ETH_P_IPV6 => {
            if data.len() < IPV6_HLEN {
                return Err(NhrpError::MalformedFrame(format!(
                    "IPv6 packet truncated at {} bytes",
                    data.len()
                )));
            }
            let src = Address::protocol(&data[IPV6_SRC_OFFSET..IPV6_SRC_OFFSET + 16])?;
            let dst = Address::protocol(&data[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16])?;
            Ok((src, dst))
        }
        other => Err(NhrpError::MalformedFrame(format!(
            "unsupported protocol 0x{other:04x}"
        ))),
    }
}
