// Packet capture device abstraction.
//
// The dispatcher reads network-layer frames together with their link-level
// metadata and re-sends frames to rewritten link addresses. On Linux this is
// an AF_PACKET `SOCK_DGRAM` socket; tests substitute an in-memory device.

use std::io;

use crate::bpf::filter::FilterProgram;
use crate::error::NhrpError;

/// Maximum link-layer address length carried by `sockaddr_ll`.
pub const MAX_LINK_ADDR_LEN: usize = 8;

/// Per-frame link metadata (the fields of `sockaddr_ll` the daemon uses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkInfo {
    pub ifindex: u32,
    /// EtherType, host byte order.
    pub protocol: u16,
    pub pkttype: u8,
    pub halen: u8,
    pub addr: [u8; MAX_LINK_ADDR_LEN],
}

impl LinkInfo {
    pub fn link_addr(&self) -> &[u8] {
        &self.addr[..(self.halen as usize).min(MAX_LINK_ADDR_LEN)]
    }

    /// True when the frame already carries a resolved link destination.
    pub fn has_link_addr(&self) -> bool {
        self.link_addr().iter().any(|&b| b != 0)
    }

    /// Copy of this metadata with the link destination replaced.
    ///
    /// Returns `None` if `addr` does not fit a `sockaddr_ll`.
    pub fn with_link_addr(&self, addr: &[u8]) -> Option<LinkInfo> {
        if addr.len() > MAX_LINK_ADDR_LEN {
            return None;
        }
        let mut out = *self;
        out.addr = [0; MAX_LINK_ADDR_LEN];
        out.addr[..addr.len()].copy_from_slice(addr);
        out.halen = addr.len() as u8;
        Some(out)
    }
}

/// A raw capture resource owned by the dispatcher.
pub trait CaptureDevice {
    /// Non-blocking receive of one frame into `buf`.
    ///
    /// Returns the full length of the frame, which exceeds `buf.len()` when
    /// the frame was truncated. `WouldBlock` means the queue is drained;
    /// `Ok((0, _))` means EOF.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, LinkInfo)>;

    /// Send `frame` out of `link.ifindex` to `link.link_addr()`.
    fn send(&mut self, frame: &[u8], link: &LinkInfo) -> io::Result<usize>;

    /// Atomically replace the kernel filter.
    fn attach_filter(&mut self, program: &FilterProgram) -> Result<(), NhrpError>;
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;
