// Linux capture implementation: AF_PACKET datagram sockets.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::bpf::filter::{FilterProgram, sock_filter};
use crate::error::NhrpError;

use super::{CaptureDevice, LinkInfo, MAX_LINK_ADDR_LEN};

// ---------------------------------------------------------------------------
// AF_PACKET constants
// ---------------------------------------------------------------------------

const ETH_P_ALL: u16 = 0x0003;

#[allow(non_camel_case_types)]
#[repr(C)]
struct sock_fprog {
    len: u16,
    filter: *const sock_filter,
}

/// AF_PACKET socket receiving every protocol on every interface.
///
/// Frames are delivered without their link-layer header, so filter offsets
/// address the network header. Drop closes the fd automatically via OwnedFd.
pub struct PacketSocket {
    fd: OwnedFd,
}

impl PacketSocket {
    /// Open a close-on-exec, non-blocking packet socket.
    pub fn open() -> Result<Self, NhrpError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                ETH_P_ALL.to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(NhrpError::CaptureDevice(format!(
                "Unable to create PF_PACKET socket: {}",
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        log::info!("PF_PACKET socket open (fd={})", fd.as_raw_fd());
        Ok(Self { fd })
    }
}

impl AsRawFd for PacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl CaptureDevice for PacketSocket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, LinkInfo)> {
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut sll_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
                &mut sll as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut sll_len,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let link = LinkInfo {
            ifindex: sll.sll_ifindex as u32,
            protocol: u16::from_be(sll.sll_protocol),
            pkttype: sll.sll_pkttype,
            halen: sll.sll_halen.min(MAX_LINK_ADDR_LEN as u8),
            addr: sll.sll_addr,
        };
        Ok((n as usize, link))
    }

    fn send(&mut self, frame: &[u8], link: &LinkInfo) -> io::Result<usize> {
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = link.protocol.to_be();
        sll.sll_ifindex = link.ifindex as i32;
        sll.sll_halen = link.halen;
        sll.sll_addr = link.addr;

        let n = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn attach_filter(&mut self, program: &FilterProgram) -> Result<(), NhrpError> {
        let insns = program.instructions();
        let len = u16::try_from(insns.len()).map_err(|_| NhrpError::CapacityExceeded {
            count: insns.len(),
            max: u16::MAX as usize,
        })?;
        let prog = sock_fprog {
            len,
            filter: insns.as_ptr(),
        };

        // The kernel swaps the old program for the new one in a single step.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const sock_fprog as *const libc::c_void,
                std::mem::size_of::<sock_fprog>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(NhrpError::InstallFailed(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Resolve an interface name to its kernel index.
pub fn if_nametoindex(name: &str) -> Result<u32, NhrpError> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| NhrpError::Config(format!("invalid interface name {name:?}")))?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(NhrpError::Config(format!(
            "if_nametoindex({}) failed: {}",
            name,
            io::Error::last_os_error()
        )));
    }
    Ok(idx)
}
