//! Capture dispatcher.
//!
//! Owns the packet socket, keeps the kernel filter in sync with the current
//! topology and dispatches every captured outgoing frame: multicast frames
//! are replicated to each up peer on the interface, unicast frames are handed
//! to the NHRP encapsulation path.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::address::parse_packet;
use crate::bpf::filter::FilterProgram;
use crate::bpf::policy::{DEFAULT_MAX_FILTER_INSNS, PACKET_OUTGOING, build_capture_filter};
use crate::capture::{CaptureDevice, LinkInfo};
use crate::error::NhrpError;
use crate::registry::{Interface, PeerSelector, Topology};
use crate::sched::{Scheduler, Task};

/// Default delay between failed filter install attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default receive buffer, large enough for any frame on an NBMA tunnel.
pub const DEFAULT_CAPTURE_BUFFER: usize = 2048;

/// Receiver of unicast traffic that needs NHRP resolution.
pub trait TrafficHandler {
    fn send_traffic(&mut self, iface: &Interface, protocol: u16, frame: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Uninitialized,
    /// Socket open, no filter for the current topology installed yet.
    FilterPending,
    Active,
    Closed,
}

impl fmt::Display for ForwardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForwardState::Uninitialized => "uninitialized",
            ForwardState::FilterPending => "filter-pending",
            ForwardState::Active => "active",
            ForwardState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSettings {
    pub max_filter_insns: usize,
    pub retry_interval: Duration,
    pub capture_buffer: usize,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            max_filter_insns: DEFAULT_MAX_FILTER_INSNS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            capture_buffer: DEFAULT_CAPTURE_BUFFER,
        }
    }
}

/// Running totals, logged on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub received: u64,
    pub discarded: u64,
    pub replicated: u64,
    pub encapsulated: u64,
    pub filter_installs: u64,
}

enum Dispatch {
    Ignored,
    Replicated(usize),
    Encapsulated,
}

pub struct Forwarder<D: CaptureDevice> {
    settings: ForwardSettings,
    device: Option<D>,
    state: ForwardState,
    installed: Option<FilterProgram>,
    buf: Vec<u8>,
    stats: ForwardStats,
}

impl<D: CaptureDevice> Forwarder<D> {
    pub fn new(settings: ForwardSettings) -> Self {
        Self {
            buf: vec![0u8; settings.capture_buffer.max(1)],
            settings,
            device: None,
            state: ForwardState::Uninitialized,
            installed: None,
            stats: ForwardStats::default(),
        }
    }

    /// Take ownership of the capture device and queue the first filter
    /// install.
    pub fn open(&mut self, device: D, sched: &mut dyn Scheduler) {
        self.device = Some(device);
        self.installed = None;
        self.state = ForwardState::FilterPending;
        sched.schedule(Task::InstallFilter, Duration::ZERO);
    }

    pub fn state(&self) -> ForwardState {
        self.state
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    /// The program currently attached to the socket, if any.
    pub fn installed_filter(&self) -> Option<&FilterProgram> {
        self.installed.as_ref()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats
    }

    /// Topology changed: the installed filter is stale.
    pub fn local_addresses_changed(&mut self, sched: &mut dyn Scheduler) {
        if self.state == ForwardState::Active {
            self.state = ForwardState::FilterPending;
        }
        sched.schedule(Task::InstallFilter, Duration::ZERO);
    }

    pub fn run_task<T: Topology + ?Sized>(
        &mut self,
        task: Task,
        topology: &T,
        sched: &mut dyn Scheduler,
    ) {
        match task {
            Task::InstallFilter => {
                // failures are logged and, where useful, rescheduled
                let _ = self.rebuild_and_install_filter(topology, sched);
            }
        }
    }

    /// Build the filter for the current topology and swap it in.
    ///
    /// Assembly errors keep the previous filter and are not retried until the
    /// topology changes again. Kernel rejections are retried after the
    /// configured interval.
    pub fn rebuild_and_install_filter<T: Topology + ?Sized>(
        &mut self,
        topology: &T,
        sched: &mut dyn Scheduler,
    ) -> Result<(), NhrpError> {
        let Some(device) = self.device.as_mut() else {
            return Err(NhrpError::NotOpen);
        };

        let program = match build_capture_filter(topology, self.settings.max_filter_insns) {
            Ok(program) => program,
            Err(e) => {
                log::error!("{e}");
                sched.cancel(Task::InstallFilter);
                return Err(e);
            }
        };

        if let Err(e) = device.attach_filter(&program) {
            log::warn!(
                "{e}; retrying in {:?}",
                self.settings.retry_interval
            );
            sched.schedule(Task::InstallFilter, self.settings.retry_interval);
            return Err(e);
        }

        log::info!("Filter code installed ({} opcodes)", program.len());
        log::debug!("Capture filter:\n{program}");
        sched.cancel(Task::InstallFilter);
        self.installed = Some(program);
        self.state = ForwardState::Active;
        self.stats.filter_installs += 1;
        Ok(())
    }

    /// Drain every frame currently queued on the capture socket.
    ///
    /// Returns the number of frames read. End of stream closes the
    /// dispatcher and is reported as [`NhrpError::CaptureEof`].
    pub fn capture_readable<T: Topology + ?Sized>(
        &mut self,
        topology: &T,
        traffic: &mut dyn TrafficHandler,
    ) -> Result<usize, NhrpError> {
        let Some(device) = self.device.as_mut() else {
            return Err(NhrpError::NotOpen);
        };

        let mut frames = 0;
        loop {
            let (len, link) = match device.recv(&mut self.buf) {
                Ok((0, _)) => {
                    log::error!("PF_PACKET returned EOF");
                    self.device = None;
                    self.state = ForwardState::Closed;
                    return Err(NhrpError::CaptureEof);
                }
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("PF_PACKET overrun: {e}");
                    break;
                }
            };
            frames += 1;
            self.stats.received += 1;

            if len > self.buf.len() {
                log::debug!(
                    "Discarding frame on ifindex {}: {}",
                    link.ifindex,
                    NhrpError::MalformedFrame(format!(
                        "{len} byte frame truncated to {} bytes",
                        self.buf.len()
                    ))
                );
                self.stats.discarded += 1;
                continue;
            }
            let frame = &self.buf[..len];
            match dispatch_frame(device, frame, &link, topology, traffic) {
                Ok(Dispatch::Ignored) => self.stats.discarded += 1,
                Ok(Dispatch::Replicated(n)) => self.stats.replicated += n as u64,
                Ok(Dispatch::Encapsulated) => self.stats.encapsulated += 1,
                Err(e) => {
                    log::debug!("Discarding frame on ifindex {}: {e}", link.ifindex);
                    self.stats.discarded += 1;
                }
            }
        }
        Ok(frames)
    }

    /// Release the socket. Pending filter installs are cancelled.
    pub fn close(&mut self, sched: &mut dyn Scheduler) {
        sched.cancel(Task::InstallFilter);
        self.device = None;
        self.installed = None;
        self.state = ForwardState::Closed;
    }
}

fn dispatch_frame<D, T>(
    device: &mut D,
    frame: &[u8],
    link: &LinkInfo,
    topology: &T,
    traffic: &mut dyn TrafficHandler,
) -> Result<Dispatch, NhrpError>
where
    D: CaptureDevice + ?Sized,
    T: Topology + ?Sized,
{
    if link.pkttype != PACKET_OUTGOING {
        return Ok(Dispatch::Ignored);
    }
    let iface = topology
        .interface_by_index(link.ifindex)
        .ok_or(NhrpError::UnknownInterface(link.ifindex))?;
    let (src, dst) = parse_packet(link.protocol, frame)?;

    if !dst.is_multicast() {
        traffic.send_traffic(&iface, link.protocol, frame);
        return Ok(Dispatch::Encapsulated);
    }
    if link.has_link_addr() {
        return Ok(Dispatch::Ignored);
    }

    log::debug!("Multicast from {src} to {dst}");
    let mut sent = 0;
    topology.for_each_peer(&PeerSelector::multicast_targets(iface.index), &mut |peer| {
        let nbma = &peer.next_hop_address;
        let Some(to) = link.with_link_addr(nbma.addr()) else {
            log::warn!("Cannot send multicast to nbma {nbma}: address too long");
            return;
        };
        log::debug!("Sending multicast to nbma {nbma}");
        match device.send(frame, &to) {
            Ok(_) => sent += 1,
            Err(e) => log::error!("Failed to forward multicast packet to {nbma}: {e}"),
        }
    });
    Ok(Dispatch::Replicated(sent))
}
