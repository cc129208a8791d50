//! End-to-end capture pipeline: configuration → topology → filter synthesis
//! → event loop → dispatch, over an in-memory capture device that evaluates
//! the attached filter the way the kernel would.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use nhrpd::address::ETH_P_IP;
use nhrpd::bpf::FilterProgram;
use nhrpd::bpf::policy::PACKET_OUTGOING;
use nhrpd::bpf::vm::{self, SkbContext};
use nhrpd::capture::{CaptureDevice, LinkInfo};
use nhrpd::config::Config;
use nhrpd::error::NhrpError;
use nhrpd::forward::{ForwardState, Forwarder, TrafficHandler};
use nhrpd::packet::{
    HeaderBuffer, NHRP_EXTENSION_RESPONDER_ADDRESS, NHRP_PACKET_RESOLUTION_REQUEST, Packet,
    Payload,
};
use nhrpd::registry::{Interface, Registry};
use nhrpd::sched::{Event, EventLoop, Scheduler, Task};

const CONFIG: &str = r#"{
    "interfaces": [ { "name": "gre1", "index": 5 }, { "name": "gre2", "index": 9 } ],
    "peers": [
        { "type": "local",  "interface": "gre1", "protocol_address": "10.0.0.1", "prefix_length": 24 },
        { "type": "static", "interface": "gre1", "protocol_address": "10.0.0.2", "next_hop": "192.0.2.2" },
        { "type": "static", "interface": "gre1", "protocol_address": "10.0.0.3", "next_hop": "192.0.2.3" },
        { "type": "cached", "interface": "gre2", "protocol_address": "10.0.1.4", "next_hop": "192.0.2.4" }
    ]
}"#;

/// Capture device that runs queued frames through the attached filter.
#[derive(Default)]
struct FilteringDevice {
    wire: VecDeque<(Vec<u8>, LinkInfo)>,
    filter: Option<FilterProgram>,
    sent: Vec<(Vec<u8>, LinkInfo)>,
    filtered_out: usize,
}

impl CaptureDevice for FilteringDevice {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, LinkInfo)> {
        while let Some((frame, link)) = self.wire.pop_front() {
            if let Some(filter) = &self.filter {
                let skb = SkbContext {
                    data: &frame,
                    protocol: link.protocol,
                    pkttype: link.pkttype,
                    ifindex: link.ifindex,
                };
                if vm::run(filter.instructions(), &skb) == 0 {
                    self.filtered_out += 1;
                    continue;
                }
            }
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            return Ok((frame.len(), link));
        }
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn send(&mut self, frame: &[u8], link: &LinkInfo) -> io::Result<usize> {
        self.sent.push((frame.to_vec(), *link));
        Ok(frame.len())
    }

    fn attach_filter(&mut self, program: &FilterProgram) -> Result<(), NhrpError> {
        self.filter = Some(program.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Handoff(Vec<(String, Vec<u8>)>);

impl TrafficHandler for Handoff {
    fn send_traffic(&mut self, iface: &Interface, _protocol: u16, frame: &[u8]) {
        self.0.push((iface.name.clone(), frame.to_vec()));
    }
}

fn ipv4(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut pkt = vec![0x45, 0];
    pkt.extend_from_slice(&total.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0x40, 0, 64, 17, 0, 0]);
    pkt.extend_from_slice(&src);
    pkt.extend_from_slice(&dst);
    pkt.extend_from_slice(payload);
    pkt
}

fn link(ifindex: u32, pkttype: u8) -> LinkInfo {
    LinkInfo {
        ifindex,
        protocol: ETH_P_IP,
        pkttype,
        halen: 4,
        addr: [0; 8],
    }
}

fn registry() -> (Config, Registry) {
    let config = Config::from_json(CONFIG).unwrap();
    let registry = config
        .to_registry(|name| Err(NhrpError::Config(format!("unexpected lookup of {name}"))))
        .unwrap();
    (config, registry)
}

/// Run the event loop until the pending install has fired.
fn settle(fwd: &mut Forwarder<FilteringDevice>, reg: &Registry, ev: &mut EventLoop) {
    for _ in 0..10 {
        for event in ev.wait(Duration::from_millis(50)).unwrap() {
            if let Event::Task(task) = event {
                fwd.run_task(task, reg, ev);
            }
        }
        if !ev.is_scheduled(Task::InstallFilter) {
            return;
        }
    }
    panic!("filter install never ran");
}

#[test]
fn multicast_fan_out_and_unicast_handoff() {
    let (config, reg) = registry();
    let mut ev = EventLoop::new();
    let mut fwd = Forwarder::new(config.settings());
    fwd.open(FilteringDevice::default(), &mut ev);
    settle(&mut fwd, &reg, &mut ev);
    assert_eq!(fwd.state(), ForwardState::Active);

    let mcast = ipv4([10, 0, 0, 1], [224, 0, 0, 5], b"hello");
    let unicast = ipv4([10, 0, 1, 7], [10, 0, 1, 4], b"data");
    let device_frames = [
        (mcast.clone(), link(5, PACKET_OUTGOING)),
        // incoming traffic and unknown interfaces never pass the filter
        (mcast.clone(), link(5, 0)),
        (unicast.clone(), link(77, PACKET_OUTGOING)),
        // own unicast traffic is dropped by the local prefix check
        (ipv4([10, 0, 0, 9], [10, 0, 1, 4], b""), link(5, PACKET_OUTGOING)),
        (unicast.clone(), link(9, PACKET_OUTGOING)),
    ];

    let mut device = FilteringDevice::default();
    device.wire.extend(device_frames);
    // reopen with the queued traffic; the fresh socket needs its filter too
    fwd.close(&mut ev);
    fwd.open(device, &mut ev);
    settle(&mut fwd, &reg, &mut ev);

    let mut handoff = Handoff::default();
    let frames = fwd.capture_readable(&reg, &mut handoff).unwrap();
    assert_eq!(frames, 2);

    let device = fwd.device().unwrap();
    assert_eq!(device.filtered_out, 3);
    let targets: Vec<&[u8]> = device.sent.iter().map(|(_, l)| l.link_addr()).collect();
    assert_eq!(targets, vec![&[192, 0, 2, 2][..], &[192, 0, 2, 3][..]]);
    assert!(device.sent.iter().all(|(frame, l)| frame == &mcast && l.ifindex == 5));

    assert_eq!(handoff.0, vec![("gre2".to_string(), unicast)]);

    let stats = fwd.stats();
    assert_eq!(stats.replicated, 2);
    assert_eq!(stats.encapsulated, 1);
}

#[test]
fn topology_change_rebuilds_through_scheduler() {
    let (config, reg) = registry();
    let mut ev = EventLoop::new();
    let mut fwd = Forwarder::new(config.settings());
    fwd.open(FilteringDevice::default(), &mut ev);
    settle(&mut fwd, &reg, &mut ev);
    let first = fwd.installed_filter().cloned().unwrap();

    let mut grown = reg.clone();
    grown.add_interface(Interface {
        index: 12,
        name: "gre3".into(),
    });
    fwd.local_addresses_changed(&mut ev);
    assert_eq!(fwd.state(), ForwardState::FilterPending);
    settle(&mut fwd, &grown, &mut ev);

    assert_eq!(fwd.state(), ForwardState::Active);
    let second = fwd.installed_filter().cloned().unwrap();
    assert_eq!(second.len(), first.len() + 1);
    assert_eq!(fwd.stats().filter_installs, 2);
}

#[test]
fn eof_is_fatal_for_the_dispatcher() {
    let (config, reg) = registry();
    let mut ev = EventLoop::new();
    let mut fwd = Forwarder::new(config.settings());
    let mut device = FilteringDevice::default();
    device.wire.push_back((Vec::new(), link(5, PACKET_OUTGOING)));
    fwd.open(device, &mut ev);

    let err = fwd.capture_readable(&reg, &mut Handoff::default()).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(fwd.state(), ForwardState::Closed);
    ev.cancel(Task::InstallFilter);
}

#[test]
fn encoded_request_fits_a_single_pdu() {
    let (_, reg) = registry();
    let peer = &reg.peers()[1];

    let mut packet = Packet::default();
    packet.header.afnum = 1;
    packet.header.protocol_type = ETH_P_IP;
    packet.header.hop_count = 16;
    packet.header.packet_type = NHRP_PACKET_RESOLUTION_REQUEST;
    packet.src_nbma_address = peer.next_hop_address.clone();
    packet.src_protocol_address = reg.peers()[0].protocol_address.clone();
    packet.dst_protocol_address = peer.protocol_address.clone();
    packet
        .set_extension(NHRP_EXTENSION_RESPONDER_ADDRESS, true, Payload::Raw(Vec::new()))
        .unwrap();

    let pdu = packet.to_pdu().unwrap();
    let hdr = HeaderBuffer::new_checked(&pdu[..]).unwrap();
    assert_eq!(hdr.packet_size() as usize, pdu.len());
    assert_eq!(hdr.src_nbma_address_len(), 4);
    // header, three IPv4 addresses, responder extension, end marker
    assert_eq!(pdu.len(), 28 + 12 + 4 + 4);
    assert_eq!(&pdu[pdu.len() - 4..], &[0x80, 0, 0, 0]);
}
