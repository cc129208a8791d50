//! Linux-only integration tests for the packet socket.
//!
//! These tests require root (or CAP_NET_RAW) and are skipped otherwise.
//!
//! Run with: `sudo cargo test --test linux_capture`

#![cfg(target_os = "linux")]

use std::io;
use std::os::fd::AsRawFd;

use nhrpd::address::{Address, AddressFamily};
use nhrpd::bpf::build_capture_filter;
use nhrpd::bpf::filter::{BPF_K, BPF_MAXINSNS, BPF_RET, FilterBuilder};
use nhrpd::capture::{CaptureDevice, PacketSocket, if_nametoindex};
use nhrpd::config::Config;
use nhrpd::error::NhrpError;
use nhrpd::registry::{Interface, PeerType, Registry, ipv4_peer};

fn is_root_or_capable() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn loopback_config() -> Config {
    Config::from_json(
        r#"{ "interfaces": [ { "name": "lo" } ],
             "peers": [ { "type": "local", "interface": "lo",
                          "protocol_address": "127.0.0.0", "prefix_length": 8 } ] }"#,
    )
    .unwrap()
}

#[test]
fn packet_socket_is_nonblocking_and_cloexec() {
    if !is_root_or_capable() {
        eprintln!("skipping: requires root or CAP_NET_RAW");
        return;
    }
    let mut sock = PacketSocket::open().unwrap();
    let fd = sock.as_raw_fd();
    let fd_flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    assert!(fd_flags & libc::FD_CLOEXEC != 0);
    let fl_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert!(fl_flags & libc::O_NONBLOCK != 0);

    // A drop-everything filter leaves nothing to read.
    let mut f = FilterBuilder::new(1);
    f.emit_stmt(BPF_RET | BPF_K, 0);
    sock.attach_filter(&f.finalize().unwrap()).unwrap();
    let mut buf = [0u8; 2048];
    loop {
        match sock.recv(&mut buf) {
            // frames queued before the filter swap
            Ok(_) => continue,
            Err(e) => {
                assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
                break;
            }
        }
    }
}

#[test]
fn synthesized_filter_is_accepted_by_kernel() {
    if !is_root_or_capable() {
        eprintln!("skipping: requires root or CAP_NET_RAW");
        return;
    }
    let config = loopback_config();
    let registry = config.to_registry(if_nametoindex).unwrap();
    let program = build_capture_filter(&registry, config.max_filter_insns).unwrap();

    let mut sock = PacketSocket::open().unwrap();
    sock.attach_filter(&program).unwrap();
    // replacing an installed filter works the same way
    sock.attach_filter(&program).unwrap();
}

#[test]
fn kernel_accepts_filter_with_long_jumps() {
    if !is_root_or_capable() {
        eprintln!("skipping: requires root or CAP_NET_RAW");
        return;
    }
    let lo = if_nametoindex("lo").unwrap();
    let mut registry = Registry::new();
    registry.add_interface(Interface {
        index: lo,
        name: "lo".into(),
    });
    for i in 0..130 {
        registry.add_peer(ipv4_peer(
            PeerType::Local,
            lo,
            [10, 1, i, 0],
            24,
            Address::none(AddressFamily::Nbma),
            true,
        ));
    }
    let program = build_capture_filter(&registry, BPF_MAXINSNS).unwrap();
    assert!(program.len() > 256);

    let mut sock = PacketSocket::open().unwrap();
    sock.attach_filter(&program).unwrap();
}

#[test]
fn kernel_rejects_invalid_program() {
    if !is_root_or_capable() {
        eprintln!("skipping: requires root or CAP_NET_RAW");
        return;
    }
    // no return instruction
    let mut f = FilterBuilder::new(1);
    f.emit_stmt(0x00, 0);
    let mut sock = PacketSocket::open().unwrap();
    assert!(matches!(
        sock.attach_filter(&f.finalize().unwrap()),
        Err(NhrpError::InstallFailed(_))
    ));
}
