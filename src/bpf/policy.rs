//! Capture filter policy.
//!
//! Builds the socket filter for the packet socket from the current topology.
//! Offsets are relative to the network header (`SOCK_DGRAM` packet socket).
//!
//! ```text
//!        ld   #type                      ; packet direction
//!        jeq  #PACKET_OUTGOING, next, drop
//!        ld   #ifidx
//!        jeq  #if1, if_ok, next          ; one per interface,
//!        jeq  #ifN, if_ok, drop          ; last falls through to drop
//! if_ok: ld   #proto
//!        jeq  #ETH_P_IP, next, not_ipv4
//!        ld   [16]                       ; daddr
//!        jge  #0xe0000000, next, skip1
//!        jge  #0xf0000000, next, accept  ; 224.0.0.0/4 → accept
//!        ld   [12]                       ; saddr
//!        jeq  #local/32, drop, next      ; one per local /32
//!        jge  #net, next, skip1          ; two per local prefix
//!        jgt  #bcast, next, drop
//!        ret  #65535
//! not_ipv4:
//! accept: ret #65535
//! drop:   ret #0
//! ```

use crate::address::ETH_P_IP;
use crate::error::NhrpError;
use crate::registry::{PeerSelector, Topology};

use super::filter::{
    BPF_ABS, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_K, BPF_LD, BPF_RET, BPF_W, FilterBuilder,
    FilterProgram, Label, SKF_AD_IFINDEX, SKF_AD_OFF, SKF_AD_PKTTYPE, SKF_AD_PROTOCOL,
};

/// `sll_pkttype` of frames sent by this host.
pub const PACKET_OUTGOING: u8 = 4;

/// Default instruction budget for the capture filter.
pub const DEFAULT_MAX_FILTER_INSNS: usize = 100;

const ACCEPT: u32 = 65535;
const DROP: u32 = 0;

// IPv4 header offsets
const IPV4_SADDR: u32 = 12;
const IPV4_DADDR: u32 = 16;

const IPV4_MULTICAST_FIRST: u32 = 0xe000_0000;
const IPV4_MULTICAST_END: u32 = 0xf000_0000;

const JEQ: u16 = BPF_JMP | BPF_JEQ | BPF_K;
const JGE: u16 = BPF_JMP | BPF_JGE | BPF_K;
const JGT: u16 = BPF_JMP | BPF_JGT | BPF_K;
const LDW: u16 = BPF_LD | BPF_W | BPF_ABS;
const RET: u16 = BPF_RET | BPF_K;

/// Build the capture filter for the current interface and local peer sets.
///
/// Deterministic: the same topology always yields the same program.
pub fn build_capture_filter<T: Topology + ?Sized>(
    topology: &T,
    max_insns: usize,
) -> Result<FilterProgram, NhrpError> {
    let mut f = FilterBuilder::new(max_insns);

    // Only outgoing traffic
    f.emit_stmt(LDW, SKF_AD_OFF + SKF_AD_PKTTYPE);
    f.emit_jump(JEQ, PACKET_OUTGOING as u32, Label::Next, Label::Drop);

    // Known interface
    f.emit_stmt(LDW, SKF_AD_OFF + SKF_AD_IFINDEX);
    topology.for_each_interface(&mut |iface| {
        f.emit_jump(JEQ, iface.index, Label::IfOk, Label::Next);
    });
    if !f.patch_last_jump(Label::Drop) {
        log::warn!("No interfaces configured: capture filter drops everything");
        f.emit_stmt(RET, DROP);
    }
    f.mark(Label::IfOk);

    // Non-IPv4 passes through untouched
    f.emit_stmt(LDW, SKF_AD_OFF + SKF_AD_PROTOCOL);
    f.emit_jump(JEQ, ETH_P_IP as u32, Label::Next, Label::NotIpv4);

    // IPv4 multicast destination
    f.emit_stmt(LDW, IPV4_DADDR);
    f.emit_jump(JGE, IPV4_MULTICAST_FIRST, Label::Next, Label::Skip1);
    f.emit_jump(JGE, IPV4_MULTICAST_END, Label::Next, Label::Accept);

    // Drop traffic sourced from our own addresses
    f.emit_stmt(LDW, IPV4_SADDR);
    topology.for_each_peer(&PeerSelector::local(), &mut |peer| {
        if peer.protocol_type != ETH_P_IP {
            return;
        }
        let Some(addr) = peer.protocol_address.to_ipv4_u32() else {
            log::debug!(
                "Skipping local peer {} with non-IPv4 address",
                peer.protocol_address
            );
            return;
        };
        match peer.prefix_length {
            32 => f.emit_jump(JEQ, addr, Label::Drop, Label::Next),
            len @ 0..=31 => {
                let host_mask = u32::MAX >> len;
                f.emit_jump(JGE, addr & !host_mask, Label::Next, Label::Skip1);
                f.emit_jump(JGT, addr | host_mask, Label::Next, Label::Drop);
            }
            len => log::warn!(
                "Ignoring local peer {}/{}: invalid prefix length",
                peer.protocol_address,
                len
            ),
        }
    });
    f.emit_stmt(RET, ACCEPT);

    f.mark(Label::NotIpv4);
    f.mark(Label::Accept);
    f.emit_stmt(RET, ACCEPT);
    f.mark(Label::Drop);
    f.emit_stmt(RET, DROP);

    f.finalize()
}
