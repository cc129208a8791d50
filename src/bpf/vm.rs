//! Minimal classic BPF interpreter.
//!
//! Evaluates a resolved filter the way the Linux socket filter would for a
//! packet delivered to a `SOCK_DGRAM` packet socket: absolute loads address
//! the network header, and `SKF_AD_OFF` loads return the frame metadata.
//! Supports the subset emitted by the policy builder: LD (W/H/B, ABS),
//! JMP (JA, JEQ, JGT, JGE, JSET with K) and RET (K, A).

use super::filter::{
    BPF_B, BPF_H, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET, BPF_LD, BPF_RET, BPF_W,
    SKF_AD_IFINDEX, SKF_AD_OFF, SKF_AD_PKTTYPE, SKF_AD_PROTOCOL, bpf_class, sock_filter,
};

/// Frame metadata and network-layer bytes seen by the filter.
#[derive(Debug, Clone, Copy)]
pub struct SkbContext<'a> {
    pub data: &'a [u8],
    pub protocol: u16,
    pub pkttype: u8,
    pub ifindex: u32,
}

/// Execute `program` against `skb`.
///
/// Returns the value from the `RET` instruction:
/// - 0 means the packet is rejected.
/// - A positive value means the packet is accepted (the value is the
///   snap length, i.e. how many bytes to capture).
///
/// Out-of-bounds loads, unsupported opcodes and running off the end of the
/// program all reject, as the kernel does.
pub fn run(program: &[sock_filter], skb: &SkbContext<'_>) -> u32 {
    let mut a: u32 = 0;
    let mut pc: usize = 0;

    while pc < program.len() {
        let inst = program[pc];
        match bpf_class(inst.code) {
            BPF_LD => {
                if inst.code & 0xe0 != 0x20 {
                    // only BPF_ABS
                    return 0;
                }
                a = match load_abs(skb, inst.code & 0x18, inst.k) {
                    Some(v) => v,
                    None => return 0,
                };
            }
            BPF_JMP => {
                let op = inst.code & 0xf0;
                if op == BPF_JA {
                    pc += inst.k as usize;
                } else {
                    let taken = match op {
                        BPF_JEQ => a == inst.k,
                        BPF_JGT => a > inst.k,
                        BPF_JGE => a >= inst.k,
                        BPF_JSET => a & inst.k != 0,
                        _ => return 0,
                    };
                    let off = if taken { inst.jt } else { inst.jf };
                    pc += off as usize;
                }
            }
            BPF_RET => {
                // BPF_K: return constant; BPF_A (0x10): return accumulator
                if inst.code & 0x18 == 0x10 {
                    return a;
                }
                return inst.k;
            }
            _ => return 0,
        }
        pc += 1;
    }
    // Fell off the end without a RET.
    0
}

fn load_abs(skb: &SkbContext<'_>, size: u16, k: u32) -> Option<u32> {
    if k >= SKF_AD_OFF {
        return match k - SKF_AD_OFF {
            SKF_AD_PROTOCOL => Some(skb.protocol as u32),
            SKF_AD_PKTTYPE => Some(skb.pkttype as u32),
            SKF_AD_IFINDEX => Some(skb.ifindex),
            _ => None,
        };
    }
    let off = k as usize;
    let data = skb.data;
    match size {
        BPF_W => {
            let b = data.get(off..off.checked_add(4)?)?;
            Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
        BPF_H => {
            let b = data.get(off..off.checked_add(2)?)?;
            Some(u16::from_be_bytes([b[0], b[1]]) as u32)
        }
        BPF_B => data.get(off).map(|&b| b as u32),
        _ => None,
    }
}
