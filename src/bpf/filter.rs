//! Classic BPF program assembly.
//!
//! Filter programs are a flat instruction array where conditional jumps only
//! carry forward offsets relative to the next instruction. The capture policy,
//! however, is expressed over lists (interfaces, peers) whose length is only
//! known while emitting. [`FilterBuilder`] lets the caller branch to symbolic
//! [`Label`]s, place them with [`FilterBuilder::mark`] once the position is
//! known, and resolves every reference to a relative offset in
//! [`FilterBuilder::finalize`]. Only the resolved [`FilterProgram`] can be
//! attached to a socket.

use std::fmt;

use serde::Serialize;

use crate::error::NhrpError;

// ---------------------------------------------------------------------------
// FFI type: BPF instruction
// ---------------------------------------------------------------------------

/// A single classic BPF instruction, matching the kernel `struct sock_filter`.
///
/// The layout is:
/// - `code` (u16): opcode composed of class | size | mode
/// - `jt`   (u8):  jump-true offset (relative, for conditional jumps)
/// - `jf`   (u8):  jump-false offset (relative, for conditional jumps)
/// - `k`    (u32): generic constant (immediate value, memory offset, etc.)
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct sock_filter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

// Compile-time size assertion: sock_filter must be exactly 8 bytes.
const _: () = assert!(std::mem::size_of::<sock_filter>() == 8);

// ---------------------------------------------------------------------------
// BPF instruction constants (linux/filter.h)
// ---------------------------------------------------------------------------

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;

// LD sizes
pub const BPF_W: u16 = 0x00; // word (32-bit)
pub const BPF_H: u16 = 0x08; // half-word (16-bit)
pub const BPF_B: u16 = 0x10; // byte

// LD modes
pub const BPF_ABS: u16 = 0x20; // absolute offset into packet

// JMP operations
pub const BPF_JA: u16 = 0x00; // unconditional jump
pub const BPF_JEQ: u16 = 0x10; // jump if A == k
pub const BPF_JGT: u16 = 0x20; // jump if A > k
pub const BPF_JGE: u16 = 0x30; // jump if A >= k
pub const BPF_JSET: u16 = 0x40; // jump if A & k != 0

// Operand source
pub const BPF_K: u16 = 0x00; // constant operand

// Ancillary data loads: offsets relative to SKF_AD_OFF (-4096)
pub const SKF_AD_OFF: u32 = (-0x1000i32) as u32;
pub const SKF_AD_PROTOCOL: u32 = 0;
pub const SKF_AD_PKTTYPE: u32 = 4;
pub const SKF_AD_IFINDEX: u32 = 8;

/// Kernel limit on the number of instructions in a socket filter.
pub const BPF_MAXINSNS: usize = 4096;

pub const fn bpf_class(code: u16) -> u16 {
    code & 0x07
}

/// Construct a single `sock_filter` with the given fields.
pub fn insn(code: u16, jt: u8, jf: u8, k: u32) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Jump targets used while assembling a filter.
///
/// `Next` and `Skip1` are structural: they always mean "fall through" and
/// "skip one instruction" and never need to be marked. The others name a
/// position that must be placed with [`FilterBuilder::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Next,
    Skip1,
    Drop,
    Accept,
    IfOk,
    NotIpv4,
}

impl Label {
    const COUNT: usize = 6;

    fn structural_offset(self) -> Option<u8> {
        match self {
            Label::Next => Some(0),
            Label::Skip1 => Some(1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Stmt { code: u16, k: u32 },
    Jump { code: u16, k: u32, jt: Label, jf: Label },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct FilterBuilder {
    ops: Vec<Op>,
    pos: [Option<usize>; Label::COUNT],
    max_insns: usize,
}

impl FilterBuilder {
    pub fn new(max_insns: usize) -> Self {
        Self {
            ops: Vec::new(),
            pos: [None; Label::COUNT],
            max_insns: max_insns.min(BPF_MAXINSNS),
        }
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn emit_stmt(&mut self, code: u16, k: u32) {
        self.ops.push(Op::Stmt { code, k });
    }

    pub fn emit_jump(&mut self, code: u16, k: u32, jt: Label, jf: Label) {
        debug_assert_eq!(bpf_class(code), BPF_JMP);
        self.ops.push(Op::Jump { code, k, jt, jf });
    }

    /// Place `label` at the next instruction to be emitted.
    pub fn mark(&mut self, label: Label) {
        debug_assert!(
            label.structural_offset().is_none(),
            "structural label {label:?} cannot be marked"
        );
        self.pos[label as usize] = Some(self.ops.len());
    }

    /// Redirect the fall-through targets of the last instruction to `label`.
    ///
    /// Returns `false` when the last instruction is not a jump.
    pub fn patch_last_jump(&mut self, label: Label) -> bool {
        match self.ops.last_mut() {
            Some(Op::Jump { jt, jf, .. }) => {
                if *jt == Label::Next {
                    *jt = label;
                }
                if *jf == Label::Next {
                    *jf = label;
                }
                true
            }
            _ => false,
        }
    }

    /// Resolve every label to a relative offset and check the instruction
    /// budget.
    ///
    /// Conditional jumps reach at most 255 instructions ahead. An edge that
    /// lands further away is routed through a `ja` trampoline placed right
    /// after the jump; trampolines count against the budget.
    pub fn finalize(self) -> Result<FilterProgram, NhrpError> {
        let mut placed = Vec::with_capacity(self.ops.len());
        for (i, op) in self.ops.iter().enumerate() {
            placed.push(match *op {
                Op::Stmt { code, k } => Placed::Stmt { code, k },
                Op::Jump { code, k, jt, jf } => Placed::Jump {
                    code,
                    k,
                    to: [self.target(i, jt)?, self.target(i, jf)?],
                },
            });
        }

        // Inserting a trampoline only lengthens forward jumps, so the set of
        // far edges grows monotonically and the loop terminates.
        let mut far = vec![[false; 2]; placed.len()];
        let start = loop {
            let start = layout(&far);
            let mut grown = false;
            for (i, op) in placed.iter().enumerate() {
                let Placed::Jump { to, .. } = op else {
                    continue;
                };
                for edge in 0..2 {
                    if !far[i][edge] && start[to[edge]] - start[i] - 1 > MAX_COND_JUMP {
                        far[i][edge] = true;
                        grown = true;
                    }
                }
            }
            if !grown {
                break start;
            }
        };

        let count = start[placed.len()];
        if count > self.max_insns {
            return Err(NhrpError::CapacityExceeded {
                count,
                max: self.max_insns,
            });
        }

        let mut insns = Vec::with_capacity(count);
        for (i, op) in placed.iter().enumerate() {
            match *op {
                Placed::Stmt { code, k } => insns.push(insn(code, 0, 0, k)),
                Placed::Jump { code, k, to } => {
                    let [far_t, far_f] = far[i];
                    let near = |target: usize| (start[target] - start[i] - 1) as u8;
                    let jt = if far_t { 0 } else { near(to[0]) };
                    let jf = if far_f { far_t as u8 } else { near(to[1]) };
                    insns.push(insn(code, jt, jf, k));
                    for (is_far, target) in [(far_t, to[0]), (far_f, to[1])] {
                        if is_far {
                            let off = start[target] - insns.len() - 1;
                            insns.push(insn(BPF_JMP | BPF_JA, 0, 0, off as u32));
                        }
                    }
                }
            }
        }
        Ok(FilterProgram { insns })
    }

    /// Index of the operation `label` refers to, seen from operation `from`.
    fn target(&self, from: usize, label: Label) -> Result<usize, NhrpError> {
        let to = match label.structural_offset() {
            Some(offset) => from + 1 + offset as usize,
            None => self.pos[label as usize].ok_or(NhrpError::UnresolvedLabel(label))?,
        };
        if to <= from || to > self.ops.len() {
            return Err(NhrpError::JumpOutOfRange { from, to });
        }
        Ok(to)
    }
}

/// Longest offset a conditional jump can encode.
const MAX_COND_JUMP: usize = u8::MAX as usize;

/// An operation with its jump targets resolved to operation indexes.
#[derive(Debug, Clone, Copy)]
enum Placed {
    Stmt { code: u16, k: u32 },
    Jump { code: u16, k: u32, to: [usize; 2] },
}

/// Start position of every operation, plus the total length at the end,
/// given which jump edges need a trampoline.
fn layout(far: &[[bool; 2]]) -> Vec<usize> {
    let mut start = Vec::with_capacity(far.len() + 1);
    let mut pos = 0;
    start.push(pos);
    for [far_t, far_f] in far {
        pos += 1 + *far_t as usize + *far_f as usize;
        start.push(pos);
    }
    start
}

// ---------------------------------------------------------------------------
// Resolved program
// ---------------------------------------------------------------------------

/// A fully resolved filter program, ready to be attached to a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterProgram {
    insns: Vec<sock_filter>,
}

impl FilterProgram {
    pub fn instructions(&self) -> &[sock_filter] {
        &self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }
}

/// Pseudo-assembly listing with absolute jump targets.
impl fmt::Display for FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ins) in self.insns.iter().enumerate() {
            write!(f, "[{i:3}] ")?;
            match bpf_class(ins.code) {
                BPF_LD => {
                    let size = match ins.code & 0x18 {
                        BPF_W => "ld ",
                        BPF_H => "ldh",
                        _ => "ldb",
                    };
                    match ins.k.checked_sub(SKF_AD_OFF) {
                        Some(SKF_AD_PROTOCOL) => writeln!(f, "{size} #proto")?,
                        Some(SKF_AD_PKTTYPE) => writeln!(f, "{size} #type")?,
                        Some(SKF_AD_IFINDEX) => writeln!(f, "{size} #ifidx")?,
                        _ => writeln!(f, "{size} [{}]", ins.k)?,
                    }
                }
                BPF_JMP if ins.code & 0xf0 == BPF_JA => {
                    writeln!(f, "ja   {}", i + 1 + ins.k as usize)?;
                }
                BPF_JMP => {
                    let op = match ins.code & 0xf0 {
                        BPF_JEQ => "jeq ",
                        BPF_JGT => "jgt ",
                        BPF_JGE => "jge ",
                        BPF_JSET => "jset",
                        _ => "j?  ",
                    };
                    let jt = i + 1 + ins.jt as usize;
                    let jf = i + 1 + ins.jf as usize;
                    writeln!(f, "{op} #0x{:x}  jt {jt}  jf {jf}", ins.k)?;
                }
                BPF_RET => writeln!(f, "ret  #{}", ins.k)?,
                _ => writeln!(
                    f,
                    "code=0x{:02x} jt={} jf={} k=0x{:x}",
                    ins.code, ins.jt, ins.jf, ins.k
                )?,
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
