//! Symbolic eBPF instructions and their packed encoding.
//!
//! [`Instr`](enum.Instr.html) is the form the translator emits: operands are
//! typed, jumps name [`Label`](enum.Label.html)s instead of offsets, and
//! 64-bit immediate loads are still single entries. [`link`](fn.link.html)
//! flattens a stream of `Instr` into packed [`Insn`](struct.Insn.html)
//! records: labels vanish, double-word loads expand into two records, and
//! every jump gets its relative offset resolved.
//!
//! Record layout (little endian):
//!
//! | byte 0 | byte 1 (lo/hi nibble) | bytes 2-3 | bytes 4-7 |
//! |--------|-----------------------|-----------|-----------|
//! | opcode | dst / src register    | offset    | immediate |

use crate::opcode::*;
use byteorder::ByteOrder;
use num_derive::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use std::fmt;

type Endian = byteorder::LittleEndian;

/// The eBPF register file. R0 holds return values, R1-R5 pass helper
/// arguments, R6-R9 are callee saved and R10 is the read-only frame pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive, ToPrimitive)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
}

impl Reg {
    /// The frame pointer alias.
    pub const FP: Reg = Reg::R10;

    fn num(self) -> u8 {
        self as u8
    }
}

/// Access width of a load or store.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Size {
    Byte,
    Short,
    Word,
    Quad,
}

impl Size {
    pub fn bits(self) -> u8 {
        match self {
            Size::Byte => BPF_B,
            Size::Short => BPF_H,
            Size::Word => BPF_W,
            Size::Quad => BPF_DW,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            Size::Byte => 1,
            Size::Short => 2,
            Size::Word => 4,
            Size::Quad => 8,
        }
    }

    pub fn from_bytes(n: u32) -> Option<Size> {
        match n {
            1 => Some(Size::Byte),
            2 => Some(Size::Short),
            4 => Some(Size::Word),
            8 => Some(Size::Quad),
            _ => None,
        }
    }
}

/// A memory operand: `size`-wide access at `reg + off`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Mem {
    pub reg: Reg,
    pub off: i16,
    pub size: Size,
}

impl Mem {
    pub fn new(reg: Reg, off: i16, size: Size) -> Mem {
        Mem { reg, off, size }
    }
}

/// Register-or-immediate operand for ALU and conditional jump instructions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegImm {
    Reg(Reg),
    Imm(i32),
}

/// 64-bit ALU operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Lsh,
    Rsh,
}

impl AluOp {
    fn bits(self) -> u8 {
        match self {
            AluOp::Add => BPF_ADD,
            AluOp::Sub => BPF_SUB,
            AluOp::Mul => BPF_MUL,
            AluOp::Div => BPF_DIV,
            AluOp::Mod => BPF_MOD,
            AluOp::And => BPF_AND,
            AluOp::Or => BPF_OR,
            AluOp::Xor => BPF_XOR,
            AluOp::Lsh => BPF_LSH,
            AluOp::Rsh => BPF_RSH,
        }
    }
}

/// Unsigned conditions for conditional jumps.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JmpCond {
    Eq,
    Ne,
    Gt,
    Ge,
}

impl JmpCond {
    fn bits(self) -> u8 {
        match self {
            JmpCond::Eq => BPF_JEQ,
            JmpCond::Ne => BPF_JNE,
            JmpCond::Gt => BPF_JGT,
            JmpCond::Ge => BPF_JGE,
        }
    }
}

/// A branch target. `Target` labels mark translated bytecode offsets,
/// `Scratch` labels are generated inside instruction templates and are
/// unique per emission.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Label {
    Target(u32),
    Scratch(u32),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Label::Target(off) => write!(f, "L{}", off),
            Label::Scratch(n) => write!(f, "t{}", n),
        }
    }
}

/// A symbolic instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Instr {
    /// `dst = src`
    MovReg { src: Reg, dst: Reg },
    /// `dst = imm` (sign extended)
    MovImm { imm: i32, dst: Reg },
    /// `dst = imm` as a full 64-bit constant; occupies two records.
    MovImm64 { imm: u64, dst: Reg },
    /// Map-fd relocation: a double-word immediate load whose src nibble is
    /// `BPF_PSEUDO_MAP_FD`, telling the kernel to substitute the map address.
    MovMapFd { fd: i32, dst: Reg },
    /// `dst = *(size *)(src.reg + src.off)`
    Load { src: Mem, dst: Reg },
    /// `*(size *)(dst.reg + dst.off) = src`
    Store { src: Reg, dst: Mem },
    /// `*(size *)(dst.reg + dst.off) = imm`
    StoreImm { imm: i32, dst: Mem },
    /// `dst = dst op src`, 64-bit
    Alu { op: AluOp, src: RegImm, dst: Reg },
    /// `dst = -dst`
    Neg { dst: Reg },
    /// `if lhs cond rhs goto target`
    JumpIf {
        cond: JmpCond,
        lhs: Reg,
        rhs: RegImm,
        target: Label,
    },
    /// `goto target`
    Jump { target: Label },
    /// Call the numbered kernel helper; clobbers R1-R5, returns in R0.
    Call { func: i32 },
    Exit,
    /// Legacy absolute packet load: `R0 = *(size *)(skb->data + off)`,
    /// implicitly using the socket buffer held by the runtime.
    LoadSkbAbs { off: i32, size: Size },
    /// Indirect packet load: `R0 = *(size *)(skb->data + off_reg)`.
    LoadSkbInd { off_reg: Reg, size: Size },
    /// Branch target marker; occupies no record.
    Label(Label),
}

impl Instr {
    /// Number of 8-byte records this instruction occupies once linked.
    pub fn slots(&self) -> usize {
        match self {
            Instr::Label(_) => 0,
            Instr::MovImm64 { .. } | Instr::MovMapFd { .. } => 2,
            _ => 1,
        }
    }
}

/// One packed instruction record.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Insn {
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
}

impl Insn {
    pub const BYTES: usize = 8;

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.code;
        buf[1] = (self.dst & 0x0f) | (self.src << 4);
        Endian::write_i16(&mut buf[2..4], self.off);
        Endian::write_i32(&mut buf[4..8], self.imm);
    }

    /// Instruction class, the low three opcode bits.
    pub fn class(&self) -> u8 {
        self.code & 0x07
    }
}

/// Errors from resolving labels in [`link`](fn.link.html).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("redefinition of label {0}")]
    DuplicateLabel(Label),
    #[error("jump to undefined label {0}")]
    UndefinedLabel(Label),
    #[error("illegal jump back from instruction {from} to label {label}")]
    BackwardJump { from: usize, label: Label },
}

fn reg_imm(src: RegImm) -> (u8, u8, i32) {
    match src {
        RegImm::Reg(r) => (BPF_X, r.num(), 0),
        RegImm::Imm(v) => (BPF_K, 0, v),
    }
}

/// Resolve labels and serialize a symbolic instruction stream into packed
/// records. Labels occupy no slot; double-word loads occupy two. Every jump
/// must land strictly forward of itself.
pub fn link(prog: &[Instr]) -> Result<Vec<Insn>, LinkError> {
    let mut slots: HashMap<Label, usize> = HashMap::new();
    let mut len = 0usize;
    for ins in prog {
        if let Instr::Label(l) = ins {
            if slots.insert(*l, len).is_some() {
                return Err(LinkError::DuplicateLabel(*l));
            }
        } else {
            len += ins.slots();
        }
    }

    let resolve = |label: Label, from: usize| -> Result<i16, LinkError> {
        let target = *slots
            .get(&label)
            .ok_or_else(|| LinkError::UndefinedLabel(label))?;
        if target <= from {
            return Err(LinkError::BackwardJump { from, label });
        }
        Ok((target - from - 1) as i16)
    };

    let mut out = Vec::with_capacity(len);
    for ins in prog {
        let idx = out.len();
        match *ins {
            Instr::Label(_) => {}
            Instr::MovReg { src, dst } => out.push(Insn {
                code: BPF_ALU64 | BPF_MOV | BPF_X,
                src: src.num(),
                dst: dst.num(),
                ..Insn::default()
            }),
            Instr::MovImm { imm, dst } => out.push(Insn {
                code: BPF_ALU64 | BPF_MOV | BPF_K,
                dst: dst.num(),
                imm,
                ..Insn::default()
            }),
            Instr::MovImm64 { imm, dst } => {
                out.push(Insn {
                    code: BPF_LD | BPF_IMM | BPF_DW,
                    dst: dst.num(),
                    imm: imm as u32 as i32,
                    ..Insn::default()
                });
                out.push(Insn {
                    imm: (imm >> 32) as u32 as i32,
                    ..Insn::default()
                });
            }
            Instr::MovMapFd { fd, dst } => {
                out.push(Insn {
                    code: BPF_LD | BPF_IMM | BPF_DW,
                    src: BPF_PSEUDO_MAP_FD,
                    dst: dst.num(),
                    imm: fd,
                    ..Insn::default()
                });
                out.push(Insn::default());
            }
            Instr::Load { src, dst } => out.push(Insn {
                code: BPF_LDX | BPF_MEM | src.size.bits(),
                src: src.reg.num(),
                dst: dst.num(),
                off: src.off,
                ..Insn::default()
            }),
            Instr::Store { src, dst } => out.push(Insn {
                code: BPF_STX | BPF_MEM | dst.size.bits(),
                src: src.num(),
                dst: dst.reg.num(),
                off: dst.off,
                ..Insn::default()
            }),
            Instr::StoreImm { imm, dst } => out.push(Insn {
                code: BPF_ST | BPF_MEM | dst.size.bits(),
                dst: dst.reg.num(),
                off: dst.off,
                imm,
                ..Insn::default()
            }),
            Instr::Alu { op, src, dst } => {
                let (k, src_reg, imm) = reg_imm(src);
                out.push(Insn {
                    code: BPF_ALU64 | op.bits() | k,
                    src: src_reg,
                    dst: dst.num(),
                    imm,
                    ..Insn::default()
                });
            }
            Instr::Neg { dst } => out.push(Insn {
                code: BPF_ALU64 | BPF_NEG | BPF_K,
                dst: dst.num(),
                ..Insn::default()
            }),
            Instr::JumpIf {
                cond,
                lhs,
                rhs,
                target,
            } => {
                let (k, src_reg, imm) = reg_imm(rhs);
                out.push(Insn {
                    code: BPF_JMP | cond.bits() | k,
                    src: src_reg,
                    dst: lhs.num(),
                    off: resolve(target, idx)?,
                    imm,
                });
            }
            Instr::Jump { target } => out.push(Insn {
                code: BPF_JMP | BPF_JA,
                off: resolve(target, idx)?,
                ..Insn::default()
            }),
            Instr::Call { func } => out.push(Insn {
                code: BPF_JMP | BPF_CALL,
                imm: func,
                ..Insn::default()
            }),
            Instr::Exit => out.push(Insn {
                code: BPF_JMP | BPF_EXIT,
                ..Insn::default()
            }),
            Instr::LoadSkbAbs { off, size } => {
                debug_assert!(size != Size::Quad, "packet loads are at most a word");
                out.push(Insn {
                    code: BPF_LD | BPF_ABS | size.bits(),
                    imm: off,
                    ..Insn::default()
                });
            }
            Instr::LoadSkbInd { off_reg, size } => {
                debug_assert!(size != Size::Quad, "packet loads are at most a word");
                out.push(Insn {
                    code: BPF_LD | BPF_IND | size.bits(),
                    src: off_reg.num(),
                    ..Insn::default()
                });
            }
        }
    }

    Ok(out)
}
