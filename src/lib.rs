//! Machine layer for the bpf workspace.
//!
//! This crate knows what the kernel knows: the eBPF register file, the packed
//! 8-byte instruction record and its symbolic form, label linking, the kernel
//! helper table, the compile-time type and value system shared with the
//! translator, the context structs handed to programs, and the program image
//! that goes into the load call. It performs no syscalls; attaching programs
//! and creating maps is the business of whatever embeds this workspace.
//!
//! The [`bpfjit`](../bpfjit/index.html) crate builds on top of this one and
//! turns stack bytecode into [`Program`](prog/struct.Program.html)s.

pub mod context;
pub mod helpers;
pub mod insn;
pub mod maps;
pub mod opcode;
pub mod prog;
pub mod types;

#[cfg(test)]
mod test;

pub use context::{pt_regs, sk_buff, ProgType};
pub use helpers::{HelperDef, Pseudo};
pub use insn::{link, Insn, Instr, JmpCond, Label, LinkError, Mem, Reg, RegImm, Size};
pub use maps::{MapDef, MapHandle, MapKind};
pub use prog::{KernelVersion, LoadError, LoadRequest, ProgLoader, Program};
pub use types::{ArrayTy, ArrayVal, Field, HostFn, Scalar, StructDef, StructVal, Ty, Value};
