//! Translates a restricted subset of stack bytecode into eBPF programs.
//!
//! The input is a [`Code`](bytecode/struct.Code.html) object: one compiled
//! function of a stack-based virtual machine, together with its constant
//! pool and defining environment. The output is an
//! [`ebpf::Program`](../ebpf/prog/struct.Program.html) with resolved jump
//! offsets and map-fd relocations, ready for the kernel load call.
//!
//! Translation is a straight line of pure passes:
//!
//! 1. decode and validate the opcode stream;
//! 2. trace all forward execution paths and replace the operand stack with
//!    explicit variables ([`vars`]);
//! 3. pin globals, fold constants, reinterpret strings, prune dead
//!    constants ([`fold`]);
//! 4. infer and check types ([`infer`]);
//! 5. classify variables into argument/local/constant/slot and allocate
//!    the frame ([`mem`], [`stack`]);
//! 6. insert branch-target labels ([`labels`]) and expand each instruction
//!    through its template ([`emit`]);
//! 7. link labels into relative offsets (`ebpf::link`).
//!
//! Everything is deterministic: compiling the same `Code` twice yields
//! byte-identical programs. Nothing here performs I/O; loading is the
//! embedder's job through [`ebpf::ProgLoader`](../ebpf/prog/trait.ProgLoader.html).
//!
//! Programs take exactly one argument, the kernel-supplied context; its
//! schema depends on the program type (packet metadata for socket filters
//! and classifiers, a register snapshot for kprobes).

pub mod bytecode;
pub mod emit;
pub mod error;
pub mod fold;
pub mod infer;
pub mod labels;
pub mod mem;
pub mod stack;
pub mod trace;
pub mod vars;

#[cfg(test)]
mod test;

use ebpf::{ProgType, Program, StructDef, Ty};
use std::rc::Rc;
use tracing::trace;

pub use bytecode::{Code, CodeBuilder};
pub use error::{Error, Result};

fn dump(vis: &[vars::Ir]) -> String {
    vis.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compile one function against an explicit context schema.
pub fn compile(code: &Code, ctx: Rc<StructDef>, prog_type: ProgType) -> Result<Program> {
    let arg_tys = [Ty::Struct(ctx)];

    let insns = bytecode::decode(code)?;
    trace!("decoded {} instructions", insns.len());

    let vis = vars::assign(&insns)?;
    let vis = vars::fill_lines(vis);
    trace!("assigned vars:\n{}", dump(&vis));

    let vis = fold::pin_globals(code, vis)?;
    let vis = fold::fold_consts(vis)?;
    let vis = fold::reinterpret_strings(vis);
    let vis = fold::prune_unread(vis);
    trace!("folded constants:\n{}", dump(&vis));

    let vis = infer::dst_types(vis, &arg_tys)?;
    let vis = infer::src_types(vis);
    trace!("inferred types:\n{}", dump(&vis));

    let vis = mem::replace_arg_loads(vis, &arg_tys)?;
    let vis = mem::widen_ints(vis);
    let vis = mem::inline_consts(vis);
    let vis = mem::insert_fast_vars(vis);
    let vis = mem::forward_fast_loads(vis);
    let vis = mem::forward_fast_stores(vis)?;
    let (vis, stack) = stack::place(vis);
    trace!("placed memory ({} byte frame):\n{}", stack.frame_size(), dump(&vis));

    let items = labels::insert(vis);
    let (instrs, _stack) = emit::emit(&items, stack)?;
    trace!("emitted {} template instructions", instrs.len());

    let linked = ebpf::link(&instrs)?;
    Ok(Program::new(prog_type, linked))
}

/// Compile a socket filter: context is the packet metadata aggregate.
pub fn compile_socket_filter(code: &Code) -> Result<Program> {
    compile(code, ebpf::sk_buff(), ProgType::SocketFilter)
}

/// Compile a traffic-control classifier; same context as a socket filter.
pub fn compile_classifier(code: &Code) -> Result<Program> {
    compile(code, ebpf::sk_buff(), ProgType::SchedCls)
}

/// Compile a kprobe program: context is the CPU register snapshot.
pub fn compile_kprobe(code: &Code) -> Result<Program> {
    compile(code, ebpf::pt_regs(), ProgType::Kprobe)
}
