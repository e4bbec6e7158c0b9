//! Program types and the context aggregates the kernel passes them.

use crate::types::{Scalar, StructDef, Ty};
use num_derive::{FromPrimitive, ToPrimitive};
use std::rc::Rc;

/// Program type tags for the load call.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive, ToPrimitive)]
pub enum ProgType {
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
}

fn word() -> Ty {
    Ty::Scalar(Scalar::Word)
}

fn quad() -> Ty {
    Ty::Scalar(Scalar::Quad)
}

/// The `__sk_buff` view seen by socket filters and classifiers.
///
/// `data` and `data_end` are declared 32-bit by the ABI but the verifier
/// treats loads of them as 64-bit packet pointers, hence the overrides.
pub fn sk_buff() -> Rc<StructDef> {
    Rc::new(
        StructDef::layout(
            "sk_buff",
            vec![
                ("len", word()),
                ("pkt_type", word()),
                ("mark", word()),
                ("queue_mapping", word()),
                ("protocol", word()),
                ("vlan_present", word()),
                ("vlan_tci", word()),
                ("vlan_proto", word()),
                ("priority", word()),
                ("ingress_ifindex", word()),
                ("ifindex", word()),
                ("tc_index", word()),
                ("cb", Ty::array_of(word(), 5)),
                ("hash", word()),
                ("tc_classid", word()),
                ("data", word()),
                ("data_end", word()),
            ],
        )
        .with_overrides(&[("data", Scalar::Quad), ("data_end", Scalar::Quad)]),
    )
}

/// The x86-64 register snapshot a kprobe program receives, in kernel ABI
/// order.
pub fn pt_regs() -> Rc<StructDef> {
    Rc::new(StructDef::layout(
        "pt_regs",
        vec![
            ("r15", quad()),
            ("r14", quad()),
            ("r13", quad()),
            ("r12", quad()),
            ("rbp", quad()),
            ("rbx", quad()),
            ("r11", quad()),
            ("r10", quad()),
            ("r9", quad()),
            ("r8", quad()),
            ("rax", quad()),
            ("rcx", quad()),
            ("rdx", quad()),
            ("rsi", quad()),
            ("rdi", quad()),
            ("orig_rax", quad()),
            ("rip", quad()),
            ("cs", quad()),
            ("eflags", quad()),
            ("rsp", quad()),
            ("ss", quad()),
        ],
    ))
}
