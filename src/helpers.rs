//! Functions callable from inside programs.
//!
//! Real helpers are kernel routines reached through the call opcode; their
//! numbers are fixed by the ABI. Pseudo intrinsics never become calls, the
//! translator expands them inline.

use crate::types::Value;

/// A kernel helper: name, ABI number, arity and the positions of arguments
/// whose byte size the compiler fills in as a synthesized extra argument.
///
/// Some helpers take an array pointer followed by its size; spelling the
/// size out at every call site is noise, so the translator computes it from
/// the pointee type of the argument at `fill_size_of[i]`.
#[derive(PartialEq, Debug)]
pub struct HelperDef {
    pub name: &'static str,
    pub num: i32,
    /// Argument count before size filling; `None` means variadic.
    pub args: Option<usize>,
    pub fill_size_of: &'static [usize],
}

const fn helper(name: &'static str, num: i32, args: usize) -> HelperDef {
    HelperDef {
        name,
        num,
        args: Some(args),
        fill_size_of: &[],
    }
}

pub static MAP_LOOKUP_ELEM: HelperDef = helper("map_lookup_elem", 1, 2);
pub static MAP_UPDATE_ELEM: HelperDef = helper("map_update_elem", 2, 4);
pub static MAP_DELETE_ELEM: HelperDef = helper("map_delete_elem", 3, 2);
pub static PROBE_READ: HelperDef = HelperDef {
    name: "probe_read",
    num: 4,
    args: Some(2),
    fill_size_of: &[0],
};
pub static KTIME_GET_NS: HelperDef = helper("ktime_get_ns", 5, 0);
pub static TRACE_PRINTK: HelperDef = HelperDef {
    name: "trace_printk",
    num: 6,
    args: None,
    fill_size_of: &[0],
};
pub static GET_SMP_PROCESSOR_ID: HelperDef = helper("get_smp_processor_id", 8, 0);
pub static GET_CURRENT_PID_TGID: HelperDef = helper("get_current_pid_tgid", 14, 0);
pub static GET_CURRENT_UID_GID: HelperDef = helper("get_current_uid_gid", 15, 0);
pub static GET_CURRENT_COMM: HelperDef = HelperDef {
    name: "get_current_comm",
    num: 16,
    args: Some(1),
    fill_size_of: &[0],
};
pub static PERF_EVENT_OUTPUT: HelperDef = HelperDef {
    name: "perf_event_output",
    num: 25,
    args: Some(4),
    fill_size_of: &[3],
};
pub static SKB_LOAD_BYTES: HelperDef = helper("skb_load_bytes", 26, 4);
pub static GET_STACKID: HelperDef = helper("get_stackid", 27, 3);

pub static HELPERS: [&HelperDef; 13] = [
    &MAP_LOOKUP_ELEM,
    &MAP_UPDATE_ELEM,
    &MAP_DELETE_ELEM,
    &PROBE_READ,
    &KTIME_GET_NS,
    &TRACE_PRINTK,
    &GET_SMP_PROCESSOR_ID,
    &GET_CURRENT_PID_TGID,
    &GET_CURRENT_UID_GID,
    &GET_CURRENT_COMM,
    &PERF_EVENT_OUTPUT,
    &SKB_LOAD_BYTES,
    &GET_STACKID,
];

/// Intrinsics expanded inline by the translator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Pseudo {
    /// `addrof(x)`: address of a stack- or argument-resident value.
    Addrof,
    /// `memcpy(dst, src, n)`: n constant, expands to byte moves.
    Memcpy,
    /// `ptr(x)`: reinterpret a value as a pointer, no code beyond a move.
    Ptr,
    /// `deref(p)`: load through a pointer.
    Deref,
    /// `packet_copy(ctx, off, dst, n)`: bounds-checked raw packet copy.
    PacketCopy,
    LoadSkbByte,
    LoadSkbShort,
    LoadSkbWord,
    /// `mem_eq(pattern, buf)`: compare a constant byte array to a buffer.
    MemEq,
}

impl Pseudo {
    pub fn name(self) -> &'static str {
        match self {
            Pseudo::Addrof => "addrof",
            Pseudo::Memcpy => "memcpy",
            Pseudo::Ptr => "ptr",
            Pseudo::Deref => "deref",
            Pseudo::PacketCopy => "packet_copy",
            Pseudo::LoadSkbByte => "load_skb_byte",
            Pseudo::LoadSkbShort => "load_skb_short",
            Pseudo::LoadSkbWord => "load_skb_word",
            Pseudo::MemEq => "mem_eq",
        }
    }

    pub fn args(self) -> usize {
        match self {
            Pseudo::Addrof | Pseudo::Ptr | Pseudo::Deref => 1,
            Pseudo::Memcpy => 3,
            Pseudo::PacketCopy => 4,
            Pseudo::LoadSkbByte | Pseudo::LoadSkbShort | Pseudo::LoadSkbWord => 2,
            Pseudo::MemEq => 2,
        }
    }
}

static PSEUDOS: [Pseudo; 9] = [
    Pseudo::Addrof,
    Pseudo::Memcpy,
    Pseudo::Ptr,
    Pseudo::Deref,
    Pseudo::PacketCopy,
    Pseudo::LoadSkbByte,
    Pseudo::LoadSkbShort,
    Pseudo::LoadSkbWord,
    Pseudo::MemEq,
];

/// Builtin bindings consulted when a global name has no binding in the
/// program's own environment.
pub fn builtin(name: &str) -> Option<Value> {
    if let Some(h) = HELPERS.iter().find(|h| h.name == name) {
        return Some(Value::Helper(*h));
    }
    PSEUDOS
        .iter()
        .find(|p| p.name() == name)
        .map(|p| Value::Pseudo(*p))
}
