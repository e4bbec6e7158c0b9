//! Stack slot allocation.
//!
//! A simple bump allocator growing down from the frame pointer. Every slot
//! is aligned to its type's natural alignment and nothing is ever reused;
//! paying a few bytes of frame beats tracking variable lifetimes.

use crate::vars::{Ir, VarRef};
use ebpf::Ty;
use std::collections::HashMap;
use std::fmt;

/// A spill slot at a negative offset from the frame pointer.
#[derive(Clone, Debug, PartialEq)]
pub struct StackVar {
    pub ty: Ty,
    pub offset: i32,
}

impl fmt::Display for StackVar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StackVar<{}>({})", self.ty, self.offset)
    }
}

/// The bump allocator. The frame limit is the verifier's business; we just
/// hand out offsets.
#[derive(Debug, Default)]
pub struct Stack {
    neg_off: u32,
}

impl Stack {
    pub fn new() -> Stack {
        Stack::default()
    }

    pub fn alloc(&mut self, ty: &Ty) -> StackVar {
        // File-descriptor datastructures occupy a pointer-sized slot.
        let (size, align) = match ty {
            Ty::Map(_) => (8, 8),
            other => (other.size(), other.align()),
        };
        self.neg_off += size;
        self.neg_off += align - 1;
        self.neg_off &= !(align - 1);
        StackVar {
            ty: ty.clone(),
            offset: -(self.neg_off as i32),
        }
    }

    pub fn frame_size(&self) -> u32 {
        self.neg_off
    }
}

/// Give every symbolic variable and every named local a slot. First
/// encounter allocates; later references share the slot.
pub fn place(vis: Vec<Ir>) -> (Vec<Ir>, Stack) {
    let mut stack = Stack::new();
    let mut slots: HashMap<u32, StackVar> = HashMap::new();
    let mut fast_slots: HashMap<String, StackVar> = HashMap::new();

    let mut place_one = |v: &mut VarRef, stack: &mut Stack| match v {
        VarRef::Sym(var, ty) => {
            let ty = ty.as_ref().expect("untyped variable at placement");
            let slot = slots
                .entry(var.num)
                .or_insert_with(|| stack.alloc(ty))
                .clone();
            *v = VarRef::Stack(slot);
        }
        VarRef::Fast(fast) => {
            let slot = fast_slots
                .entry(fast.name.clone())
                .or_insert_with(|| stack.alloc(&fast.ty))
                .clone();
            *v = VarRef::Stack(slot);
        }
        _ => {}
    };

    let vis = vis
        .into_iter()
        .map(|mut i| {
            for dv in i.dsts.iter_mut() {
                place_one(dv, &mut stack);
            }
            for sv in i.srcs.iter_mut() {
                place_one(sv, &mut stack);
            }
            i
        })
        .collect();
    (vis, stack)
}
