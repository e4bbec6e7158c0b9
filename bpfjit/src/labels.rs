//! Explicit branch targets, inserted just before emission.
//!
//! Earlier passes key jumps on bytecode offsets; the emitter wants a
//! marker item at every offset that is jumped to. A min-heap keeps the
//! pending targets sorted as we walk forward; consecutive duplicates
//! collapse into one marker.

use crate::bytecode::ArgVal;
use crate::vars::Ir;
use matches::debug_assert_matches;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// An instruction stream item once branch targets are explicit.
#[derive(Clone, Debug, PartialEq)]
pub enum Labeled {
    /// A branch target at the given bytecode offset. Occupies no code.
    Mark(u32),
    Ir(Ir),
}

pub fn insert(vis: Vec<Ir>) -> Vec<Labeled> {
    let mut ret = Vec::with_capacity(vis.len());
    let mut pending: BinaryHeap<Reverse<u32>> = BinaryHeap::new();

    for i in vis {
        let mut last = None;
        while let Some(&Reverse(off)) = pending.peek() {
            if off > i.offset {
                break;
            }
            if last != Some(off) {
                ret.push(Labeled::Mark(off));
                last = Some(off);
            }
            pending.pop();
        }

        if i.op.is_jump() {
            debug_assert_matches!(i.argval, ArgVal::Target(_));
            if let ArgVal::Target(target) = i.argval {
                pending.push(Reverse(target));
            }
        }
        ret.push(Labeled::Ir(i));
    }

    // Targets at the very end of the stream (nothing follows a return on
    // any path, but keep the linker honest).
    let mut last = None;
    while let Some(Reverse(off)) = pending.pop() {
        if last != Some(off) {
            ret.push(Labeled::Mark(off));
            last = Some(off);
        }
    }
    ret
}
