//! Stack discipline: negative, aligned, bump-allocated slots.

use super::*;
use crate::stack::Stack;
use crate::vars::{Ir, VarRef};

fn placed(code: &Code) -> (Vec<Ir>, Stack) {
    let arg_tys = [Ty::Struct(ebpf::sk_buff())];
    let insns = bytecode::decode(code).unwrap();
    let vis = vars::fill_lines(vars::assign(&insns).unwrap());
    let vis = fold::pin_globals(code, vis).unwrap();
    let vis = fold::fold_consts(vis).unwrap();
    let vis = fold::reinterpret_strings(vis);
    let vis = fold::prune_unread(vis);
    let vis = infer::dst_types(vis, &arg_tys).unwrap();
    let vis = infer::src_types(vis);
    let vis = mem::replace_arg_loads(vis, &arg_tys).unwrap();
    let vis = mem::widen_ints(vis);
    let vis = mem::inline_consts(vis);
    let vis = mem::insert_fast_vars(vis);
    let vis = mem::forward_fast_loads(vis);
    let vis = mem::forward_fast_stores(vis).unwrap();
    stack::place(vis)
}

fn slots(vis: &[Ir]) -> Vec<(i32, u32)> {
    let mut out = Vec::new();
    for i in vis {
        for v in i.dsts.iter().chain(i.srcs.iter()) {
            if let VarRef::Stack(sv) = v {
                out.push((sv.offset, sv.ty.align()));
            }
        }
    }
    out
}

#[test]
fn slots_are_negative_aligned_and_inside_the_frame() {
    let mut b = builder();
    b.load_const(Value::Str("ab".to_string())).store_fast("s");
    b.load_fast("ctx").load_attr("len").store_fast("x");
    b.load_int(5).store_fast("y");
    b.load_fast("y").return_value();
    let (vis, stack) = placed(&b.finish());

    let frame = stack.frame_size() as i32;
    assert!(frame > 0);
    for (offset, align) in slots(&vis) {
        assert!(offset < 0, "slot offset {} must be negative", offset);
        assert!(offset >= -frame, "slot {} outside frame {}", offset, frame);
        assert_eq!(
            offset.rem_euclid(align as i32),
            0,
            "slot {} misaligned for {}",
            offset,
            align
        );
    }
}

#[test]
fn frame_is_the_sum_of_aligned_allocations() {
    let mut b = builder();
    b.load_const(Value::Str("ab".to_string())).store_fast("s");
    b.load_fast("ctx").load_attr("len").store_fast("x");
    b.load_int(5).store_fast("y");
    b.load_fast("y").return_value();
    let (vis, stack) = placed(&b.finish());

    // s: 3 bytes at -3; x: word aligned up to -8; y: quad at -16.
    assert_eq!(stack.frame_size(), 16);
    let slots = slots(&vis);
    assert!(slots.contains(&(-3, 1)));
    assert!(slots.iter().any(|(off, _)| *off == -8));
    assert!(slots.iter().any(|(off, _)| *off == -16));
}

#[test]
fn shared_locals_share_one_slot() {
    let mut b = builder();
    b.load_int(1).store_fast("x");
    b.load_fast("x").load_int(2).op(crate::bytecode::Opcode::BinaryAdd, 0).store_fast("y");
    b.load_fast("x").load_fast("y").op(crate::bytecode::Opcode::BinaryAdd, 0).return_value();
    let (vis, _stack) = placed(&b.finish());

    let mut x_offsets: Vec<i32> = Vec::new();
    for i in &vis {
        for v in i.dsts.iter().chain(i.srcs.iter()) {
            if let VarRef::Stack(sv) = v {
                x_offsets.push(sv.offset);
            }
        }
    }
    x_offsets.sort();
    x_offsets.dedup();
    // x and y plus the arithmetic temporary: never more than three slots.
    assert!(x_offsets.len() <= 3, "got slots {:?}", x_offsets);
}

#[test]
fn map_handles_occupy_pointer_sized_slots() {
    let mut stack = Stack::new();
    let def = match u64_hash(1) {
        Value::Map(h) => h.def,
        _ => unreachable!(),
    };
    let slot = stack.alloc(&Ty::Map(def));
    assert_eq!(slot.offset, -8);
    assert_eq!(stack.frame_size(), 8);
}
