//! One program per supported opcode; each must make it through the whole
//! pipeline and end in an exit.

use super::*;
use crate::bytecode::{CmpOp, Opcode};

fn compiles(code: &Code) {
    let p = sf(code);
    assert_eq!(p.insns.last().unwrap().code, EXIT);
    assert_forward_jumps(&p);
}

#[test]
fn return_constant() {
    let mut b = builder();
    b.load_int(0).return_value();
    compiles(&b.finish());
}

#[test]
fn return_field() {
    let mut b = builder();
    b.load_fast("ctx").load_attr("len").return_value();
    compiles(&b.finish());
}

#[test]
fn local_variable_round_trip() {
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .store_fast("l")
        .load_fast("l")
        .return_value();
    compiles(&b.finish());
}

fn binary(op: Opcode) {
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .load_fast("ctx")
        .load_attr("protocol")
        .op(op, 0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn add() {
    binary(Opcode::BinaryAdd);
}

#[test]
fn subtract() {
    binary(Opcode::BinarySubtract);
}

#[test]
fn multiply() {
    binary(Opcode::BinaryMultiply);
}

#[test]
fn true_divide() {
    binary(Opcode::BinaryTrueDivide);
}

#[test]
fn floor_divide() {
    binary(Opcode::BinaryFloorDivide);
}

#[test]
fn modulo() {
    binary(Opcode::BinaryModulo);
}

#[test]
fn bit_and() {
    binary(Opcode::BinaryAnd);
}

#[test]
fn bit_or() {
    binary(Opcode::BinaryOr);
}

#[test]
fn bit_xor() {
    binary(Opcode::BinaryXor);
}

#[test]
fn lshift() {
    binary(Opcode::BinaryLshift);
}

#[test]
fn rshift() {
    binary(Opcode::BinaryRshift);
}

#[test]
fn negate() {
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .op(Opcode::UnaryNegative, 0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn inplace_add_through_local() {
    // The arithmetic keeps x a plain integer on both stores; a bare
    // `x = ctx.len` would pin x to the field's 32-bit type instead.
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .load_int(0)
        .op(Opcode::BinaryAdd, 0)
        .store_fast("x")
        .load_fast("x")
        .load_int(1)
        .op(Opcode::InplaceAdd, 0)
        .store_fast("x")
        .load_fast("x")
        .return_value();
    compiles(&b.finish());
}

fn comparison(op: CmpOp) {
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .load_int(64)
        .compare(op)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn compare_all_operators() {
    comparison(CmpOp::Lt);
    comparison(CmpOp::Le);
    comparison(CmpOp::Eq);
    comparison(CmpOp::Ne);
    comparison(CmpOp::Gt);
    comparison(CmpOp::Ge);
}

#[test]
fn dup_top() {
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .op(Opcode::DupTop, 0)
        .op(Opcode::BinaryAdd, 0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn dup_top_two() {
    let mut b = builder();
    b.load_int(2)
        .load_int(3)
        .op(Opcode::DupTopTwo, 0)
        .op(Opcode::BinaryAdd, 0)
        .op(Opcode::BinaryAdd, 0)
        .op(Opcode::BinaryAdd, 0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn rot_two() {
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .load_int(1)
        .op(Opcode::RotTwo, 0)
        .op(Opcode::BinarySubtract, 0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn rot_three() {
    let mut b = builder();
    b.load_fast("ctx")
        .load_attr("len")
        .load_fast("ctx")
        .load_attr("protocol")
        .load_fast("ctx")
        .load_attr("mark")
        .op(Opcode::RotThree, 0)
        .op(Opcode::BinarySubtract, 0)
        .op(Opcode::BinarySubtract, 0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn pop_top() {
    let mut b = builder();
    b.load_int(9)
        .load_fast("ctx")
        .load_attr("len")
        .op(Opcode::PopTop, 0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn conditional_branch() {
    let mut b = builder();
    let other = b.label();
    b.load_fast("ctx")
        .load_attr("len")
        .load_int(64)
        .compare(CmpOp::Gt)
        .pop_jump_if_false(other)
        .load_int(1)
        .return_value()
        .bind(other)
        .load_int(0)
        .return_value();
    compiles(&b.finish());
}

#[test]
fn classifier_and_kprobe_share_the_pipeline() {
    let mut b = builder();
    b.load_int(0).return_value();
    let code = b.finish();
    assert!(compile_classifier(&code).is_ok());
    assert!(compile_kprobe(&code).is_ok());

    let mut b = builder();
    b.load_fast("ctx").load_attr("rdi").return_value();
    assert!(compile_kprobe(&b.finish()).is_ok());
}

#[test]
fn captured_cell_pins_like_a_global() {
    let mut b = builder();
    b.cell("limit", Value::Int(9000));
    b.load_deref(0).return_value();
    compiles(&b.finish());
}
