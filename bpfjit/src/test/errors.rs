//! One minimal program per error kind.

use super::*;
use crate::bytecode::Opcode;
use matches::assert_matches;

#[test]
fn unsupported_opcodes_are_reported_together() {
    let mut b = builder();
    b.op(Opcode::GetIter, 0)
        .op(Opcode::ForIter, 0)
        .raw(200, 0)
        .load_int(0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    match err {
        Error::UnsupportedOpcode { names } => {
            assert!(names.contains(&"ForIter".to_string()));
            assert!(names.contains(&"GetIter".to_string()));
            assert!(names.contains(&"opcode 200".to_string()));
        }
        other => panic!("expected UnsupportedOpcode, got {}", other),
    }
}

#[test]
fn type_conflict_names_both_lines() {
    let mut b = builder();
    b.line(3).load_int(1).store_fast("x");
    b.line(7)
        .load_fast("ctx")
        .store_fast("x")
        .load_int(0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(
        err,
        Error::TypeConflict {
            line: 7,
            old_line: 3,
            ..
        }
    );
}

#[test]
fn backward_jump_is_rejected() {
    let mut b = builder();
    b.load_int(1)
        .op(Opcode::PopJumpIfFalse, 0)
        .load_int(0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(err, Error::BackwardJump { from: 1, to: 0, .. });
}

#[test]
fn runtime_array_index_is_rejected() {
    let mut b = builder();
    b.load_const(Value::Bytes(vec![1, 2, 3, 0])).store_fast("x");
    b.load_fast("x")
        .load_fast("ctx")
        .load_attr("len")
        .op(Opcode::BinarySubscr, 0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(
        err,
        Error::NonConstantRequired {
            what: "array index",
            ..
        }
    );
}

#[test]
fn runtime_memcpy_size_is_rejected() {
    let mut b = builder();
    b.load_const(Value::Bytes(vec![0; 4])).store_fast("buf");
    b.load_global("memcpy")
        .load_global("addrof")
        .load_fast("buf")
        .call(1, 0)
        .load_global("addrof")
        .load_fast("buf")
        .call(1, 0)
        .load_fast("ctx")
        .load_attr("len")
        .call(3, 0)
        .op(Opcode::PopTop, 0)
        .load_int(0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(
        err,
        Error::NonConstantRequired {
            what: "memcpy size",
            ..
        }
    );
}

#[test]
fn undefined_global_is_a_name_error() {
    let mut b = builder();
    b.load_global("no_such_thing").return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    match err {
        Error::UndefinedName { name, .. } => assert_eq!(name, "no_such_thing"),
        other => panic!("expected UndefinedName, got {}", other),
    }
}

#[test]
fn helper_arity_is_checked() {
    let mut b = builder();
    b.load_global("ktime_get_ns")
        .load_int(5)
        .call(1, 0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(
        err,
        Error::BadArgCount {
            expected: 0,
            got: 1,
            ..
        }
    );
}

#[test]
fn storing_over_an_argument_is_rejected() {
    let mut b = builder();
    b.load_int(1).store_fast("ctx").load_int(0).return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    match err {
        Error::ArgOverwrite { name, .. } => assert_eq!(name, "ctx"),
        other => panic!("expected ArgOverwrite, got {}", other),
    }
}

#[test]
fn unknown_field_is_rejected() {
    let mut b = builder();
    b.load_fast("ctx").load_attr("no_field").return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(err, Error::NoSuchField { .. });
}

#[test]
fn aggregates_cannot_be_returned() {
    let mut b = builder();
    b.load_const(Value::Bytes(vec![1, 0]))
        .store_fast("x")
        .load_fast("x")
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(err, Error::BadReturnType { .. });
}

#[test]
fn calling_a_plain_constant_is_rejected() {
    let mut b = builder();
    b.global("five", Value::Int(5));
    b.load_global("five")
        .load_fast("ctx")
        .load_attr("len")
        .call(1, 0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(err, Error::BadCallee { .. });
}

#[test]
fn folding_division_by_zero_is_reported() {
    let mut b = builder();
    b.line(2)
        .load_int(4)
        .load_int(0)
        .op(Opcode::BinaryFloorDivide, 0)
        .return_value();
    let err = compile_socket_filter(&b.finish()).unwrap_err();
    assert_matches!(err, Error::Eval { line: 2, .. });
}

#[test]
fn load_failure_surfaces_errno_and_verifier_log() {
    let err = ebpf::LoadError {
        errno: 13,
        log: "R1 invalid mem access".to_string(),
    };
    let text = err.to_string();
    assert!(text.contains("13"));
    assert!(text.contains("R1 invalid mem access"));
}
