use super::*;
use ebpf::{
    ArrayTy, ArrayVal, Insn, MapDef, MapHandle, Program, Scalar, StructDef, StructVal, Ty, Value,
};
use std::rc::Rc;

mod e2e;
mod errors;
mod frames;
mod smoke;

// Packed opcode bytes the assertions look for.
const MOV_X: u8 = 0xbf;
const MOV_K: u8 = 0xb7;
const LDX_W: u8 = 0x61;
const LDX_DW: u8 = 0x79;
const LDX_B: u8 = 0x71;
const STX_DW: u8 = 0x7b;
const ST_B: u8 = 0x72;
const LD_IMM_DW: u8 = 0x18;
const JNE_K: u8 = 0x55;
const JEQ_K: u8 = 0x15;
const JGT_X: u8 = 0x2d;
const CALL: u8 = 0x85;
const EXIT: u8 = 0x95;

fn byte() -> Ty {
    Ty::Scalar(Scalar::Byte)
}

fn quad() -> Ty {
    Ty::Scalar(Scalar::Quad)
}

fn builder() -> CodeBuilder {
    CodeBuilder::new(&["ctx"])
}

fn sf(code: &Code) -> Program {
    compile_socket_filter(code).expect("program should compile")
}

/// A u64 -> u64 hash map handle with a fake fd.
fn u64_hash(fd: i32) -> Value {
    Value::Map(MapHandle::new(MapDef::hash(quad(), quad(), 64), fd))
}

fn calls(p: &Program) -> Vec<i32> {
    p.insns
        .iter()
        .filter(|i| i.code == CALL)
        .map(|i| i.imm)
        .collect()
}

fn count(p: &Program, code: u8) -> usize {
    p.insns.iter().filter(|i| i.code == code).count()
}

fn has(p: &Program, pred: impl Fn(&Insn) -> bool) -> bool {
    p.insns.iter().any(pred)
}

/// Map-fd relocations present in the program, in order.
fn relocations(p: &Program) -> Vec<i32> {
    p.insns
        .iter()
        .filter(|i| i.code == LD_IMM_DW && i.src == 1)
        .map(|i| i.imm)
        .collect()
}

/// Every jump must land strictly forward, on a real
/// instruction, with `off == target - source - 1`.
fn assert_forward_jumps(p: &Program) {
    for (idx, insn) in p.insns.iter().enumerate() {
        let is_jump = insn.class() == 0x05 && insn.code != CALL && insn.code != EXIT;
        if is_jump {
            assert!(insn.off >= 0, "backward jump at {}: {:?}", idx, insn);
            let target = idx + 1 + insn.off as usize;
            assert!(
                target < p.insns.len(),
                "jump at {} lands past the end",
                idx
            );
        }
    }
}

fn event_def() -> Rc<StructDef> {
    Rc::new(StructDef::layout("event", vec![("pid", quad()), ("delta", quad())]))
}

fn event_ctor(_args: &[Value], _kwargs: &[(String, Value)]) -> std::result::Result<Value, String> {
    Ok(Value::Struct(StructVal::zeroed(event_def())))
}

fn htons(args: &[Value], _kwargs: &[(String, Value)]) -> std::result::Result<Value, String> {
    let v = args
        .first()
        .and_then(Value::as_int)
        .ok_or("expected an integer")?;
    let v = v as u16;
    Ok(Value::Int(v.swap_bytes() as i64))
}

fn ip_addr_ctor(_args: &[Value], _kwargs: &[(String, Value)]) -> std::result::Result<Value, String> {
    Ok(Value::Array(ArrayVal {
        ty: Rc::new(ArrayTy {
            elem: byte(),
            len: 4,
        }),
        items: Vec::new(),
    }))
}
