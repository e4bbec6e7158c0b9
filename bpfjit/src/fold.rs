//! Constant pinning, folding and pruning.
//!
//! Globals and captured cells are pinned to the values they hold in the
//! defining environment; instructions whose operands are all constants are
//! evaluated at compile time over the closed [`Value`](../../ebpf/types/enum.Value.html)
//! set; string literals become null-terminated byte arrays; constants
//! nobody reads are dropped. Calls to kernel helpers and pseudo intrinsics
//! are never folded, and neither is anything whose first operand is a map
//! handle.

use crate::bytecode::{ArgVal, Code, Opcode};
use crate::error::{Error, Result};
use crate::vars::{Ir, Var, VarRef};
use ebpf::helpers;
use ebpf::Value;
use std::collections::HashMap;

fn make_const(old: &Ir, value: Value) -> Ir {
    Ir {
        op: Opcode::LoadConst,
        arg: 0,
        argval: ArgVal::Value(value),
        srcs: Vec::new(),
        dsts: old.dsts.clone(),
        ..old.clone()
    }
}

fn sym(v: &VarRef) -> Var {
    match v {
        VarRef::Sym(var, _) => *var,
        _ => unreachable!("folding runs before memory placement"),
    }
}

/// Rewrite global and cell loads into constant loads bound to the values
/// from the defining environment, falling back to the builtin helper table.
pub fn pin_globals(code: &Code, vis: Vec<Ir>) -> Result<Vec<Ir>> {
    let mut ret = Vec::with_capacity(vis.len());
    for i in vis {
        match i.op {
            Opcode::LoadGlobal => {
                let name = i.name();
                let value = code
                    .globals
                    .get(name)
                    .cloned()
                    .or_else(|| helpers::builtin(name));
                match value {
                    Some(v) => ret.push(make_const(&i, v)),
                    None => {
                        return Err(Error::UndefinedName {
                            line: i.line(),
                            name: name.to_string(),
                        })
                    }
                }
            }
            Opcode::LoadDeref => {
                let value = code.cells.get(i.arg as usize).cloned().ok_or_else(|| {
                    Error::UndefinedName {
                        line: i.line(),
                        name: i.name().to_string(),
                    }
                })?;
                ret.push(make_const(&i, value));
            }
            _ => ret.push(i),
        }
    }
    Ok(ret)
}

/// What we know about a variable's producers.
#[derive(Clone, Debug)]
enum Cls {
    NotConst,
    Const(Value),
    /// More than one constant producer; folding through it would pick one
    /// arbitrarily.
    Multi,
}

fn classify(vis: &[Ir]) -> HashMap<Var, Cls> {
    let mut produced: HashMap<Var, Vec<Option<Value>>> = HashMap::new();
    for i in vis {
        let v = match (i.op, &i.argval) {
            (Opcode::LoadConst, ArgVal::Value(val)) => Some(val.clone()),
            _ => None,
        };
        for dv in &i.dsts {
            produced.entry(sym(dv)).or_insert_with(Vec::new).push(v.clone());
        }
    }
    produced
        .into_iter()
        .map(|(var, vals)| {
            let cls = match vals[0].clone() {
                Some(_) if vals.len() > 1 => Cls::Multi,
                Some(val) => Cls::Const(val),
                None => Cls::NotConst,
            };
            (var, cls)
        })
        .collect()
}

fn eval_host_call(i: &Ir, srcs: &[Value]) -> Result<Option<Value>> {
    let positional = (i.arg & 0xff) as usize;
    let keyword = (i.arg >> 8) as usize;
    let callee = &srcs[0];
    let host = match callee {
        // Kernel-side callees are never folded.
        Value::Helper(_) | Value::Pseudo(_) => return Ok(None),
        Value::Host(f) => f,
        other => {
            return Err(Error::Eval {
                line: i.line(),
                msg: format!("{} is not callable", other),
            })
        }
    };
    let args = &srcs[1..=positional];
    let mut kwargs = Vec::with_capacity(keyword);
    for k in 0..keyword {
        let name = match &srcs[positional + 1 + 2 * k] {
            Value::Str(s) => s.clone(),
            other => {
                return Err(Error::Eval {
                    line: i.line(),
                    msg: format!("keyword name must be a string, got {}", other),
                })
            }
        };
        kwargs.push((name, srcs[positional + 2 + 2 * k].clone()));
    }
    let value = (host.call)(args, &kwargs).map_err(|msg| Error::Eval {
        line: i.line(),
        msg: format!("{}: {}", host.name, msg),
    })?;
    Ok(Some(value))
}

fn eval(i: &Ir, srcs: &[Value]) -> Result<Option<Value>> {
    let int2 = || -> Result<(i64, i64)> {
        match (srcs[0].as_int(), srcs[1].as_int()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Error::Eval {
                line: i.line(),
                msg: format!("cannot evaluate {} on {}, {}", i.op, srcs[0], srcs[1]),
            }),
        }
    };
    let div = |a: i64, b: i64| -> Result<i64> {
        a.checked_div(b).ok_or_else(|| Error::Eval {
            line: i.line(),
            msg: format!("cannot evaluate constant division {} / {}", a, b),
        })
    };

    let val = match i.op {
        Opcode::BinaryAdd => {
            let (a, b) = int2()?;
            Value::Int(a.wrapping_add(b))
        }
        Opcode::BinarySubtract => {
            let (a, b) = int2()?;
            Value::Int(a.wrapping_sub(b))
        }
        Opcode::BinaryMultiply => {
            let (a, b) = int2()?;
            Value::Int(a.wrapping_mul(b))
        }
        Opcode::BinaryTrueDivide | Opcode::BinaryFloorDivide => {
            let (a, b) = int2()?;
            Value::Int(div(a, b)?)
        }
        Opcode::LoadAttr => match &srcs[0] {
            Value::Struct(sv) => sv.field(i.name()).ok_or_else(|| Error::NoSuchField {
                line: i.line(),
                field: i.name().to_string(),
                ty: sv.def.name.clone(),
            })?,
            _ => return Ok(None),
        },
        Opcode::BinarySubscr => {
            let idx = match srcs[1].as_int() {
                Some(v) => v,
                None => return Ok(None),
            };
            match &srcs[0] {
                Value::Array(av) => {
                    if idx < 0 || idx as u32 >= av.ty.len {
                        return Err(Error::Eval {
                            line: i.line(),
                            msg: format!("constant index {} out of range", idx),
                        });
                    }
                    av.item(idx as u32)
                }
                Value::Bytes(b) => match b.get(idx as usize) {
                    Some(byte) => Value::Int(*byte as i64),
                    None => {
                        return Err(Error::Eval {
                            line: i.line(),
                            msg: format!("constant index {} out of range", idx),
                        })
                    }
                },
                _ => return Ok(None),
            }
        }
        Opcode::CallFunction => return eval_host_call(i, srcs),
        _ => return Ok(None),
    };
    Ok(Some(val))
}

/// Evaluate instructions whose operands are all constants. Leaves the dead
/// constant loads behind for [`prune_unread`](fn.prune_unread.html).
pub fn fold_consts(vis: Vec<Ir>) -> Result<Vec<Ir>> {
    let mut var_map = classify(&vis);

    let mut ret = Vec::with_capacity(vis.len());
    for i in vis {
        if i.srcs.is_empty() {
            ret.push(i);
            continue;
        }
        let consts: Option<Vec<Value>> = i
            .srcs
            .iter()
            .map(|sv| match var_map.get(&sym(sv)) {
                Some(Cls::Const(v)) => Some(v.clone()),
                _ => None,
            })
            .collect();
        let srcs = match consts {
            Some(srcs) => srcs,
            None => {
                ret.push(i);
                continue;
            }
        };
        // Map handles stay runtime operations even with constant keys.
        if let Value::Map(_) = srcs[0] {
            ret.push(i);
            continue;
        }

        match eval(&i, &srcs)? {
            Some(val) => {
                for dv in &i.dsts {
                    let entry = var_map.get_mut(&sym(dv)).unwrap();
                    if !matches!(entry, Cls::Multi) {
                        *entry = Cls::Const(val.clone());
                    }
                }
                ret.push(make_const(&i, val));
            }
            None => ret.push(i),
        }
    }
    Ok(ret)
}

/// String literals become null-terminated byte arrays; the machine has no
/// string type.
pub fn reinterpret_strings(vis: Vec<Ir>) -> Vec<Ir> {
    vis.into_iter()
        .map(|i| match (&i.op, &i.argval) {
            (Opcode::LoadConst, ArgVal::Value(Value::Str(s))) => {
                let mut bytes = s.clone().into_bytes();
                bytes.push(0);
                make_const(&i, Value::Bytes(bytes))
            }
            _ => i,
        })
        .collect()
}

/// Drop constant loads whose destination is never read.
pub fn prune_unread(vis: Vec<Ir>) -> Vec<Ir> {
    let mut read: Vec<Var> = Vec::new();
    for i in &vis {
        read.extend(i.srcs.iter().map(sym));
    }
    vis.into_iter()
        .filter(|i| {
            i.op != Opcode::LoadConst || i.dsts.iter().any(|dv| read.contains(&sym(dv)))
        })
        .collect()
}
