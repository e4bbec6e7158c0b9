//! Memory classification: which register, slot or immediate each variable
//! lives in.
//!
//! Argument loads collapse into direct references to the input register;
//! constant loads collapse into immediate operands attached to their
//! consumers; named locals become [`FastVar`](struct.FastVar.html)s that
//! the stack pass will give dedicated slots. Host integers widen to quads
//! on the way through.

use crate::bytecode::{ArgVal, Opcode};
use crate::error::{Error, Result};
use crate::vars::{Ir, Var, VarRef};
use ebpf::{Scalar, Ty, Value};
use std::collections::HashMap;

/// A variable living in a fixed input register.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgVar {
    pub index: u32,
    pub ty: Ty,
    pub offset: i32,
}

/// A named local; gets a dedicated stack slot.
#[derive(Clone, Debug, PartialEq)]
pub struct FastVar {
    pub name: String,
    pub ty: Ty,
}

/// A host-resident literal, materialized lazily by the emitter.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstVar {
    pub ty: Ty,
    pub value: Value,
}

fn sym(v: &VarRef) -> Var {
    match v {
        VarRef::Sym(var, _) => *var,
        _ => unreachable!("operand already placed"),
    }
}

fn sym_ty(v: &VarRef) -> &Ty {
    match v {
        VarRef::Sym(_, Some(ty)) => ty,
        _ => unreachable!("operand not yet typed"),
    }
}

/// Replace loads of argument slots with direct argument references; storing
/// over an argument is an error.
pub fn replace_arg_loads(vis: Vec<Ir>, arg_tys: &[Ty]) -> Result<Vec<Ir>> {
    let mut arg_map: HashMap<Var, VarRef> = HashMap::new();
    let mut ret = Vec::with_capacity(vis.len());
    for mut i in vis {
        match i.op {
            Opcode::LoadFast if (i.arg as usize) < arg_tys.len() => {
                if let Some(dv) = i.dsts.first() {
                    arg_map.insert(
                        sym(dv),
                        VarRef::Arg(ArgVar {
                            index: i.arg as u32,
                            ty: arg_tys[i.arg as usize].clone(),
                            offset: 0,
                        }),
                    );
                }
            }
            Opcode::StoreFast if (i.arg as usize) < arg_tys.len() => {
                return Err(Error::ArgOverwrite {
                    line: i.line(),
                    name: i.name().to_string(),
                });
            }
            _ => {
                for sv in i.srcs.iter_mut() {
                    if let Some(arg) = arg_map.get(&sym(sv)) {
                        *sv = arg.clone();
                    }
                }
                ret.push(i);
            }
        }
    }
    Ok(ret)
}

/// Host integers and booleans have no width of their own; give them one.
pub fn widen_ints(vis: Vec<Ir>) -> Vec<Ir> {
    fn quad(ty: &mut Ty) {
        if let Ty::Int | Ty::Bool = ty {
            *ty = Ty::Scalar(Scalar::Quad);
        }
    }
    vis.into_iter()
        .map(|mut i| {
            for v in i.srcs.iter_mut().chain(i.dsts.iter_mut()) {
                match v {
                    VarRef::Sym(_, Some(ty)) => quad(ty),
                    VarRef::Arg(a) => quad(&mut a.ty),
                    _ => {}
                }
            }
            i
        })
        .collect()
}

/// Lift constant loads into [`ConstVar`](struct.ConstVar.html) operands on
/// their consumers and drop the load instructions.
pub fn inline_consts(vis: Vec<Ir>) -> Vec<Ir> {
    let mut const_map: HashMap<Var, VarRef> = HashMap::new();
    for i in &vis {
        if i.op == Opcode::LoadConst {
            let value = match &i.argval {
                ArgVal::Value(v) => v.clone(),
                _ => unreachable!("constant load without a value"),
            };
            let ty = sym_ty(&i.dsts[0]).clone();
            // A host int under a sized slot becomes a sized literal.
            let value = match (&ty, value) {
                (Ty::Scalar(s), Value::Int(v)) => Value::Scalar(*s, v as u64),
                (_, value) => value,
            };
            const_map.insert(sym(&i.dsts[0]), VarRef::Const(ConstVar { ty, value }));
        }
    }

    vis.into_iter()
        .filter(|i| i.op != Opcode::LoadConst)
        .map(|mut i| {
            for sv in i.srcs.iter_mut() {
                if let VarRef::Sym(var, _) = sv {
                    if let Some(cv) = const_map.get(var) {
                        *sv = cv.clone();
                    }
                }
            }
            i
        })
        .collect()
}

/// Rewrite fast loads and stores to reference named locals.
pub fn insert_fast_vars(vis: Vec<Ir>) -> Vec<Ir> {
    vis.into_iter()
        .map(|mut i| {
            match i.op {
                Opcode::LoadFast => {
                    let ty = sym_ty(&i.dsts[0]).clone();
                    i.srcs = vec![VarRef::Fast(FastVar {
                        name: i.name().to_string(),
                        ty,
                    })];
                }
                Opcode::StoreFast => {
                    let src = &i.srcs[0];
                    let ty = src.ty().cloned().expect("store source untyped");
                    // Aggregate-valued sources are held by pointer, except
                    // constants which materialize into the slot itself.
                    let ty = match src {
                        VarRef::Const(_) => ty,
                        _ if !ty.is_primitive() => Ty::ptr_to(ty),
                        _ => ty,
                    };
                    i.dsts = vec![VarRef::Fast(FastVar {
                        name: i.name().to_string(),
                        ty,
                    })];
                }
                _ => {}
            }
            i
        })
        .collect()
}

/// Forward each fast load's local into its consumers and drop the load.
pub fn forward_fast_loads(vis: Vec<Ir>) -> Vec<Ir> {
    let mut load_map: HashMap<Var, VarRef> = HashMap::new();
    let mut ret = Vec::with_capacity(vis.len());
    for mut i in vis {
        if i.op == Opcode::LoadFast {
            if let Some(dv) = i.dsts.first() {
                load_map.insert(sym(dv), i.srcs[0].clone());
            }
            continue;
        }
        for sv in i.srcs.iter_mut() {
            if let VarRef::Sym(var, _) = sv {
                if let Some(fast) = load_map.get(var) {
                    *sv = fast.clone();
                }
            }
        }
        ret.push(i);
    }
    ret
}

/// Retarget producers so they write named locals directly, dropping the
/// store instruction. Stores of non-variable sources (constants, argument
/// references) have no producer to retarget and survive as explicit moves.
pub fn forward_fast_stores(vis: Vec<Ir>) -> Result<Vec<Ir>> {
    let mut store_map: HashMap<Var, VarRef> = HashMap::new();
    for i in &vis {
        if i.op == Opcode::StoreFast {
            if let VarRef::Sym(var, _) = &i.srcs[0] {
                if store_map.insert(*var, i.dsts[0].clone()).is_some() {
                    return Err(Error::Malformed(
                        "a value is stored into more than one local".to_string(),
                    ));
                }
            }
        }
    }

    let mut ret = Vec::with_capacity(vis.len());
    for mut i in vis {
        if i.op == Opcode::StoreFast {
            if let VarRef::Sym(_, _) = i.srcs[0] {
                continue;
            }
            ret.push(i);
            continue;
        }
        for dv in i.dsts.iter_mut() {
            if let VarRef::Sym(var, _) = dv {
                if let Some(fast) = store_map.get(var) {
                    *dv = fast.clone();
                }
            }
        }
        ret.push(i);
    }
    Ok(ret)
}
