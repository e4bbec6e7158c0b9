//! Type checking and assignment.
//!
//! Two passes: the destination pass walks the stream in order, stamping
//! every destination variable and binding named locals to the type of
//! their last store; the source pass then copies the learned types onto
//! every source operand so later passes never have to look anything up.
//! A variable or local written with two incompatible types is an error
//! naming both source lines.

use crate::bytecode::{ArgVal, Opcode};
use crate::error::{Error, Result};
use crate::vars::{Ir, Var, VarRef};
use ebpf::{Scalar, Ty, Value};
use std::collections::HashMap;

fn sym(v: &VarRef) -> Var {
    match v {
        VarRef::Sym(var, _) => *var,
        _ => unreachable!("typing runs before memory placement"),
    }
}

/// Aggregates are only ever handled through pointers once loaded.
fn widen(ty: Ty) -> Ty {
    match ty {
        Ty::Struct(_) | Ty::Array(_) => Ty::ptr_to(ty),
        other => other,
    }
}

fn math_op(op: Opcode) -> bool {
    match op {
        Opcode::UnaryNegative
        | Opcode::BinaryAdd
        | Opcode::BinarySubtract
        | Opcode::BinaryMultiply
        | Opcode::BinaryTrueDivide
        | Opcode::BinaryFloorDivide
        | Opcode::BinaryModulo
        | Opcode::BinaryAnd
        | Opcode::BinaryOr
        | Opcode::BinaryXor
        | Opcode::BinaryLshift
        | Opcode::BinaryRshift
        | Opcode::InplaceAdd => true,
        _ => false,
    }
}

#[derive(Default)]
struct Types {
    vars: HashMap<Var, Ty>,
    var_lines: HashMap<Var, u32>,
    var_consts: HashMap<Var, Value>,
    fast: HashMap<u16, Ty>,
    fast_lines: HashMap<u16, u32>,
}

impl Types {
    fn set_var(&mut self, i: &Ir, var: Var, ty: Ty) -> Result<()> {
        if let Some(old) = self.vars.get(&var) {
            if *old != ty {
                return Err(Error::TypeConflict {
                    line: i.line(),
                    old_line: self.var_lines[&var],
                    what: var.to_string(),
                    new: ty.to_string(),
                    old: old.to_string(),
                });
            }
        }
        self.vars.insert(var, ty);
        self.var_lines.insert(var, i.line());
        Ok(())
    }

    fn set_dst(&mut self, i: &Ir, ty: Ty) -> Result<()> {
        // No destination means the result is discarded; nothing to stamp.
        match i.dsts.first() {
            Some(dv) => {
                debug_assert_eq!(i.dsts.len(), 1);
                self.set_var(i, sym(dv), ty)
            }
            None => Ok(()),
        }
    }

    fn set_fast(&mut self, i: &Ir, ty: Ty) -> Result<()> {
        if let Some(old) = self.fast.get(&i.arg) {
            if *old != ty {
                return Err(Error::TypeConflict {
                    line: i.line(),
                    old_line: self.fast_lines[&i.arg],
                    what: i.name().to_string(),
                    new: ty.to_string(),
                    old: old.to_string(),
                });
            }
        }
        self.fast.insert(i.arg, ty);
        self.fast_lines.insert(i.arg, i.line());
        Ok(())
    }

    fn of(&self, v: &VarRef) -> &Ty {
        &self.vars[&sym(v)]
    }
}

fn attr_type(i: &Ir, tys: &Types) -> Result<Ty> {
    let obj = tys.of(&i.srcs[0]).pointee().clone();
    let def = match &obj {
        Ty::Struct(def) => def,
        other => {
            return Err(Error::NoSuchField {
                line: i.line(),
                field: i.name().to_string(),
                ty: other.to_string(),
            })
        }
    };
    // Verifier-mandated promotions (e.g. packet bounds fields) win over the
    // declared field type.
    if let Some(scalar) = def.dest_type_override(i.name()) {
        return Ok(Ty::Scalar(scalar));
    }
    match def.field(i.name()) {
        Some(field) if field.ty.is_primitive() => Ok(field.ty.clone()),
        Some(field) => Ok(Ty::ptr_to(field.ty.clone())),
        None => Err(Error::NoSuchField {
            line: i.line(),
            field: i.name().to_string(),
            ty: obj.to_string(),
        }),
    }
}

fn subscr_type(i: &Ir, tys: &Types) -> Result<Ty> {
    match tys.of(&i.srcs[0]).pointee() {
        Ty::Array(a) => Ok(a.elem.clone()),
        Ty::Map(def) => {
            // Primitive values load by value, aggregates by reference.
            if def.value.is_primitive() {
                Ok(def.value.clone())
            } else {
                Ok(Ty::ptr_to(def.value.clone()))
            }
        }
        other => Err(Error::NotSubscriptable {
            line: i.line(),
            what: other.to_string(),
        }),
    }
}

fn call_type(i: &Ir, tys: &Types) -> Result<Ty> {
    let callee = sym(&i.srcs[0]);
    match tys.var_consts.get(&callee) {
        // Every kernel helper and pseudo intrinsic yields a 64-bit result.
        Some(Value::Helper(_)) | Some(Value::Pseudo(_)) => Ok(Ty::Scalar(Scalar::Quad)),
        Some(Value::Host(f)) => Err(Error::BadCallee {
            line: i.line(),
            what: format!("host function {} with runtime arguments", f.name),
        }),
        Some(other) => Err(Error::BadCallee {
            line: i.line(),
            what: other.to_string(),
        }),
        None => Err(Error::BadCallee {
            line: i.line(),
            what: "a dynamically selected function".to_string(),
        }),
    }
}

/// The destination pass.
pub fn dst_types(vis: Vec<Ir>, arg_tys: &[Ty]) -> Result<Vec<Ir>> {
    let mut tys = Types::default();
    for (n, ty) in arg_tys.iter().enumerate() {
        tys.fast.insert(n as u16, ty.clone());
        tys.fast_lines.insert(n as u16, 0);
    }

    for i in &vis {
        match i.op {
            Opcode::LoadConst => {
                let value = match &i.argval {
                    ArgVal::Value(v) => v.clone(),
                    _ => unreachable!("constant load without a value"),
                };
                if let Some(dv) = i.dsts.first() {
                    tys.var_consts.insert(sym(dv), value.clone());
                }
                tys.set_dst(i, value.ty())?;
            }
            Opcode::LoadFast => {
                let ty = tys.fast.get(&i.arg).cloned().ok_or_else(|| {
                    Error::UndefinedName {
                        line: i.line(),
                        name: i.name().to_string(),
                    }
                })?;
                tys.set_dst(i, widen(ty))?;
            }
            Opcode::StoreFast => {
                if (i.arg as usize) < arg_tys.len() {
                    return Err(Error::ArgOverwrite {
                        line: i.line(),
                        name: i.name().to_string(),
                    });
                }
                let ty = widen(tys.of(&i.srcs[0]).clone());
                tys.set_fast(i, ty)?;
            }
            op if math_op(op) => tys.set_dst(i, Ty::Int)?,
            Opcode::CompareOp => tys.set_dst(i, Ty::Bool)?,
            Opcode::LoadAttr => {
                let ty = attr_type(i, &tys)?;
                tys.set_dst(i, ty)?;
            }
            Opcode::BinarySubscr => {
                let ty = subscr_type(i, &tys)?;
                tys.set_dst(i, ty)?;
            }
            Opcode::CallFunction => {
                let ty = call_type(i, &tys)?;
                tys.set_dst(i, ty)?;
            }
            Opcode::JumpForward
            | Opcode::PopJumpIfTrue
            | Opcode::PopJumpIfFalse
            | Opcode::ReturnValue
            | Opcode::StoreAttr
            | Opcode::StoreSubscr
            | Opcode::DeleteSubscr => {}
            op => unreachable!("cannot deduce type for {}", op),
        }
    }

    Ok(vis
        .into_iter()
        .map(|mut i| {
            for dv in i.dsts.iter_mut() {
                let ty = tys.vars[&sym(dv)].clone();
                *dv = VarRef::Sym(sym(dv), Some(ty));
            }
            i
        })
        .collect())
}

/// The source pass: stamp each source with its producer's type.
pub fn src_types(vis: Vec<Ir>) -> Vec<Ir> {
    let mut var_tys: HashMap<Var, Ty> = HashMap::new();
    for i in &vis {
        for dv in &i.dsts {
            if let VarRef::Sym(var, Some(ty)) = dv {
                var_tys.insert(*var, ty.clone());
            }
        }
    }
    vis.into_iter()
        .map(|mut i| {
            for sv in i.srcs.iter_mut() {
                let var = sym(sv);
                *sv = VarRef::Sym(var, Some(var_tys[&var].clone()));
            }
            i
        })
        .collect()
}
