//! Template translation from placed IR to symbolic machine instructions.
//!
//! Deliberately dumb: each IR opcode expands into a short fixed template.
//! Anything clever happened in earlier passes.
//!
//! Register discipline: R6 holds the context pointer for the whole program
//! (set once in the prelude), R10 is the frame pointer, R0 and R1 are
//! rewritten freely as scratch, and helper calls clobber R1-R5 and return
//! in R0. No template assumes a register survives a call.

use crate::bytecode::{ArgVal, CmpOp, Opcode};
use crate::error::{Error, Result};
use crate::labels::Labeled;
use crate::mem::ConstVar;
use crate::stack::Stack;
use crate::vars::{Ir, VarRef};
use ebpf::helpers::{HelperDef, Pseudo, MAP_DELETE_ELEM, MAP_LOOKUP_ELEM, MAP_UPDATE_ELEM};
use ebpf::insn::AluOp;
use ebpf::{Instr, JmpCond, Label, MapDef, Mem, Reg, RegImm, Scalar, Size, Ty, Value};
use std::rc::Rc;

/// A resolved source operand.
enum Opnd {
    Reg(Reg),
    Mem(Mem),
    Imm(i64),
    MapFd(i32),
}

/// A resolved destination.
#[derive(Clone, Copy)]
enum Place {
    Reg(Reg),
    Mem(Mem),
}

fn scalar_size(s: Scalar) -> Size {
    Size::from_bytes(s.size()).expect("scalar widths are load sizes")
}

fn fits_i32(v: i64) -> bool {
    v >= i32::min_value() as i64 && v <= i32::max_value() as i64
}

pub struct Emitter {
    out: Vec<Instr>,
    stack: Stack,
    next_scratch: u32,
}

/// Translate a labeled IR stream. Consumes the stack allocator because
/// templates may materialize constants into fresh slots.
pub fn emit(items: &[Labeled], stack: Stack) -> Result<(Vec<Instr>, Stack)> {
    let mut e = Emitter {
        out: Vec::new(),
        stack,
        next_scratch: 0,
    };
    // The kernel passes the context in R1; park it in a callee-saved
    // register before anything can clobber it.
    e.push(Instr::MovReg {
        src: Reg::R1,
        dst: Reg::R6,
    });
    for item in items {
        match item {
            Labeled::Mark(off) => e.push(Instr::Label(Label::Target(*off))),
            Labeled::Ir(i) => e.translate(i)?,
        }
    }
    Ok((e.out, e.stack))
}

impl Emitter {
    fn push(&mut self, i: Instr) {
        self.out.push(i);
    }

    fn scratch_label(&mut self) -> Label {
        let l = Label::Scratch(self.next_scratch);
        self.next_scratch += 1;
        l
    }

    /// Base register and offset of a memory-resident variable.
    fn var_base(v: &VarRef) -> (Reg, i32) {
        match v {
            VarRef::Stack(sv) => (Reg::FP, sv.offset),
            VarRef::Arg(av) => {
                debug_assert_eq!(av.index, 0, "only single-argument programs");
                (Reg::R6, av.offset)
            }
            other => unreachable!("{} has no base register", other),
        }
    }

    fn operand(v: &VarRef, line: u32) -> Result<Opnd> {
        let not_scalar = |ty: &Ty| Error::NotScalar {
            line,
            ty: ty.to_string(),
        };
        match v {
            VarRef::Const(cv) => match &cv.value {
                Value::Map(h) => Ok(Opnd::MapFd(h.fd)),
                value => value
                    .as_int()
                    .map(Opnd::Imm)
                    .ok_or_else(|| not_scalar(&cv.ty)),
            },
            VarRef::Stack(_) | VarRef::Arg(_) => {
                let ty = v.ty().unwrap();
                if !ty.is_primitive() && !matches!(ty, Ty::Map(_)) {
                    return Err(not_scalar(ty));
                }
                let (reg, off) = Self::var_base(v);
                Ok(Opnd::Mem(Mem::new(reg, off as i16, scalar_size(ty.scalar()))))
            }
            other => unreachable!("{} survived placement", other),
        }
    }

    fn place(v: &VarRef, line: u32) -> Result<Place> {
        let ty = v.ty().unwrap();
        if !ty.is_primitive() && !matches!(ty, Ty::Map(_)) {
            return Err(Error::NotScalar {
                line,
                ty: ty.to_string(),
            });
        }
        let (reg, off) = Self::var_base(v);
        Ok(Place::Mem(Mem::new(reg, off as i16, scalar_size(ty.scalar()))))
    }

    /// The universal move. Memory-to-memory traffic is laundered through R0.
    fn mov(&mut self, src: Opnd, dst: Place) {
        match (src, dst) {
            (Opnd::Reg(s), Place::Reg(d)) => self.push(Instr::MovReg { src: s, dst: d }),
            (Opnd::Reg(s), Place::Mem(d)) => self.push(Instr::Store { src: s, dst: d }),
            (Opnd::Mem(m), Place::Reg(d)) => self.push(Instr::Load { src: m, dst: d }),
            (Opnd::Mem(m), Place::Mem(d)) => {
                self.push(Instr::Load {
                    src: m,
                    dst: Reg::R0,
                });
                self.push(Instr::Store {
                    src: Reg::R0,
                    dst: d,
                });
            }
            (Opnd::Imm(v), Place::Reg(d)) => {
                if fits_i32(v) {
                    self.push(Instr::MovImm {
                        imm: v as i32,
                        dst: d,
                    });
                } else {
                    self.push(Instr::MovImm64 {
                        imm: v as u64,
                        dst: d,
                    });
                }
            }
            (Opnd::Imm(v), Place::Mem(d)) => {
                // A store immediate carries 32 bits; wider values take the
                // long way through R0.
                if d.size == Size::Quad && !fits_i32(v) {
                    self.push(Instr::MovImm64 {
                        imm: v as u64,
                        dst: Reg::R0,
                    });
                    self.push(Instr::Store {
                        src: Reg::R0,
                        dst: d,
                    });
                } else {
                    self.push(Instr::StoreImm {
                        imm: v as i32,
                        dst: d,
                    });
                }
            }
            (Opnd::MapFd(fd), Place::Reg(d)) => self.push(Instr::MovMapFd { fd, dst: d }),
            (Opnd::MapFd(fd), Place::Mem(d)) => {
                self.push(Instr::MovMapFd {
                    fd,
                    dst: Reg::R0,
                });
                self.push(Instr::Store {
                    src: Reg::R0,
                    dst: Mem::new(d.reg, d.off, Size::Quad),
                });
            }
        }
    }

    /// Variable-to-variable move; aggregate constants materialize field by
    /// field into the destination slot.
    fn mov_vv(&mut self, src: &VarRef, dst: &VarRef, line: u32) -> Result<()> {
        if let VarRef::Const(cv) = src {
            if !cv.ty.is_primitive() && !matches!(cv.ty, Ty::Map(_)) {
                let (reg, off) = Self::var_base(dst);
                return self.mov_const(&cv.ty, &cv.value, reg, off, line);
            }
        }
        let s = Self::operand(src, line)?;
        let d = Self::place(dst, line)?;
        self.mov(s, d);
        Ok(())
    }

    fn mov_vr(&mut self, src: &VarRef, dst: Reg, line: u32) -> Result<()> {
        let s = Self::operand(src, line)?;
        self.mov(s, Place::Reg(dst));
        Ok(())
    }

    fn mov_rv(&mut self, src: Reg, dst: &VarRef, line: u32) -> Result<()> {
        let d = Self::place(dst, line)?;
        self.mov(Opnd::Reg(src), d);
        Ok(())
    }

    /// Write a constant of the given type at `base + off`, recursing
    /// through aggregates.
    fn mov_const(&mut self, ty: &Ty, value: &Value, base: Reg, off: i32, line: u32) -> Result<()> {
        match ty {
            Ty::Map(_) => {
                let slot = Mem::new(base, off as i16, Size::Quad);
                match value {
                    Value::Map(h) => self.mov(Opnd::MapFd(h.fd), Place::Mem(slot)),
                    _ => self.mov(Opnd::Imm(0), Place::Mem(slot)),
                }
            }
            ty if ty.is_primitive() => {
                let imm = value.as_int().unwrap_or(0);
                self.mov(
                    Opnd::Imm(imm),
                    Place::Mem(Mem::new(base, off as i16, scalar_size(ty.scalar()))),
                );
            }
            Ty::Array(a) => {
                let elem_size = a.elem.size() as i32;
                for idx in 0..a.len {
                    let elem = match value {
                        Value::Array(av) => av.item(idx),
                        Value::Bytes(b) => {
                            Value::Int(b.get(idx as usize).copied().unwrap_or(0) as i64)
                        }
                        _ => Value::zero(&a.elem),
                    };
                    self.mov_const(&a.elem, &elem, base, off + idx as i32 * elem_size, line)?;
                }
            }
            Ty::Struct(def) => {
                for (idx, field) in def.fields.iter().enumerate() {
                    let fval = match value {
                        Value::Struct(sv) => sv
                            .fields
                            .get(idx)
                            .cloned()
                            .unwrap_or_else(|| Value::zero(&field.ty)),
                        _ => Value::zero(&field.ty),
                    };
                    self.mov_const(&field.ty, &fval, base, off + field.offset as i32, line)?;
                }
            }
            other => unreachable!("cannot materialize a {}", other),
        }
        Ok(())
    }

    /// Take the address of a value. Constants get laid down into a fresh
    /// stack slot first; map handles reduce to their fd relocation.
    fn lea(&mut self, src: &VarRef, dst: Place, line: u32) -> Result<()> {
        if let Ty::Map(_) = src.ty().unwrap() {
            return match src {
                VarRef::Const(ConstVar {
                    value: Value::Map(h),
                    ..
                }) => {
                    self.mov(Opnd::MapFd(h.fd), dst);
                    Ok(())
                }
                _ => Err(Error::NonConstantRequired {
                    line,
                    what: "map handle",
                }),
            };
        }

        let slot;
        let src = if let VarRef::Const(cv) = src {
            slot = VarRef::Stack(self.stack.alloc(&cv.ty));
            let (reg, off) = Self::var_base(&slot);
            self.mov_const(&cv.ty, &cv.value, reg, off, line)?;
            &slot
        } else {
            src
        };

        let (reg, off) = Self::var_base(src);
        if off == 0 {
            self.mov(Opnd::Reg(reg), dst);
        } else {
            self.push(Instr::MovReg {
                src: reg,
                dst: Reg::R0,
            });
            self.push(Instr::Alu {
                op: AluOp::Add,
                src: RegImm::Imm(off as i32),
                dst: Reg::R0,
            });
            self.mov(Opnd::Reg(Reg::R0), dst);
        }
        Ok(())
    }

    /// Constant-length byte-by-byte copy; the size restriction keeps the
    /// verifier able to see every access.
    fn memcpy(&mut self, dst_reg: Reg, src_reg: Reg, len: u32) {
        for i in 0..len {
            self.push(Instr::Load {
                src: Mem::new(src_reg, i as i16, Size::Byte),
                dst: Reg::R0,
            });
            self.push(Instr::Store {
                src: Reg::R0,
                dst: Mem::new(dst_reg, i as i16, Size::Byte),
            });
        }
    }

    fn const_int(v: &VarRef, line: u32, what: &'static str) -> Result<i64> {
        match v {
            VarRef::Const(cv) => cv
                .value
                .as_int()
                .ok_or(Error::NonConstantRequired { line, what }),
            _ => Err(Error::NonConstantRequired { line, what }),
        }
    }

    fn map_const<'a>(v: &'a VarRef, line: u32) -> Result<(i32, &'a Rc<MapDef>)> {
        match v {
            VarRef::Const(ConstVar {
                value: Value::Map(h),
                ..
            }) => Ok((h.fd, &h.def)),
            _ => Err(Error::NonConstantRequired {
                line,
                what: "map handle",
            }),
        }
    }

    fn translate(&mut self, i: &Ir) -> Result<()> {
        let line = i.line();
        match i.op {
            Opcode::JumpForward => {
                let target = match i.argval {
                    ArgVal::Target(t) => t,
                    _ => unreachable!("jump without target"),
                };
                self.push(Instr::Jump {
                    target: Label::Target(target),
                });
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let target = match i.argval {
                    ArgVal::Target(t) => t,
                    _ => unreachable!("jump without target"),
                };
                self.mov_vr(&i.srcs[0], Reg::R1, line)?;
                self.push(Instr::JumpIf {
                    cond: if i.op == Opcode::PopJumpIfFalse {
                        JmpCond::Eq
                    } else {
                        JmpCond::Ne
                    },
                    lhs: Reg::R1,
                    rhs: RegImm::Imm(0),
                    target: Label::Target(target),
                });
            }
            Opcode::CompareOp => self.compare(i)?,
            Opcode::UnaryNegative => {
                if i.dsts.is_empty() {
                    return Ok(());
                }
                self.mov_vr(&i.srcs[0], Reg::R0, line)?;
                self.push(Instr::Neg { dst: Reg::R0 });
                self.mov_rv(Reg::R0, &i.dsts[0], line)?;
            }
            Opcode::BinaryAdd
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
            | Opcode::InplaceAdd => self.binary_op(i)?,
            Opcode::ReturnValue => {
                let ty = i.srcs[0].ty().unwrap();
                if !ty.is_primitive() {
                    return Err(Error::BadReturnType {
                        line,
                        ty: ty.to_string(),
                    });
                }
                self.mov_vr(&i.srcs[0], Reg::R0, line)?;
                self.push(Instr::Exit);
            }
            Opcode::LoadAttr => self.load_attr(i)?,
            Opcode::StoreAttr => self.store_attr(i)?,
            Opcode::BinarySubscr => match i.srcs[0].ty().unwrap().pointee() {
                Ty::Array(_) => self.subscr_array(i)?,
                Ty::Map(_) => self.subscr_map(i)?,
                other => {
                    return Err(Error::NotSubscriptable {
                        line,
                        what: other.to_string(),
                    })
                }
            },
            Opcode::StoreSubscr => match i.srcs[1].ty().unwrap().pointee() {
                Ty::Array(_) => self.store_subscr_array(i)?,
                Ty::Map(_) => self.store_subscr_map(i)?,
                other => {
                    return Err(Error::NotSubscriptable {
                        line,
                        what: other.to_string(),
                    })
                }
            },
            Opcode::DeleteSubscr => {
                let (fd, _) = match i.srcs[0].ty().unwrap().pointee() {
                    Ty::Map(_) => Self::map_const(&i.srcs[0], line)?,
                    other => {
                        return Err(Error::NotSubscriptable {
                            line,
                            what: format!("deleting from {}", other),
                        })
                    }
                };
                self.push(Instr::MovMapFd { fd, dst: Reg::R1 });
                self.lea(&i.srcs[1], Place::Reg(Reg::R2), line)?;
                self.push(Instr::Call {
                    func: MAP_DELETE_ELEM.num,
                });
            }
            Opcode::CallFunction => self.call(i)?,
            Opcode::StoreFast => {
                // Only stores of non-variable sources survive the memory
                // passes; everything else was forwarded to its producer.
                let (src, dst) = (&i.srcs[0], &i.dsts[0]);
                let dst_is_ptr = matches!(dst.ty().unwrap(), Ty::Ptr(_));
                let src_is_ptr = matches!(src.ty().unwrap(), Ty::Ptr(_));
                if dst_is_ptr && !src_is_ptr {
                    self.lea(src, Self::place(dst, line)?, line)?;
                } else {
                    self.mov_vv(src, dst, line)?;
                }
            }
            op => unreachable!("{} survived earlier passes", op),
        }
        Ok(())
    }

    fn binary_op(&mut self, i: &Ir) -> Result<()> {
        if i.dsts.is_empty() {
            return Ok(());
        }
        let line = i.line();
        let op = match i.op {
            Opcode::BinaryAdd | Opcode::InplaceAdd => AluOp::Add,
            Opcode::BinarySubtract => AluOp::Sub,
            Opcode::BinaryMultiply => AluOp::Mul,
            // Both divisions floor; operands are integers by construction.
            Opcode::BinaryTrueDivide | Opcode::BinaryFloorDivide => AluOp::Div,
            Opcode::BinaryModulo => AluOp::Mod,
            Opcode::BinaryAnd => AluOp::And,
            Opcode::BinaryOr => AluOp::Or,
            Opcode::BinaryXor => AluOp::Xor,
            Opcode::BinaryLshift => AluOp::Lsh,
            Opcode::BinaryRshift => AluOp::Rsh,
            op => unreachable!("{} is not an alu op", op),
        };
        self.mov_vr(&i.srcs[0], Reg::R0, line)?;
        self.mov_vr(&i.srcs[1], Reg::R1, line)?;
        self.push(Instr::Alu {
            op,
            src: RegImm::Reg(Reg::R1),
            dst: Reg::R0,
        });
        self.mov_rv(Reg::R0, &i.dsts[0], line)
    }

    fn compare(&mut self, i: &Ir) -> Result<()> {
        if i.dsts.is_empty() {
            return Ok(());
        }
        let line = i.line();
        let (mut lhs, mut rhs) = (&i.srcs[0], &i.srcs[1]);
        let op = match i.argval {
            ArgVal::Cmp(op) => op,
            _ => unreachable!("compare without operator"),
        };
        // Only unsigned above/equal conditions exist; flip the lessers.
        let cond = match op {
            CmpOp::Eq => JmpCond::Eq,
            CmpOp::Ne => JmpCond::Ne,
            CmpOp::Gt => JmpCond::Gt,
            CmpOp::Ge => JmpCond::Ge,
            CmpOp::Lt => {
                std::mem::swap(&mut lhs, &mut rhs);
                JmpCond::Gt
            }
            CmpOp::Le => {
                std::mem::swap(&mut lhs, &mut rhs);
                JmpCond::Ge
            }
        };

        let (true_l, done_l) = (self.scratch_label(), self.scratch_label());
        self.mov_vr(lhs, Reg::R1, line)?;
        self.mov_vr(rhs, Reg::R2, line)?;
        self.push(Instr::JumpIf {
            cond,
            lhs: Reg::R1,
            rhs: RegImm::Reg(Reg::R2),
            target: true_l,
        });
        let dst = Self::place(&i.dsts[0], line)?;
        self.mov(Opnd::Imm(0), dst);
        self.push(Instr::Jump { target: done_l });
        self.push(Instr::Label(true_l));
        self.mov(Opnd::Imm(1), dst);
        self.push(Instr::Label(done_l));
        Ok(())
    }

    fn field<'a>(obj_ty: &'a Ty, name: &str, line: u32) -> Result<&'a ebpf::Field> {
        let def = match obj_ty.pointee() {
            Ty::Struct(def) => def,
            other => {
                return Err(Error::NoSuchField {
                    line,
                    field: name.to_string(),
                    ty: other.to_string(),
                })
            }
        };
        def.field(name).ok_or_else(|| Error::NoSuchField {
            line,
            field: name.to_string(),
            ty: def.name.clone(),
        })
    }

    fn load_attr(&mut self, i: &Ir) -> Result<()> {
        if i.dsts.is_empty() {
            return Ok(());
        }
        let line = i.line();
        let sv = &i.srcs[0];
        let dv = &i.dsts[0];
        let obj_ty = sv.ty().unwrap().clone();
        let field = Self::field(&obj_ty, i.name(), line)?;
        let field_off = field.offset as i32;

        if let Ty::Ptr(_) = dv.ty().unwrap() {
            // Address form: the field itself is an aggregate.
            if let Ty::Ptr(_) = obj_ty {
                self.mov_vr(sv, Reg::R0, line)?;
            } else {
                let (base, base_off) = Self::var_base(sv);
                self.push(Instr::MovReg {
                    src: base,
                    dst: Reg::R0,
                });
                if base_off != 0 {
                    self.push(Instr::Alu {
                        op: AluOp::Add,
                        src: RegImm::Imm(base_off),
                        dst: Reg::R0,
                    });
                }
            }
            if field_off != 0 {
                self.push(Instr::Alu {
                    op: AluOp::Add,
                    src: RegImm::Imm(field_off),
                    dst: Reg::R0,
                });
            }
            return self.mov_rv(Reg::R0, dv, line);
        }

        // Value form: load the field at its declared width; destination
        // overrides only widen the slot it lands in.
        let size = scalar_size(field.ty.scalar());
        if let Ty::Ptr(_) = obj_ty {
            self.mov_vr(sv, Reg::R0, line)?;
            let d = Self::place(dv, line)?;
            self.mov(Opnd::Mem(Mem::new(Reg::R0, field_off as i16, size)), d);
        } else {
            let (base, base_off) = Self::var_base(sv);
            let d = Self::place(dv, line)?;
            self.mov(
                Opnd::Mem(Mem::new(base, (base_off + field_off) as i16, size)),
                d,
            );
        }
        Ok(())
    }

    fn store_attr(&mut self, i: &Ir) -> Result<()> {
        let line = i.line();
        let (val, obj) = (&i.srcs[0], &i.srcs[1]);
        let obj_ty = obj.ty().unwrap().clone();
        let field = Self::field(&obj_ty, i.name(), line)?;
        let size = scalar_size(field.ty.scalar());
        let field_off = field.offset as i32;

        if let Ty::Ptr(_) = obj_ty {
            // Through a pointer: R1 holds the object base so the value move
            // can still use R0 for memory-to-memory traffic.
            self.mov_vr(obj, Reg::R1, line)?;
            let s = Self::operand(val, line)?;
            self.mov(s, Place::Mem(Mem::new(Reg::R1, field_off as i16, size)));
        } else {
            let (base, base_off) = Self::var_base(obj);
            let s = Self::operand(val, line)?;
            self.mov(
                s,
                Place::Mem(Mem::new(base, (base_off + field_off) as i16, size)),
            );
        }
        Ok(())
    }

    /// Leave the address of `arr[idx]` in R0.
    fn array_element_addr(&mut self, arr: &VarRef, idx: &VarRef, line: u32) -> Result<Ty> {
        let arr_ty = arr.ty().unwrap().clone();
        let elem_ty = match arr_ty.pointee() {
            Ty::Array(a) => a.elem.clone(),
            other => unreachable!("subscript on {}", other),
        };
        if !elem_ty.is_primitive() {
            return Err(Error::NotSubscriptable {
                line,
                what: format!("array of {}", elem_ty),
            });
        }
        let idx = Self::const_int(idx, line, "array index")?;
        let mut el_off = idx as i32 * elem_ty.size() as i32;

        if let Ty::Ptr(_) = arr_ty {
            self.mov_vr(arr, Reg::R0, line)?;
        } else {
            let (base, base_off) = Self::var_base(arr);
            el_off += base_off;
            self.push(Instr::MovReg {
                src: base,
                dst: Reg::R0,
            });
        }
        if el_off != 0 {
            self.push(Instr::Alu {
                op: AluOp::Add,
                src: RegImm::Imm(el_off),
                dst: Reg::R0,
            });
        }
        Ok(elem_ty)
    }

    fn subscr_array(&mut self, i: &Ir) -> Result<()> {
        if i.dsts.is_empty() {
            return Ok(());
        }
        let line = i.line();
        let elem_ty = self.array_element_addr(&i.srcs[0], &i.srcs[1], line)?;
        let size = scalar_size(elem_ty.scalar());
        self.push(Instr::Load {
            src: Mem::new(Reg::R0, 0, size),
            dst: Reg::R0,
        });
        self.mov_rv(Reg::R0, &i.dsts[0], line)
    }

    fn store_subscr_array(&mut self, i: &Ir) -> Result<()> {
        let line = i.line();
        let (val, arr, idx) = (&i.srcs[0], &i.srcs[1], &i.srcs[2]);
        let elem_ty = self.array_element_addr(arr, idx, line)?;
        let size = scalar_size(elem_ty.scalar());
        self.mov_vr(val, Reg::R1, line)?;
        self.push(Instr::Store {
            src: Reg::R1,
            dst: Mem::new(Reg::R0, 0, size),
        });
        Ok(())
    }

    fn subscr_map(&mut self, i: &Ir) -> Result<()> {
        if i.dsts.is_empty() {
            return Ok(());
        }
        let line = i.line();
        let (fd, def) = Self::map_const(&i.srcs[0], line)?;
        let def = def.clone();
        let dv = &i.dsts[0];

        self.push(Instr::MovMapFd { fd, dst: Reg::R1 });
        self.lea(&i.srcs[1], Place::Reg(Reg::R2), line)?;
        self.push(Instr::Call {
            func: MAP_LOOKUP_ELEM.num,
        });

        let dst_ty = dv.ty().unwrap().clone();
        if let Ty::Ptr(_) = dst_ty {
            // Pointer destinations take the lookup result as-is; null means
            // absent and the program is expected to test for it.
            return self.mov_rv(Reg::R0, dv, line);
        }

        let (found_l, done_l) = (self.scratch_label(), self.scratch_label());
        self.push(Instr::JumpIf {
            cond: JmpCond::Ne,
            lhs: Reg::R0,
            rhs: RegImm::Imm(0),
            target: found_l,
        });

        // Absent: materialize the map's declared default.
        let (dreg, doff) = Self::var_base(dv);
        self.mov_const(&dst_ty, &def.default_value(), dreg, doff, line)?;
        self.push(Instr::Jump { target: done_l });

        self.push(Instr::Label(found_l));
        let size = scalar_size(dst_ty.scalar());
        let d = Self::place(dv, line)?;
        self.mov(Opnd::Mem(Mem::new(Reg::R0, 0, size)), d);
        self.push(Instr::Label(done_l));
        Ok(())
    }

    fn store_subscr_map(&mut self, i: &Ir) -> Result<()> {
        let line = i.line();
        let (val, map, key) = (&i.srcs[0], &i.srcs[1], &i.srcs[2]);
        let (fd, _) = Self::map_const(map, line)?;
        self.push(Instr::MovMapFd { fd, dst: Reg::R1 });
        self.lea(key, Place::Reg(Reg::R2), line)?;
        self.lea(val, Place::Reg(Reg::R3), line)?;
        self.push(Instr::MovImm {
            imm: 0,
            dst: Reg::R4,
        });
        self.push(Instr::Call {
            func: MAP_UPDATE_ELEM.num,
        });
        Ok(())
    }

    fn call(&mut self, i: &Ir) -> Result<()> {
        let line = i.line();
        let callee = match &i.srcs[0] {
            VarRef::Const(cv) => &cv.value,
            _ => {
                return Err(Error::BadCallee {
                    line,
                    what: "a dynamically selected function".to_string(),
                })
            }
        };
        match callee.clone() {
            Value::Pseudo(p) => self.pseudo_call(i, p),
            Value::Helper(def) => self.helper_call(i, def),
            other => Err(Error::BadCallee {
                line,
                what: other.to_string(),
            }),
        }
    }

    fn helper_call(&mut self, i: &Ir, def: &'static HelperDef) -> Result<()> {
        let line = i.line();
        let args = &i.srcs[1..];
        if let Some(expected) = def.args {
            if args.len() != expected {
                return Err(Error::BadArgCount {
                    line,
                    name: def.name.to_string(),
                    expected,
                    got: args.len(),
                });
            }
        }

        // Synthesize the byte-size arguments the helper wants after
        // specific array pointers.
        let mut marshalled: Vec<VarRef> = Vec::with_capacity(args.len() + 1);
        for (idx, arg) in args.iter().enumerate() {
            marshalled.push((*arg).clone());
            if def.fill_size_of.contains(&idx) {
                let ty = arg.ty().unwrap();
                let len = match ty {
                    Ty::Ptr(inner) => inner.size(),
                    other => other.size(),
                };
                marshalled.push(VarRef::Const(ConstVar {
                    ty: Ty::Scalar(Scalar::Quad),
                    value: Value::Int(len as i64),
                }));
            }
        }

        const ARG_REGS: [Reg; 5] = [Reg::R1, Reg::R2, Reg::R3, Reg::R4, Reg::R5];
        if marshalled.len() > ARG_REGS.len() {
            return Err(Error::BadArgCount {
                line,
                name: def.name.to_string(),
                expected: ARG_REGS.len(),
                got: marshalled.len(),
            });
        }

        for (arg, reg) in marshalled.iter().zip(ARG_REGS.iter()) {
            if arg.ty().unwrap().is_primitive() {
                self.mov_vr(arg, *reg, line)?;
            } else {
                self.lea(arg, Place::Reg(*reg), line)?;
            }
        }
        self.push(Instr::Call { func: def.num });

        match i.dsts.first() {
            Some(dv) => self.mov_rv(Reg::R0, dv, line),
            None => Ok(()),
        }
    }

    fn pseudo_call(&mut self, i: &Ir, p: Pseudo) -> Result<()> {
        let line = i.line();
        let args = &i.srcs[1..];
        if args.len() != p.args() {
            return Err(Error::BadArgCount {
                line,
                name: p.name().to_string(),
                expected: p.args(),
                got: args.len(),
            });
        }
        match p {
            Pseudo::Addrof => {
                if i.dsts.is_empty() {
                    return Ok(());
                }
                let d = Self::place(&i.dsts[0], line)?;
                self.lea(&args[0], d, line)
            }
            Pseudo::Ptr => match i.dsts.first() {
                Some(dv) => self.mov_vv(&args[0], dv, line),
                None => Ok(()),
            },
            Pseudo::Deref => {
                let dv = match i.dsts.first() {
                    Some(dv) => dv,
                    None => return Ok(()),
                };
                let size = scalar_size(dv.ty().unwrap().scalar());
                self.mov_vr(&args[0], Reg::R0, line)?;
                let d = Self::place(dv, line)?;
                self.mov(Opnd::Mem(Mem::new(Reg::R0, 0, size)), d);
                Ok(())
            }
            Pseudo::Memcpy => {
                let len = Self::const_int(&args[2], line, "memcpy size")?;
                self.mov_vr(&args[0], Reg::R1, line)?;
                self.mov_vr(&args[1], Reg::R2, line)?;
                self.memcpy(Reg::R1, Reg::R2, len as u32);
                Ok(())
            }
            Pseudo::PacketCopy => self.packet_copy(i),
            Pseudo::LoadSkbByte => self.load_skb(i, Size::Byte),
            Pseudo::LoadSkbShort => self.load_skb(i, Size::Short),
            Pseudo::LoadSkbWord => self.load_skb(i, Size::Word),
            Pseudo::MemEq => self.mem_eq(i),
        }
    }

    /// The verifier's packet access protocol: prove `data + off + len`
    /// stays at or below `data_end` before touching a single byte, and
    /// skip the copy entirely when it would run past the end.
    fn packet_copy(&mut self, i: &Ir) -> Result<()> {
        let line = i.line();
        let (skb, offset, dst_ptr, len) = (&i.srcs[1], &i.srcs[2], &i.srcs[3], &i.srcs[4]);
        let ctx_ty = match skb {
            VarRef::Arg(av) => av.ty.clone(),
            _ => {
                return Err(Error::ContextRequired {
                    line,
                    what: "packet_copy",
                })
            }
        };
        let len = Self::const_int(len, line, "packet_copy size")?;
        let data = Self::field(&ctx_ty, "data", line)?.clone();
        let data_end = Self::field(&ctx_ty, "data_end", line)?.clone();

        self.mov_vr(dst_ptr, Reg::R1, line)?;

        // R2 = skb->data + offset; R3 keeps the start, R2 becomes the end.
        self.push(Instr::Load {
            src: Mem::new(Reg::R6, data.offset as i16, Size::Word),
            dst: Reg::R2,
        });
        match Self::const_int(offset, line, "") {
            Ok(off) => {
                if off != 0 {
                    self.push(Instr::Alu {
                        op: AluOp::Add,
                        src: RegImm::Imm(off as i32),
                        dst: Reg::R2,
                    });
                }
            }
            Err(_) => {
                self.mov_vr(offset, Reg::R3, line)?;
                self.push(Instr::Alu {
                    op: AluOp::Add,
                    src: RegImm::Reg(Reg::R3),
                    dst: Reg::R2,
                });
            }
        }
        self.push(Instr::MovReg {
            src: Reg::R2,
            dst: Reg::R3,
        });
        self.push(Instr::Alu {
            op: AluOp::Add,
            src: RegImm::Imm(len as i32),
            dst: Reg::R2,
        });
        self.push(Instr::Load {
            src: Mem::new(Reg::R6, data_end.offset as i16, Size::Word),
            dst: Reg::R4,
        });

        let oob = self.scratch_label();
        self.push(Instr::JumpIf {
            cond: JmpCond::Gt,
            lhs: Reg::R2,
            rhs: RegImm::Reg(Reg::R4),
            target: oob,
        });
        self.memcpy(Reg::R1, Reg::R3, len as u32);
        self.push(Instr::Label(oob));
        Ok(())
    }

    fn load_skb(&mut self, i: &Ir, size: Size) -> Result<()> {
        let line = i.line();
        let (skb, off) = (&i.srcs[1], &i.srcs[2]);
        if !matches!(skb, VarRef::Arg(_)) {
            return Err(Error::ContextRequired {
                line,
                what: "load_skb",
            });
        }
        match Self::const_int(off, line, "") {
            Ok(v) => self.push(Instr::LoadSkbAbs {
                off: v as i32,
                size,
            }),
            Err(_) => {
                self.mov_vr(off, Reg::R0, line)?;
                self.push(Instr::LoadSkbInd {
                    off_reg: Reg::R0,
                    size,
                });
            }
        }
        match i.dsts.first() {
            Some(dv) => self.mov_rv(Reg::R0, dv, line),
            None => Ok(()),
        }
    }

    fn mem_eq(&mut self, i: &Ir) -> Result<()> {
        if i.dsts.is_empty() {
            return Ok(());
        }
        let line = i.line();
        let (pattern, buf) = (&i.srcs[1], &i.srcs[2]);
        let bytes = match pattern {
            VarRef::Const(ConstVar {
                value: Value::Bytes(b),
                ..
            }) => b.clone(),
            _ => {
                return Err(Error::NonConstantRequired {
                    line,
                    what: "mem_eq pattern",
                })
            }
        };
        // Compare up to the terminator, not including it.
        let pat: Vec<u8> = bytes.iter().copied().take_while(|b| *b != 0).collect();

        self.lea(buf, Place::Reg(Reg::R2), line)?;
        let (false_l, done_l) = (self.scratch_label(), self.scratch_label());
        for (off, byte) in pat.iter().enumerate() {
            self.push(Instr::Load {
                src: Mem::new(Reg::R2, off as i16, Size::Byte),
                dst: Reg::R1,
            });
            self.push(Instr::JumpIf {
                cond: JmpCond::Ne,
                lhs: Reg::R1,
                rhs: RegImm::Imm(*byte as i32),
                target: false_l,
            });
        }
        let d = Self::place(&i.dsts[0], line)?;
        self.mov(Opnd::Imm(1), d);
        self.push(Instr::Jump { target: done_l });
        self.push(Instr::Label(false_l));
        self.mov(Opnd::Imm(0), d);
        self.push(Instr::Label(done_l));
        Ok(())
    }
}
