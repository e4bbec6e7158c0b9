//! The input bytecode model and its decoder.
//!
//! A [`Code`](struct.Code.html) object is one compiled function of a
//! stack-based virtual machine: a list of `(opcode, arg)` code units plus
//! the constant pool, name tables, captured cells, the defining global
//! environment and a line table. Offsets are code-unit indices throughout.
//!
//! The decoder checks every opcode against the translatable subset up
//! front, resolves each raw `arg` into a typed
//! [`ArgVal`](enum.ArgVal.html) and marks jump targets, producing the
//! stream the rest of the pipeline consumes.

use crate::error::{Error, Result};
use ebpf::Value;
use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use std::fmt;

/// Opcodes of the source virtual machine.
///
/// Everything before `Nop` is translatable; the tail variants are
/// recognized (so diagnostics can name them) but rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, FromPrimitive, ToPrimitive)]
pub enum Opcode {
    PopTop = 1,
    RotTwo,
    RotThree,
    DupTop,
    DupTopTwo,
    UnaryNegative,
    BinaryAdd,
    BinarySubtract,
    BinaryMultiply,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    BinaryLshift,
    BinaryRshift,
    BinarySubscr,
    InplaceAdd,
    CompareOp,
    LoadConst,
    LoadFast,
    StoreFast,
    LoadGlobal,
    LoadDeref,
    LoadAttr,
    StoreAttr,
    StoreSubscr,
    DeleteSubscr,
    JumpForward,
    PopJumpIfTrue,
    PopJumpIfFalse,
    CallFunction,
    ReturnValue,

    // Recognized but never translatable.
    Nop,
    UnaryNot,
    BinaryPower,
    GetIter,
    ForIter,
    JumpAbsolute,
    SetupLoop,
    PopBlock,
    MakeFunction,
    BuildTuple,
    BuildList,
    BuildMap,
    RaiseVarargs,
    SetupFinally,
    YieldValue,
}

impl Opcode {
    pub fn translatable(self) -> bool {
        (self as u8) < (Opcode::Nop as u8)
    }

    pub fn is_jump(self) -> bool {
        match self {
            Opcode::JumpForward | Opcode::PopJumpIfTrue | Opcode::PopJumpIfFalse => true,
            _ => false,
        }
    }

    pub fn is_stack_manip(self) -> bool {
        match self {
            Opcode::PopTop
            | Opcode::RotTwo
            | Opcode::RotThree
            | Opcode::DupTop
            | Opcode::DupTopTwo => true,
            _ => false,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Comparison operators, indexed by the `arg` of a `CompareOp`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive, ToPrimitive)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// One code unit. Jump-forward args are relative to the following unit;
/// pop-jump args are absolute target indices. `CallFunction` packs
/// `positional | keyword << 8`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RawOp {
    pub op: u8,
    pub arg: u16,
}

/// A compiled function.
#[derive(Clone, Debug, Default)]
pub struct Code {
    /// Number of arguments; the first `arg_count` varnames are argument
    /// slots.
    pub arg_count: u32,
    pub ops: Vec<RawOp>,
    pub consts: Vec<Value>,
    /// Attribute and global names.
    pub names: Vec<String>,
    /// Local variable names.
    pub varnames: Vec<String>,
    /// Names of captured bindings, parallel to `cells`.
    pub freevars: Vec<String>,
    pub cells: Vec<Value>,
    /// The defining environment, searched by global pinning.
    pub globals: HashMap<String, Value>,
    /// `(offset, line)` pairs, ascending by offset.
    pub lines: Vec<(u32, u32)>,
}

/// The decoded argument of an instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgVal {
    None,
    /// A constant; the folder rewrites instructions into `LoadConst` with
    /// this payload.
    Value(Value),
    /// A local, global, attribute or cell name.
    Name(String),
    /// Absolute jump target offset.
    Target(u32),
    Cmp(CmpOp),
}

impl fmt::Display for ArgVal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArgVal::None => Ok(()),
            ArgVal::Value(v) => write!(f, "{}", v),
            ArgVal::Name(n) => f.write_str(n),
            ArgVal::Target(t) => write!(f, "-> {}", t),
            ArgVal::Cmp(c) => write!(f, "{}", c),
        }
    }
}

/// One decoded instruction. Immutable after decode.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    pub op: Opcode,
    pub arg: u16,
    pub argval: ArgVal,
    pub offset: u32,
    pub line: Option<u32>,
    pub is_jump_target: bool,
}

fn lookup<'a, T>(table: &'a [T], idx: u16, what: &str) -> Result<&'a T> {
    table
        .get(idx as usize)
        .ok_or_else(|| Error::Malformed(format!("{} index {} out of range", what, idx)))
}

/// Decode a code object, rejecting anything outside the translatable subset.
pub fn decode(code: &Code) -> Result<Vec<Decoded>> {
    let mut bad = Vec::new();
    let mut out = Vec::with_capacity(code.ops.len());

    for (idx, raw) in code.ops.iter().enumerate() {
        let offset = idx as u32;
        let op = match Opcode::from_u8(raw.op) {
            Some(op) if op.translatable() => op,
            Some(op) => {
                bad.push(op.to_string());
                continue;
            }
            None => {
                bad.push(format!("opcode {}", raw.op));
                continue;
            }
        };

        let argval = match op {
            Opcode::LoadConst => ArgVal::Value(lookup(&code.consts, raw.arg, "constant")?.clone()),
            Opcode::LoadFast | Opcode::StoreFast => {
                ArgVal::Name(lookup(&code.varnames, raw.arg, "varname")?.clone())
            }
            Opcode::LoadGlobal | Opcode::LoadAttr | Opcode::StoreAttr => {
                ArgVal::Name(lookup(&code.names, raw.arg, "name")?.clone())
            }
            Opcode::LoadDeref => ArgVal::Name(lookup(&code.freevars, raw.arg, "freevar")?.clone()),
            Opcode::CompareOp => ArgVal::Cmp(
                CmpOp::from_u16(raw.arg)
                    .ok_or_else(|| Error::Malformed(format!("compare op {}", raw.arg)))?,
            ),
            Opcode::JumpForward => ArgVal::Target(offset + 1 + raw.arg as u32),
            Opcode::PopJumpIfTrue | Opcode::PopJumpIfFalse => ArgVal::Target(raw.arg as u32),
            _ => ArgVal::None,
        };

        out.push(Decoded {
            op,
            arg: raw.arg,
            argval,
            offset,
            line: code
                .lines
                .iter()
                .find(|(off, _)| *off == offset)
                .map(|(_, line)| *line),
            is_jump_target: false,
        });
    }

    if !bad.is_empty() {
        bad.sort();
        bad.dedup();
        return Err(Error::UnsupportedOpcode { names: bad });
    }

    let targets: Vec<u32> = out
        .iter()
        .filter_map(|i| match i.argval {
            ArgVal::Target(t) => Some(t),
            _ => None,
        })
        .collect();
    for i in out.iter_mut() {
        if targets.contains(&i.offset) {
            i.is_jump_target = true;
        }
    }

    Ok(out)
}

/// Fluent builder for [`Code`](struct.Code.html) objects with label
/// back-patching. The only frontend in this workspace; an embedding host
/// would generate `Code` from its own compiler instead.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    code: Code,
    bound: Vec<Option<u32>>,
    patches: Vec<(usize, BuildLabel)>,
    cur_line: Option<u32>,
}

/// A forward branch target handed out by
/// [`CodeBuilder::label`](struct.CodeBuilder.html#method.label).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BuildLabel(usize);

impl CodeBuilder {
    pub fn new(args: &[&str]) -> CodeBuilder {
        let mut b = CodeBuilder::default();
        b.code.arg_count = args.len() as u32;
        b.code.varnames = args.iter().map(|a| a.to_string()).collect();
        b
    }

    /// Bind a name in the defining environment.
    pub fn global(&mut self, name: &str, value: Value) -> &mut Self {
        self.code.globals.insert(name.to_string(), value);
        self
    }

    /// Add a captured cell; `load_deref` refers to cells by index.
    pub fn cell(&mut self, name: &str, value: Value) -> &mut Self {
        self.code.freevars.push(name.to_string());
        self.code.cells.push(value);
        self
    }

    /// Set the source line for subsequent instructions.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.cur_line = Some(line);
        self
    }

    fn intern(table: &mut Vec<String>, name: &str) -> u16 {
        if let Some(idx) = table.iter().position(|n| n == name) {
            return idx as u16;
        }
        table.push(name.to_string());
        (table.len() - 1) as u16
    }

    pub fn op(&mut self, op: Opcode, arg: u16) -> &mut Self {
        let offset = self.code.ops.len() as u32;
        if let Some(line) = self.cur_line.take() {
            self.code.lines.push((offset, line));
        }
        self.code.ops.push(RawOp { op: op as u8, arg });
        self
    }

    /// Append a raw unit, for building deliberately broken streams.
    pub fn raw(&mut self, op: u8, arg: u16) -> &mut Self {
        self.code.ops.push(RawOp { op, arg });
        self
    }

    pub fn load_const(&mut self, value: Value) -> &mut Self {
        self.code.consts.push(value);
        let idx = (self.code.consts.len() - 1) as u16;
        self.op(Opcode::LoadConst, idx)
    }

    pub fn load_int(&mut self, value: i64) -> &mut Self {
        self.load_const(Value::Int(value))
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        let idx = Self::intern(&mut self.code.varnames, name);
        self.op(Opcode::LoadFast, idx)
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        let idx = Self::intern(&mut self.code.varnames, name);
        self.op(Opcode::StoreFast, idx)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        let idx = Self::intern(&mut self.code.names, name);
        self.op(Opcode::LoadGlobal, idx)
    }

    pub fn load_deref(&mut self, idx: u16) -> &mut Self {
        self.op(Opcode::LoadDeref, idx)
    }

    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        let idx = Self::intern(&mut self.code.names, name);
        self.op(Opcode::LoadAttr, idx)
    }

    pub fn store_attr(&mut self, name: &str) -> &mut Self {
        let idx = Self::intern(&mut self.code.names, name);
        self.op(Opcode::StoreAttr, idx)
    }

    pub fn compare(&mut self, cmp: CmpOp) -> &mut Self {
        self.op(Opcode::CompareOp, cmp as u16)
    }

    pub fn call(&mut self, positional: u8, keyword: u8) -> &mut Self {
        self.op(
            Opcode::CallFunction,
            positional as u16 | (keyword as u16) << 8,
        )
    }

    pub fn return_value(&mut self) -> &mut Self {
        self.op(Opcode::ReturnValue, 0)
    }

    pub fn label(&mut self) -> BuildLabel {
        self.bound.push(None);
        BuildLabel(self.bound.len() - 1)
    }

    /// Bind a label to the current position.
    pub fn bind(&mut self, label: BuildLabel) -> &mut Self {
        debug_assert!(self.bound[label.0].is_none(), "label bound twice");
        self.bound[label.0] = Some(self.code.ops.len() as u32);
        self
    }

    pub fn jump_forward(&mut self, label: BuildLabel) -> &mut Self {
        self.patches.push((self.code.ops.len(), label));
        self.op(Opcode::JumpForward, 0)
    }

    pub fn pop_jump_if_false(&mut self, label: BuildLabel) -> &mut Self {
        self.patches.push((self.code.ops.len(), label));
        self.op(Opcode::PopJumpIfFalse, 0)
    }

    pub fn pop_jump_if_true(&mut self, label: BuildLabel) -> &mut Self {
        self.patches.push((self.code.ops.len(), label));
        self.op(Opcode::PopJumpIfTrue, 0)
    }

    /// Patch jumps and hand over the finished code object.
    ///
    /// Panics if a jumped-to label was never bound; that is a builder bug,
    /// not an input error.
    pub fn finish(mut self) -> Code {
        for (at, label) in self.patches {
            let target = self.bound[label.0].expect("jump to unbound label");
            let op = Opcode::from_u8(self.code.ops[at].op).unwrap();
            self.code.ops[at].arg = match op {
                Opcode::JumpForward => (target - at as u32 - 1) as u16,
                _ => target as u16,
            };
        }
        self.code
    }
}
