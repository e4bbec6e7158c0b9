//! From implicit stack slots to explicit variables.
//!
//! The source machine passes operands on a stack; everything downstream
//! wants three-address form. This pass simulates the stack along every
//! execution path, records which producer instruction feeds each operand
//! position of each consumer, and unifies producers that can feed the same
//! position on different paths into a single variable. Stack-manipulation
//! opcodes disappear here; their effect is fully captured in the variable
//! assignment.

use crate::bytecode::{ArgVal, Decoded, Opcode};
use crate::error::{Error, Result};
use crate::mem::{ArgVar, ConstVar, FastVar};
use crate::stack::StackVar;
use crate::trace;
use ebpf::Ty;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A symbolic operand. Identity is the number alone; the type is stamped
/// on later without re-keying.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Var {
    pub num: u32,
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.num)
    }
}

/// An operand reference, refined pass by pass: symbolic after assignment,
/// then argument/named/constant, finally stack-resident.
#[derive(Clone, Debug, PartialEq)]
pub enum VarRef {
    Sym(Var, Option<Ty>),
    Arg(ArgVar),
    Fast(FastVar),
    Stack(StackVar),
    Const(ConstVar),
}

impl VarRef {
    pub fn ty(&self) -> Option<&Ty> {
        match self {
            VarRef::Sym(_, ty) => ty.as_ref(),
            VarRef::Arg(v) => Some(&v.ty),
            VarRef::Fast(v) => Some(&v.ty),
            VarRef::Stack(v) => Some(&v.ty),
            VarRef::Const(v) => Some(&v.ty),
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VarRef::Sym(v, Some(ty)) => write!(f, "{}<{}>", v, ty),
            VarRef::Sym(v, None) => write!(f, "{}", v),
            VarRef::Arg(v) => write!(f, "arg{}<{}>", v.index, v.ty),
            VarRef::Fast(v) => write!(f, "{}<{}>", v.name, v.ty),
            VarRef::Stack(v) => write!(f, "stack[{}]<{}>", v.offset, v.ty),
            VarRef::Const(v) => write!(f, "const {}<{}>", v.value, v.ty),
        }
    }
}

/// A three-address instruction: the decoded opcode plus explicit source and
/// destination operands.
#[derive(Clone, Debug, PartialEq)]
pub struct Ir {
    pub op: Opcode,
    pub arg: u16,
    pub argval: ArgVal,
    pub offset: u32,
    pub line: Option<u32>,
    pub is_jump_target: bool,
    pub srcs: Vec<VarRef>,
    pub dsts: Vec<VarRef>,
}

impl Ir {
    fn from_decoded(i: &Decoded, srcs: Vec<VarRef>, dsts: Vec<VarRef>) -> Ir {
        Ir {
            op: i.op,
            arg: i.arg,
            argval: i.argval.clone(),
            offset: i.offset,
            line: i.line,
            is_jump_target: i.is_jump_target,
            srcs,
            dsts,
        }
    }

    pub fn line(&self) -> u32 {
        self.line.unwrap_or(0)
    }

    pub fn name(&self) -> &str {
        match &self.argval {
            ArgVal::Name(n) => n,
            _ => unreachable!("{} carries no name", self.op),
        }
    }
}

impl fmt::Display for Ir {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (n, dv) in self.dsts.iter().enumerate() {
            write!(f, "{}{}", if n > 0 { ", " } else { "" }, dv)?;
        }
        if !self.dsts.is_empty() {
            write!(f, " = ")?;
        }
        write!(f, "{}(", self.op)?;
        let mut sep = match &self.argval {
            ArgVal::None => "",
            argval => {
                write!(f, "{}", argval)?;
                ", "
            }
        };
        for sv in &self.srcs {
            write!(f, "{}{}", sep, sv)?;
            sep = ", ";
        }
        write!(f, ") # line {}", self.line())
    }
}

/// Stack effect table: how many operands an instruction pushes.
fn pushes(i: &Decoded) -> usize {
    match i.op {
        Opcode::LoadConst
        | Opcode::LoadFast
        | Opcode::LoadGlobal
        | Opcode::LoadDeref
        | Opcode::LoadAttr
        | Opcode::UnaryNegative
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
        | Opcode::BinarySubscr
        | Opcode::InplaceAdd
        | Opcode::CompareOp
        | Opcode::CallFunction => 1,
        _ => 0,
    }
}

/// Stack effect table: how many operands an instruction pops.
fn pops(i: &Decoded) -> usize {
    match i.op {
        Opcode::CallFunction => {
            let positional = (i.arg & 0xff) as usize;
            let keyword = (i.arg >> 8) as usize;
            // one extra for the callee itself
            1 + positional + 2 * keyword
        }
        Opcode::UnaryNegative | Opcode::LoadAttr => 1,
        Opcode::StoreFast
        | Opcode::ReturnValue
        | Opcode::PopJumpIfTrue
        | Opcode::PopJumpIfFalse => 1,
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
        | Opcode::BinarySubscr
        | Opcode::InplaceAdd
        | Opcode::CompareOp
        | Opcode::StoreAttr
        | Opcode::DeleteSubscr => 2,
        Opcode::StoreSubscr => 3,
        _ => 0,
    }
}

struct UnionFind {
    parent: HashMap<u32, u32>,
}

impl UnionFind {
    fn new() -> UnionFind {
        UnionFind {
            parent: HashMap::new(),
        }
    }

    fn find(&mut self, x: u32) -> u32 {
        let p = *self.parent.get(&x).unwrap_or(&x);
        if p == x {
            return x;
        }
        let root = self.find(p);
        self.parent.insert(x, root);
        root
    }

    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent.insert(rb, ra);
        }
    }
}

fn simulate(path: &[usize], insns: &[Decoded], srcs: &mut BTreeMap<u32, Vec<Vec<u32>>>) -> Result<()> {
    let mut stack: Vec<u32> = Vec::new();
    let pop = |stack: &mut Vec<u32>| {
        stack
            .pop()
            .ok_or_else(|| Error::Malformed("operand stack underflow".to_string()))
    };

    for &idx in path {
        let i = &insns[idx];
        match i.op {
            Opcode::RotTwo => {
                let tos = pop(&mut stack)?;
                let tos1 = pop(&mut stack)?;
                stack.extend([tos, tos1].iter());
            }
            Opcode::RotThree => {
                let tos = pop(&mut stack)?;
                let tos1 = pop(&mut stack)?;
                let tos2 = pop(&mut stack)?;
                stack.extend([tos, tos2, tos1].iter());
            }
            Opcode::DupTop => {
                let tos = pop(&mut stack)?;
                stack.extend([tos, tos].iter());
            }
            Opcode::DupTopTwo => {
                let tos = pop(&mut stack)?;
                let tos1 = pop(&mut stack)?;
                stack.extend([tos1, tos, tos1, tos].iter());
            }
            Opcode::PopTop => {
                pop(&mut stack)?;
            }
            _ => {
                let n = pops(i);
                if n > 0 {
                    if stack.len() < n {
                        return Err(Error::Malformed("operand stack underflow".to_string()));
                    }
                    srcs.entry(i.offset)
                        .or_insert_with(Vec::new)
                        .push(stack.split_off(stack.len() - n));
                }
                for _ in 0..pushes(i) {
                    stack.push(i.offset);
                }
            }
        }
    }
    Ok(())
}

/// Trace every path, unify producers feeding the same consumer position,
/// and rewrite the stream into three-address form.
pub fn assign(insns: &[Decoded]) -> Result<Vec<Ir>> {
    let mut srcs: BTreeMap<u32, Vec<Vec<u32>>> = BTreeMap::new();
    for path in trace::execution_paths(insns)? {
        simulate(&path, insns, &mut srcs)?;
    }

    // Producers that can feed the same operand position become one variable.
    let mut uf = UnionFind::new();
    let mut producers: Vec<u32> = Vec::new();
    for alternatives in srcs.values() {
        let first = &alternatives[0];
        producers.extend(first.iter().copied());
        for alt in &alternatives[1..] {
            debug_assert_eq!(first.len(), alt.len());
            for (&a, &b) in first.iter().zip(alt.iter()) {
                uf.union(a, b);
                producers.push(b);
            }
        }
    }

    // Number roots in producer-offset order so output is deterministic.
    producers.sort();
    producers.dedup();
    let mut var_of: HashMap<u32, Var> = HashMap::new();
    let mut next = 1u32;
    for off in producers {
        let root = uf.find(off);
        if !var_of.contains_key(&root) {
            var_of.insert(root, Var { num: next });
            next += 1;
        }
    }

    let mut ret = Vec::new();
    for i in insns {
        if i.op.is_stack_manip() {
            continue;
        }
        let src_vars = match srcs.get(&i.offset) {
            Some(alternatives) => alternatives[0]
                .iter()
                .map(|off| VarRef::Sym(var_of[&uf.find(*off)], None))
                .collect(),
            None => Vec::new(),
        };
        let root = uf.find(i.offset);
        let dst_vars = match var_of.get(&root) {
            Some(v) => vec![VarRef::Sym(*v, None)],
            None => Vec::new(),
        };
        ret.push(Ir::from_decoded(i, src_vars, dst_vars));
    }
    Ok(ret)
}

/// Propagate line numbers forward so every instruction can report one.
pub fn fill_lines(vis: Vec<Ir>) -> Vec<Ir> {
    let mut last = None;
    vis.into_iter()
        .map(|mut i| {
            match i.line {
                Some(line) => last = Some(line),
                None => i.line = last,
            }
            i
        })
        .collect()
}
