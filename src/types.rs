//! The compile-time type and value system shared between this crate and the
//! translator.
//!
//! Types describe where bits live (scalar widths, C-style aggregate layouts,
//! pointers); values are the host-resident constants the translator folds
//! over. Both are closed sets: there is deliberately no hook for arbitrary
//! host objects.

use crate::helpers::{HelperDef, Pseudo};
use crate::maps::{MapDef, MapHandle};
use std::fmt;
use std::rc::Rc;

/// Primitive scalar widths. Signedness is immaterial for emission.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Scalar {
    Byte,
    Short,
    Word,
    Quad,
}

impl Scalar {
    pub fn size(self) -> u32 {
        match self {
            Scalar::Byte => 1,
            Scalar::Short => 2,
            Scalar::Word => 4,
            Scalar::Quad => 8,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A field of an aggregate: name, type and byte offset.
#[derive(Clone, PartialEq, Debug)]
pub struct Field {
    pub name: String,
    pub ty: Ty,
    pub offset: u32,
}

/// An aggregate layout: ordered fields with explicit offsets, total size and
/// alignment, plus optional destination-type overrides for fields the
/// verifier secretly treats wider than their declared width.
#[derive(Clone, PartialEq, Debug)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Field>,
    pub size: u32,
    pub align: u32,
    overrides: Vec<(String, Scalar)>,
}

impl StructDef {
    /// Build a definition with natural C layout: each field aligned to its
    /// type's alignment, total size padded to the largest alignment.
    pub fn layout(name: &str, fields: Vec<(&str, Ty)>) -> StructDef {
        let mut off = 0u32;
        let mut align = 1u32;
        let mut out = Vec::with_capacity(fields.len());
        for (fname, ty) in fields {
            let a = ty.align();
            align = align.max(a);
            off = (off + a - 1) & !(a - 1);
            let size = ty.size();
            out.push(Field {
                name: fname.to_string(),
                ty,
                offset: off,
            });
            off += size;
        }
        StructDef {
            name: name.to_string(),
            fields: out,
            size: (off + align - 1) & !(align - 1),
            align,
            overrides: Vec::new(),
        }
    }

    /// Force-promote the named fields to a wider scalar when they appear as
    /// load destinations. Needed for context fields like `data`/`data_end`
    /// which the ABI declares 32-bit but the verifier tracks as pointers.
    pub fn with_overrides(mut self, overrides: &[(&str, Scalar)]) -> StructDef {
        self.overrides = overrides
            .iter()
            .map(|(n, s)| (n.to_string(), *s))
            .collect();
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn dest_type_override(&self, name: &str) -> Option<Scalar> {
        self.overrides
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }
}

/// A fixed-length array type.
#[derive(Clone, PartialEq, Debug)]
pub struct ArrayTy {
    pub elem: Ty,
    pub len: u32,
}

/// A variable's type.
#[derive(Clone, PartialEq, Debug)]
pub enum Ty {
    /// A host integer constant or arithmetic result; becomes a quad when
    /// memory is assigned.
    Int,
    /// A comparison result; emitted as a 64-bit 0/1.
    Bool,
    Scalar(Scalar),
    Struct(Rc<StructDef>),
    Array(Rc<ArrayTy>),
    /// A 64-bit pointer carrying its pointee as a phantom parameter.
    Ptr(Rc<Ty>),
    /// A file-descriptor datastructure; reduces to a map-fd immediate.
    Map(Rc<MapDef>),
    /// Helpers, pseudo intrinsics and host functions. Never stored.
    Callable,
}

impl Ty {
    pub fn ptr_to(ty: Ty) -> Ty {
        Ty::Ptr(Rc::new(ty))
    }

    pub fn array_of(elem: Ty, len: u32) -> Ty {
        Ty::Array(Rc::new(ArrayTy { elem, len }))
    }

    pub fn size(&self) -> u32 {
        match self {
            Ty::Scalar(s) => s.size(),
            Ty::Struct(d) => d.size,
            Ty::Array(a) => a.elem.size() * a.len,
            Ty::Int | Ty::Bool | Ty::Ptr(_) | Ty::Map(_) | Ty::Callable => 8,
        }
    }

    pub fn align(&self) -> u32 {
        match self {
            Ty::Scalar(s) => s.size(),
            Ty::Struct(d) => d.align,
            Ty::Array(a) => a.elem.align(),
            Ty::Int | Ty::Bool | Ty::Ptr(_) | Ty::Map(_) | Ty::Callable => 8,
        }
    }

    /// True for types that fit in a register: scalars and pointers. These
    /// pass to helpers by value; everything else passes by reference.
    pub fn is_primitive(&self) -> bool {
        match self {
            Ty::Int | Ty::Bool | Ty::Scalar(_) | Ty::Ptr(_) => true,
            _ => false,
        }
    }

    /// Register width of a primitive type.
    ///
    /// Panics on aggregates; callers must check `is_primitive` or know the
    /// placer has already run.
    pub fn scalar(&self) -> Scalar {
        match self {
            Ty::Scalar(s) => *s,
            Ty::Int | Ty::Bool | Ty::Ptr(_) | Ty::Map(_) => Scalar::Quad,
            _ => unreachable!("no scalar width for {}", self),
        }
    }

    /// Strip one level of pointer, if any.
    pub fn pointee(&self) -> &Ty {
        match self {
            Ty::Ptr(inner) => inner,
            other => other,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ty::Int => write!(f, "int"),
            Ty::Bool => write!(f, "bool"),
            Ty::Scalar(s) => write!(f, "u{}", s.size() * 8),
            Ty::Struct(d) => write!(f, "struct {}", d.name),
            Ty::Array(a) => write!(f, "{}[{}]", a.elem, a.len),
            Ty::Ptr(t) => write!(f, "*{}", t),
            Ty::Map(d) => write!(f, "map<{}, {}>", d.key, d.value),
            Ty::Callable => write!(f, "callable"),
        }
    }
}

/// An aggregate literal: values for a prefix of the fields, remainder zero.
#[derive(Clone, PartialEq, Debug)]
pub struct StructVal {
    pub def: Rc<StructDef>,
    pub fields: Vec<Value>,
}

impl StructVal {
    pub fn zeroed(def: Rc<StructDef>) -> StructVal {
        StructVal {
            def,
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        let idx = self.def.fields.iter().position(|f| f.name == name)?;
        Some(
            self.fields
                .get(idx)
                .cloned()
                .unwrap_or_else(|| Value::zero(&self.def.fields[idx].ty)),
        )
    }
}

/// An array literal: values for a prefix of the elements, remainder zero.
#[derive(Clone, PartialEq, Debug)]
pub struct ArrayVal {
    pub ty: Rc<ArrayTy>,
    pub items: Vec<Value>,
}

impl ArrayVal {
    pub fn item(&self, idx: u32) -> Value {
        self.items
            .get(idx as usize)
            .cloned()
            .unwrap_or_else(|| Value::zero(&self.ty.elem))
    }
}

/// A host-only function: folded at compile time, never emitted. The call
/// receives positional arguments and keyword pairs and either produces a
/// constant or explains why it cannot.
#[derive(Clone, Copy)]
pub struct HostFn {
    pub name: &'static str,
    pub call: fn(&[Value], &[(String, Value)]) -> Result<Value, String>,
}

impl PartialEq for HostFn {
    fn eq(&self, other: &HostFn) -> bool {
        self.name == other.name && self.call as usize == other.call as usize
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HostFn({})", self.name)
    }
}

/// A host-resident constant.
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Int(i64),
    /// A sized integer literal, e.g. a typed map default.
    Scalar(Scalar, u64),
    /// A string literal; the folder reinterprets these as null-terminated
    /// byte arrays before typing.
    Str(String),
    /// A null-terminated byte array.
    Bytes(Vec<u8>),
    Struct(StructVal),
    Array(ArrayVal),
    Map(MapHandle),
    Helper(&'static HelperDef),
    Pseudo(Pseudo),
    Host(HostFn),
}

impl Value {
    pub fn ty(&self) -> Ty {
        match self {
            Value::Int(_) => Ty::Int,
            Value::Scalar(s, _) => Ty::Scalar(*s),
            Value::Str(s) => Ty::array_of(Ty::Scalar(Scalar::Byte), s.len() as u32 + 1),
            Value::Bytes(b) => Ty::array_of(Ty::Scalar(Scalar::Byte), b.len() as u32),
            Value::Struct(v) => Ty::Struct(v.def.clone()),
            Value::Array(v) => Ty::Array(v.ty.clone()),
            Value::Map(h) => Ty::Map(h.def.clone()),
            Value::Helper(_) | Value::Pseudo(_) | Value::Host(_) => Ty::Callable,
        }
    }

    /// The all-zero value of a type.
    pub fn zero(ty: &Ty) -> Value {
        match ty {
            Ty::Int | Ty::Bool => Value::Int(0),
            Ty::Scalar(s) => Value::Scalar(*s, 0),
            Ty::Ptr(_) | Ty::Map(_) | Ty::Callable => Value::Scalar(Scalar::Quad, 0),
            Ty::Struct(d) => Value::Struct(StructVal::zeroed(d.clone())),
            Ty::Array(a) => Value::Array(ArrayVal {
                ty: a.clone(),
                items: Vec::new(),
            }),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Scalar(_, v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Scalar(s, v) => write!(f, "{}u{}", v, s.size() * 8),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "{:?}", b),
            Value::Struct(v) => write!(f, "{} {{..}}", v.def.name),
            Value::Array(v) => write!(f, "[..; {}]", v.ty.len),
            Value::Map(h) => write!(f, "map(fd={})", h.fd),
            Value::Helper(h) => write!(f, "{}", h.name),
            Value::Pseudo(p) => write!(f, "{}", p.name()),
            Value::Host(h) => write!(f, "{}", h.name),
        }
    }
}
