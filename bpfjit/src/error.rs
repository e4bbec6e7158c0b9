//! Translation errors. Every pass fails fast; nothing is recovered locally.
//!
//! Variants carry the source line where one is known; line 0 means the
//! input carried no line information.

use ebpf::LinkError;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// The bytecode uses opcodes outside the translatable subset. All
    /// offenders are collected before failing so the author sees the full
    /// damage at once.
    #[error("got untranslatable opcodes: {}", .names.join(", "))]
    UnsupportedOpcode { names: Vec<String> },

    #[error("line {line}: {what} set with new type {new}, was {old} at line {old_line}")]
    TypeConflict {
        line: u32,
        old_line: u32,
        what: String,
        new: String,
        old: String,
    },

    #[error("line {line}: jump from offset {from} to {to} goes backwards")]
    BackwardJump { line: u32, from: u32, to: u32 },

    #[error("line {line}: {what} must be a compile-time constant")]
    NonConstantRequired { line: u32, what: &'static str },

    #[error("line {line}: name '{name}' is not defined")]
    UndefinedName { line: u32, name: String },

    #[error("line {line}: {name} expected {expected} arguments, got {got}")]
    BadArgCount {
        line: u32,
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("line {line}: cannot overwrite argument {name}")]
    ArgOverwrite { line: u32, name: String },

    #[error("line {line}: no field {field} within type {ty}")]
    NoSuchField { line: u32, field: String, ty: String },

    #[error("line {line}: subscript not supported for {what}")]
    NotSubscriptable { line: u32, what: String },

    #[error("line {line}: cannot call {what}")]
    BadCallee { line: u32, what: String },

    #[error("line {line}: must return a primitive value, got {ty}")]
    BadReturnType { line: u32, ty: String },

    #[error("line {line}: first argument to {what} must be the program context")]
    ContextRequired { line: u32, what: &'static str },

    #[error("line {line}: expected a scalar operand, got {ty}")]
    NotScalar { line: u32, ty: String },

    /// Constant evaluation failed: division by zero, a host call that
    /// refused its arguments, an out-of-range subscript.
    #[error("line {line}: {msg}")]
    Eval { line: u32, msg: String },

    #[error("malformed bytecode: {0}")]
    Malformed(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, Error>;
