//! Enumeration of all execution paths through a decoded stream.
//!
//! The stream is a DAG because only forward jumps are admitted; every walk
//! from entry to a return terminates. Paths are reported as index lists so
//! later passes can simulate the operand stack along each one.

use crate::bytecode::{ArgVal, Decoded, Opcode};
use crate::error::{Error, Result};

fn jump_target(i: &Decoded) -> u32 {
    match i.argval {
        ArgVal::Target(t) => t,
        _ => unreachable!("jump without a target"),
    }
}

/// Yield every acyclic path from the entry to a return instruction.
pub fn execution_paths(insns: &[Decoded]) -> Result<Vec<Vec<usize>>> {
    let mut paths = Vec::new();
    walk(insns, 0, &mut Vec::new(), &mut paths)?;
    Ok(paths)
}

fn walk(
    insns: &[Decoded],
    from: usize,
    path: &mut Vec<usize>,
    out: &mut Vec<Vec<usize>>,
) -> Result<()> {
    let depth = path.len();
    let mut idx = from;
    while idx < insns.len() {
        let i = &insns[idx];
        path.push(idx);

        if i.op == Opcode::ReturnValue {
            out.push(path.clone());
            path.truncate(depth);
            return Ok(());
        }

        if i.op.is_jump() {
            let target = jump_target(i);
            if target <= i.offset {
                return Err(Error::BackwardJump {
                    line: i.line.unwrap_or(0),
                    from: i.offset,
                    to: target,
                });
            }
            if target as usize >= insns.len() {
                return Err(Error::Malformed(format!(
                    "jump target {} past the end of the function",
                    target
                )));
            }
            walk(insns, target as usize, path, out)?;
            if i.op == Opcode::JumpForward {
                path.truncate(depth);
                return Ok(());
            }
            // Conditional: fall through as well.
        }

        idx += 1;
    }

    Err(Error::Malformed(
        "execution can run off the end of the function".to_string(),
    ))
}
