use super::*;

mod layout;
mod linking;

fn insn_of(i: Instr) -> Insn {
    let linked = link(&[i]).unwrap();
    assert_eq!(linked.len(), 1);
    linked[0]
}
