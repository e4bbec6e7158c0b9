use super::*;
use matches::assert_matches;

#[test]
fn labels_occupy_no_slot() {
    let l = Label::Scratch(0);
    let linked = link(&[
        Instr::Jump { target: l },
        Instr::Label(l),
        Instr::Exit,
    ])
    .unwrap();
    assert_eq!(linked.len(), 2);
    assert_eq!(linked[0].off, 0, "jump to the immediately following slot");
}

#[test]
fn jump_offset_is_distance_minus_one() {
    let l = Label::Target(9);
    let linked = link(&[
        Instr::Jump { target: l },
        Instr::MovImm { imm: 0, dst: Reg::R0 },
        Instr::MovImm { imm: 1, dst: Reg::R0 },
        Instr::Label(l),
        Instr::Exit,
    ])
    .unwrap();
    assert_eq!(linked[0].off, 2);
}

#[test]
fn two_slot_loads_count_twice_for_offsets() {
    let l = Label::Scratch(1);
    let linked = link(&[
        Instr::Jump { target: l },
        Instr::MovMapFd { fd: 3, dst: Reg::R1 },
        Instr::Label(l),
        Instr::Exit,
    ])
    .unwrap();
    assert_eq!(linked.len(), 4);
    assert_eq!(linked[0].off, 2, "the relocation pair is two slots wide");
}

#[test]
fn conditional_jump_resolves() {
    let l = Label::Scratch(2);
    let linked = link(&[
        Instr::JumpIf {
            cond: JmpCond::Eq,
            lhs: Reg::R1,
            rhs: RegImm::Imm(0),
            target: l,
        },
        Instr::MovImm { imm: 1, dst: Reg::R0 },
        Instr::Label(l),
        Instr::Exit,
    ])
    .unwrap();
    assert_eq!(linked[0].code, 0x15);
    assert_eq!(linked[0].off, 1);
}

#[test]
fn backward_jump_is_rejected() {
    let l = Label::Scratch(3);
    let err = link(&[
        Instr::Label(l),
        Instr::MovImm { imm: 0, dst: Reg::R0 },
        Instr::Jump { target: l },
    ])
    .unwrap_err();
    assert_matches!(err, LinkError::BackwardJump { .. });
}

#[test]
fn self_jump_is_rejected() {
    let l = Label::Scratch(4);
    let err = link(&[Instr::Label(l), Instr::Jump { target: l }]).unwrap_err();
    assert_matches!(err, LinkError::BackwardJump { .. });
}

#[test]
fn undefined_label_is_rejected() {
    let err = link(&[Instr::Jump {
        target: Label::Scratch(5),
    }])
    .unwrap_err();
    assert_matches!(err, LinkError::UndefinedLabel(_));
}

#[test]
fn duplicate_label_is_rejected() {
    let l = Label::Target(0);
    let err = link(&[Instr::Label(l), Instr::Exit, Instr::Label(l)]).unwrap_err();
    assert_matches!(err, LinkError::DuplicateLabel(_));
}
