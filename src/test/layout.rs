use super::*;
use crate::helpers;
use crate::types::Scalar;

#[test]
fn natural_layout_aligns_fields() {
    let def = StructDef::layout(
        "flow",
        vec![
            ("src", Ty::Scalar(Scalar::Word)),
            ("port", Ty::Scalar(Scalar::Short)),
            ("proto", Ty::Scalar(Scalar::Byte)),
            ("count", Ty::Scalar(Scalar::Quad)),
        ],
    );
    assert_eq!(def.field("src").unwrap().offset, 0);
    assert_eq!(def.field("port").unwrap().offset, 4);
    assert_eq!(def.field("proto").unwrap().offset, 6);
    assert_eq!(def.field("count").unwrap().offset, 8);
    assert_eq!(def.size, 16);
    assert_eq!(def.align, 8);
}

#[test]
fn sk_buff_matches_kernel_abi() {
    let skb = sk_buff();
    assert_eq!(skb.field("len").unwrap().offset, 0);
    assert_eq!(skb.field("protocol").unwrap().offset, 16);
    assert_eq!(skb.field("cb").unwrap().offset, 48);
    assert_eq!(skb.field("hash").unwrap().offset, 68);
    assert_eq!(skb.field("data").unwrap().offset, 76);
    assert_eq!(skb.field("data_end").unwrap().offset, 80);
    assert_eq!(skb.size, 84);
    assert_eq!(skb.dest_type_override("data"), Some(Scalar::Quad));
    assert_eq!(skb.dest_type_override("data_end"), Some(Scalar::Quad));
    assert_eq!(skb.dest_type_override("len"), None);
}

#[test]
fn pt_regs_is_the_x86_64_snapshot() {
    let regs = pt_regs();
    assert_eq!(regs.fields.len(), 21);
    assert_eq!(regs.field("rdi").unwrap().offset, 14 * 8);
    assert_eq!(regs.field("rip").unwrap().offset, 16 * 8);
    assert_eq!(regs.size, 21 * 8);
}

#[test]
fn helper_numbers_are_abi_fixed() {
    assert_eq!(helpers::MAP_LOOKUP_ELEM.num, 1);
    assert_eq!(helpers::MAP_UPDATE_ELEM.num, 2);
    assert_eq!(helpers::MAP_DELETE_ELEM.num, 3);
    assert_eq!(helpers::KTIME_GET_NS.num, 5);
    assert_eq!(helpers::GET_CURRENT_PID_TGID.num, 14);
    assert_eq!(helpers::PERF_EVENT_OUTPUT.num, 25);
    assert_eq!(helpers::SKB_LOAD_BYTES.num, 26);
    assert_eq!(helpers::GET_STACKID.num, 27);
    assert_eq!(helpers::PERF_EVENT_OUTPUT.fill_size_of, &[3]);
    assert_eq!(helpers::TRACE_PRINTK.args, None);
}

#[test]
fn builtins_cover_helpers_and_pseudos() {
    assert_eq!(
        helpers::builtin("map_lookup_elem"),
        Some(Value::Helper(&helpers::MAP_LOOKUP_ELEM))
    );
    assert_eq!(
        helpers::builtin("packet_copy"),
        Some(Value::Pseudo(Pseudo::PacketCopy))
    );
    assert_eq!(helpers::builtin("open"), None);
}

#[test]
fn kernel_version_packing() {
    assert_eq!(KernelVersion::new(4, 9, 12).pack(), (4 << 16) | (9 << 8) | 12);
}

#[test]
fn load_request_packs_the_attr() {
    let prog = Program::new(
        ProgType::SocketFilter,
        vec![
            Insn {
                code: 0xb7,
                ..Insn::default()
            },
            Insn {
                code: 0x95,
                ..Insn::default()
            },
        ],
    );
    let req = prog.load_request(KernelVersion::new(4, 9, 0));
    assert_eq!(req.prog_type, 1);
    assert_eq!(req.insn_cnt, 2);
    assert_eq!(req.image.len(), 16);
    assert_eq!(req.license, "GPL");

    let attr = req.attr_bytes(0x1000, 0x2000, 0x3000, 1 << 20);
    assert_eq!(&attr[0..4], &1u32.to_le_bytes());
    assert_eq!(&attr[4..8], &2u32.to_le_bytes());
    assert_eq!(&attr[8..16], &0x1000u64.to_le_bytes());
    assert_eq!(&attr[40..44], &req.kern_version.to_le_bytes());
}

#[test]
fn map_defaults() {
    let def = MapDef::hash(
        Ty::Scalar(Scalar::Word),
        Ty::Scalar(Scalar::Quad),
        256,
    );
    assert_eq!(def.key_size(), 4);
    assert_eq!(def.value_size(), 8);
    assert_eq!(def.default_value(), Value::Scalar(Scalar::Quad, 0));

    let with_default = def.with_default(Value::Int(7));
    assert_eq!(with_default.default_value(), Value::Int(7));

    let traces = MapDef::stack_trace(64);
    assert_eq!(traces.value_size(), 8 * maps::PERF_MAX_STACK_DEPTH);
}
