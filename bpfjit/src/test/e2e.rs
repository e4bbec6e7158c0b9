//! Whole-pipeline scenarios asserting on the shape of the linked output.

use super::*;
use crate::bytecode::{CmpOp, Opcode};
use ebpf::HostFn;

#[test]
fn return_zero_is_exactly_three_instructions() {
    let mut b = builder();
    b.load_int(0).return_value();
    let p = sf(&b.finish());

    assert_eq!(p.insns.len(), 3);
    // mov r6, r1
    assert_eq!(p.insns[0].code, MOV_X);
    assert_eq!(p.insns[0].dst, 6);
    assert_eq!(p.insns[0].src, 1);
    // mov r0, 0
    assert_eq!(p.insns[1].code, MOV_K);
    assert_eq!(p.insns[1].dst, 0);
    assert_eq!(p.insns[1].imm, 0);
    assert_eq!(p.insns[2].code, EXIT);
}

#[test]
fn field_read_loads_len_through_the_context_register() {
    let mut b = builder();
    b.load_fast("ctx").load_attr("len").return_value();
    let p = sf(&b.finish());

    // One 32-bit load of ctx.len (offset 0) relative to R6.
    assert!(has(&p, |i| i.code == LDX_W && i.src == 6 && i.off == 0));
    assert_eq!(p.insns.last().unwrap().code, EXIT);
    // The value ends up in R0 right before the exit.
    let before_exit = &p.insns[p.insns.len() - 2];
    assert_eq!(before_exit.dst, 0);
}

#[test]
fn packet_length_check_produces_zero_or_one() {
    let mut b = builder();
    let other = b.label();
    b.load_fast("ctx")
        .load_attr("len")
        .load_int(64)
        .compare(CmpOp::Gt)
        .pop_jump_if_false(other)
        .load_int(1)
        .return_value()
        .bind(other)
        .load_int(0)
        .return_value();
    let p = sf(&b.finish());

    assert_forward_jumps(&p);
    // The compare emits an unsigned greater-than on registers.
    assert_eq!(count(&p, JGT_X), 1);
    // The compare result is re-tested against zero for the branch.
    assert_eq!(count(&p, JEQ_K), 1);
    // Both arms terminate.
    assert_eq!(count(&p, EXIT), 2);
    // 0 and 1 both land in R0 on some path.
    assert!(has(&p, |i| i.code == MOV_K && i.dst == 0 && i.imm == 0));
    assert!(has(&p, |i| i.code == MOV_K && i.dst == 0 && i.imm == 1));
}

#[test]
fn map_increment_emits_lookup_default_add_update() {
    let mut b = builder();
    b.global("m", u64_hash(7));
    b.load_global("m")
        .load_int(5)
        .op(Opcode::DupTopTwo, 0)
        .op(Opcode::BinarySubscr, 0)
        .load_int(1)
        .op(Opcode::InplaceAdd, 0)
        .op(Opcode::RotThree, 0)
        .op(Opcode::StoreSubscr, 0)
        .load_int(0)
        .return_value();
    let p = sf(&b.finish());

    assert_forward_jumps(&p);
    // The fd is embedded twice: once for the lookup, once for the update.
    assert_eq!(relocations(&p), vec![7, 7]);
    assert_eq!(calls(&p), vec![1, 2]);
    // Null check on the lookup result.
    assert!(has(&p, |i| i.code == JNE_K && i.dst == 0 && i.imm == 0));
    // The miss branch materializes the default value 0 into the slot.
    assert!(has(&p, |i| i.code == 0x7a && i.imm == 0));
    // Update flags are zero in R4.
    assert!(has(&p, |i| i.code == MOV_K && i.dst == 4 && i.imm == 0));
}

#[test]
fn ipv4_source_blacklist() {
    let key = Ty::array_of(byte(), 4);
    let m = Value::Map(MapHandle::new(MapDef::hash(key, byte(), 256), 9));

    let mut b = builder();
    b.global("m", m)
        .global("htons", Value::Host(HostFn { name: "htons", call: htons }))
        .global("IpAddr", Value::Host(HostFn { name: "IpAddr", call: ip_addr_ctor }));

    let miss = b.label();
    // ip = IpAddr(); skb_load_bytes(ctx, 26, ip, 4)
    b.load_global("IpAddr")
        .call(0, 0)
        .store_fast("ip")
        .load_global("skb_load_bytes")
        .load_fast("ctx")
        .load_int(26)
        .load_fast("ip")
        .load_int(4)
        .call(4, 0)
        .op(Opcode::PopTop, 0);
    // if ctx.protocol == htons(0x0800): return m[ip]
    b.load_fast("ctx")
        .load_attr("protocol")
        .load_global("htons")
        .load_int(0x0800)
        .call(1, 0)
        .compare(CmpOp::Eq)
        .pop_jump_if_false(miss)
        .load_global("m")
        .load_fast("ip")
        .op(Opcode::BinarySubscr, 0)
        .return_value();
    b.bind(miss).load_int(0).return_value();
    let p = sf(&b.finish());

    assert_forward_jumps(&p);
    // htons folded at compile time, so the only calls are the helper and
    // the map lookup.
    assert_eq!(calls(&p), vec![26, 1]);
    assert_eq!(relocations(&p), vec![9]);
    // The folded htons(0x0800) comparison operand.
    assert!(has(&p, |i| i.code == MOV_K && i.imm == 8));
    // Byte-sized value traffic: miss default store and hit load.
    assert!(has(&p, |i| i.code == ST_B && i.imm == 0));
    assert!(has(&p, |i| i.code == LDX_B));
}

#[test]
fn kprobe_with_perf_output() {
    let ts = Value::Map(MapHandle::new(MapDef::hash(quad(), quad(), 1024), 4));
    let queue = Value::Map(MapHandle::new(MapDef::perf_event_array(8), 5));

    let mut b = builder();
    b.global("ts", ts)
        .global("q", queue)
        .global("Event", Value::Host(HostFn { name: "Event", call: event_ctor }));

    // pid = get_current_pid_tgid(); ev = Event(); ev.pid = pid
    b.load_global("get_current_pid_tgid")
        .call(0, 0)
        .store_fast("pid")
        .load_global("Event")
        .call(0, 0)
        .store_fast("ev")
        .load_fast("pid")
        .load_fast("ev")
        .store_attr("pid");
    // delta = ktime_get_ns(); ts[pid] = delta; ev.delta = delta
    b.load_global("ktime_get_ns")
        .call(0, 0)
        .store_fast("delta")
        .load_fast("delta")
        .load_global("ts")
        .load_fast("pid")
        .op(Opcode::StoreSubscr, 0)
        .load_fast("delta")
        .load_fast("ev")
        .store_attr("delta");
    // perf_event_output(ctx, q, get_smp_processor_id(), ev)
    b.load_global("perf_event_output")
        .load_fast("ctx")
        .load_global("q")
        .load_global("get_smp_processor_id")
        .call(0, 0)
        .load_fast("ev")
        .call(4, 0)
        .op(Opcode::PopTop, 0)
        .load_int(0)
        .return_value();
    let code = b.finish();
    let p = compile_kprobe(&code).expect("kprobe should compile");

    assert_forward_jumps(&p);
    assert_eq!(calls(&p), vec![14, 5, 2, 8, 25]);
    // ts for the update, q for the perf output.
    assert_eq!(relocations(&p), vec![4, 5]);
    // The synthesized size of the event struct rides in R5.
    assert!(has(&p, |i| i.code == MOV_K && i.dst == 5 && i.imm == 16));
    // The context pointer is handed through as the first argument.
    assert!(has(&p, |i| i.code == MOV_X && i.dst == 1 && i.src == 6));
}

#[test]
fn mem_eq_expands_to_byte_compares() {
    let mut b = builder();
    let done = b.label();
    b.load_const(Value::Bytes(vec![0; 4])).store_fast("buf");
    b.load_global("mem_eq")
        .load_const(Value::Str("GET".to_string()))
        .load_fast("buf")
        .call(2, 0)
        .pop_jump_if_false(done)
        .load_int(1)
        .return_value()
        .bind(done)
        .load_int(0)
        .return_value();
    let p = sf(&b.finish());

    assert_forward_jumps(&p);
    // Three pattern bytes, the NUL terminator excluded.
    assert_eq!(count(&p, JNE_K), 3);
}

#[test]
fn packet_copy_emits_the_bounds_protocol() {
    let mut b = builder();
    b.global("buf", Value::Bytes(vec![0, 0, 0, 0]));
    // dst = buf; packet_copy(ctx, 14, addrof(dst), 4)
    b.load_global("buf").store_fast("dst");
    b.load_global("packet_copy")
        .load_fast("ctx")
        .load_int(14)
        .load_global("addrof")
        .load_fast("dst")
        .call(1, 0)
        .load_int(4)
        .call(4, 0)
        .op(Opcode::PopTop, 0)
        .load_int(0)
        .return_value();
    let p = sf(&b.finish());

    assert_forward_jumps(&p);
    // skb->data and skb->data_end are read as 32-bit fields.
    assert!(has(&p, |i| i.code == LDX_W && i.src == 6 && i.off == 76));
    assert!(has(&p, |i| i.code == LDX_W && i.src == 6 && i.off == 80));
    // One unsigned bounds test guards the copy.
    assert_eq!(count(&p, JGT_X), 1);
    // Four byte loads and four byte stores for the copy itself.
    assert_eq!(count(&p, LDX_B), 4);
    assert_eq!(count(&p, 0x73), 4);
    // No helper call is involved.
    assert_eq!(calls(&p), Vec::<i32>::new());
}

#[test]
fn skb_byte_loads_use_absolute_and_indirect_forms() {
    let mut b = builder();
    b.load_global("load_skb_byte")
        .load_fast("ctx")
        .load_int(23)
        .call(2, 0)
        .store_fast("proto");
    b.load_global("load_skb_short")
        .load_fast("ctx")
        .load_fast("proto")
        .call(2, 0)
        .return_value();
    let p = sf(&b.finish());

    // Constant offset: absolute form. Runtime offset: indirect form.
    assert!(has(&p, |i| i.code == 0x30 && i.imm == 23));
    assert!(has(&p, |i| i.code == 0x48));
}
