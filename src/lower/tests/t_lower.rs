use super::*;

use crate::ir::types::{CallConv, FuncType, ScalarType, TypeTable, ValType};
use crate::ir::{FuncBuilder, IrCallee, NodeKind, Operand, VarPool};
use crate::wasm::BinOp;

const U32: ValType = ValType::Scalar(ScalarType::U32);

/// Builds the reference module: an exported `sum`, a spawnable `ticker`
/// coroutine and an exported `run` that spawns one and calls the other.
fn demo_wat() -> String {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let mut backend = Backend::new();

    let sum_ty = types.add_func(FuncType {
        params: vec![U32],
        result: Some(U32),
        conv: CallConv::Fyr,
    });
    let ticker_ty = types.add_func(FuncType {
        params: vec![U32],
        result: None,
        conv: CallConv::FyrCoroutine,
    });
    let run_ty = types.add_func(FuncType {
        params: vec![U32],
        result: Some(U32),
        conv: CallConv::Fyr,
    });

    let sum_id = backend.declare_function("sum");
    let ticker_id = backend.declare_function("ticker");
    let run_id = backend.declare_function("run");

    let mut b = FuncBuilder::new(&types, &mut pool, "sum", sum_ty);
    let n = b.decl_param("n", U32);
    b.decl_result("ret", U32);
    let acc = b.decl_var("acc", U32);
    let i = b.decl_var("i", U32);
    b.assign(Some(acc), NodeKind::Const, Some(U32), vec![Operand::Int(0)]);
    b.assign(Some(i), NodeKind::Const, Some(U32), vec![Operand::Int(0)]);
    let outer = b.block();
    let head = b.loop_();
    let done = b.expr(
        NodeKind::Binary(BinOp::GeU),
        U32,
        vec![Operand::Var(i), Operand::Var(n)],
    );
    b.br_if(done, outer);
    b.assign(
        Some(acc),
        NodeKind::Binary(BinOp::Add),
        Some(U32),
        vec![Operand::Var(acc), Operand::Var(i)],
    );
    b.assign(
        Some(i),
        NodeKind::Binary(BinOp::Add),
        Some(U32),
        vec![Operand::Var(i), Operand::Int(1)],
    );
    b.br(head);
    b.end();
    b.end();
    b.ret(vec![Operand::Var(acc)]);
    backend.define_function(sum_id, b.finish(), Some("sum"));

    let mut b = FuncBuilder::new(&types, &mut pool, "ticker", ticker_ty);
    let n = b.decl_param("n", U32);
    let i = b.decl_var("i", U32);
    b.assign(Some(i), NodeKind::Const, Some(U32), vec![Operand::Int(0)]);
    let outer = b.block();
    let head = b.loop_();
    let done = b.expr(
        NodeKind::Binary(BinOp::GeU),
        U32,
        vec![Operand::Var(i), Operand::Var(n)],
    );
    b.br_if(done, outer);
    b.yield_();
    b.assign(
        Some(i),
        NodeKind::Binary(BinOp::Add),
        Some(U32),
        vec![Operand::Var(i), Operand::Int(1)],
    );
    b.br(head);
    b.end();
    b.end();
    b.ret(vec![]);
    backend.define_function(ticker_id, b.finish(), None);

    let mut b = FuncBuilder::new(&types, &mut pool, "run", run_ty);
    let n = b.decl_param("n", U32);
    b.decl_result("ret", U32);
    let out = b.decl_var("out", U32);
    b.spawn(ticker_ty, IrCallee::Func(ticker_id), vec![Operand::Var(n)]);
    b.call(
        Some(out),
        sum_ty,
        IrCallee::Func(sum_id),
        vec![Operand::Var(n)],
    );
    b.ret(vec![Operand::Var(out)]);
    backend.define_function(run_id, b.finish(), Some("run"));

    let (wat, trace) = backend
        .generate_module(&types, &mut pool, false)
        .expect("lowering failed");
    assert!(trace.is_none());
    wat
}

/// Builds a module where `pack` returns an aggregate whose call-frame slot
/// sits past alignment padding: the `Small` parameter occupies 4 bytes, so
/// the 8-aligned `Wide` result lands at offset 8, not 4.
fn pack_wat() -> String {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let mut backend = Backend::new();

    let small = types.add_struct(Some("Small".to_string()));
    types.add_field(small, "a", U32, 1);
    types.finalize_struct(small);
    let small_vt = ValType::Struct(small);

    let wide = types.add_struct(Some("Wide".to_string()));
    types.add_field(wide, "w", ValType::Scalar(ScalarType::U64), 1);
    types.finalize_struct(wide);
    let wide_vt = ValType::Struct(wide);

    let pack_ty = types.add_func(FuncType {
        params: vec![small_vt],
        result: Some(wide_vt),
        conv: CallConv::Fyr,
    });
    let build_ty = types.add_func(FuncType {
        params: vec![],
        result: None,
        conv: CallConv::Fyr,
    });

    let pack_id = backend.declare_function("pack");
    let build_id = backend.declare_function("build");

    let mut b = FuncBuilder::new(&types, &mut pool, "pack", pack_ty);
    b.decl_param("s", small_vt);
    let r = b.decl_result("r", wide_vt);
    b.assign(Some(r), NodeKind::Struct, Some(wide_vt), vec![Operand::Int(5)]);
    b.ret(vec![Operand::Var(r)]);
    backend.define_function(pack_id, b.finish(), None);

    let mut b = FuncBuilder::new(&types, &mut pool, "build", build_ty);
    let tmp = b.decl_var("s0", small_vt);
    let out = b.decl_var("out", wide_vt);
    let spare = b.decl_var("s1", small_vt);
    b.assign(Some(tmp), NodeKind::Struct, Some(small_vt), vec![Operand::Int(7)]);
    b.call(Some(out), pack_ty, IrCallee::Func(pack_id), vec![Operand::Var(tmp)]);
    b.assign(Some(spare), NodeKind::Struct, Some(small_vt), vec![Operand::Int(9)]);
    b.ret(vec![]);
    backend.define_function(build_id, b.finish(), None);

    let (wat, _) = backend
        .generate_module(&types, &mut pool, false)
        .expect("lowering failed");
    wat
}

/// The rendered body of one function, up to the next `(func`.
fn func_section<'a>(wat: &'a str, name: &str) -> &'a str {
    let open = format!("(func {} ", name);
    let start = wat.find(&open).unwrap_or_else(|| panic!("no function {}", name));
    let rest = &wat[start + open.len()..];
    match rest.find("(func ") {
        Some(n) => &wat[start..start + open.len() + n],
        None => &wat[start..],
    }
}

#[test]
fn sync_function_keeps_its_body_and_gains_a_host_wrapper() {
    let wat = demo_wat();

    // The internal entry point takes the shadow stack pointer as an extra
    // trailing parameter.
    assert!(
        wat.contains("(func $sum (param i32) (param i32) (result i32)"),
        "missing internal sum signature:\n{wat}"
    );
    // The exported surface hides the stack pointer behind a host wrapper.
    assert!(
        wat.contains("(func $sum.host (export \"sum\") (param i32) (result i32)"),
        "missing host wrapper:\n{wat}"
    );
    assert!(wat.contains("call $startHostCoroutine"));
    assert!(wat.contains("call $finishHostCoroutine"));
    assert!(wat.contains("i32.ge_u"));
    assert!(wat.contains("i32.add"));
}

#[test]
fn coroutine_lowers_to_a_step_dispatch_loop() {
    let wat = demo_wat();

    // step, n, sp -> frame pointer.
    assert!(
        wat.contains("(func $ticker (param i32) (param i32) (param i32) (result i32)"),
        "missing coroutine signature:\n{wat}"
    );
    // Four steps plus one suspension point: targets 0..3, default lands on
    // the suspension tail.
    assert!(
        wat.contains("br_table 0 1 2 3 6"),
        "missing dispatch table:\n{wat}"
    );
    // Resume header distinguishes fresh/spawned sentinels from resumes.
    assert!(wat.contains("i32.const 4294967294"));
    assert!(wat.contains(";; STEP 0"));
    assert!(wat.contains(";; STEP 3"));
    assert!(wat.contains(";; ASYNC CALL 0"));
}

#[test]
fn coroutine_scalar_parameter_gets_a_resume_trampoline() {
    let wat = demo_wat();

    // `n` lives in a local, so resuming from the scheduler goes through a
    // trampoline that reloads it from the frame.
    assert!(
        wat.contains("(func $ticker.callback (param i32) (param i32) (result i32)"),
        "missing trampoline:\n{wat}"
    );
    assert!(wat.contains("(table 1 anyfunc)"));
    assert!(wat.contains("(elem (i32.const 0) $ticker.callback)"));
}

#[test]
fn spawn_goes_through_the_scheduler() {
    let wat = demo_wat();

    assert!(wat.contains("call $createCoroutine"));
    assert!(wat.contains("call $scheduleCoroutine"));
    assert!(wat.contains("call $ticker"));
    assert!(wat.contains("call $sum"));
}

#[test]
fn heap_global_points_past_constant_data() {
    let wat = demo_wat();

    // No strings or binaries in the demo, so the heap starts right after
    // the reserved null page.
    assert!(
        wat.contains("(global $heap i32 (i32.const 8))"),
        "missing heap base:\n{wat}"
    );
}

#[test]
fn memory_covers_reserved_heap_and_stack() {
    let wat = demo_wat();

    // 16 heap pages, one stack page, one for the data segment.
    assert!(
        wat.contains("(memory (export \"memory\") 18)"),
        "wrong page count:\n{wat}"
    );
}

#[test]
fn generated_text_is_deterministic() {
    assert_eq!(demo_wat(), demo_wat());
}

#[test]
fn return_value_count_must_match_declaration() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let mut backend = Backend::new();

    let fty = types.add_func(FuncType {
        params: vec![],
        result: Some(U32),
        conv: CallConv::Fyr,
    });
    let id = backend.declare_function("bad");
    let mut b = FuncBuilder::new(&types, &mut pool, "bad", fty);
    b.decl_result("ret", U32);
    b.ret(vec![]);
    backend.define_function(id, b.finish(), None);

    match backend.generate_module(&types, &mut pool, false) {
        Err(LowerError::ReturnArity { expected, got, .. }) => {
            assert_eq!(expected, 1);
            assert_eq!(got, 0);
        }
        other => panic!("expected a return arity error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn struct_result_slot_agrees_between_caller_and_callee() {
    let wat = pack_wat();

    // The callee writes its result where the caller's call-frame layout
    // put `$result`: after the 4-byte parameter, aligned up to 8.
    let callee = func_section(&wat, "$pack");
    assert!(
        callee.contains("i64.store offset=8"),
        "callee result store landed off the $result slot:\n{wat}"
    );
    let caller = func_section(&wat, "$build");
    assert!(
        caller.contains("i64.load offset=8"),
        "caller result read landed off the $result slot:\n{wat}"
    );
}

#[test]
fn call_frames_restore_the_stack_pointer() {
    let wat = pack_wat();

    // The 16-byte call frame is pushed once before the call and popped
    // once after the result copy; the vars frame (24 bytes) stays apart.
    let caller = func_section(&wat, "$build");
    assert_eq!(
        caller.matches("i32.const 16\n    i32.sub").count(),
        1,
        "expected one call frame push:\n{wat}"
    );
    assert_eq!(
        caller.matches("i32.const 16\n    i32.add").count(),
        1,
        "expected one call frame pop:\n{wat}"
    );
}

#[test]
fn pointer_local_writes_through_to_its_frame_slot() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let mut backend = Backend::new();

    let ptr = ValType::Scalar(ScalarType::Ptr);
    let fty = types.add_func(FuncType {
        params: vec![],
        result: None,
        conv: CallConv::Fyr,
    });
    let id = backend.declare_function("touch");
    let mut b = FuncBuilder::new(&types, &mut pool, "touch", fty);
    let p = b.decl_var("p", ptr);
    b.assign(Some(p), NodeKind::Const, Some(ptr), vec![Operand::Int(0)]);
    b.ret(vec![]);
    backend.define_function(id, b.finish(), None);

    let (wat, _) = backend
        .generate_module(&types, &mut pool, false)
        .expect("lowering failed");

    // The store tees into the local and mirrors the value into the
    // collector-visible frame slot in the same sequence.
    assert!(
        wat.contains("get_local 1\n    i32.const 0\n    tee_local 2\n    i32.store\n"),
        "missing write-through to the frame slot:\n{wat}"
    );
}

#[test]
fn single_yield_coroutine_splits_into_two_steps() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let mut backend = Backend::new();

    let fty = types.add_func(FuncType {
        params: vec![],
        result: None,
        conv: CallConv::FyrCoroutine,
    });
    let id = backend.declare_function("pause");
    let mut b = FuncBuilder::new(&types, &mut pool, "pause", fty);
    b.yield_();
    b.ret(vec![]);
    backend.define_function(id, b.finish(), None);

    let (wat, _) = backend
        .generate_module(&types, &mut pool, false)
        .expect("lowering failed");

    // step, sp -> frame pointer; no scalar parameters to persist.
    assert!(
        wat.contains("(func $pause (param i32) (param i32) (result i32)"),
        "missing coroutine signature:\n{wat}"
    );
    // Two steps and one suspension point: targets 0..1, default exits
    // through the suspension tail.
    assert!(
        wat.contains("br_table 0 1 4"),
        "missing dispatch table:\n{wat}"
    );
    // Without parameters in locals the coroutine resumes through itself.
    assert!(
        wat.contains("(elem (i32.const 0) $pause)"),
        "missing table entry:\n{wat}"
    );
}

#[test]
fn zeroed_struct_literal_uses_bulk_fill() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let mut backend = Backend::new();

    let big = types.add_struct(Some("Big".to_string()));
    for i in 0..9 {
        types.add_field(big, &format!("f{}", i), U32, 1);
    }
    types.finalize_struct(big);
    let big_vt = ValType::Struct(big);

    let fty = types.add_func(FuncType {
        params: vec![],
        result: None,
        conv: CallConv::Fyr,
    });
    let id = backend.declare_function("mk");
    let mut b = FuncBuilder::new(&types, &mut pool, "mk", fty);
    let s = b.decl_var("s", big_vt);
    b.assign(
        Some(s),
        NodeKind::Struct,
        Some(big_vt),
        vec![Operand::Int(0); 9],
    );
    b.ret(vec![]);
    backend.define_function(id, b.finish(), None);

    let (wat, _) = backend
        .generate_module(&types, &mut pool, false)
        .expect("lowering failed");
    assert!(
        wat.contains("call $memZero"),
        "expected one bulk zero, not per-field stores:\n{wat}"
    );
    // No field remains to store individually.
    assert!(!wat.contains("i32.store offset"), "unexpected field stores:\n{wat}");
}
