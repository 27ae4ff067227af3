use super::*;

use crate::ir::format::format_body;
use crate::ir::types::{CallConv, FuncType, ScalarType, TypeTable, ValType};
use crate::ir::{FuncBuilder, IrCallee, NodeKind, Operand, VarPool};
use crate::wasm::{BinOp, FuncId};

const U32: ValType = ValType::Scalar(ScalarType::U32);

fn chain(body: &Body) -> Vec<(NodeKind, Option<String>)> {
    let mut out = Vec::new();
    let mut cur = Some(body.entry);
    while let Some(id) = cur {
        let n = body.node(id);
        out.push((n.kind, n.name.clone()));
        cur = n.next.first().copied();
    }
    out
}

#[test]
fn synchronous_bodies_pass_through_unchanged() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = types.add_func(FuncType {
        params: vec![U32],
        result: None,
        conv: CallConv::Fyr,
    });

    let mut b = FuncBuilder::new(&types, &mut pool, "f", fty);
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
    let mut body = b.finish();

    let before = format_body(&types, &pool, &body);
    StepTransformer::new().transform(&types, &mut body);
    assert_eq!(before, format_body(&types, &pool, &body));
}

#[test]
fn yielding_loop_is_flattened_into_steps() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = types.add_func(FuncType {
        params: vec![U32],
        result: None,
        conv: CallConv::FyrCoroutine,
    });

    let mut b = FuncBuilder::new(&types, &mut pool, "ticker", fty);
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
    let mut body = b.finish();

    StepTransformer::new().transform(&types, &mut body);

    let s = |name: &str| Some(name.to_string());
    assert_eq!(
        chain(&body),
        vec![
            (NodeKind::Define, s("ticker")),
            (NodeKind::Step, s("s0")),
            (NodeKind::DeclParam, None),
            (NodeKind::DeclVar, None),
            (NodeKind::Const, None),
            (NodeKind::GotoStep, s("s1")),
            // Loop head: test the exit condition, then suspend.
            (NodeKind::Step, s("s1")),
            (NodeKind::GotoStepIf, s("s3")),
            (NodeKind::Yield, None),
            (NodeKind::GotoStep, s("s2")),
            // Resume point after the yield; the back edge became a jump.
            (NodeKind::Step, s("s2")),
            (NodeKind::Binary(BinOp::Add), None),
            (NodeKind::GotoStep, s("s1")),
            (NodeKind::Step, s("s3")),
            (NodeKind::Return, None),
            (NodeKind::End, None),
        ]
    );
}

#[test]
fn awaited_call_splits_around_the_suspension() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let source_ty = types.add_func(FuncType {
        params: vec![],
        result: Some(U32),
        conv: CallConv::FyrCoroutine,
    });
    let waiter_ty = types.add_func(FuncType {
        params: vec![],
        result: None,
        conv: CallConv::FyrCoroutine,
    });

    let mut b = FuncBuilder::new(&types, &mut pool, "waiter", waiter_ty);
    let v = b.decl_var("v", U32);
    b.call(Some(v), source_ty, IrCallee::Func(FuncId(0)), vec![]);
    b.ret(vec![]);
    let mut body = b.finish();

    StepTransformer::new().transform(&types, &mut body);

    let kinds: Vec<NodeKind> = chain(&body).into_iter().map(|(k, _)| k).collect();
    assert_eq!(
        kinds,
        vec![
            NodeKind::Define,
            NodeKind::Step,
            NodeKind::DeclVar,
            NodeKind::CallBegin,
            NodeKind::GotoStep,
            NodeKind::Step,
            NodeKind::CallEnd,
            NodeKind::Return,
            NodeKind::End,
        ]
    );

    // The result assignment moves to the resume side of the call.
    let mut cur = Some(body.entry);
    while let Some(id) = cur {
        let node = body.node(id);
        match node.kind {
            NodeKind::CallBegin => assert_eq!(node.assign, None),
            NodeKind::CallEnd => assert_eq!(node.assign, Some(v)),
            _ => {}
        }
        cur = node.next.first().copied();
    }
}

#[test]
fn body_end_marker_survives_the_transform() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = types.add_func(FuncType {
        params: vec![],
        result: None,
        conv: CallConv::FyrCoroutine,
    });

    let mut b = FuncBuilder::new(&types, &mut pool, "pause", fty);
    b.yield_();
    b.ret(vec![]);
    let mut body = b.finish();

    StepTransformer::new().transform(&types, &mut body);

    // The entry `Define` is async, but its `End` terminates the chain the
    // emitter walks; only the ends of dissolved blocks and loops go away.
    let nodes = chain(&body);
    assert_eq!(
        nodes.last(),
        Some(&(NodeKind::End, None)),
        "chain must keep its terminator, got {:?}",
        nodes
    );
    let mut last = body.entry;
    let mut cur = body.node(last).next.first().copied();
    while let Some(id) = cur {
        last = id;
        cur = body.node(id).next.first().copied();
    }
    assert_eq!(body.node(last).partner, Some(body.entry));
}

#[test]
fn jump_off_the_end_resolves_to_the_end_marker() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = types.add_func(FuncType {
        params: vec![],
        result: None,
        conv: CallConv::FyrCoroutine,
    });

    // A yield as the last statement: the resume jump has no step left to
    // land on.
    let mut b = FuncBuilder::new(&types, &mut pool, "last", fty);
    b.yield_();
    let mut body = b.finish();

    StepTransformer::new().transform(&types, &mut body);

    let names: Vec<Option<String>> = chain(&body).into_iter().map(|(_, n)| n).collect();
    assert!(
        names.contains(&Some(END_STEP.to_string())),
        "expected a jump to {:?}, got {:?}",
        END_STEP,
        names
    );
}
