use super::*;

use crate::ir::types::{CallConv, FuncType, ScalarType, TypeTable, ValType};
use crate::ir::{Body, NodeId, NodeKind, Operand, VarPool};
use crate::wasm::BinOp;

const U32: ValType = ValType::Scalar(ScalarType::U32);

fn sync_fty(types: &mut TypeTable) -> crate::ir::types::FuncTypeId {
    types.add_func(FuncType {
        params: vec![U32],
        result: None,
        conv: CallConv::Fyr,
    })
}

fn chain_kinds(body: &Body) -> Vec<NodeKind> {
    let mut kinds = Vec::new();
    let mut cur = Some(body.entry);
    while let Some(id) = cur {
        kinds.push(body.node(id).kind);
        cur = body.node(id).next.first().copied();
    }
    kinds
}

#[test]
fn statements_form_a_single_chain() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = sync_fty(&mut types);

    let mut b = FuncBuilder::new(&types, &mut pool, "f", fty);
    b.decl_param("p", U32);
    let x = b.decl_var("x", U32);
    b.assign(Some(x), NodeKind::Const, Some(U32), vec![Operand::Int(7)]);
    b.ret(vec![]);
    let body = b.finish();

    assert_eq!(
        chain_kinds(&body),
        vec![
            NodeKind::Define,
            NodeKind::DeclParam,
            NodeKind::DeclVar,
            NodeKind::Const,
            NodeKind::Return,
            NodeKind::End,
        ]
    );
    // The entry and the terminator point at each other.
    let end = body.node(body.entry).partner.unwrap();
    assert_eq!(body.node(end).partner, Some(body.entry));
}

#[test]
fn expr_nodes_stay_detached() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = sync_fty(&mut types);

    let mut b = FuncBuilder::new(&types, &mut pool, "f", fty);
    let p = b.decl_param("p", U32);
    let e = b.expr(
        NodeKind::Binary(BinOp::Add),
        U32,
        vec![Operand::Var(p), Operand::Int(1)],
    );
    b.ret(vec![]);
    let body = b.finish();

    // An operand expression is referenced by its consumer, never linked
    // into the statement chain.
    let id = match e {
        Operand::Node(id) => id,
        other => panic!("expected a node operand, got {:?}", other),
    };
    assert!(body.node(id).next.is_empty());
    assert!(body.node(id).prev.is_empty());
    assert!(!chain_kinds(&body).contains(&NodeKind::Binary(BinOp::Add)));
}

#[test]
fn if_else_arms_hang_off_the_branch_node() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = sync_fty(&mut types);

    let mut b = FuncBuilder::new(&types, &mut pool, "f", fty);
    let x = b.decl_var("x", U32);
    let if_id = b.if_(Operand::Int(1));
    let then_stmt = b.assign(Some(x), NodeKind::Const, Some(U32), vec![Operand::Int(1)]);
    b.else_();
    let else_stmt = b.assign(Some(x), NodeKind::Const, Some(U32), vec![Operand::Int(2)]);
    b.end();
    b.ret(vec![]);
    let body = b.finish();

    let n = body.node(if_id);
    assert_eq!(n.next[0], then_stmt);
    assert_eq!(n.next[1], else_stmt);

    let close = n.partner.expect("if without end");
    assert_eq!(body.node(close).kind, NodeKind::End);
    assert_eq!(body.node(close).partner, Some(if_id));
    // Both arm tails converge on the closing node; the then arm comes
    // first.
    assert_eq!(body.node(close).prev[0], then_stmt);
    assert!(body.node(close).prev.contains(&else_stmt));
}

#[test]
fn branch_depth_counts_enclosing_constructs() {
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let fty = sync_fty(&mut types);

    let mut b = FuncBuilder::new(&types, &mut pool, "f", fty);
    let outer = b.block();
    let head = b.loop_();
    let leave: NodeId = b.br_if(Operand::Int(0), outer);
    let again: NodeId = b.br(head);
    b.end();
    b.end();
    b.ret(vec![]);
    let body = b.finish();

    // Leaving the block crosses the loop; continuing the loop crosses
    // nothing.
    assert_eq!(body.node(leave).args[1], Operand::Int(1));
    assert_eq!(body.node(leave).partner, Some(outer));
    assert_eq!(body.node(again).args[0], Operand::Int(0));
    assert_eq!(body.node(again).partner, Some(head));
}
