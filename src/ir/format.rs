//! Human-readable dump of a function body, for tracing and tests.

use std::fmt::Write as _;

use crate::ir::node::{Body, NodeId, NodeKind, Operand, VarPool};
use crate::ir::types::{ScalarType, TypeTable, ValType};

fn scalar_name(s: ScalarType) -> &'static str {
    match s {
        ScalarType::U8 => "u8",
        ScalarType::S8 => "s8",
        ScalarType::U16 => "u16",
        ScalarType::S16 => "s16",
        ScalarType::U32 => "u32",
        ScalarType::S32 => "s32",
        ScalarType::U64 => "u64",
        ScalarType::S64 => "s64",
        ScalarType::F32 => "f32",
        ScalarType::F64 => "f64",
        ScalarType::Addr => "addr",
        ScalarType::Ptr => "ptr",
    }
}

fn type_name(types: &TypeTable, ty: ValType) -> String {
    match ty {
        ValType::Scalar(s) => scalar_name(s).to_string(),
        ValType::Struct(id) => match &types.struct_def(id).name {
            Some(n) => n.clone(),
            None => format!("struct#{}", id.0),
        },
    }
}

fn kind_name(kind: NodeKind) -> String {
    match kind {
        NodeKind::Define => "define".to_string(),
        NodeKind::DeclParam => "decl_param".to_string(),
        NodeKind::DeclResult => "decl_result".to_string(),
        NodeKind::DeclVar => "decl_var".to_string(),
        NodeKind::Const => "const".to_string(),
        NodeKind::Copy => "copy".to_string(),
        NodeKind::Struct => "struct".to_string(),
        NodeKind::Load => "load".to_string(),
        NodeKind::Store => "store".to_string(),
        NodeKind::AddrOf => "addr_of".to_string(),
        NodeKind::Alloc => "alloc".to_string(),
        NodeKind::Binary(op) => op.mnemonic().to_string(),
        NodeKind::Unary(op) => op.mnemonic().to_string(),
        NodeKind::Convert(_) => "convert".to_string(),
        NodeKind::Call => "call".to_string(),
        NodeKind::CallIndirect => "call_indirect".to_string(),
        NodeKind::CallBegin => "call_begin".to_string(),
        NodeKind::CallIndirectBegin => "call_indirect_begin".to_string(),
        NodeKind::CallEnd => "call_end".to_string(),
        NodeKind::Spawn => "spawn".to_string(),
        NodeKind::SpawnIndirect => "spawn_indirect".to_string(),
        NodeKind::Yield => "yield".to_string(),
        NodeKind::Return => "return".to_string(),
        NodeKind::Trap => "trap".to_string(),
        NodeKind::Block => "block".to_string(),
        NodeKind::Loop => "loop".to_string(),
        NodeKind::If => "if".to_string(),
        NodeKind::End => "end".to_string(),
        NodeKind::Br => "br".to_string(),
        NodeKind::BrIf => "br_if".to_string(),
        NodeKind::Step => "step".to_string(),
        NodeKind::GotoStep => "goto_step".to_string(),
        NodeKind::GotoStepIf => "goto_step_if".to_string(),
    }
}

fn operand(pool: &VarPool, op: &Operand) -> String {
    match op {
        Operand::Int(v) => format!("{}", v),
        Operand::Float(v) => format!("{}", v),
        Operand::Var(v) => format!("%{}", pool.get(*v).name.trim_start_matches('%')),
        Operand::Node(_) => "<node>".to_string(),
    }
}

/// Renders one body as indented text, one node per line.
pub fn format_body(types: &TypeTable, pool: &VarPool, body: &Body) -> String {
    let mut out = String::new();
    let entry = body.node(body.entry);
    let _ = writeln!(out, "define {} {{", body.name);
    if let Some(next) = entry.next.first().copied() {
        walk(types, pool, body, next, 1, &mut out);
    }
    out.push_str("}\n");
    out
}

fn walk(
    types: &TypeTable,
    pool: &VarPool,
    body: &Body,
    from: NodeId,
    indent: usize,
    out: &mut String,
) {
    let mut cur = Some(from);
    while let Some(id) = cur {
        let n = body.node(id);
        match n.kind {
            NodeKind::End => return,
            NodeKind::If => {
                line(types, pool, body, id, indent, out);
                if let Some(then) = n.next.first().copied() {
                    walk(types, pool, body, then, indent + 1, out);
                }
                if let Some(alt) = n.next.get(1).copied() {
                    indent_line(indent, out);
                    out.push_str("else\n");
                    walk(types, pool, body, alt, indent + 1, out);
                }
                indent_line(indent, out);
                out.push_str("end\n");
                cur = n.partner.and_then(|e| body.node(e).next.first().copied());
            }
            NodeKind::Block | NodeKind::Loop => {
                line(types, pool, body, id, indent, out);
                if let Some(inner) = n.next.first().copied() {
                    walk(types, pool, body, inner, indent + 1, out);
                }
                indent_line(indent, out);
                out.push_str("end\n");
                cur = n.partner.and_then(|e| body.node(e).next.first().copied());
            }
            _ => {
                line(types, pool, body, id, indent, out);
                cur = n.next.first().copied();
            }
        }
    }
}

fn indent_line(indent: usize, out: &mut String) {
    for _ in 0..indent {
        out.push_str("    ");
    }
}

fn line(
    types: &TypeTable,
    pool: &VarPool,
    body: &Body,
    id: NodeId,
    indent: usize,
    out: &mut String,
) {
    let n = body.node(id);
    indent_line(indent, out);
    if let Some(v) = n.assign {
        let _ = write!(out, "%{} = ", pool.get(v).name.trim_start_matches('%'));
    }
    out.push_str(&kind_name(n.kind));
    if let Some(name) = &n.name {
        let _ = write!(out, " {}", name);
    }
    if let Some(ty) = n.ty {
        let _ = write!(out, " {}", type_name(types, ty));
    }
    for (i, a) in n.args.iter().enumerate() {
        if i == 0 {
            out.push(' ');
        } else {
            out.push_str(", ");
        }
        out.push_str(&operand(pool, a));
    }
    out.push('\n');
}
