use clap::Parser as ClapParser;

use waft::ir::types::{CallConv, FuncType, ScalarType, TypeTable, ValType};
use waft::ir::{FuncBuilder, IrCallee, NodeKind, Operand, VarPool};
use waft::lower::Backend;
use waft::wasm::BinOp;

/// Builds a small demo module: an exported `sum` function and a coroutine
/// that yields once per counted tick.
#[derive(ClapParser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma-separated list of things to dump: ir,wat
    #[clap(long)]
    dump: Option<String>,
}

fn main() {
    let args = Args::parse();
    let dump: Vec<&str> = args
        .dump
        .as_deref()
        .map(|d| d.split(',').collect())
        .unwrap_or_default();

    let u32t = ValType::Scalar(ScalarType::U32);
    let mut types = TypeTable::default();
    let mut pool = VarPool::new();
    let mut backend = Backend::new();

    let sum_ty = types.add_func(FuncType {
        params: vec![u32t],
        result: Some(u32t),
        conv: CallConv::Fyr,
    });
    let ticker_ty = types.add_func(FuncType {
        params: vec![u32t],
        result: None,
        conv: CallConv::FyrCoroutine,
    });

    let sum_id = backend.declare_function("sum");
    let ticker_id = backend.declare_function("ticker");

    // sum(n) = 0 + 1 + ... + (n - 1)
    let mut b = FuncBuilder::new(&types, &mut pool, "sum", sum_ty);
    let n = b.decl_param("n", u32t);
    b.decl_result("ret", u32t);
    let acc = b.decl_var("acc", u32t);
    let i = b.decl_var("i", u32t);
    b.assign(Some(acc), NodeKind::Const, Some(u32t), vec![Operand::Int(0)]);
    b.assign(Some(i), NodeKind::Const, Some(u32t), vec![Operand::Int(0)]);
    let outer = b.block();
    let head = b.loop_();
    let done = b.expr(
        NodeKind::Binary(BinOp::GeU),
        u32t,
        vec![Operand::Var(i), Operand::Var(n)],
    );
    b.br_if(done, outer);
    b.assign(
        Some(acc),
        NodeKind::Binary(BinOp::Add),
        Some(u32t),
        vec![Operand::Var(acc), Operand::Var(i)],
    );
    b.assign(
        Some(i),
        NodeKind::Binary(BinOp::Add),
        Some(u32t),
        vec![Operand::Var(i), Operand::Int(1)],
    );
    b.br(head);
    b.end();
    b.end();
    b.ret(vec![Operand::Var(acc)]);
    backend.define_function(sum_id, b.finish(), Some("sum"));

    // ticker(n): spawnable coroutine yielding n times.
    let mut b = FuncBuilder::new(&types, &mut pool, "ticker", ticker_ty);
    let n = b.decl_param("n", u32t);
    let i = b.decl_var("i", u32t);
    b.assign(Some(i), NodeKind::Const, Some(u32t), vec![Operand::Int(0)]);
    let outer = b.block();
    let head = b.loop_();
    let done = b.expr(
        NodeKind::Binary(BinOp::GeU),
        u32t,
        vec![Operand::Var(i), Operand::Var(n)],
    );
    b.br_if(done, outer);
    b.yield_();
    b.assign(
        Some(i),
        NodeKind::Binary(BinOp::Add),
        Some(u32t),
        vec![Operand::Var(i), Operand::Int(1)],
    );
    b.br(head);
    b.end();
    b.end();
    b.ret(vec![]);
    backend.define_function(ticker_id, b.finish(), None);

    // run(n): spawn a ticker, then sum.
    let run_ty = types.add_func(FuncType {
        params: vec![u32t],
        result: Some(u32t),
        conv: CallConv::Fyr,
    });
    let run_id = backend.declare_function("run");
    let mut b = FuncBuilder::new(&types, &mut pool, "run", run_ty);
    let n = b.decl_param("n", u32t);
    b.decl_result("ret", u32t);
    let out = b.decl_var("out", u32t);
    b.spawn(ticker_ty, IrCallee::Func(ticker_id), vec![Operand::Var(n)]);
    b.call(
        Some(out),
        sum_ty,
        IrCallee::Func(sum_id),
        vec![Operand::Var(n)],
    );
    b.ret(vec![Operand::Var(out)]);
    backend.define_function(run_id, b.finish(), Some("run"));

    let emit_ir = dump.contains(&"ir");
    match backend.generate_module(&types, &mut pool, emit_ir) {
        Ok((wat, trace)) => {
            if let Some(trace) = trace {
                println!("============ IR ===============");
                println!("{trace}");
            }
            if dump.is_empty() || dump.contains(&"wat") {
                println!("{wat}");
            }
        }
        Err(e) => {
            eprintln!("[ERROR] {e}");
            std::process::exit(1);
        }
    }
}
