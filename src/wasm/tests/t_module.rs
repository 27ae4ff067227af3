use super::*;

use indoc::indoc;

use crate::wasm::{BinOp, Inst, RuntimeFn, StackType};

fn func(name: &str, params: &[StackType], results: &[StackType], body: Vec<Inst>) -> Func {
    Func {
        name: name.to_string(),
        import_from: None,
        params: params.to_vec(),
        results: results.to_vec(),
        locals: Vec::new(),
        body,
        export_as: None,
    }
}

#[test]
fn renders_a_minimal_function() {
    let mut m = Module::new();
    let id = m.declare_func("add".to_string());
    m.set_func(
        id,
        func(
            "add",
            &[StackType::I32, StackType::I32],
            &[StackType::I32],
            vec![
                Inst::GetLocal(0),
                Inst::GetLocal(1),
                Inst::Binary(StackType::I32, BinOp::Add),
            ],
        ),
    );

    assert_eq!(
        m.to_wat(),
        indoc! {r#"
            (module
              (memory (export "memory") 1)
              (func $add (param i32) (param i32) (result i32)
                get_local 0
                get_local 1
                i32.add
              )
            )
        "#}
    );
}

#[test]
fn nesting_indents_one_level_per_construct() {
    let mut m = Module::new();
    let id = m.declare_func("f".to_string());
    m.set_func(
        id,
        func(
            "f",
            &[],
            &[],
            vec![
                Inst::Block,
                Inst::Loop,
                Inst::i32_const(0),
                Inst::If,
                Inst::Br(2),
                Inst::Else,
                Inst::Br(3),
                Inst::End,
                Inst::Br(0),
                Inst::End,
                Inst::End,
            ],
        ),
    );

    assert_eq!(
        m.to_wat(),
        indoc! {r#"
            (module
              (memory (export "memory") 1)
              (func $f
                block
                  loop
                    i32.const 0
                    if
                      br 2
                    else
                      br 3
                    end
                    br 0
                  end
                end
              )
            )
        "#}
    );
}

#[test]
fn runtime_calls_become_imports_in_first_use_order() {
    let mut m = Module::new();
    let id = m.declare_func("f".to_string());
    m.set_func(
        id,
        func(
            "f",
            &[],
            &[],
            vec![
                Inst::Call(Callee::Runtime(RuntimeFn::Alloc)),
                Inst::Call(Callee::Runtime(RuntimeFn::Copy)),
                Inst::Call(Callee::Runtime(RuntimeFn::Alloc)),
            ],
        ),
    );

    let wat = m.to_wat();
    let alloc = wat
        .find("(import \"runtime\" \"alloc\" (func $alloc (param i32) (param i32) (param i32) (param i32) (result i32)))")
        .expect("missing alloc import");
    let copy = wat
        .find("(import \"runtime\" \"copy\" (func $copy (param i32) (param i32) (param i32) (param i32)))")
        .expect("missing copy import");
    assert!(alloc < copy, "imports out of first-use order:\n{wat}");
}

#[test]
fn string_records_are_deduplicated() {
    let mut m = Module::new();

    // Offset 0 stays reserved for null.
    assert_eq!(m.add_string("hi"), 8);
    assert_eq!(m.add_string("hi"), 8);
    // Next record starts 4-aligned after the 6 bytes of the first.
    assert_eq!(m.add_string("abc"), 16);

    let wat = m.to_wat();
    assert!(
        wat.contains("(data (i32.const 0) \"\\00\\00\\00\\00\\00\\00\\00\\00\\02\\00\\00\\00hi"),
        "bad data segment:\n{wat}"
    );
}

#[test]
fn zeroed_regions_respect_alignment() {
    let mut m = Module::new();
    assert_eq!(m.add_zeroed(12, 8), 8);
    assert_eq!(m.add_zeroed(4, 4), 20);
    // Rounded to 8 bytes.
    assert_eq!(m.text_size(), 24);
}

#[test]
fn reserved_memory_raises_the_page_count() {
    let mut m = Module::new();
    assert!(m.to_wat().contains("(memory (export \"memory\") 1)"));
    m.reserve_memory(3 * 65536);
    assert!(m.to_wat().contains("(memory (export \"memory\") 4)"));
}

#[test]
fn signatures_are_interned() {
    let mut m = Module::new();
    let sig = FuncSig {
        params: vec![StackType::I32],
        results: vec![StackType::I64],
    };
    assert_eq!(m.add_sig(sig.clone()), 0);
    assert_eq!(m.add_sig(sig), 0);
    assert_eq!(
        m.add_sig(FuncSig {
            params: vec![],
            results: vec![],
        }),
        1
    );

    let wat = m.to_wat();
    assert!(wat.contains("(type $t0 (func (param i32) (result i64)))"));
    assert!(wat.contains("(type $t1 (func))"));
}
