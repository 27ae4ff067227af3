//! Lowering backend from a typed register IR to a wasm32-style module.
//!
//! The pipeline: build function bodies with [`ir::FuncBuilder`], register
//! them with [`lower::Backend`], and generate the module text. Coroutine
//! bodies are rewritten into step-dispatched state machines on the way
//! down; everything else lowers structurally.

pub mod ir;
pub mod lower;
pub mod wasm;
