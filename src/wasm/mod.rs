//! Structured wasm32-style target model.

mod inst;
mod module;

pub use inst::{
    BinOp, Callee, Imm, Inst, LoadWidth, RuntimeFn, StackType, StoreWidth, UnOp,
};
pub use module::{Func, FuncId, FuncSig, Global, Module};
