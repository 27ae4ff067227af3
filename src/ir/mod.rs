//! Typed register IR: types, node graph, builder and the coroutine step
//! transformer.

mod builder;
pub mod format;
mod node;
mod steps;
pub mod types;

pub use builder::FuncBuilder;
pub use node::{
    Body, ConstData, IrCallee, Node, NodeId, NodeKind, Operand, VarId, VarPool, Variable,
};
pub use steps::{StepTransformer, END_STEP};
pub use types::{
    align_to, CallConv, Field, FuncType, FuncTypeId, ScalarType, StructDef, SysCall, TypeId,
    TypeTable, ValType,
};

/// Convert operations, re-exported for builders of arithmetic-heavy code.
pub use node::ConvertOp;
