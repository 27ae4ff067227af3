//! Storage descriptors and frame layouts.
//!
//! Every variable of a function ends up with exactly one primary [`Storage`]
//! and possibly a shadow slot in the vars frame (collector-visible or
//! suspension-surviving). Frames grow downward on the shadow stack; within
//! a frame, fields get natural alignment in append order, so layout is a
//! deterministic function of allocation order.

use crate::ir::types::{align_to, FuncType, TypeTable, ValType};
use crate::ir::ScalarType;

/// Where a value lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// A target local, by absolute index.
    Local(u32),
    /// A symbolic pool slot; rebased to `Local` once reserved locals are
    /// known.
    LocalSlot(u32),
    /// Byte offset into the function's vars frame (bp-relative).
    Vars(u32),
    /// Byte offset into the caller-built params frame.
    Params(u32),
    /// Byte offset into the caller-visible result frame.
    Result(u32),
    /// A direct target-level result, by result index.
    LocalResult(u32),
    /// A scalar module global, by global index.
    Global(u32),
    /// A fixed linear-memory address in the module's data segment.
    GlobalHeap(u32),
    /// Address of an interned string record.
    GlobalStrings(u32),
}

/// A stack frame under construction: result, params or vars frame of a
/// function, or a call-site frame.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    fields: Vec<(String, ValType, u32)>,
    raw_size: u32,
    align: u32,
}

impl FrameLayout {
    pub fn new() -> FrameLayout {
        FrameLayout {
            fields: Vec::new(),
            raw_size: 0,
            align: 1,
        }
    }

    /// Appends a field and returns its byte offset.
    pub fn add_field(&mut self, types: &TypeTable, name: &str, ty: ValType) -> u32 {
        let fa = types.align_of(ty);
        self.align = self.align.max(fa);
        let offset = align_to(self.raw_size, fa);
        self.fields.push((name.to_string(), ty, offset));
        self.raw_size = offset + types.size_of(ty);
        offset
    }

    /// Appends all fields of another layout, preserving their order.
    pub fn extend(&mut self, types: &TypeTable, other: &FrameLayout) {
        for (name, ty, _) in &other.fields {
            self.add_field(types, name, *ty);
        }
    }

    /// `func` names the function whose frame this is, for diagnostics.
    pub fn field_offset(&self, name: &str, func: &str) -> u32 {
        for (n, _, off) in &self.fields {
            if n == name {
                return *off;
            }
        }
        panic!("unknown field {} in frame of {}", name, func);
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _, _)| n == name)
    }

    /// Frame size, rounded up to the frame's alignment.
    pub fn size(&self) -> u32 {
        align_to(self.raw_size, self.align)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, ValType, u32)] {
        &self.fields
    }
}

/// The call-site frame of a function type: aggregate parameters are passed
/// through memory as `$p{i}`, and the result travels through memory when it
/// is an aggregate or when the callee can suspend.
pub fn call_frame(types: &TypeTable, ft: &FuncType) -> FrameLayout {
    let mut frame = FrameLayout::new();
    for (i, p) in ft.params.iter().enumerate() {
        if matches!(p, ValType::Struct(_)) {
            frame.add_field(types, &format!("$p{}", i), *p);
        }
    }
    if let Some(result) = ft.result {
        if matches!(result, ValType::Struct(_)) || ft.is_async() {
            frame.add_field(types, "$result", result);
        }
    }
    frame
}

/// The vars-frame header of a coroutine: resume bookkeeping the scheduler
/// reads and writes.
pub fn coroutine_frame_header(types: &TypeTable) -> FrameLayout {
    let mut h = FrameLayout::new();
    h.add_field(types, "$func", ValType::Scalar(ScalarType::U32));
    h.add_field(types, "$sp", ValType::Scalar(ScalarType::U32));
    h.add_field(types, "$step", ValType::Scalar(ScalarType::U32));
    h.add_field(types, "$prevFrame", ValType::Scalar(ScalarType::Addr));
    h
}

#[cfg(test)]
#[path = "tests/t_storage.rs"]
mod t_storage;
