//! Lowering of the register IR to a linear-memory target module.
//!
//! [`Backend`] is the entry point: declare functions and globals, hand in
//! finished bodies, then call [`Backend::generate_module`]. Synchronous
//! functions lower to plain target functions; coroutine bodies run through
//! the step transformer first and come out as resumable state machines.
//!
//! Memory layout at run time: the constant data segment sits at the bottom
//! (address zero stays unused so it can act as null), the garbage-collected
//! heap follows, and each stack grows downward from the top of its region.

mod emit;
mod error;
mod func;
mod slots;
mod storage;
mod value;

pub use error::LowerError;
pub use func::FuncLower;
pub use storage::{FrameLayout, Storage};

use indexmap::IndexMap;

use crate::ir::format::format_body;
use crate::ir::types::{FuncTypeId, ScalarType, TypeTable, ValType};
use crate::ir::{Body, ConstData, StepTransformer, VarId, VarPool};
use crate::wasm::{Callee, Func, FuncId, FuncSig, Imm, Inst, Module, RuntimeFn, StackType};

/// Step argument of an activation that has never run.
pub const STEP_FRESH: u32 = 0xffff_ffff;
/// Step argument of a freshly spawned coroutine: run step 0 when first
/// scheduled. Step numbers at or above this value are sentinels.
pub const STEP_SPAWNED: u32 = 0xffff_fffe;

/// Heap region reserved above the data segment, 1 MiB.
pub const HEAP_SIZE: u32 = 16 << 16;
/// Stack region per coroutine, 64 KiB.
pub const STACK_SIZE: u32 = 1 << 16;

/// Index of the heap-base global. It is the first global of every module.
pub(crate) const HEAP_GLOBAL: u32 = 0;

struct FuncEntry {
    id: FuncId,
    body: Option<Body>,
    export: Option<String>,
    is_init: bool,
}

/// Collects declarations and bodies for one module and drives lowering.
pub struct Backend {
    module: Module,
    funcs: Vec<FuncEntry>,
    global_vars: Vec<VarId>,
    global_storage: IndexMap<VarId, Storage>,
}

impl Backend {
    pub fn new() -> Backend {
        let mut module = Module::new();
        // Type index 0 is the callback signature: (frame, coroutine) ->
        // frame. `continue_coroutine` dispatches through it.
        module.add_sig(FuncSig {
            params: vec![StackType::I32, StackType::I32],
            results: vec![StackType::I32],
        });
        // The heap base is only known once the data segment is complete;
        // the initializer is patched in generate_module.
        module.add_global("heap".to_string(), StackType::I32, false, Imm::Int(0));
        Backend {
            module,
            funcs: Vec::new(),
            global_vars: Vec::new(),
            global_storage: IndexMap::new(),
        }
    }

    /// Imports a host function. Aggregate parameters are not representable
    /// across the host boundary and are skipped; the stack pointer is
    /// appended as the last parameter.
    pub fn import_function(
        &mut self,
        types: &TypeTable,
        from: &str,
        name: &str,
        fty: FuncTypeId,
    ) -> FuncId {
        let ft = types.func(fty);
        let mut params = Vec::new();
        for p in &ft.params {
            if let ValType::Scalar(s) = p {
                params.push(s.stack_type());
            }
        }
        params.push(StackType::I32);
        let mut results = Vec::new();
        if let Some(ValType::Scalar(s)) = ft.result {
            results.push(s.stack_type());
        }
        self.module
            .add_import(from, name.to_string(), FuncSig { params, results })
    }

    pub fn declare_function(&mut self, name: &str) -> FuncId {
        let id = self.module.declare_func(name.to_string());
        self.funcs.push(FuncEntry {
            id,
            body: None,
            export: None,
            is_init: false,
        });
        id
    }

    /// Declares the module initializer. It bootstraps the stack pointer
    /// from the memory size instead of taking it as a parameter.
    pub fn declare_init_function(&mut self, name: &str) -> FuncId {
        let id = self.declare_function(name);
        self.entry_mut(id).is_init = true;
        id
    }

    pub fn declare_global_var(&mut self, pool: &mut VarPool, name: &str, ty: ValType) -> VarId {
        let v = pool.alloc(name.to_string(), Some(ty), true);
        self.global_vars.push(v);
        v
    }

    pub fn define_function(&mut self, id: FuncId, body: Body, export: Option<&str>) {
        let e = self.entry_mut(id);
        e.body = Some(body);
        e.export = export.map(str::to_string);
    }

    /// Registers `f` for indirect calls and returns its table slot.
    pub fn add_function_to_table(&mut self, f: FuncId) -> u32 {
        self.module.add_func_to_table(f)
    }

    fn entry_mut(&mut self, id: FuncId) -> &mut FuncEntry {
        self.funcs
            .iter_mut()
            .find(|e| e.id == id)
            .unwrap_or_else(|| panic!("undeclared function"))
    }

    /// Lowers everything and renders the module text. With `emit_ir` the
    /// transformed IR of each function is returned alongside.
    pub fn generate_module(
        &mut self,
        types: &TypeTable,
        pool: &mut VarPool,
        emit_ir: bool,
    ) -> Result<(String, Option<String>), LowerError> {
        self.assign_global_storage(types, pool);

        let mut trace = if emit_ir { Some(String::new()) } else { None };
        let mut transformer = StepTransformer::new();
        for i in 0..self.funcs.len() {
            let mut body = match self.funcs[i].body.take() {
                Some(b) => b,
                None => continue,
            };
            if body.is_async {
                transformer.transform(types, &mut body);
            }
            if let Some(t) = trace.as_mut() {
                t.push_str(&format_body(types, pool, &body));
                t.push('\n');
            }
            let id = self.funcs[i].id;
            let is_init = self.funcs[i].is_init;
            FuncLower::new(types, pool, &mut self.module, &self.global_storage, id, is_init)
                .generate(&body)?;
            if let Some(export) = self.funcs[i].export.clone() {
                self.export_function(id, &export)?;
            }
        }

        self.module.reserve_memory(HEAP_SIZE + STACK_SIZE);
        let text_size = self.module.text_size();
        self.module
            .set_global_init(HEAP_GLOBAL, Imm::Int(i64::from(text_size)));
        Ok((self.module.to_wat(), trace))
    }

    /// Storage assignment for module-level variables. Constants go into
    /// the data pools, addressable or aggregate variables into reserved
    /// heap memory, everything else into a mutable scalar global.
    fn assign_global_storage(&mut self, types: &TypeTable, pool: &VarPool) {
        for &v in &self.global_vars {
            let var = pool.get(v);
            let ty = var
                .ty
                .unwrap_or_else(|| panic!("untyped global {}", var.name));
            let storage = match &var.constant {
                Some(ConstData::Str(s)) => Storage::GlobalStrings(self.module.add_string(s)),
                Some(ConstData::Bytes(b)) => Storage::GlobalHeap(self.module.add_binary(b)),
                None => {
                    let aggregate = matches!(ty, ValType::Struct(_));
                    let ptr = ty == ValType::Scalar(ScalarType::Ptr);
                    if var.addressable || aggregate || ptr {
                        let off = self
                            .module
                            .add_zeroed(types.size_of(ty), types.align_of(ty));
                        Storage::GlobalHeap(off)
                    } else {
                        let st = match ty {
                            ValType::Scalar(s) => s.stack_type(),
                            ValType::Struct(_) => unreachable!(),
                        };
                        let init = match st {
                            StackType::F32 | StackType::F64 => Imm::Float(0.0),
                            _ => Imm::Int(0),
                        };
                        let idx = self.module.add_global(var.name.clone(), st, true, init);
                        Storage::Global(idx)
                    }
                }
            };
            self.global_storage.insert(v, storage);
        }
    }

    /// Host wrapper for an exported function: the stack pointer parameter
    /// is stripped and the call runs inside a host coroutine.
    fn export_function(&mut self, id: FuncId, export: &str) -> Result<(), LowerError> {
        let inner = self.module.func(id);
        let mut params = inner.params.clone();
        params.pop();
        let results = inner.results.clone();
        if results.len() > 1 {
            return Err(LowerError::ExportResultArity {
                func: inner.name.clone(),
            });
        }
        let mut code = Vec::new();
        for i in 0..params.len() as u32 {
            code.push(Inst::GetLocal(i));
        }
        code.push(Inst::i32_const(0));
        code.push(Inst::Call(Callee::Runtime(RuntimeFn::StartHostCoroutine)));
        code.push(Inst::Call(Callee::Index(id.0)));
        code.push(Inst::i32_const(0));
        code.push(Inst::Call(Callee::Runtime(RuntimeFn::FinishHostCoroutine)));
        if !results.is_empty() {
            code.push(Inst::Return);
        }
        let name = format!("{}.host", export);
        let wid = self.module.declare_func(name.clone());
        self.module.set_func(
            wid,
            Func {
                name,
                import_from: None,
                params,
                results,
                locals: Vec::new(),
                body: code,
                export_as: Some(export.to_string()),
            },
        );
        Ok(())
    }

    /// The finished module, for callers that need more than the text.
    pub fn module(&self) -> &Module {
        &self.module
    }
}

impl Default for Backend {
    fn default() -> Backend {
        Backend::new()
    }
}

#[cfg(test)]
#[path = "tests/t_lower.rs"]
mod t_lower;
