//! Per-function lowering driver.
//!
//! A [`FuncLower`] owns the state of one function while it is being turned
//! into target code: the three shadow-stack frames, the variable storage
//! maps, the local-slot pool and the step bookkeeping of coroutines.
//! Synchronous functions lower to a straight body; coroutines lower to a
//! step dispatch loop with a resume header and a suspension tail.

use indexmap::IndexMap;

use crate::ir::types::{ScalarType, TypeTable, ValType};
use crate::ir::{Body, ConstData, NodeId, NodeKind, Operand, VarId, VarPool};
use crate::lower::error::LowerError;
use crate::lower::slots::{SlotPool, SlotUse};
use crate::lower::storage::{call_frame, FrameLayout, Storage};
use crate::lower::{HEAP_GLOBAL, STEP_FRESH, STEP_SPAWNED};
use crate::wasm::{
    BinOp, Callee, Func, FuncId, Inst, LoadWidth, Module, RuntimeFn, StackType, StoreWidth,
};

pub struct FuncLower<'a> {
    pub(super) types: &'a TypeTable,
    pub(super) pool: &'a mut VarPool,
    pub(super) module: &'a mut Module,
    pub(super) global_storage: &'a IndexMap<VarId, Storage>,
    pub(super) func_id: FuncId,
    pub(super) func_name: String,
    pub(super) is_async: bool,
    pub(super) is_init: bool,

    pub(super) wf_params: Vec<StackType>,
    pub(super) wf_results: Vec<StackType>,
    pub(super) wf_locals: Vec<StackType>,

    pub(super) result_frame: FrameLayout,
    pub(super) params_frame: FrameLayout,
    pub(super) vars_frame: FrameLayout,

    pub(super) var_storage: IndexMap<VarId, Storage>,
    /// Write-through shadow offsets in the vars frame for collector-visible
    /// locals.
    pub(super) var_gc_storage: IndexMap<VarId, u32>,
    /// Save-on-suspend shadow offsets for locals that cross a step boundary.
    pub(super) var_async_storage: IndexMap<VarId, u32>,
    pub(super) parameter_vars: Vec<VarId>,
    pub(super) return_vars: Vec<VarId>,
    pub(super) local_vars: Vec<VarId>,

    pub(super) slot_pool: SlotPool,

    pub(super) steps: Vec<NodeId>,
    pub(super) steps_by_name: IndexMap<String, u32>,
    pub(super) async_calls: Vec<NodeId>,
    pub(super) step_code: Vec<Vec<Inst>>,
    pub(super) async_call_code: Vec<Vec<Inst>>,

    pub(super) sp_local: u32,
    pub(super) bp_local: Option<u32>,
    pub(super) step_local: u32,
    pub(super) async_ret_local: u32,

    tmp_locals: Vec<(u32, StackType, bool)>,
    tmp_i32: Option<u32>,
    tmp_i64: Option<u32>,
    tmp_f32: Option<u32>,
    tmp_f64: Option<u32>,
    tmp_src: Option<u32>,
    tmp_dest: Option<u32>,
}

impl<'a> FuncLower<'a> {
    pub fn new(
        types: &'a TypeTable,
        pool: &'a mut VarPool,
        module: &'a mut Module,
        global_storage: &'a IndexMap<VarId, Storage>,
        func_id: FuncId,
        is_init: bool,
    ) -> FuncLower<'a> {
        let func_name = module.func_name(func_id).to_string();
        FuncLower {
            types,
            pool,
            module,
            global_storage,
            func_id,
            func_name,
            is_async: false,
            is_init,
            wf_params: Vec::new(),
            wf_results: Vec::new(),
            wf_locals: Vec::new(),
            result_frame: FrameLayout::new(),
            params_frame: FrameLayout::new(),
            vars_frame: FrameLayout::new(),
            var_storage: IndexMap::new(),
            var_gc_storage: IndexMap::new(),
            var_async_storage: IndexMap::new(),
            parameter_vars: Vec::new(),
            return_vars: Vec::new(),
            local_vars: Vec::new(),
            slot_pool: SlotPool::new(),
            steps: Vec::new(),
            steps_by_name: IndexMap::new(),
            async_calls: Vec::new(),
            step_code: Vec::new(),
            async_call_code: Vec::new(),
            sp_local: 0,
            bp_local: None,
            step_local: 0,
            async_ret_local: 0,
            tmp_locals: Vec::new(),
            tmp_i32: None,
            tmp_i64: None,
            tmp_f32: None,
            tmp_f64: None,
            tmp_src: None,
            tmp_dest: None,
        }
    }

    /// Lowers `body` and installs the finished function in the module. For
    /// coroutines the step transformer must already have run.
    pub fn generate(mut self, body: &Body) -> Result<(), LowerError> {
        self.is_async = body.is_async;
        if self.is_async {
            self.generate_async(body)
        } else {
            self.generate_sync(body)
        }
    }

    fn generate_sync(&mut self, body: &Body) -> Result<(), LowerError> {
        let entry = body.entry;
        let end = match body.node(entry).partner {
            Some(e) => e,
            None => panic!("unterminated body in function {}", self.func_name),
        };
        let start = body.node(entry).next[0];

        self.traverse(body, start, end, None);
        let mut used: SlotUse = Vec::new();
        self.analyze_storage(body, entry, Some(end), &mut used)?;

        let mut code: Vec<Inst> = Vec::new();

        if self.is_init {
            // The init function bootstraps the shadow stack at the end of
            // linear memory before anything else can run.
            self.sp_local = (self.wf_params.len() + self.wf_locals.len()) as u32;
            self.wf_locals.push(StackType::I32);
            code.push(Inst::CurrentMemory);
            code.push(Inst::i32_const(16));
            code.push(Inst::Binary(StackType::I32, BinOp::Shl));
            code.push(Inst::TeeLocal(self.sp_local));
            code.push(Inst::Call(Callee::Runtime(RuntimeFn::InitializeMemory)));
            code.push(Inst::SetLocal(self.sp_local));
        } else {
            self.sp_local = self.wf_params.len() as u32;
            self.wf_params.push(StackType::I32);
        }

        if self.vars_frame.size() > 0
            || self.params_frame.size() > 0
            || self.result_frame.size() > 0
        {
            self.bp_local = Some((self.wf_params.len() + self.wf_locals.len()) as u32);
            self.wf_locals.push(StackType::I32);
        }

        self.rebase_slots();

        if self.vars_frame.size() > 0 {
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::i32_const(self.vars_frame.size() as i64));
            code.push(Inst::Binary(StackType::I32, BinOp::Sub));
            code.push(Inst::TeeLocal(self.sp_local));
            code.push(Inst::SetLocal(self.bp()));
        } else if self.bp_local.is_some() {
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::SetLocal(self.bp()));
        }

        // Parameters living in locals but visible to the collector are
        // mirrored into the vars frame on entry.
        for v in self.parameter_vars.clone() {
            let alt = match self.var_gc_storage.get(&v) {
                Some(&off) => off,
                None => continue,
            };
            let idx = match self.storage_of(v) {
                Storage::Local(i) => i,
                _ => continue,
            };
            let sc = self.scalar_type_of(v);
            code.push(Inst::GetLocal(self.bp()));
            code.push(Inst::GetLocal(idx));
            code.push(Inst::Store {
                ty: sc.stack_type(),
                width: narrow_store(sc),
                offset: alt,
            });
        }

        self.emit_code(0, start, None, &mut code, 0, 0, body)?;

        self.install(code);
        Ok(())
    }

    fn generate_async(&mut self, body: &Body) -> Result<(), LowerError> {
        let entry = body.entry;
        let end = match body.node(entry).partner {
            Some(e) => e,
            None => panic!("unterminated body in function {}", self.func_name),
        };
        let start = body.node(entry).next[0];

        // Resume bookkeeping lives at the base of the vars frame.
        let header = super::storage::coroutine_frame_header(self.types);
        self.vars_frame.extend(self.types, &header);

        // The step selector is always the first parameter.
        self.step_local = self.wf_params.len() as u32;
        self.wf_params.push(StackType::I32);

        self.traverse(body, start, end, None);
        if self.steps.len() as u64 >= u64::from(STEP_SPAWNED) {
            return Err(LowerError::TooManySteps {
                func: self.func_name.clone(),
                count: self.steps.len(),
                max: STEP_SPAWNED,
            });
        }

        let mut used: SlotUse = Vec::new();
        self.analyze_storage(body, entry, Some(end), &mut used)?;

        self.sp_local = self.wf_params.len() as u32;
        self.wf_params.push(StackType::I32);
        // Returns the top-most unfinished frame, or zero on completion.
        self.wf_results.push(StackType::I32);

        self.bp_local = Some((self.wf_params.len() + self.wf_locals.len()) as u32);
        self.wf_locals.push(StackType::I32);
        self.async_ret_local = (self.wf_params.len() + self.wf_locals.len()) as u32;
        self.wf_locals.push(StackType::I32);

        self.rebase_slots();

        let mut code: Vec<Inst> = Vec::new();
        let prev_frame = self.vars_frame.field_offset("$prevFrame", &self.func_name);
        let sp_field = self.vars_frame.field_offset("$sp", &self.func_name);
        let step_field = self.vars_frame.field_offset("$step", &self.func_name);
        let func_field = self.vars_frame.field_offset("$func", &self.func_name);

        // Fresh or spawned invocations build a frame; resumed ones restore
        // the one stored by the previous suspension.
        code.push(Inst::GetLocal(self.step_local));
        code.push(Inst::i32_const(i64::from(STEP_SPAWNED)));
        code.push(Inst::Binary(StackType::I32, BinOp::GeU));
        code.push(Inst::If);
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::i32_const(self.vars_frame.size() as i64));
        code.push(Inst::Binary(StackType::I32, BinOp::Sub));
        code.push(Inst::TeeLocal(self.sp_local));
        code.push(Inst::TeeLocal(self.bp()));
        code.push(Inst::GetLocal(self.bp()));
        code.push(Inst::i32_const(0));
        code.push(Inst::Store {
            ty: StackType::I32,
            width: None,
            offset: prev_frame,
        });
        code.push(Inst::GetLocal(self.step_local));
        code.push(Inst::i32_const(i64::from(STEP_FRESH)));
        code.push(Inst::Binary(StackType::I32, BinOp::Eq));
        code.push(Inst::If);
        code.push(Inst::i32_const(0));
        code.push(Inst::SetLocal(self.step_local));
        code.push(Inst::End);
        code.push(Inst::Else);
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::TeeLocal(self.bp()));
        code.push(Inst::Load {
            ty: StackType::I32,
            width: None,
            offset: sp_field,
        });
        code.push(Inst::SetLocal(self.sp_local));
        for v in self.local_vars.clone() {
            let alt = match self.var_async_storage.get(&v) {
                Some(&off) => off,
                None => continue,
            };
            let idx = match self.storage_of(v) {
                Storage::Local(i) => i,
                _ => continue,
            };
            let sc = self.scalar_type_of(v);
            code.push(Inst::GetLocal(self.bp()));
            code.push(Inst::Load {
                ty: sc.stack_type(),
                width: narrow_load(sc),
                offset: alt,
            });
            code.push(Inst::SetLocal(idx));
        }
        code.push(Inst::End);

        // Step dispatch loop.
        code.push(Inst::Block);
        code.push(Inst::Loop);
        self.emit_steps(body)?;
        let mut targets: Vec<u32> = Vec::new();
        for i in 0..self.step_code.len() {
            code.push(Inst::Block);
            targets.push(i as u32);
        }
        for _ in 0..self.async_call_code.len() {
            code.push(Inst::Block);
        }
        // Default: leave the dispatch loop through the suspension tail.
        targets.push((self.step_code.len() + self.async_call_code.len() + 1) as u32);
        code.push(Inst::GetLocal(self.step_local));
        code.push(Inst::BrTable(targets));
        for c in std::mem::take(&mut self.step_code) {
            code.extend(c);
        }
        for c in std::mem::take(&mut self.async_call_code) {
            code.extend(c);
        }
        code.push(Inst::End);
        code.push(Inst::End);

        // Suspension tail: persist the resume state and hand the top-most
        // unfinished frame to the scheduler.
        code.push(Inst::GetLocal(self.step_local));
        code.push(Inst::i32_const(i64::from(STEP_SPAWNED)));
        code.push(Inst::Binary(StackType::I32, BinOp::Eq));
        code.push(Inst::If);
        code.push(Inst::i32_const(0));
        code.push(Inst::SetLocal(self.step_local));
        code.push(Inst::End);
        code.push(Inst::GetLocal(self.bp()));
        code.push(Inst::GetLocal(self.step_local));
        code.push(Inst::Store {
            ty: StackType::I32,
            width: None,
            offset: step_field,
        });
        code.push(Inst::GetLocal(self.bp()));
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::Store {
            ty: StackType::I32,
            width: None,
            offset: sp_field,
        });
        code.push(Inst::GetLocal(self.bp()));
        code.push(Inst::i32_const(i64::from(self.module.table_len())));
        code.push(Inst::Store {
            ty: StackType::I32,
            width: None,
            offset: func_field,
        });

        let mut needs_callback = false;
        let persisted: Vec<VarId> = self
            .parameter_vars
            .iter()
            .chain(self.local_vars.iter())
            .copied()
            .collect();
        for v in persisted {
            let alt = match self
                .var_gc_storage
                .get(&v)
                .or_else(|| self.var_async_storage.get(&v))
            {
                Some(&off) => off,
                None => continue,
            };
            let idx = match self.storage_of(v) {
                Storage::Local(i) => i,
                _ => continue,
            };
            if self.parameter_vars.contains(&v) {
                needs_callback = true;
            }
            let sc = self.scalar_type_of(v);
            code.push(Inst::GetLocal(self.bp()));
            code.push(Inst::GetLocal(idx));
            code.push(Inst::Store {
                ty: sc.stack_type(),
                width: narrow_store(sc),
                offset: alt,
            });
        }

        code.push(Inst::GetLocal(self.async_ret_local));
        code.push(Inst::If);
        code.push(Inst::GetLocal(self.async_ret_local));
        code.push(Inst::GetLocal(self.bp()));
        code.push(Inst::Store {
            ty: StackType::I32,
            width: None,
            offset: prev_frame,
        });
        code.push(Inst::GetLocal(self.async_ret_local));
        code.push(Inst::Return);
        code.push(Inst::End);
        code.push(Inst::GetLocal(self.bp()));
        code.push(Inst::Return);

        self.install(code);

        // The scheduler resumes a coroutine through the function table. When
        // parameters live in locals the table entry must be a trampoline
        // that reloads them from the frame first.
        if needs_callback {
            let cb_id = self
                .module
                .declare_func(format!("{}.callback", self.func_name));
            let mut code: Vec<Inst> = Vec::new();
            code.push(Inst::Comment(format!("CallbackFn of {}", self.func_name)));
            code.push(Inst::GetLocal(0));
            for v in self.parameter_vars.clone() {
                let alt = match self
                    .var_gc_storage
                    .get(&v)
                    .or_else(|| self.var_async_storage.get(&v))
                {
                    Some(&off) => off,
                    None => continue,
                };
                let sc = self.scalar_type_of(v);
                code.push(Inst::GetLocal(1));
                code.push(Inst::Load {
                    ty: sc.stack_type(),
                    width: narrow_load(sc),
                    offset: alt,
                });
            }
            code.push(Inst::GetLocal(1));
            code.push(Inst::Call(Callee::Index(self.func_id.0)));
            code.push(Inst::Return);
            let f = Func {
                name: format!("{}.callback", self.func_name),
                import_from: None,
                params: vec![StackType::I32, StackType::I32],
                results: vec![StackType::I32],
                locals: Vec::new(),
                body: code,
                export_as: None,
            };
            self.module.set_func(cb_id, f);
            self.module.add_func_to_table(cb_id);
        } else {
            self.module.add_func_to_table(self.func_id);
        }

        Ok(())
    }

    fn install(&mut self, code: Vec<Inst>) {
        let f = Func {
            name: self.func_name.clone(),
            import_from: None,
            params: self.wf_params.clone(),
            results: self.wf_results.clone(),
            locals: self.wf_locals.clone(),
            body: code,
            export_as: None,
        };
        self.module.set_func(self.func_id, f);
    }

    /// Collects steps and suspension points, and flags variables whose
    /// liveness crosses a step boundary.
    fn traverse(&mut self, body: &Body, start: NodeId, end: NodeId, mut step: Option<NodeId>) {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let args = body.node(id).args.clone();
            for a in &args {
                self.mark_operand(body, a, step);
            }
            if let Some(v) = body.node(id).assign {
                self.mark_var(v, step);
            }
            if id == end {
                break;
            }
            let n = body.node(id);
            match n.kind {
                NodeKind::Step => {
                    step = Some(id);
                    let name = n.name.clone().unwrap_or_default();
                    self.steps_by_name.insert(name, self.steps.len() as u32);
                    self.steps.push(id);
                    cur = n.next.first().copied();
                }
                NodeKind::If => {
                    if let Some(alt) = n.next.get(1).copied() {
                        let partner = n.partner.unwrap_or(end);
                        self.traverse(body, alt, partner, step);
                    }
                    cur = body.node(id).next.first().copied();
                }
                NodeKind::CallBegin | NodeKind::CallIndirectBegin | NodeKind::Yield => {
                    self.async_calls.push(id);
                    cur = n.next.first().copied();
                }
                _ => {
                    cur = n.next.first().copied();
                }
            }
        }
    }

    fn mark_operand(&mut self, body: &Body, op: &Operand, step: Option<NodeId>) {
        match op {
            Operand::Var(v) => self.mark_var(*v, step),
            Operand::Node(id) => {
                let args = body.node(*id).args.clone();
                if let Some(v) = body.node(*id).assign {
                    self.mark_var(v, step);
                }
                for a in &args {
                    self.mark_operand(body, a, step);
                }
            }
            _ => {}
        }
    }

    fn mark_var(&mut self, v: VarId, step: Option<NodeId>) {
        let var = self.pool.get_mut(v);
        match (var.step_mark, step) {
            (Some(m), Some(s)) if m != s.0 => var.used_in_multiple_steps = true,
            (_, Some(s)) => var.step_mark = Some(s.0),
            (_, None) => var.step_mark = None,
        }
    }

    /// Assigns a storage location to every variable the function touches.
    /// Declarations pick their frame directly; everything else goes through
    /// [`FuncLower::assign_var_storage`].
    fn analyze_storage(
        &mut self,
        body: &Body,
        start: NodeId,
        end: Option<NodeId>,
        used: &mut SlotUse,
    ) -> Result<(), LowerError> {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let n = body.node(id);
            match n.kind {
                NodeKind::DeclResult => {
                    let v = n.assign.unwrap_or_else(|| panic!("decl_result without target"));
                    let ty = self.type_of_var(v);
                    if self.is_async || matches!(ty, ValType::Struct(_)) {
                        // Aggregates, and everything in a coroutine, return
                        // through the call frame. The stored offset is
                        // relative to the frame base so it lands exactly on
                        // the `$result` slot callers build, padding
                        // included.
                        let ft = self.types.func(body.fty);
                        let base = call_frame(self.types, ft)
                            .field_offset("$result", &self.func_name);
                        let name = self.pool.get(v).name.clone();
                        let off = self.result_frame.add_field(self.types, &name, ty);
                        self.var_storage.insert(v, Storage::Result(base + off));
                    } else {
                        self.var_storage
                            .insert(v, Storage::LocalResult(self.wf_results.len() as u32));
                        self.wf_results.push(self.stack_type(ty));
                    }
                    self.return_vars.push(v);
                }
                NodeKind::DeclParam => {
                    let v = n.assign.unwrap_or_else(|| panic!("decl_param without target"));
                    let ty = self.type_of_var(v);
                    if let ValType::Struct(_) = ty {
                        let name = self.pool.get(v).name.clone();
                        let off = self.params_frame.add_field(self.types, &name, ty);
                        self.var_storage.insert(v, Storage::Params(off));
                    } else {
                        let idx = self.wf_params.len() as u32;
                        let t = self.stack_type(ty);
                        self.wf_params.push(t);
                        self.var_storage.insert(v, Storage::Local(idx));
                        if self.pool.get(v).gc_visible {
                            let off = self.vars_frame.add_field(
                                self.types,
                                &format!("$param{}", idx),
                                ty,
                            );
                            self.var_gc_storage.insert(v, off);
                        } else if self.is_async {
                            // The frame must hold the parameter across a
                            // suspension.
                            let off = self.vars_frame.add_field(
                                self.types,
                                &format!("$param{}", idx),
                                ty,
                            );
                            self.var_async_storage.insert(v, off);
                        }
                    }
                    self.parameter_vars.push(v);
                }
                NodeKind::DeclVar => {
                    // Plain variables get storage at their first use.
                }
                _ => {
                    if let Some(v) = n.assign {
                        self.assign_var_storage(v, used)?;
                    }
                    let args = n.args.clone();
                    for a in &args {
                        match a {
                            Operand::Var(v) => self.assign_var_storage(*v, used)?,
                            Operand::Node(m) => self.analyze_storage(body, *m, None, used)?,
                            _ => {}
                        }
                    }
                    let n = body.node(id);
                    if n.kind == NodeKind::If {
                        if let Some(alt) = n.next.get(1).copied() {
                            let partner = n.partner;
                            // The else arm may reuse slots the then arm
                            // allocated.
                            let mut forked = used.clone();
                            self.analyze_storage(body, alt, partner, &mut forked)?;
                        }
                    }
                }
            }
            if Some(id) == end {
                break;
            }
            cur = body.node(id).next.first().copied();
        }
        Ok(())
    }

    fn assign_var_storage(&mut self, v: VarId, used: &mut SlotUse) -> Result<(), LowerError> {
        if self.var_storage.contains_key(&v) || self.global_storage.contains_key(&v) {
            return Ok(());
        }
        let (name, ty, constant, addressable, gc_visible, multi_step) = {
            let var = self.pool.get(v);
            (
                var.name.clone(),
                var.ty,
                var.constant.clone(),
                var.addressable,
                var.gc_visible,
                var.used_in_multiple_steps,
            )
        };
        if let Some(c) = constant {
            let s = match c {
                ConstData::Str(text) => Storage::GlobalStrings(self.module.add_string(&text)),
                ConstData::Bytes(bytes) => Storage::GlobalHeap(self.module.add_binary(&bytes)),
            };
            self.var_storage.insert(v, s);
            return Ok(());
        }
        let ty = match ty {
            Some(t) => t,
            None => panic!("untyped variable {}", name),
        };
        let is_struct = matches!(ty, ValType::Struct(_));

        if !multi_step && !is_struct && !gc_visible && !addressable {
            // The fast path: a plain target local.
            let slot = self.slot_pool.allocate(self.stack_type(ty), used);
            self.var_storage.insert(v, Storage::LocalSlot(slot));
        } else if multi_step && !is_struct && !addressable {
            // Lives in a local, saved to the frame on suspension.
            let slot = self.slot_pool.allocate(self.stack_type(ty), used);
            self.var_storage.insert(v, Storage::LocalSlot(slot));
            let off = self.vars_frame.add_field(self.types, &name, ty);
            self.var_async_storage.insert(v, off);
        } else if !is_struct && !addressable {
            // Collector-visible: writes go through to the frame.
            let slot = self.slot_pool.allocate(self.stack_type(ty), used);
            self.var_storage.insert(v, Storage::LocalSlot(slot));
            let off = self.vars_frame.add_field(self.types, &name, ty);
            self.var_gc_storage.insert(v, off);
        } else {
            let off = self.vars_frame.add_field(self.types, &name, ty);
            self.var_storage.insert(v, Storage::Vars(off));
        }
        self.local_vars.push(v);
        Ok(())
    }

    /// Turns symbolic pool slots into absolute local indices and appends the
    /// pool's locals to the function.
    fn rebase_slots(&mut self) {
        let shift = (self.wf_params.len() + self.wf_locals.len()) as u32;
        for s in self.var_storage.values_mut() {
            if let Storage::LocalSlot(n) = *s {
                *s = Storage::Local(shift + n);
            }
        }
        self.wf_locals.extend_from_slice(self.slot_pool.slots());
    }

    pub(super) fn storage_of(&self, v: VarId) -> Storage {
        if let Some(s) = self.var_storage.get(&v) {
            return *s;
        }
        match self.global_storage.get(&v) {
            Some(s) => *s,
            None => panic!("variable {} has no storage", self.pool.get(v).name),
        }
    }

    pub(super) fn bp(&self) -> u32 {
        match self.bp_local {
            Some(bp) => bp,
            None => panic!("frame access without a base pointer"),
        }
    }

    pub(super) fn type_of_var(&self, v: VarId) -> ValType {
        match self.pool.get(v).ty {
            Some(t) => t,
            None => panic!("untyped variable {}", self.pool.get(v).name),
        }
    }

    pub(super) fn scalar_type_of(&self, v: VarId) -> ScalarType {
        match self.type_of_var(v) {
            ValType::Scalar(s) => s,
            ValType::Struct(_) => panic!("aggregate where a scalar was expected"),
        }
    }

    pub(super) fn stack_type(&self, ty: ValType) -> StackType {
        match ty {
            ValType::Scalar(s) => s.stack_type(),
            ValType::Struct(_) => panic!("aggregate has no stack type"),
        }
    }

    pub(super) fn step_number(&self, n: NodeId) -> u32 {
        match self.steps.iter().position(|&s| s == n) {
            Some(i) => i as u32,
            None => panic!("jump to a node that is not a step"),
        }
    }

    pub(super) fn step_number_from_name(&self, name: &str) -> u32 {
        match self.steps_by_name.get(name) {
            Some(&i) => i,
            None => panic!("jump to unknown step {}", name),
        }
    }

    pub(super) fn frame_of(&self, fty: crate::ir::types::FuncTypeId) -> FrameLayout {
        call_frame(self.types, self.types.func(fty))
    }

    /// Grabs a scratch local, reusing a freed one of the same type.
    pub(super) fn alloc_local(&mut self, ty: StackType) -> u32 {
        for entry in self.tmp_locals.iter_mut() {
            if !entry.2 && entry.1 == ty {
                entry.2 = true;
                return entry.0;
            }
        }
        let idx = (self.wf_params.len() + self.wf_locals.len()) as u32;
        self.wf_locals.push(ty);
        self.tmp_locals.push((idx, ty, true));
        idx
    }

    pub(super) fn free_local(&mut self, idx: u32) {
        for entry in self.tmp_locals.iter_mut() {
            if entry.0 == idx {
                entry.2 = false;
                return;
            }
        }
        panic!("freeing a local that was never allocated");
    }

    /// A per-type scratch local that is never freed. `src`/`dest` have their
    /// own slots so copies can hold both addresses at once.
    pub(super) fn get_tmp_local(&mut self, tmp: Tmp) -> u32 {
        let slot = match tmp {
            Tmp::I32 => &mut self.tmp_i32,
            Tmp::I64 => &mut self.tmp_i64,
            Tmp::F32 => &mut self.tmp_f32,
            Tmp::F64 => &mut self.tmp_f64,
            Tmp::Src => &mut self.tmp_src,
            Tmp::Dest => &mut self.tmp_dest,
        };
        if let Some(idx) = *slot {
            return idx;
        }
        let ty = match tmp {
            Tmp::I64 => StackType::I64,
            Tmp::F32 => StackType::F32,
            Tmp::F64 => StackType::F64,
            _ => StackType::I32,
        };
        let idx = (self.wf_params.len() + self.wf_locals.len()) as u32;
        self.wf_locals.push(ty);
        match tmp {
            Tmp::I32 => self.tmp_i32 = Some(idx),
            Tmp::I64 => self.tmp_i64 = Some(idx),
            Tmp::F32 => self.tmp_f32 = Some(idx),
            Tmp::F64 => self.tmp_f64 = Some(idx),
            Tmp::Src => self.tmp_src = Some(idx),
            Tmp::Dest => self.tmp_dest = Some(idx),
        }
        idx
    }

    pub(super) fn tmp_for(&mut self, ty: StackType) -> u32 {
        match ty {
            StackType::I32 => self.get_tmp_local(Tmp::I32),
            StackType::I64 => self.get_tmp_local(Tmp::I64),
            StackType::F32 => self.get_tmp_local(Tmp::F32),
            StackType::F64 => self.get_tmp_local(Tmp::F64),
        }
    }

    pub(super) fn heap_global(&self) -> u32 {
        HEAP_GLOBAL
    }
}

/// Scratch-local selector for [`FuncLower::get_tmp_local`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Tmp {
    I32,
    I64,
    F32,
    F64,
    Src,
    Dest,
}

/// Narrow store width for sub-word scalars.
pub(super) fn narrow_store(sc: ScalarType) -> Option<StoreWidth> {
    match sc {
        ScalarType::U8 | ScalarType::S8 => Some(StoreWidth::W8),
        ScalarType::U16 | ScalarType::S16 => Some(StoreWidth::W16),
        _ => None,
    }
}

/// Narrow load width for sub-word scalars, extending by signedness.
pub(super) fn narrow_load(sc: ScalarType) -> Option<LoadWidth> {
    match sc {
        ScalarType::U8 => Some(LoadWidth::W8U),
        ScalarType::S8 => Some(LoadWidth::W8S),
        ScalarType::U16 => Some(LoadWidth::W16U),
        ScalarType::S16 => Some(LoadWidth::W16S),
        _ => None,
    }
}
