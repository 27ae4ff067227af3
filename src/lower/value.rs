//! Expression and value emission.
//!
//! Scalars travel over the target's value stack; aggregates live in linear
//! memory and move with [`FuncLower::emit_copy`]. `emit_assign` is the
//! single entry point: it routes a source operand to a destination, which
//! is either the value stack, an address already on the stack (`Heap`), or
//! an offset from the stack pointer (`HeapStack`).
//!
//! Copy convention: when both addresses are involved the destination
//! address is pushed first, the source address second.

use crate::ir::types::{ScalarType, TypeId, ValType};
use crate::ir::{Body, ConvertOp, IrCallee, NodeId, NodeKind, Operand, VarId};
use crate::lower::error::LowerError;
use crate::lower::func::{narrow_load, narrow_store, FuncLower, Tmp};
use crate::lower::storage::Storage;
use crate::lower::{STACK_SIZE, STEP_SPAWNED};
use crate::wasm::{BinOp, Callee, Imm, Inst, RuntimeFn, StackType, UnOp};

/// Where an assigned value goes, besides an optional variable assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dest {
    /// Leave the value on the value stack.
    WasmStack,
    /// Store through an address that is already on the value stack.
    Heap,
    /// Store at the given offset from the stack pointer.
    HeapStack,
}

fn is_zero(op: &Operand) -> bool {
    match op {
        Operand::Int(v) => *v == 0,
        Operand::Float(f) => *f == 0.0,
        _ => false,
    }
}

impl FuncLower<'_> {
    pub(super) fn emit_assign(
        &mut self,
        ty: Option<ValType>,
        src: &Operand,
        dest: Option<Dest>,
        dest_offset: u32,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        if let Some(ValType::Struct(tid)) = ty {
            if dest == Some(Dest::WasmStack) {
                return Err(LowerError::AggregateOnStack {
                    func: self.func_name.clone(),
                });
            }
            return self.emit_assign_struct(tid, src, dest, dest_offset, code, body);
        }

        if dest == Some(Dest::HeapStack) {
            code.push(Inst::GetLocal(self.sp_local));
        }
        self.emit_word_assign(ty, src, dest.is_some(), code, body)?;
        if matches!(dest, Some(Dest::Heap) | Some(Dest::HeapStack)) {
            let sc = match ty {
                Some(ValType::Scalar(s)) => s,
                _ => panic!("memory store without a scalar type"),
            };
            code.push(Inst::Store {
                ty: sc.stack_type(),
                width: narrow_store(sc),
                offset: dest_offset,
            });
        }
        Ok(())
    }

    fn emit_assign_struct(
        &mut self,
        tid: TypeId,
        src: &Operand,
        dest: Option<Dest>,
        mut dest_offset: u32,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let ty = ValType::Struct(tid);
        let node = match src {
            Operand::Node(id) => Some(*id),
            _ => None,
        };

        // A synchronous call returning an aggregate builds its frame on the
        // shadow stack and the result is copied out of it.
        if let Some(id) = node {
            let kind = body.node(id).kind;
            if kind == NodeKind::Call || kind == NodeKind::CallIndirect {
                return self.emit_struct_call(id, dest, dest_offset, code, body);
            }
            if kind == NodeKind::Struct {
                return self.emit_struct_literal(tid, id, dest, dest_offset, code, body);
            }
            if kind == NodeKind::Copy || kind == NodeKind::Load {
                let n = body.node(id);
                let assign = n.assign;
                let args = n.args.clone();
                let mut tmp = None;
                match dest {
                    None => {
                        let v = match assign {
                            Some(v) => v,
                            None => {
                                return Err(LowerError::UnexpectedNode {
                                    func: self.func_name.clone(),
                                    node: "unassigned aggregate expression",
                                })
                            }
                        };
                        dest_offset = self.emit_addr_of_var(v, true, code)?;
                    }
                    Some(Dest::HeapStack) => code.push(Inst::GetLocal(self.sp_local)),
                    Some(Dest::Heap) => {
                        if assign.is_some() {
                            // Keep the address around for the second copy.
                            let t = self.get_tmp_local(Tmp::I32);
                            code.push(Inst::TeeLocal(t));
                            tmp = Some(t);
                        }
                    }
                    Some(Dest::WasmStack) => unreachable!(),
                }
                if kind == NodeKind::Load {
                    let off = operand_int(&args[1]);
                    self.emit_word_assign(
                        Some(ValType::Scalar(ScalarType::Addr)),
                        &args[0],
                        true,
                        code,
                        body,
                    )?;
                    self.emit_copy(ty, off, dest_offset, code);
                } else {
                    match &args[0] {
                        Operand::Var(v) => {
                            let src_off = self.emit_addr_of_var(*v, true, code)?;
                            self.emit_copy(ty, src_off, dest_offset, code);
                        }
                        _ => {
                            return Err(LowerError::UnexpectedNode {
                                func: self.func_name.clone(),
                                node: "aggregate copy source",
                            })
                        }
                    }
                }
                if let (Some(v), Some(d)) = (assign, dest) {
                    let assign_off = self.emit_addr_of_var(v, true, code)?;
                    match d {
                        Dest::HeapStack => code.push(Inst::GetLocal(self.sp_local)),
                        Dest::Heap => code.push(Inst::GetLocal(
                            tmp.unwrap_or_else(|| panic!("missing address temporary")),
                        )),
                        Dest::WasmStack => unreachable!(),
                    }
                    self.emit_copy(ty, dest_offset, assign_off, code);
                }
                return Ok(());
            }
            return Err(LowerError::UnexpectedNode {
                func: self.func_name.clone(),
                node: "aggregate-typed expression",
            });
        }

        match src {
            Operand::Var(v) => {
                let d = match dest {
                    Some(d) => d,
                    None => {
                        return Err(LowerError::UnexpectedNode {
                            func: self.func_name.clone(),
                            node: "aggregate variable without a destination",
                        })
                    }
                };
                if d == Dest::HeapStack {
                    code.push(Inst::GetLocal(self.sp_local));
                }
                let src_off = self.emit_addr_of_var(*v, true, code)?;
                self.emit_copy(ty, src_off, dest_offset, code);
                Ok(())
            }
            _ => Err(LowerError::UnexpectedNode {
                func: self.func_name.clone(),
                node: "immediate of aggregate type",
            }),
        }
    }

    fn emit_struct_call(
        &mut self,
        id: NodeId,
        dest: Option<Dest>,
        dest_offset: u32,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let n = body.node(id);
        let kind = n.kind;
        let assign = n.assign;
        let callee = n.callee;
        let args = n.args.clone();
        let fty = n.fty.unwrap_or_else(|| panic!("call without a signature"));
        let ft = self.types.func(fty).clone();
        let frame = self.frame_of(fty);
        let result = match ft.result {
            Some(r) => r,
            None => panic!("struct call without a result"),
        };
        let indirect = kind == NodeKind::CallIndirect;
        let arg_base = usize::from(indirect);

        let mut assign_offset = 0;
        if let Some(v) = assign {
            assign_offset = self.emit_addr_of_var(v, true, code)?;
        }
        if matches!(dest, Some(Dest::HeapStack)) {
            // The copy-out below stores relative to the caller frame.
            code.push(Inst::GetLocal(self.sp_local));
        }
        let stack_sub = frame.size();
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::i32_const(i64::from(stack_sub)));
        code.push(Inst::Binary(StackType::I32, BinOp::Sub));
        code.push(Inst::SetLocal(self.sp_local));

        let mut sig_params: Vec<StackType> = Vec::new();
        for (i, p) in ft.params.iter().enumerate() {
            if let ValType::Struct(_) = p {
                let off = frame.field_offset(&format!("$p{}", i), &self.func_name);
                self.emit_assign(
                    Some(*p),
                    &args[arg_base + i].clone(),
                    Some(Dest::HeapStack),
                    off,
                    code,
                    body,
                )?;
            } else {
                if indirect {
                    sig_params.push(self.stack_type(*p));
                }
                self.emit_assign(
                    Some(*p),
                    &args[arg_base + i].clone(),
                    Some(Dest::WasmStack),
                    0,
                    code,
                    body,
                )?;
            }
        }
        if ft.conv != crate::ir::types::CallConv::Native {
            code.push(Inst::GetLocal(self.sp_local));
            if indirect {
                sig_params.push(StackType::I32);
            }
        }
        if indirect {
            self.emit_assign(
                Some(ValType::Scalar(ScalarType::S32)),
                &args[0].clone(),
                Some(Dest::WasmStack),
                0,
                code,
                body,
            )?;
            let sig = crate::wasm::FuncSig {
                params: sig_params,
                results: Vec::new(),
            };
            let idx = self.module.add_sig(sig);
            code.push(Inst::CallIndirect(idx));
        } else {
            match callee {
                Some(IrCallee::Func(f)) => code.push(Inst::Call(Callee::Index(f.0))),
                _ => panic!("struct call without a direct callee"),
            }
        }

        let result_off = frame.field_offset("$result", &self.func_name);
        if assign.is_some() {
            code.push(Inst::GetLocal(self.sp_local));
            self.emit_copy(result, result_off, assign_offset, code);
        }
        if matches!(dest, Some(Dest::Heap) | Some(Dest::HeapStack)) {
            code.push(Inst::GetLocal(self.sp_local));
            self.emit_copy(result, result_off, dest_offset, code);
        }
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::i32_const(i64::from(stack_sub)));
        code.push(Inst::Binary(StackType::I32, BinOp::Add));
        code.push(Inst::SetLocal(self.sp_local));
        Ok(())
    }

    fn emit_struct_literal(
        &mut self,
        tid: TypeId,
        id: NodeId,
        dest: Option<Dest>,
        mut dest_offset: u32,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let ty = ValType::Struct(tid);
        let assign = body.node(id).assign;
        let args = body.node(id).args.clone();

        if dest.is_none() {
            let v = match assign {
                Some(v) => v,
                None => {
                    return Err(LowerError::UnexpectedNode {
                        func: self.func_name.clone(),
                        node: "unassigned struct literal",
                    })
                }
            };
            dest_offset = self.emit_addr_of_var(v, true, code)?;
        }

        // All-zero literal of some size: one runtime call.
        let all_zero = self.all_mem_zero(tid, Some(&args), body);
        if matches!(all_zero, Some(n) if n > 8) && (dest.is_none() || assign.is_none()) {
            if dest == Some(Dest::HeapStack) {
                code.push(Inst::GetLocal(self.sp_local));
            }
            if dest_offset != 0 {
                code.push(Inst::i32_const(i64::from(dest_offset)));
                code.push(Inst::Binary(StackType::I32, BinOp::Add));
            }
            code.push(Inst::i32_const(i64::from(self.types.size_of(ty))));
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::Call(Callee::Runtime(RuntimeFn::MemZero)));
            return Ok(());
        }

        let mut addr_local = None;
        if dest != Some(Dest::HeapStack) {
            // The destination address was pushed by the caller or above.
            let l = self.alloc_local(StackType::I32);
            code.push(Inst::SetLocal(l));
            addr_local = Some(l);
        }

        // Zero the whole struct first when enough fields would need it.
        let has_mem_zero = self.needs_mem_zero(tid, Some(&args), body) > 8;
        if has_mem_zero {
            match addr_local {
                Some(l) => code.push(Inst::GetLocal(l)),
                None => code.push(Inst::GetLocal(self.sp_local)),
            }
            if dest_offset != 0 {
                code.push(Inst::i32_const(i64::from(dest_offset)));
                code.push(Inst::Binary(StackType::I32, BinOp::Add));
            }
            code.push(Inst::i32_const(i64::from(self.types.size_of(ty))));
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::Call(Callee::Runtime(RuntimeFn::MemZero)));
        }

        let def = self.types.struct_def(tid).clone();
        let mut argn = 0usize;
        for (i, f) in def.fields.iter().enumerate() {
            let field_off = self.types.field_offset(tid, i);
            let size = self.types.size_of(f.ty);
            for j in 0..f.count {
                if argn >= args.len() {
                    panic!("struct literal is missing field values");
                }
                let arg = args[argn].clone();
                argn += 1;
                let off = dest_offset + field_off + j * size;
                let zero = is_zero(&arg);
                if zero && has_mem_zero {
                    continue;
                }
                match f.ty {
                    ValType::Struct(inner) if zero => {
                        let base = match addr_local {
                            Some(l) => l,
                            None => self.sp_local,
                        };
                        self.emit_zero_struct(base, inner, off, code, body)?;
                    }
                    _ => match addr_local {
                        Some(l) => {
                            code.push(Inst::GetLocal(l));
                            self.emit_assign(Some(f.ty), &arg, Some(Dest::Heap), off, code, body)?;
                        }
                        None => {
                            self.emit_assign(
                                Some(f.ty),
                                &arg,
                                Some(Dest::HeapStack),
                                off,
                                code,
                                body,
                            )?;
                        }
                    },
                }
            }
        }

        if let (Some(v), Some(_)) = (assign, dest) {
            let assign_off = self.emit_addr_of_var(v, true, code)?;
            match addr_local {
                Some(l) => code.push(Inst::GetLocal(l)),
                None => code.push(Inst::GetLocal(self.sp_local)),
            }
            self.emit_copy(ty, dest_offset, assign_off, code);
        }

        if let Some(l) = addr_local {
            self.free_local(l);
        }
        Ok(())
    }

    /// Zeroes a nested aggregate field by field. Used when the surrounding
    /// literal did not warrant a bulk zero call.
    fn emit_zero_struct(
        &mut self,
        base_local: u32,
        tid: TypeId,
        dest_offset: u32,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let def = self.types.struct_def(tid).clone();
        for (i, f) in def.fields.iter().enumerate() {
            let field_off = self.types.field_offset(tid, i);
            let size = self.types.size_of(f.ty);
            for j in 0..f.count {
                let off = dest_offset + field_off + j * size;
                match f.ty {
                    ValType::Struct(inner) => {
                        self.emit_zero_struct(base_local, inner, off, code, body)?;
                    }
                    _ => {
                        code.push(Inst::GetLocal(base_local));
                        self.emit_assign(
                            Some(f.ty),
                            &Operand::Int(0),
                            Some(Dest::Heap),
                            off,
                            code,
                            body,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of fields that would have to be stored as zero, recursing
    /// into nested literals.
    fn needs_mem_zero(&self, tid: TypeId, args: Option<&[Operand]>, body: &Body) -> u32 {
        let def = self.types.struct_def(tid);
        let mut zeros = 0;
        let mut argn = 0usize;
        for f in &def.fields {
            for _ in 0..f.count {
                let arg = args.map(|a| &a[argn]);
                if let ValType::Struct(inner) = f.ty {
                    let nested = match arg {
                        Some(Operand::Node(m)) => Some(body.node(*m).args.as_slice()),
                        _ => None,
                    };
                    zeros += self.needs_mem_zero(inner, nested, body);
                } else if arg.map(is_zero).unwrap_or(true) {
                    zeros += 1;
                }
                argn += 1;
            }
        }
        zeros
    }

    /// Like [`FuncLower::needs_mem_zero`], but `None` if any field carries a
    /// non-zero value.
    fn all_mem_zero(&self, tid: TypeId, args: Option<&[Operand]>, body: &Body) -> Option<u32> {
        let def = self.types.struct_def(tid);
        let mut zeros = 0;
        let mut argn = 0usize;
        for f in &def.fields {
            for _ in 0..f.count {
                let arg = args.map(|a| &a[argn]);
                if let ValType::Struct(inner) = f.ty {
                    let nested = match arg {
                        Some(Operand::Node(m)) => Some(body.node(*m).args.as_slice()),
                        _ => None,
                    };
                    let nested = if arg.map(is_zero).unwrap_or(true) {
                        None
                    } else {
                        nested
                    };
                    zeros += self.all_mem_zero(inner, nested, body)?;
                } else if arg.map(is_zero).unwrap_or(true) {
                    zeros += 1;
                } else {
                    return None;
                }
                argn += 1;
            }
        }
        Some(zeros)
    }

    pub(super) fn emit_word_assign(
        &mut self,
        ty: Option<ValType>,
        src: &Operand,
        on_stack: bool,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        match src {
            Operand::Node(id) => self.emit_word_node(*id, on_stack, code, body),
            Operand::Var(v) => {
                self.emit_word_variable(*v, code)?;
                Ok(())
            }
            Operand::Int(v) => {
                let st = match ty {
                    Some(t) => self.stack_type(t),
                    None => StackType::I32,
                };
                code.push(Inst::Const(st, Imm::Int(*v)));
                Ok(())
            }
            Operand::Float(f) => {
                let st = match ty {
                    Some(t) => self.stack_type(t),
                    None => StackType::F64,
                };
                code.push(Inst::Const(st, Imm::Float(*f)));
                Ok(())
            }
        }
    }

    fn emit_word_variable(&mut self, v: VarId, code: &mut Vec<Inst>) -> Result<(), LowerError> {
        let sc = self.scalar_type_of(v);
        let st = sc.stack_type();
        let width = narrow_load(sc);
        match self.storage_of(v) {
            Storage::Local(idx) => code.push(Inst::GetLocal(idx)),
            Storage::Vars(off) => {
                code.push(Inst::GetLocal(self.bp()));
                code.push(Inst::Load {
                    ty: st,
                    width,
                    offset: off,
                });
            }
            Storage::Params(off) => {
                code.push(Inst::GetLocal(self.bp()));
                code.push(Inst::Load {
                    ty: st,
                    width,
                    offset: self.vars_frame.size() + off,
                });
            }
            Storage::Result(off) => {
                code.push(Inst::GetLocal(self.bp()));
                code.push(Inst::Load {
                    ty: st,
                    width,
                    offset: self.vars_frame.size() + off,
                });
            }
            Storage::Global(idx) => code.push(Inst::GetGlobal(idx)),
            Storage::GlobalHeap(off) => {
                code.push(Inst::i32_const(i64::from(off)));
                code.push(Inst::Load {
                    ty: st,
                    width,
                    offset: 0,
                });
            }
            Storage::GlobalStrings(off) => code.push(Inst::i32_const(i64::from(off))),
            Storage::LocalSlot(_) => panic!("slot storage survived rebasing"),
            Storage::LocalResult(_) => panic!("direct results cannot be read back"),
        }
        Ok(())
    }

    fn emit_word_node(
        &mut self,
        id: NodeId,
        on_stack: bool,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let n = body.node(id);
        let kind = n.kind;
        let ty = n.ty;
        let assign = n.assign;
        let args = n.args.clone();

        match kind {
            NodeKind::Alloc => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                let alloc_ty = ty.unwrap_or(ValType::Scalar(ScalarType::U8));
                self.emit_word_assign(
                    Some(ValType::Scalar(ScalarType::U32)),
                    &args[0],
                    true,
                    code,
                    body,
                )?;
                code.push(Inst::i32_const(i64::from(self.types.size_of(alloc_ty))));
                if let Some(Operand::Var(head)) = args.get(1) {
                    let head_ty = self.type_of_var(*head);
                    code.push(Inst::i32_const(i64::from(self.types.size_of(head_ty))));
                } else {
                    code.push(Inst::i32_const(0));
                }
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::Alloc)));
                if let Some(v) = assign {
                    self.store_var_2(ScalarType::Addr, v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::AddrOf => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                let target = match &args[0] {
                    Operand::Var(v) => *v,
                    _ => panic!("addr_of takes a variable"),
                };
                self.emit_addr_of_var(target, false, code)?;
                if let Some(v) = assign {
                    self.store_var_2(ScalarType::Addr, v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::Const => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                self.emit_word_assign(ty, &args[0], true, code, body)?;
                if let Some(v) = assign {
                    self.store_var_2(self.scalar_of(ty), v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::Load => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                self.emit_word_assign(
                    Some(ValType::Scalar(ScalarType::Addr)),
                    &args[0],
                    true,
                    code,
                    body,
                )?;
                let sc = self.scalar_of(ty);
                code.push(Inst::Load {
                    ty: sc.stack_type(),
                    width: narrow_load(sc),
                    offset: operand_int(&args[1]),
                });
                if let Some(v) = assign {
                    self.store_var_2(sc, v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::Binary(op) => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                self.emit_word_assign(ty, &args[0], true, code, body)?;
                self.emit_word_assign(ty, &args[1], true, code, body)?;
                let sc = self.scalar_of(ty);
                code.push(Inst::Binary(sc.stack_type(), op));
                if let Some(v) = assign {
                    self.store_var_2(sc, v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::Unary(op) => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                self.emit_word_assign(ty, &args[0], true, code, body)?;
                let sc = self.scalar_of(ty);
                code.push(Inst::Unary(sc.stack_type(), op));
                if let Some(v) = assign {
                    self.store_var_2(sc, v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::Convert(op) => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                self.emit_word_assign(ty, &args[0], true, code, body)?;
                code.push(convert_inst(op));
                if let Some(v) = assign {
                    self.store_var_2(self.scalar_of(ty), v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::Copy => {
                if let Some(v) = assign {
                    self.store_var_1(v, code);
                }
                self.emit_word_assign(ty, &args[0], true, code, body)?;
                if let Some(v) = assign {
                    self.store_var_2(self.scalar_of(ty), v, on_stack, code);
                }
                Ok(())
            }
            NodeKind::Call
            | NodeKind::CallIndirect
            | NodeKind::Spawn
            | NodeKind::SpawnIndirect => self.emit_word_call(id, on_stack, code, body),
            _ => Err(LowerError::UnexpectedNode {
                func: self.func_name.clone(),
                node: "expression node",
            }),
        }
    }

    fn emit_word_call(
        &mut self,
        id: NodeId,
        on_stack: bool,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let n = body.node(id);
        let kind = n.kind;
        let assign = n.assign;
        let callee = n.callee;
        let args = n.args.clone();
        let fty = n.fty.unwrap_or_else(|| panic!("call without a signature"));
        let ft = self.types.func(fty).clone();
        let frame = self.frame_of(fty);
        let indirect = matches!(kind, NodeKind::CallIndirect | NodeKind::SpawnIndirect);
        let spawned = matches!(kind, NodeKind::Spawn | NodeKind::SpawnIndirect);
        let arg_base = usize::from(indirect);

        if let Some(ValType::Struct(_)) = ft.result {
            return Err(LowerError::UnexpectedNode {
                func: self.func_name.clone(),
                node: "aggregate-returning call on the value stack",
            });
        }
        if let Some(v) = assign {
            self.store_var_1(v, code);
        }
        if frame.size() > 0 {
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::i32_const(i64::from(frame.size())));
            code.push(Inst::Binary(StackType::I32, BinOp::Sub));
            code.push(Inst::SetLocal(self.sp_local));
        }
        if spawned {
            // Spawned coroutines start out suspended at their first step.
            code.push(Inst::i32_const(i64::from(STEP_SPAWNED)));
        }

        let mut sig_params: Vec<StackType> = Vec::new();
        if spawned && indirect {
            sig_params.push(StackType::I32);
        }
        for (i, p) in ft.params.iter().enumerate() {
            if let ValType::Struct(_) = p {
                let off = frame.field_offset(&format!("$p{}", i), &self.func_name);
                self.emit_assign(
                    Some(*p),
                    &args[arg_base + i].clone(),
                    Some(Dest::HeapStack),
                    off,
                    code,
                    body,
                )?;
            } else {
                if indirect {
                    sig_params.push(self.stack_type(*p));
                }
                self.emit_assign(
                    Some(*p),
                    &args[arg_base + i].clone(),
                    Some(Dest::WasmStack),
                    0,
                    code,
                    body,
                )?;
            }
        }
        if ft.conv != crate::ir::types::CallConv::Native {
            if indirect {
                sig_params.push(StackType::I32);
            }
            code.push(Inst::GetLocal(self.sp_local));
        }

        match (indirect, callee) {
            (_, Some(IrCallee::Sys(sys))) => self.emit_syscall(sys, code),
            (true, _) => {
                self.emit_assign(
                    Some(ValType::Scalar(ScalarType::S32)),
                    &args[0].clone(),
                    Some(Dest::WasmStack),
                    0,
                    code,
                    body,
                )?;
                let mut results = Vec::new();
                if ft.is_async() {
                    results.push(StackType::I32);
                } else if let Some(r) = ft.result {
                    results.push(self.stack_type(r));
                }
                let sig = crate::wasm::FuncSig {
                    params: sig_params,
                    results,
                };
                let idx = self.module.add_sig(sig);
                code.push(Inst::CallIndirect(idx));
            }
            (false, Some(IrCallee::Func(f))) => code.push(Inst::Call(Callee::Index(f.0))),
            (false, None) => panic!("direct call without a callee"),
        }

        if let Some(v) = assign {
            let sc = match ft.result {
                Some(ValType::Scalar(s)) => s,
                _ => panic!("scalar assignment from a call without a scalar result"),
            };
            self.store_var_2(sc, v, on_stack, code);
        } else if !on_stack && ft.result.is_some() && !ft.is_async() {
            // Async callees leave their frame pointer instead of a value;
            // the spawn path consumes it.
            code.push(Inst::Drop);
        }

        if frame.size() > 0 {
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::i32_const(i64::from(frame.size())));
            code.push(Inst::Binary(StackType::I32, BinOp::Add));
            code.push(Inst::SetLocal(self.sp_local));
        }
        Ok(())
    }

    /// Intrinsics either map to a single instruction, a runtime call with
    /// the stack pointer appended, or an indirect call through the callback
    /// signature.
    fn emit_syscall(&mut self, sys: crate::ir::types::SysCall, code: &mut Vec<Inst>) {
        use crate::ir::types::SysCall as S;
        use StackType::{F32, F64};
        match sys {
            S::Heap => code.push(Inst::GetGlobal(self.heap_global())),
            S::CurrentMemory => code.push(Inst::CurrentMemory),
            S::GrowMemory => code.push(Inst::GrowMemory),
            S::PageSize => code.push(Inst::i32_const(1 << 16)),
            S::DefaultStackSize => code.push(Inst::i32_const(i64::from(STACK_SIZE))),
            S::StackPointer => code.push(Inst::GetLocal(self.sp_local)),
            S::ContinueCoroutine => code.push(Inst::CallIndirect(0)),
            S::Coroutine => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::CurrentCoroutine)));
            }
            S::ScheduleCoroutine => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::ScheduleCoroutine)));
            }
            S::CreateMap => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::CreateMap)));
            }
            S::SetMap => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::SetMap)));
            }
            S::LookupMap => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::LookupMap)));
            }
            S::RemoveMapKey => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::RemoveMapKey)));
            }
            S::HashString => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::HashString)));
            }
            S::SetNumericMap => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::SetNumericMap)));
            }
            S::LookupNumericMap => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::LookupNumericMap)));
            }
            S::RemoveNumericMapKey => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::RemoveNumericMapKey)));
            }
            S::DecodeUtf8 => {
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::DecodeUtf8)));
            }
            S::Abs32 => code.push(Inst::Unary(F32, UnOp::Abs)),
            S::Abs64 => code.push(Inst::Unary(F64, UnOp::Abs)),
            S::Sqrt32 => code.push(Inst::Unary(F32, UnOp::Sqrt)),
            S::Sqrt64 => code.push(Inst::Unary(F64, UnOp::Sqrt)),
            S::Trunc32 => code.push(Inst::Unary(F32, UnOp::Trunc)),
            S::Trunc64 => code.push(Inst::Unary(F64, UnOp::Trunc)),
            S::Nearest32 => code.push(Inst::Unary(F32, UnOp::Nearest)),
            S::Nearest64 => code.push(Inst::Unary(F64, UnOp::Nearest)),
            S::Floor32 => code.push(Inst::Unary(F32, UnOp::Floor)),
            S::Floor64 => code.push(Inst::Unary(F64, UnOp::Floor)),
            S::Ceil32 => code.push(Inst::Unary(F32, UnOp::Ceil)),
            S::Ceil64 => code.push(Inst::Unary(F64, UnOp::Ceil)),
            S::Min32 => code.push(Inst::Binary(F32, BinOp::Min)),
            S::Min64 => code.push(Inst::Binary(F64, BinOp::Min)),
            S::Max32 => code.push(Inst::Binary(F32, BinOp::Max)),
            S::Max64 => code.push(Inst::Binary(F64, BinOp::Max)),
            S::Copysign32 => code.push(Inst::Binary(F32, BinOp::Copysign)),
            S::Copysign64 => code.push(Inst::Binary(F64, BinOp::Copysign)),
        }
    }

    /// Pushes the base address of an addressable variable. With
    /// `return_offset` the byte offset is handed back to be folded into the
    /// following load/store instead of being added to the address.
    pub(super) fn emit_addr_of_var(
        &mut self,
        v: VarId,
        return_offset: bool,
        code: &mut Vec<Inst>,
    ) -> Result<u32, LowerError> {
        let offset = match self.storage_of(v) {
            Storage::Vars(off) => {
                code.push(Inst::GetLocal(self.bp()));
                off
            }
            Storage::Params(off) => {
                code.push(Inst::GetLocal(self.bp()));
                self.vars_frame.size() + off
            }
            Storage::Result(off) => {
                code.push(Inst::GetLocal(self.bp()));
                self.vars_frame.size() + off
            }
            Storage::GlobalHeap(off) => {
                code.push(Inst::i32_const(i64::from(off)));
                0
            }
            _ => {
                return Err(LowerError::UnaddressableVar {
                    func: self.func_name.clone(),
                    var: self.pool.get(v).name.clone(),
                })
            }
        };
        if return_offset {
            return Ok(offset);
        }
        if offset != 0 {
            code.push(Inst::i32_const(i64::from(offset)));
            code.push(Inst::Binary(StackType::I32, BinOp::Add));
        }
        Ok(0)
    }

    /// First half of a variable store: pushes the base address if the
    /// storage class needs one under the value.
    pub(super) fn store_var_1(&mut self, v: VarId, code: &mut Vec<Inst>) {
        match self.storage_of(v) {
            Storage::Vars(_) | Storage::Params(_) | Storage::Result(_) => {
                code.push(Inst::GetLocal(self.bp()));
            }
            Storage::GlobalHeap(off) => {
                code.push(Inst::i32_const(i64::from(off)));
            }
            Storage::Local(_) => {
                if self.var_gc_storage.contains_key(&v) {
                    // Write-through: the frame copy is updated together with
                    // the local.
                    code.push(Inst::GetLocal(self.bp()));
                }
            }
            Storage::Global(_) => {}
            Storage::GlobalStrings(_) => panic!("stores into interned strings"),
            Storage::LocalSlot(_) => panic!("slot storage survived rebasing"),
            Storage::LocalResult(_) => panic!("direct results are returned, not stored"),
        }
    }

    /// Second half: consumes the value (and base address) pushed around it.
    /// With `tee` the value is left on the stack afterwards.
    pub(super) fn store_var_2(&mut self, sc: ScalarType, v: VarId, tee: bool, code: &mut Vec<Inst>) {
        let st = sc.stack_type();
        let width = narrow_store(sc);
        match self.storage_of(v) {
            Storage::Local(idx) => {
                if let Some(&alt) = self.var_gc_storage.get(&v) {
                    code.push(Inst::TeeLocal(idx));
                    code.push(Inst::Store {
                        ty: st,
                        width,
                        offset: alt,
                    });
                    if tee {
                        code.push(Inst::GetLocal(idx));
                    }
                } else if tee {
                    code.push(Inst::TeeLocal(idx));
                } else {
                    code.push(Inst::SetLocal(idx));
                }
            }
            Storage::Global(idx) => {
                if tee {
                    let tmp = self.tmp_for(st);
                    code.push(Inst::TeeLocal(tmp));
                    code.push(Inst::SetGlobal(idx));
                    code.push(Inst::GetLocal(tmp));
                } else {
                    code.push(Inst::SetGlobal(idx));
                }
            }
            Storage::Vars(off) => self.store_framed(st, width, off, tee, code),
            Storage::Params(off) => {
                let off = self.vars_frame.size() + off;
                self.store_framed(st, width, off, tee, code);
            }
            Storage::Result(off) => {
                let off = self.vars_frame.size() + off;
                self.store_framed(st, width, off, tee, code);
            }
            Storage::GlobalHeap(_) => self.store_framed(st, width, 0, tee, code),
            Storage::GlobalStrings(_) => panic!("stores into interned strings"),
            Storage::LocalSlot(_) => panic!("slot storage survived rebasing"),
            Storage::LocalResult(_) => panic!("direct results are returned, not stored"),
        }
    }

    fn store_framed(
        &mut self,
        st: StackType,
        width: Option<crate::wasm::StoreWidth>,
        offset: u32,
        tee: bool,
        code: &mut Vec<Inst>,
    ) {
        if tee {
            let tmp = self.tmp_for(st);
            code.push(Inst::TeeLocal(tmp));
            code.push(Inst::Store { ty: st, width, offset });
            code.push(Inst::GetLocal(tmp));
        } else {
            code.push(Inst::Store { ty: st, width, offset });
        }
    }

    /// Copies `ty` bytes between two addresses on the value stack, pushed
    /// destination first. Small sizes inline as load/store pairs; the rest
    /// goes through the runtime.
    pub(super) fn emit_copy(
        &mut self,
        ty: ValType,
        src_offset: u32,
        dest_offset: u32,
        code: &mut Vec<Inst>,
    ) {
        use StackType::{I32, I64};
        let size = self.types.size_of(ty);
        match size {
            1 => {
                code.push(Inst::Load {
                    ty: I32,
                    width: Some(crate::wasm::LoadWidth::W8U),
                    offset: src_offset,
                });
                code.push(Inst::Store {
                    ty: I32,
                    width: Some(crate::wasm::StoreWidth::W8),
                    offset: dest_offset,
                });
            }
            2 => {
                code.push(Inst::Load {
                    ty: I32,
                    width: Some(crate::wasm::LoadWidth::W16U),
                    offset: src_offset,
                });
                code.push(Inst::Store {
                    ty: I32,
                    width: Some(crate::wasm::StoreWidth::W16),
                    offset: dest_offset,
                });
            }
            4 => {
                code.push(Inst::Load {
                    ty: I32,
                    width: None,
                    offset: src_offset,
                });
                code.push(Inst::Store {
                    ty: I32,
                    width: None,
                    offset: dest_offset,
                });
            }
            8 => {
                code.push(Inst::Load {
                    ty: I64,
                    width: None,
                    offset: src_offset,
                });
                code.push(Inst::Store {
                    ty: I64,
                    width: None,
                    offset: dest_offset,
                });
            }
            12 | 16 => {
                let src = self.get_tmp_local(Tmp::Src);
                let dest = self.get_tmp_local(Tmp::Dest);
                code.push(Inst::SetLocal(src));
                code.push(Inst::TeeLocal(dest));
                code.push(Inst::GetLocal(src));
                code.push(Inst::Load {
                    ty: I64,
                    width: None,
                    offset: src_offset,
                });
                code.push(Inst::Store {
                    ty: I64,
                    width: None,
                    offset: dest_offset,
                });
                code.push(Inst::GetLocal(dest));
                code.push(Inst::GetLocal(src));
                if size == 12 {
                    code.push(Inst::Load {
                        ty: I32,
                        width: None,
                        offset: src_offset + 8,
                    });
                    code.push(Inst::Store {
                        ty: I32,
                        width: None,
                        offset: dest_offset + 8,
                    });
                } else {
                    code.push(Inst::Load {
                        ty: I64,
                        width: None,
                        offset: src_offset + 8,
                    });
                    code.push(Inst::Store {
                        ty: I64,
                        width: None,
                        offset: dest_offset + 8,
                    });
                }
            }
            _ => {
                if dest_offset != 0 {
                    let tmp = self.get_tmp_local(Tmp::I32);
                    code.push(Inst::SetLocal(tmp));
                    code.push(Inst::i32_const(i64::from(dest_offset)));
                    code.push(Inst::Binary(I32, BinOp::Add));
                    code.push(Inst::GetLocal(tmp));
                }
                if src_offset != 0 {
                    code.push(Inst::i32_const(i64::from(src_offset)));
                    code.push(Inst::Binary(I32, BinOp::Add));
                }
                code.push(Inst::i32_const(i64::from(size)));
                code.push(Inst::GetLocal(self.sp_local));
                code.push(Inst::Call(Callee::Runtime(RuntimeFn::Copy)));
            }
        }
    }

    pub(super) fn scalar_of(&self, ty: Option<ValType>) -> ScalarType {
        match ty {
            Some(ValType::Scalar(s)) => s,
            _ => panic!("scalar type expected"),
        }
    }
}

pub(super) fn operand_int(op: &Operand) -> u32 {
    match op {
        Operand::Int(v) => *v as u32,
        _ => panic!("integer immediate expected"),
    }
}

fn convert_inst(op: ConvertOp) -> Inst {
    use StackType::{F32, F64, I32, I64};
    match op {
        ConvertOp::Wrap => Inst::Wrap,
        ConvertOp::Extend { signed } => Inst::Extend { signed },
        ConvertOp::Promote => Inst::Promote,
        ConvertOp::Demote => Inst::Demote,
        ConvertOp::Trunc {
            to64,
            from64,
            signed,
        } => Inst::Trunc {
            to: if to64 { I64 } else { I32 },
            from: if from64 { F64 } else { F32 },
            signed,
        },
        ConvertOp::ToFloat {
            to64,
            from64,
            signed,
        } => Inst::Convert {
            to: if to64 { F64 } else { F32 },
            from: if from64 { I64 } else { I32 },
            signed,
        },
    }
}
