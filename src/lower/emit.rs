//! Statement emission and the step bodies of coroutines.
//!
//! `emit_code` walks a linear chain of statement nodes and appends target
//! instructions. For coroutines it is invoked once per step; jumps between
//! steps become branches out of the nest of blocks that the dispatch loop
//! wraps around the step bodies.

use crate::ir::types::{ScalarType, ValType};
use crate::ir::{Body, IrCallee, NodeId, NodeKind, Operand, END_STEP};
use crate::lower::error::LowerError;
use crate::lower::func::{narrow_load, FuncLower};
use crate::lower::storage::Storage;
use crate::lower::value::{operand_int, Dest};
use crate::lower::STEP_FRESH;
use crate::wasm::{BinOp, Callee, Inst, RuntimeFn, StackType};

impl FuncLower<'_> {
    /// Emits one code block per step. Block `i` of the dispatch nest closes
    /// right before the step's instructions, so `br_table` entry `i` lands
    /// exactly there.
    pub(super) fn emit_steps(&mut self, body: &Body) -> Result<(), LowerError> {
        let total = self.steps.len();
        let calls = self.async_calls.len();
        for i in 0..total {
            let start = body.node(self.steps[i]).next[0];
            let depth = (total - i - 1 + calls) as u32;
            let mut code = vec![Inst::Comment(format!("STEP {}", i)), Inst::End];
            self.emit_code(i as u32, start, None, &mut code, depth, 0, body)?;
            self.step_code.push(code);
        }
        Ok(())
    }

    /// Lowers the statement chain starting at `start` until `end`, a step
    /// boundary, or an unconditional jump. `depth` is the number of blocks
    /// between the current position and the dispatch loop, `additional`
    /// counts structured constructs opened inside the step.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn emit_code(
        &mut self,
        step: u32,
        start: NodeId,
        end: Option<NodeId>,
        code: &mut Vec<Inst>,
        depth: u32,
        additional: u32,
        body: &Body,
    ) -> Result<(), LowerError> {
        let mut cur = Some(start);
        while let Some(id) = cur {
            if Some(id) == end {
                break;
            }
            let n = body.node(id);
            let kind = n.kind;
            let next = n.next.first().copied();
            match kind {
                NodeKind::Step => break,
                NodeKind::End | NodeKind::Define => break,
                NodeKind::DeclParam | NodeKind::DeclResult | NodeKind::DeclVar => {}

                NodeKind::GotoStep => {
                    let name = n.name.clone().unwrap_or_default();
                    self.emit_goto(step, &name, depth, additional, code);
                    break;
                }
                NodeKind::GotoStepIf => {
                    let name = n.name.clone().unwrap_or_default();
                    let cond = n.args[0].clone();
                    self.emit_word_assign(
                        Some(ValType::Scalar(ScalarType::S32)),
                        &cond,
                        true,
                        code,
                        body,
                    )?;
                    if name == END_STEP {
                        code.push(Inst::If);
                        code.push(Inst::i32_const(0));
                        code.push(Inst::Return);
                        code.push(Inst::End);
                    } else {
                        let target = self.step_number_from_name(&name);
                        if target > step {
                            code.push(Inst::BrIf(target - step + additional - 1));
                        } else {
                            code.push(Inst::If);
                            code.push(Inst::i32_const(i64::from(target)));
                            code.push(Inst::SetLocal(self.step_local));
                            code.push(Inst::Br(depth + additional + 1));
                            code.push(Inst::End);
                        }
                    }
                }

                NodeKind::Yield => {
                    // Suspend: branch out to the async-call block that
                    // records the resume step.
                    let jump = (depth + additional + self.async_call_code.len() as u32)
                        - self.async_calls.len() as u32;
                    code.push(Inst::Br(jump));
                    cur = Some(self.expect_step_jump(id, "yield", body)?);
                    continue;
                }

                NodeKind::CallBegin | NodeKind::CallIndirectBegin => {
                    self.emit_call_begin(id, depth, additional, code, body)?;
                    cur = Some(self.expect_step_jump(id, "coroutine call", body)?);
                    continue;
                }
                NodeKind::CallEnd => self.emit_call_end(id, code, body)?,

                NodeKind::Store => {
                    let ty = n.ty;
                    let args = n.args.clone();
                    self.emit_word_assign(
                        Some(ValType::Scalar(ScalarType::Addr)),
                        &args[0],
                        true,
                        code,
                        body,
                    )?;
                    let off = operand_int(&args[1]);
                    let from_call = match &args[2] {
                        Operand::Node(m) if body.node(*m).kind == NodeKind::CallEnd => Some(*m),
                        _ => None,
                    };
                    match from_call {
                        Some(m) => {
                            // Copy straight out of the callee frame into the
                            // target address, then pop the frame.
                            let fty = body.node(m).fty.unwrap_or_else(|| {
                                panic!("coroutine call without a signature")
                            });
                            let frame = self.frame_of(fty);
                            let result_off = frame.field_offset("$result", &self.func_name);
                            code.push(Inst::GetLocal(self.sp_local));
                            let ty = ty.unwrap_or(ValType::Scalar(ScalarType::Addr));
                            self.emit_copy(ty, result_off, off, code);
                            self.pop_call_frame(frame.size(), code);
                        }
                        None => {
                            self.emit_assign(ty, &args[2], Some(Dest::Heap), off, code, body)?;
                        }
                    }
                }

                NodeKind::Spawn | NodeKind::SpawnIndirect => {
                    self.emit_spawn(id, code, body)?;
                }

                NodeKind::Return => self.emit_return(id, code, body)?,
                NodeKind::Trap => code.push(Inst::Unreachable),

                NodeKind::If => {
                    let cond = n.args[0].clone();
                    let then_entry = n.next[0];
                    let else_entry = n.next.get(1).copied();
                    let close = n.partner.unwrap_or_else(|| panic!("if without end"));
                    self.emit_word_assign(n.ty, &cond, true, code, body)?;
                    code.push(Inst::If);
                    self.emit_code(step, then_entry, Some(close), code, depth, additional + 1, body)?;
                    if let Some(e) = else_entry {
                        code.push(Inst::Else);
                        self.emit_code(step, e, Some(close), code, depth, additional + 1, body)?;
                    }
                    code.push(Inst::End);
                    cur = body.node(close).next.first().copied();
                    continue;
                }
                NodeKind::Block | NodeKind::Loop => {
                    let entry = n.next[0];
                    let close = n.partner.unwrap_or_else(|| panic!("block without end"));
                    code.push(if kind == NodeKind::Loop {
                        Inst::Loop
                    } else {
                        Inst::Block
                    });
                    self.emit_code(step, entry, Some(close), code, depth, additional + 1, body)?;
                    code.push(Inst::End);
                    cur = body.node(close).next.first().copied();
                    continue;
                }
                NodeKind::Br => {
                    code.push(Inst::Br(operand_int(&n.args[0])));
                    break;
                }
                NodeKind::BrIf => {
                    let args = n.args.clone();
                    self.emit_word_assign(
                        Some(ValType::Scalar(ScalarType::S32)),
                        &args[0],
                        true,
                        code,
                        body,
                    )?;
                    code.push(Inst::BrIf(operand_int(&args[1])));
                }

                // Expression in statement position: evaluate for effect.
                NodeKind::Const
                | NodeKind::Copy
                | NodeKind::Struct
                | NodeKind::Load
                | NodeKind::AddrOf
                | NodeKind::Alloc
                | NodeKind::Binary(_)
                | NodeKind::Unary(_)
                | NodeKind::Convert(_)
                | NodeKind::Call
                | NodeKind::CallIndirect => {
                    let ty = match n.kind {
                        NodeKind::Call | NodeKind::CallIndirect => {
                            let fty =
                                n.fty.unwrap_or_else(|| panic!("call without a signature"));
                            self.types.func(fty).result
                        }
                        _ => n.ty,
                    };
                    self.emit_assign(ty, &Operand::Node(id), None, 0, code, body)?;
                }
            }
            cur = next;
        }
        Ok(())
    }

    /// Unconditional jump to another step.
    fn emit_goto(&mut self, step: u32, name: &str, depth: u32, additional: u32, code: &mut Vec<Inst>) {
        if name == END_STEP {
            code.push(Inst::i32_const(0));
            code.push(Inst::Return);
            return;
        }
        let target = self.step_number_from_name(name);
        if target > step {
            // The next step's block opens right after this one; an
            // immediate successor is plain fall-through.
            if target != step + 1 || additional != 0 {
                code.push(Inst::Br(target - step + additional - 1));
            }
        } else {
            code.push(Inst::i32_const(i64::from(target)));
            code.push(Inst::SetLocal(self.step_local));
            code.push(Inst::Br(depth + additional));
        }
    }

    /// The node after a suspension point must name the step to resume at.
    /// Registers the async-call block that stores it and returns the jump
    /// node so the caller continues there.
    fn expect_step_jump(
        &mut self,
        id: NodeId,
        after: &'static str,
        body: &Body,
    ) -> Result<NodeId, LowerError> {
        let next = body.node(id).next.first().copied();
        let goto = match next {
            Some(g) if body.node(g).kind == NodeKind::GotoStep => g,
            _ => {
                return Err(LowerError::MissingStepJump {
                    func: self.func_name.clone(),
                    after,
                })
            }
        };
        let name = body.node(goto).name.clone().unwrap_or_default();
        if name == END_STEP {
            return Err(LowerError::JumpLeavesFunction {
                func: self.func_name.clone(),
                after,
            });
        }
        let resume = self.step_number_from_name(&name);
        let j = self.async_call_code.len() as u32;
        let total = self.async_calls.len() as u32;
        self.async_call_code.push(vec![
            Inst::Comment(format!("ASYNC CALL {}", j)),
            Inst::End,
            Inst::i32_const(i64::from(resume)),
            Inst::SetLocal(self.step_local),
            Inst::Br(total - j),
        ]);
        Ok(goto)
    }

    /// Calls a coroutine. If the callee suspends it hands back its frame
    /// pointer and we suspend as well; otherwise execution falls through to
    /// the matching `call_end`.
    fn emit_call_begin(
        &mut self,
        id: NodeId,
        depth: u32,
        additional: u32,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let n = body.node(id);
        let indirect = n.kind == NodeKind::CallIndirectBegin;
        let callee = n.callee;
        let args = n.args.clone();
        let fty = n.fty.unwrap_or_else(|| panic!("coroutine call without a signature"));
        let ft = self.types.func(fty).clone();
        let frame = self.frame_of(fty);
        let arg_base = usize::from(indirect);

        if frame.size() > 0 {
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::i32_const(i64::from(frame.size())));
            code.push(Inst::Binary(StackType::I32, BinOp::Sub));
            code.push(Inst::SetLocal(self.sp_local));
        }
        // Step argument: a fresh activation.
        code.push(Inst::i32_const(i64::from(STEP_FRESH)));

        let mut sig_params = vec![StackType::I32];
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
        code.push(Inst::GetLocal(self.sp_local));
        if indirect {
            sig_params.push(StackType::I32);
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
                results: vec![StackType::I32],
            };
            let idx = self.module.add_sig(sig);
            code.push(Inst::CallIndirect(idx));
        } else {
            match callee {
                Some(IrCallee::Func(f)) => code.push(Inst::Call(Callee::Index(f.0))),
                _ => panic!("coroutine call without a direct callee"),
            }
        }
        code.push(Inst::TeeLocal(self.async_ret_local));
        let jump = (depth + additional + self.async_call_code.len() as u32)
            - self.async_calls.len() as u32;
        code.push(Inst::BrIf(jump));
        Ok(())
    }

    /// Picks the result out of the callee frame and pops it.
    fn emit_call_end(
        &mut self,
        id: NodeId,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let n = body.node(id);
        let assign = n.assign;
        let fty = n.fty.unwrap_or_else(|| panic!("coroutine call without a signature"));
        let ft = self.types.func(fty).clone();
        let frame = self.frame_of(fty);
        if let Some(v) = assign {
            let result_off = frame.field_offset("$result", &self.func_name);
            match ft.result {
                Some(r @ ValType::Struct(_)) => {
                    let dest = self.emit_addr_of_var(v, true, code)?;
                    code.push(Inst::GetLocal(self.sp_local));
                    self.emit_copy(r, result_off, dest, code);
                }
                Some(ValType::Scalar(sc)) => {
                    self.store_var_1(v, code);
                    code.push(Inst::GetLocal(self.sp_local));
                    code.push(Inst::Load {
                        ty: sc.stack_type(),
                        width: narrow_load(sc),
                        offset: result_off,
                    });
                    self.store_var_2(sc, v, false, code);
                }
                None => panic!("assignment from a call without a result"),
            }
        }
        self.pop_call_frame(frame.size(), code);
        Ok(())
    }

    fn pop_call_frame(&mut self, size: u32, code: &mut Vec<Inst>) {
        if size > 0 {
            code.push(Inst::GetLocal(self.sp_local));
            code.push(Inst::i32_const(i64::from(size)));
            code.push(Inst::Binary(StackType::I32, BinOp::Add));
            code.push(Inst::SetLocal(self.sp_local));
        }
    }

    /// Launches a coroutine on its own stack. The callee runs up to its
    /// first suspension there, then control returns to the spawner.
    fn emit_spawn(
        &mut self,
        id: NodeId,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let saved_sp = self.alloc_local(StackType::I32);
        let coroutine = self.alloc_local(StackType::I32);
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::SetLocal(saved_sp));
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::Call(Callee::Runtime(RuntimeFn::CreateCoroutine)));
        code.push(Inst::TeeLocal(coroutine));
        code.push(Inst::GetLocal(coroutine));
        // Switch to the coroutine's stack top.
        code.push(Inst::Load {
            ty: StackType::I32,
            width: None,
            offset: 8,
        });
        code.push(Inst::SetLocal(self.sp_local));
        self.emit_assign(None, &Operand::Node(id), None, 0, code, body)?;
        // The frame pointer of the suspended activation.
        code.push(Inst::Store {
            ty: StackType::I32,
            width: None,
            offset: 16,
        });
        code.push(Inst::GetLocal(saved_sp));
        code.push(Inst::SetLocal(self.sp_local));
        code.push(Inst::GetLocal(coroutine));
        code.push(Inst::GetLocal(self.sp_local));
        code.push(Inst::Call(Callee::Runtime(RuntimeFn::ScheduleCoroutine)));
        self.free_local(coroutine);
        self.free_local(saved_sp);
        Ok(())
    }

    fn emit_return(
        &mut self,
        id: NodeId,
        code: &mut Vec<Inst>,
        body: &Body,
    ) -> Result<(), LowerError> {
        let args = body.node(id).args.clone();
        if args.len() != self.return_vars.len() {
            return Err(LowerError::ReturnArity {
                func: self.func_name.clone(),
                expected: self.return_vars.len(),
                got: args.len(),
            });
        }
        if !self.is_async && self.result_frame.is_empty() {
            // Direct results travel on the value stack.
            for (i, arg) in args.iter().enumerate() {
                let ty = self.type_of_var(self.return_vars[i]);
                self.emit_assign(Some(ty), arg, Some(Dest::WasmStack), 0, code, body)?;
            }
            code.push(Inst::Return);
            return Ok(());
        }
        for (i, arg) in args.iter().enumerate() {
            let v = self.return_vars[i];
            let ty = self.type_of_var(v);
            let off = match self.storage_of(v) {
                Storage::Result(o) => self.vars_frame.size() + o,
                other => panic!("result variable with storage {:?}", other),
            };
            let from_call = match arg {
                Operand::Node(m) if body.node(*m).kind == NodeKind::CallEnd => Some(*m),
                _ => None,
            };
            match from_call {
                Some(m) => {
                    // Forwarding a coroutine result: copy callee frame to
                    // our result slot, then pop the callee frame.
                    let cfty = body.node(m).fty.unwrap_or_else(|| {
                        panic!("coroutine call without a signature")
                    });
                    let frame = self.frame_of(cfty);
                    let result_off = frame.field_offset("$result", &self.func_name);
                    code.push(Inst::GetLocal(self.bp()));
                    code.push(Inst::GetLocal(self.sp_local));
                    self.emit_copy(ty, result_off, off, code);
                    self.pop_call_frame(frame.size(), code);
                }
                None => {
                    code.push(Inst::GetLocal(self.bp()));
                    self.emit_assign(Some(ty), arg, Some(Dest::Heap), off, code, body)?;
                }
            }
        }
        if self.is_async {
            // Finished: no frame pointer to hand back.
            code.push(Inst::i32_const(0));
        }
        code.push(Inst::Return);
        Ok(())
    }
}
