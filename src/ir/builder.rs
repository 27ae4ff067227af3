//! Construction API for function bodies.
//!
//! The builder appends nodes to a chain and keeps a stack of open structured
//! constructs so branch depths can be resolved at build time. `br` nodes
//! carry their numeric depth and keep a partner link to the construct they
//! target; the step transformer needs the latter to retarget branches that
//! cross step boundaries.

use crate::ir::node::{Body, ConstData, IrCallee, Node, NodeId, NodeKind, Operand, VarId, VarPool};
use crate::ir::types::{FuncTypeId, TypeTable, ValType};

struct OpenBlock {
    node: NodeId,
    /// Tail of the then-branch, recorded when `else_` switches arms.
    then_tail: Option<NodeId>,
}

pub struct FuncBuilder<'t, 'p> {
    types: &'t TypeTable,
    pool: &'p mut VarPool,
    body: Body,
    blocks: Vec<OpenBlock>,
    current: NodeId,
    tmp_count: u32,
}

impl<'t, 'p> FuncBuilder<'t, 'p> {
    pub fn new(
        types: &'t TypeTable,
        pool: &'p mut VarPool,
        name: &str,
        fty: FuncTypeId,
    ) -> FuncBuilder<'t, 'p> {
        let is_async = types.func(fty).is_async();
        let body = Body::with_entry(name.to_string(), fty, is_async);
        let entry = body.entry;
        FuncBuilder {
            types,
            pool,
            body,
            blocks: Vec::new(),
            current: entry,
            tmp_count: 0,
        }
    }

    fn push(&mut self, node: Node) -> NodeId {
        let id = self.body.add(node);
        self.body.link(self.current, id);
        self.current = id;
        id
    }

    fn decl(&mut self, kind: NodeKind, name: &str, ty: ValType) -> VarId {
        let v = self.pool.alloc(name.to_string(), Some(ty), false);
        self.pool.get_mut(v).gc_visible = self.types.contains_ptr(ty);
        let mut n = Node::new(kind);
        n.ty = Some(ty);
        n.assign = Some(v);
        self.push(n);
        v
    }

    pub fn decl_param(&mut self, name: &str, ty: ValType) -> VarId {
        self.decl(NodeKind::DeclParam, name, ty)
    }

    pub fn decl_result(&mut self, name: &str, ty: ValType) -> VarId {
        self.decl(NodeKind::DeclResult, name, ty)
    }

    pub fn decl_var(&mut self, name: &str, ty: ValType) -> VarId {
        self.decl(NodeKind::DeclVar, name, ty)
    }

    /// A fresh unnamed variable.
    pub fn tmp(&mut self, ty: ValType) -> VarId {
        self.tmp_count += 1;
        let v = self
            .pool
            .alloc(format!("%{}", self.tmp_count), Some(ty), false);
        self.pool.get_mut(v).gc_visible = self.types.contains_ptr(ty);
        v
    }

    /// Attaches a compile-time payload to a variable. The storage allocator
    /// interns such variables into the module's constant pool.
    pub fn mark_constant(&mut self, v: VarId, data: ConstData) {
        self.pool.get_mut(v).constant = Some(data);
    }

    /// A detached value node consumed directly off the target's value stack
    /// by the operation that receives the returned operand. The node is not
    /// part of the control-flow chain.
    pub fn expr(&mut self, kind: NodeKind, ty: ValType, args: Vec<Operand>) -> Operand {
        if kind == NodeKind::AddrOf {
            if let Some(Operand::Var(v)) = args.first() {
                self.pool.get_mut(*v).addressable = true;
            }
        }
        let mut n = Node::new(kind);
        n.ty = Some(ty);
        n.args = args;
        Operand::Node(self.body.add(n))
    }

    /// Generic value-producing node.
    pub fn assign(
        &mut self,
        dest: Option<VarId>,
        kind: NodeKind,
        ty: Option<ValType>,
        args: Vec<Operand>,
    ) -> NodeId {
        if kind == NodeKind::AddrOf {
            if let Some(Operand::Var(v)) = args.first() {
                self.pool.get_mut(*v).addressable = true;
            }
        }
        let mut n = Node::new(kind);
        n.ty = ty;
        n.assign = dest;
        n.args = args;
        self.push(n)
    }

    /// Marks every open construct and the body itself as containing a
    /// suspension point.
    fn mark_async(&mut self) {
        let entry = self.body.entry;
        self.body.node_mut(entry).is_async = true;
        for i in 0..self.blocks.len() {
            let b = self.blocks[i].node;
            self.body.node_mut(b).is_async = true;
        }
    }

    pub fn call(
        &mut self,
        dest: Option<VarId>,
        fty: FuncTypeId,
        callee: IrCallee,
        args: Vec<Operand>,
    ) -> NodeId {
        let ft = self.types.func(fty);
        let ty = ft.result;
        let is_async = ft.is_async();
        let mut n = Node::new(NodeKind::Call);
        n.ty = ty;
        n.fty = Some(fty);
        n.callee = Some(callee);
        n.assign = dest;
        n.args = args;
        let id = self.push(n);
        if is_async {
            self.mark_async();
        }
        id
    }

    /// Indirect call through the function table; `index` is the table slot.
    pub fn call_indirect(
        &mut self,
        dest: Option<VarId>,
        fty: FuncTypeId,
        index: Operand,
        mut args: Vec<Operand>,
    ) -> NodeId {
        let ft = self.types.func(fty);
        let ty = ft.result;
        let is_async = ft.is_async();
        let mut all = vec![index];
        all.append(&mut args);
        let mut n = Node::new(NodeKind::CallIndirect);
        n.ty = ty;
        n.fty = Some(fty);
        n.assign = dest;
        n.args = all;
        let id = self.push(n);
        if is_async {
            self.mark_async();
        }
        id
    }

    /// Launches a coroutine running `callee` concurrently.
    pub fn spawn(&mut self, fty: FuncTypeId, callee: IrCallee, args: Vec<Operand>) -> NodeId {
        let mut n = Node::new(NodeKind::Spawn);
        n.fty = Some(fty);
        n.callee = Some(callee);
        n.args = args;
        self.push(n)
    }

    pub fn spawn_indirect(
        &mut self,
        fty: FuncTypeId,
        index: Operand,
        mut args: Vec<Operand>,
    ) -> NodeId {
        let mut all = vec![index];
        all.append(&mut args);
        let mut n = Node::new(NodeKind::SpawnIndirect);
        n.fty = Some(fty);
        n.args = all;
        self.push(n)
    }

    pub fn block(&mut self) -> NodeId {
        let id = self.push(Node::new(NodeKind::Block));
        self.blocks.push(OpenBlock {
            node: id,
            then_tail: None,
        });
        id
    }

    pub fn loop_(&mut self) -> NodeId {
        let id = self.push(Node::new(NodeKind::Loop));
        self.blocks.push(OpenBlock {
            node: id,
            then_tail: None,
        });
        id
    }

    pub fn if_(&mut self, cond: Operand) -> NodeId {
        let mut n = Node::new(NodeKind::If);
        n.args = vec![cond];
        let id = self.push(n);
        self.blocks.push(OpenBlock {
            node: id,
            then_tail: None,
        });
        id
    }

    /// Switches to the else arm of the innermost open `if`.
    pub fn else_(&mut self) {
        let open = self
            .blocks
            .last_mut()
            .unwrap_or_else(|| panic!("else outside of if"));
        open.then_tail = Some(self.current);
        self.current = open.node;
    }

    /// Closes the innermost open construct.
    pub fn end(&mut self) {
        let open = self
            .blocks
            .pop()
            .unwrap_or_else(|| panic!("end without open block"));
        let mut e = Node::new(NodeKind::End);
        e.partner = Some(open.node);
        let end = self.body.add(e);
        // Link the then-arm tail first so it lands in prev[0]; the step
        // transformer relies on that ordering when it splices jumps in
        // front of an `End`.
        if let Some(tt) = open.then_tail {
            self.body.link(tt, end);
        }
        self.body.link(self.current, end);
        self.body.node_mut(open.node).partner = Some(end);
        self.current = end;
    }

    fn depth_of(&self, target: NodeId) -> i64 {
        for (i, b) in self.blocks.iter().enumerate().rev() {
            if b.node == target {
                return (self.blocks.len() - 1 - i) as i64;
            }
        }
        panic!("branch target is not an open block");
    }

    /// Branch out of `target` (a block) or back to it (a loop).
    pub fn br(&mut self, target: NodeId) -> NodeId {
        let depth = self.depth_of(target);
        let mut n = Node::new(NodeKind::Br);
        n.args = vec![Operand::Int(depth)];
        n.partner = Some(target);
        self.push(n)
    }

    pub fn br_if(&mut self, cond: Operand, target: NodeId) -> NodeId {
        let depth = self.depth_of(target);
        let mut n = Node::new(NodeKind::BrIf);
        n.args = vec![cond, Operand::Int(depth)];
        n.partner = Some(target);
        self.push(n)
    }

    /// Suspension point. Only meaningful inside coroutine bodies.
    pub fn yield_(&mut self) -> NodeId {
        let id = self.push(Node::new(NodeKind::Yield));
        self.mark_async();
        id
    }

    pub fn ret(&mut self, args: Vec<Operand>) -> NodeId {
        let mut n = Node::new(NodeKind::Return);
        n.args = args;
        self.push(n)
    }

    pub fn trap(&mut self) -> NodeId {
        self.push(Node::new(NodeKind::Trap))
    }

    /// Closes the body and returns it. All structured constructs must have
    /// been ended.
    pub fn finish(mut self) -> Body {
        debug_assert!(self.blocks.is_empty(), "unclosed block at end of body");
        let entry = self.body.entry;
        let mut e = Node::new(NodeKind::End);
        e.partner = Some(entry);
        let end = self.body.add(e);
        self.body.link(self.current, end);
        self.body.node_mut(entry).partner = Some(end);
        self.body
    }
}

#[cfg(test)]
#[path = "tests/t_builder.rs"]
mod t_builder;
