//! Register IR node graph.
//!
//! A function body is an arena of [`Node`]s threaded into a doubly-linked
//! control-flow chain. Structured constructs (`Block`, `Loop`, `If`) pair
//! with their `End` node through [`Node::partner`]; an `If` with an else
//! branch forks through `next[1]` and both arms rejoin at the `End`.
//! Variables live in a program-wide [`VarPool`] so globals can be referenced
//! from any body.

use crate::ir::types::{FuncTypeId, SysCall, ValType};
use crate::wasm::{BinOp, UnOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A node input: an immediate, a variable read, or the result of another
/// node consumed directly off the value stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Int(i64),
    Float(f64),
    Var(VarId),
    Node(NodeId),
}

/// Scalar width conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOp {
    /// i64 -> i32.
    Wrap,
    /// i32 -> i64.
    Extend { signed: bool },
    /// f32 -> f64.
    Promote,
    /// f64 -> f32.
    Demote,
    /// Float to integer, truncating.
    Trunc {
        to64: bool,
        from64: bool,
        signed: bool,
    },
    /// Integer to float.
    ToFloat {
        to64: bool,
        from64: bool,
        signed: bool,
    },
}

/// Call target of a call-like node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrCallee {
    /// A function declared or imported in this module.
    Func(crate::wasm::FuncId),
    /// An intrinsic routed by tag.
    Sys(SysCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Function head. Partnered with the terminating `End`.
    Define,
    DeclParam,
    DeclResult,
    DeclVar,
    Const,
    Copy,
    /// Aggregate construction; args are the field values in order.
    Struct,
    /// args: [addr, byte offset].
    Load,
    /// args: [addr, byte offset, value].
    Store,
    /// args: [var]. Forces the variable into addressable storage.
    AddrOf,
    /// Stack allocation of `args[0]` bytes, zero-initialized.
    Alloc,
    Binary(BinOp),
    Unary(UnOp),
    Convert(ConvertOp),
    Call,
    CallIndirect,
    /// First half of a split coroutine call. Produced by the step
    /// transformer.
    CallBegin,
    CallIndirectBegin,
    CallEnd,
    Spawn,
    SpawnIndirect,
    Yield,
    Return,
    Trap,
    Block,
    Loop,
    If,
    End,
    /// args: [depth]. Rewritten to `GotoStep` inside coroutines.
    Br,
    /// args: [cond, depth].
    BrIf,
    /// State-machine boundary, inserted by the step transformer.
    Step,
    GotoStep,
    GotoStepIf,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: Option<ValType>,
    /// Signature for call-like nodes and `Define`.
    pub fty: Option<FuncTypeId>,
    pub callee: Option<IrCallee>,
    pub assign: Option<VarId>,
    pub args: Vec<Operand>,
    pub next: Vec<NodeId>,
    pub prev: Vec<NodeId>,
    pub partner: Option<NodeId>,
    /// Step name, or resolved jump destination for `GotoStep`.
    pub name: Option<String>,
    /// Set on structured constructs that contain a suspension point. The
    /// step transformer dissolves async constructs and keeps sync ones.
    pub is_async: bool,
}

impl Node {
    pub fn new(kind: NodeKind) -> Node {
        Node {
            kind,
            ty: None,
            fty: None,
            callee: None,
            assign: None,
            args: Vec::new(),
            next: Vec::new(),
            prev: Vec::new(),
            partner: None,
            name: None,
            is_async: false,
        }
    }

    pub fn is_call_like(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Call
                | NodeKind::CallIndirect
                | NodeKind::CallBegin
                | NodeKind::CallIndirectBegin
        )
    }
}

/// Constant payload attached to a variable by the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstData {
    Str(String),
    /// Pre-encoded literal bytes.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub ty: Option<ValType>,
    /// Address taken somewhere; must live in addressable memory.
    pub addressable: bool,
    /// Holds a pointer the collector must be able to find.
    pub gc_visible: bool,
    pub constant: Option<ConstData>,
    pub global: bool,
    /// Live across step boundaries of a coroutine.
    pub used_in_multiple_steps: bool,
    /// Scratch for the step analysis: index of the step that last touched
    /// this variable.
    pub(crate) step_mark: Option<u32>,
}

impl Variable {
    fn new(name: String, ty: Option<ValType>, global: bool) -> Variable {
        Variable {
            name,
            ty,
            addressable: false,
            gc_visible: false,
            constant: None,
            global,
            used_in_multiple_steps: false,
            step_mark: None,
        }
    }
}

/// Program-wide variable arena. Local variables and globals share the same
/// id space; per-function storage maps are keyed by [`VarId`].
#[derive(Debug, Default)]
pub struct VarPool {
    vars: Vec<Variable>,
}

impl VarPool {
    pub fn new() -> VarPool {
        VarPool::default()
    }

    pub fn alloc(&mut self, name: String, ty: Option<ValType>, global: bool) -> VarId {
        self.vars.push(Variable::new(name, ty, global));
        VarId(self.vars.len() as u32 - 1)
    }

    pub fn get(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.index()]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// One function body: the node arena plus its entry.
#[derive(Debug)]
pub struct Body {
    pub name: String,
    pub fty: FuncTypeId,
    pub is_async: bool,
    nodes: Vec<Node>,
    pub entry: NodeId,
}

impl Body {
    pub(crate) fn with_entry(name: String, fty: FuncTypeId, is_async: bool) -> Body {
        let mut define = Node::new(NodeKind::Define);
        define.name = Some(name.clone());
        define.fty = Some(fty);
        define.is_async = is_async;
        Body {
            name,
            fty,
            is_async,
            nodes: vec![define],
            entry: NodeId(0),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() as u32 - 1)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Appends `b` to `a`'s successor list and records the back edge.
    pub fn link(&mut self, a: NodeId, b: NodeId) {
        self.nodes[a.index()].next.push(b);
        self.nodes[b.index()].prev.push(a);
    }

    /// Splices `new` into the edge `prev -> next`.
    pub fn insert_between(&mut self, prev: NodeId, next: NodeId, new: NodeId) {
        for slot in self.nodes[prev.index()].next.iter_mut() {
            if *slot == next {
                *slot = new;
            }
        }
        for slot in self.nodes[next.index()].prev.iter_mut() {
            if *slot == prev {
                *slot = new;
            }
        }
        self.nodes[new.index()].prev = vec![prev];
        self.nodes[new.index()].next = vec![next];
    }

    /// Unlinks a node, reconnecting its predecessors to its first successor.
    pub fn remove(&mut self, id: NodeId) {
        let prevs = self.nodes[id.index()].prev.clone();
        let next0 = self.nodes[id.index()].next.first().copied();
        for &p in &prevs {
            match next0 {
                Some(n0) => {
                    for slot in self.nodes[p.index()].next.iter_mut() {
                        if *slot == id {
                            *slot = n0;
                        }
                    }
                }
                None => self.nodes[p.index()].next.retain(|&x| x != id),
            }
        }
        if let Some(n0) = next0 {
            let np = &mut self.nodes[n0.index()].prev;
            np.retain(|&x| x != id);
            for &p in &prevs {
                if !np.contains(&p) {
                    np.push(p);
                }
            }
        }
        self.nodes[id.index()].prev.clear();
        self.nodes[id.index()].next.clear();
    }
}
