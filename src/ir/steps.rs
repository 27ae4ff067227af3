//! Step partitioning for coroutine bodies.
//!
//! Rewrites the structured control flow of a suspendable function into a
//! flat sequence of steps. `Step` nodes mark resumable entry points;
//! branches that cross a suspension point become `GotoStep`/`GotoStepIf`
//! jumps whose destination is resolved to a step name. Structured
//! constructs that contain no suspension survive untouched inside their
//! step; async constructs are dissolved.

use crate::ir::node::{Body, Node, NodeId, NodeKind};
use crate::ir::types::TypeTable;

/// Jump destination used when a `GotoStep` leaves the function instead of
/// entering another step.
pub const END_STEP: &str = "<end>";

pub struct StepTransformer {
    step_counter: u32,
}

impl StepTransformer {
    pub fn new() -> StepTransformer {
        StepTransformer { step_counter: 0 }
    }

    /// Rewrites `body` in place. Bodies without suspension points are left
    /// alone.
    pub fn transform(&mut self, types: &TypeTable, body: &mut Body) {
        if !body.node(body.entry).is_async {
            return;
        }
        let entry = body.entry;
        let end = match body.node(entry).partner {
            Some(e) => e,
            None => return,
        };
        self.transform_up_to(types, body, entry, end, None, false);
        self.resolve_jumps(body, entry);
        self.cleanup(body, entry);
    }

    fn fresh_step(&mut self, body: &mut Body) -> NodeId {
        let mut s = Node::new(NodeKind::Step);
        s.name = Some(format!("s{}", self.step_counter));
        self.step_counter += 1;
        body.add(s)
    }

    /// Walks the chain from `start` to `end_node`, inserting `Step` markers
    /// and converting suspension-crossing control flow into step jumps.
    fn transform_up_to(
        &mut self,
        types: &TypeTable,
        body: &mut Body,
        start: NodeId,
        end_node: NodeId,
        mut step: Option<NodeId>,
        else_clause: bool,
    ) {
        let mut cur = Some(start);
        if let Some(id) = cur {
            if body.node(id).kind == NodeKind::Define {
                cur = body.node(id).next.first().copied();
            }
        }
        while let Some(id) = cur {
            let kind = body.node(id).kind;
            match kind {
                NodeKind::Block | NodeKind::Loop => {
                    if body.node(id).is_async {
                        if step.is_some() {
                            let prev0 = body.node(id).prev[0];
                            let goto = body.add(Node::new(NodeKind::GotoStep));
                            body.insert_between(prev0, id, goto);
                            step = None;
                        }
                        cur = body.node(id).next.first().copied();
                    } else {
                        // Wholly synchronous; continue behind its end.
                        let partner = body.node(id).partner;
                        cur = partner.and_then(|p| body.node(p).next.first().copied());
                    }
                }
                NodeKind::If => {
                    if body.node(id).is_async {
                        if step.is_none() {
                            let prev0 = body.node(id).prev[0];
                            let s = self.fresh_step(body);
                            body.insert_between(prev0, id, s);
                            step = Some(s);
                        }
                        if let Some(alt) = body.node(id).next.get(1).copied() {
                            let partner = body.node(id).partner.unwrap_or(end_node);
                            self.transform_up_to(types, body, alt, partner, step, true);
                        }
                        cur = body.node(id).next.first().copied();
                    } else {
                        let partner = body.node(id).partner;
                        cur = partner.and_then(|p| body.node(p).next.first().copied());
                    }
                }
                NodeKind::End => {
                    if step.is_some() {
                        let partner = body.node(id).partner;
                        let prev_idx = if else_clause { 1 } else { 0 };
                        let prev = body.node(id).prev.get(prev_idx).copied();
                        let from_if = partner.map(|p| body.node(p).kind == NodeKind::If) == Some(true);
                        match prev {
                            Some(p) if !from_if && body.node(p).kind == NodeKind::Return => {
                                // A return already left the step.
                                step = None;
                            }
                            Some(p) => {
                                let goto = body.add(Node::new(NodeKind::GotoStep));
                                body.insert_between(p, id, goto);
                                step = None;
                            }
                            None => step = None,
                        }
                    }
                    if id == end_node {
                        break;
                    }
                    cur = body.node(id).next.first().copied();
                }
                _ => {
                    if step.is_none() {
                        let prev0 = body.node(id).prev[0];
                        let s = self.fresh_step(body);
                        body.insert_between(prev0, id, s);
                        step = Some(s);
                    }
                    match kind {
                        NodeKind::Br => {
                            let n = body.node_mut(id);
                            n.kind = NodeKind::GotoStep;
                            n.args.clear();
                            self.retarget(body, id);
                            step = None;
                            cur = body.node(id).next.first().copied();
                        }
                        NodeKind::BrIf => {
                            let n = body.node_mut(id);
                            n.kind = NodeKind::GotoStepIf;
                            n.args.remove(1);
                            self.retarget(body, id);
                            cur = body.node(id).next.first().copied();
                        }
                        NodeKind::Call | NodeKind::CallIndirect
                            if body
                                .node(id)
                                .fty
                                .map(|f| types.func(f).is_async())
                                .unwrap_or(false) =>
                        {
                            let (assign, ty, fty) = {
                                let n = body.node_mut(id);
                                n.kind = if n.kind == NodeKind::Call {
                                    NodeKind::CallBegin
                                } else {
                                    NodeKind::CallIndirectBegin
                                };
                                let a = n.assign.take();
                                (a, n.ty, n.fty)
                            };
                            let mut result = Node::new(NodeKind::CallEnd);
                            result.assign = assign;
                            result.ty = ty;
                            result.fty = fty;
                            let result = body.add(result);
                            let goto = body.add(Node::new(NodeKind::GotoStep));
                            let next0 = body.node(id).next[0];
                            body.insert_between(id, next0, goto);
                            let after = body.node(goto).next[0];
                            body.insert_between(goto, after, result);
                            step = None;
                            // The call_end opens the next step.
                            cur = Some(result);
                        }
                        NodeKind::Yield => {
                            let goto = body.add(Node::new(NodeKind::GotoStep));
                            let next0 = body.node(id).next[0];
                            body.insert_between(id, next0, goto);
                            step = None;
                            cur = body.node(goto).next.first().copied();
                        }
                        _ => {
                            cur = body.node(id).next.first().copied();
                        }
                    }
                }
            }
        }
    }

    /// Redirects a converted branch at the node where its destination step
    /// will be searched: a loop header for back edges, the construct's end
    /// for forward edges.
    fn retarget(&self, body: &mut Body, id: NodeId) {
        if let Some(p) = body.node(id).partner {
            if body.node(p).kind != NodeKind::Loop {
                body.node_mut(id).partner = body.node(p).partner;
            }
        }
    }

    fn next_step(&self, body: &Body, from: NodeId) -> Option<NodeId> {
        let mut cur = Some(from);
        while let Some(id) = cur {
            if body.node(id).kind == NodeKind::Step {
                return Some(id);
            }
            cur = body.node(id).next.first().copied();
        }
        None
    }

    /// Resolves every `GotoStep`/`GotoStepIf` to the name of its destination
    /// step, or to [`END_STEP`] when execution falls off the function.
    fn resolve_jumps(&self, body: &mut Body, start: NodeId) {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let kind = body.node(id).kind;
            if kind == NodeKind::GotoStep || kind == NodeKind::GotoStepIf {
                let from = body.node(id).partner.unwrap_or(id);
                let dest = self.next_step(body, from);
                let n = body.node_mut(id);
                n.partner = dest;
                n.name = match dest {
                    Some(_) => None,
                    None => Some(END_STEP.to_string()),
                };
                if let Some(d) = dest {
                    let name = body.node(d).name.clone();
                    body.node_mut(id).name = name;
                }
                cur = body.node(id).next.first().copied();
            } else if kind == NodeKind::If && body.node(id).next.len() > 1 {
                let alt = body.node(id).next[1];
                self.resolve_jumps(body, alt);
                cur = body.node(id).next.first().copied();
            } else {
                cur = body.node(id).next.first().copied();
            }
        }
    }

    /// Drops the async structured nodes the state machine no longer needs.
    fn cleanup(&self, body: &mut Body, start: NodeId) {
        let mut cur = Some(start);
        while let Some(id) = cur {
            let (kind, is_async, partner, alt) = {
                let n = body.node(id);
                (n.kind, n.is_async, n.partner, n.next.get(1).copied())
            };
            if kind == NodeKind::If && alt.is_some() {
                if let Some(alt) = alt {
                    self.cleanup(body, alt);
                }
                cur = body.node(id).next.first().copied();
            } else {
                // Only dissolved constructs lose their end; the ends of the
                // body and of surviving ifs stay on the chain.
                let dissolve = (is_async
                    && (kind == NodeKind::Block || kind == NodeKind::Loop))
                    || (kind == NodeKind::End
                        && partner.map(|p| {
                            let pn = body.node(p);
                            pn.is_async
                                && (pn.kind == NodeKind::Block || pn.kind == NodeKind::Loop)
                        }) == Some(true));
                if dissolve {
                    let next = body.node(id).next.first().copied();
                    body.remove(id);
                    cur = next;
                } else {
                    cur = body.node(id).next.first().copied();
                }
            }
        }
    }
}

impl Default for StepTransformer {
    fn default() -> Self {
        StepTransformer::new()
    }
}

#[cfg(test)]
#[path = "tests/t_steps.rs"]
mod t_steps;
