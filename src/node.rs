use std::rc::Rc;

use crate::bounds;
use crate::conjunct::Conjunct;
use crate::context::OpContext;
use crate::disjunct::EnvDisjunct;
use crate::error::{Bottom, ErrorCode, Pos};
use crate::kind::Kind;
use crate::sched::{self, Scheduler};
use crate::value::Value;
use crate::vertex::VertexId;

/// A conjunct whose processing is postponed until a non-cyclic conjunct
/// permits it, paired with the vertex its reference resolved to.
#[derive(Debug, Clone)]
pub struct CyclicConjunct {
    pub c: Conjunct,
    pub arc: VertexId,
}

/// The list requirements accumulated on a node: the longest list seen so
/// far and whether any contributing list was closed.
#[derive(Debug, Clone, Copy)]
pub struct ListReq {
    pub len: usize,
    pub open: bool,
    pub pos: Pos,
}

/// NodeContext is the transient workspace of one in-progress vertex. It
/// accumulates pending work while the vertex evaluates and is recycled
/// through the session pool once the vertex finalizes.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node: VertexId,
    pub sched: Scheduler,

    pub is_initialized: bool,

    /// Depth of the vertex in the tree; used to find "new structure"
    /// between the endpoints of a cycle.
    pub depth: u32,

    /// The session evaluation depth at which this node started processing.
    /// Non-zero for all vertices on the current evaluation path, which is
    /// what makes ancestors detectable.
    pub eval_depth: u32,

    /// Running meet of the kinds of all conjuncts.
    pub kind: Kind,
    pub kind_pos: Pos,

    /// The concrete scalar, once one arrived.
    pub scalar: Option<Value>,
    pub scalar_pos: Pos,

    /// Accumulated bounds and validators, eagerly simplified.
    pub checks: Vec<Value>,

    pub errs: Option<Rc<Bottom>>,

    pub has_top: bool,
    pub has_struct_conjunct: bool,

    pub list: Option<ListReq>,

    /// Cycle bookkeeping (see the cycle detector).
    pub cyclic_conjuncts: Vec<CyclicConjunct>,
    pub has_non_cycle: bool,
    pub has_non_cyclic: bool,
    pub has_any_cyclic_conjunct: bool,
    pub has_ancestor_cycle: bool,

    /// Disjunctions to resolve during finalization, in insertion order.
    pub disjunctions: Vec<EnvDisjunct>,

    /// For overlay clones: the original vertex this workspace shadows.
    pub underlying: Option<VertexId>,

    pub is_completing: u32,
}

impl NodeContext {
    pub fn new(node: VertexId) -> NodeContext {
        NodeContext {
            node,
            sched: Scheduler::new(),
            is_initialized: false,
            depth: 0,
            eval_depth: 0,
            kind: Kind::TOP,
            kind_pos: Pos::NONE,
            scalar: None,
            scalar_pos: Pos::NONE,
            checks: Vec::new(),
            errs: None,
            has_top: false,
            has_struct_conjunct: false,
            list: None,
            cyclic_conjuncts: Vec::new(),
            has_non_cycle: false,
            has_non_cyclic: false,
            has_any_cyclic_conjunct: false,
            has_ancestor_cycle: false,
            disjunctions: Vec::new(),
            underlying: None,
            is_completing: 0,
        }
    }

    /// A field has a structural cycle if at least one conjunct is a
    /// violating cycle and no conjunct contributed non-cyclic structure.
    pub fn has_only_cyclic_conjuncts(&self) -> bool {
        (self.has_ancestor_cycle && !self.has_non_cycle)
            || (self.has_any_cyclic_conjunct && !self.has_non_cyclic)
    }
}

impl OpContext {
    /// Narrows the kind of the node; an empty meet is a conflict.
    pub(crate) fn node_update_kind(&mut self, v: VertexId, kind: Kind, pos: Pos) {
        let Some(state) = self.state_of(v) else { return };
        let (old, new, first_pos) = {
            let mut n = state.borrow_mut();
            let old = n.kind;
            n.kind = n.kind & kind;
            if n.kind_pos == Pos::NONE {
                n.kind_pos = pos;
            }
            (old, n.kind, n.kind_pos)
        };
        if new.is_bottom() && !old.is_bottom() {
            let msg = format!("conflicting values: no instances of {} and {}", old, kind);
            let b = Rc::new(Bottom::new(ErrorCode::Eval, msg).with_pos(first_pos).with_pos(pos));
            self.node_add_err(v, b);
        }
    }

    /// Sets or confirms the concrete scalar of a node. Unequal scalars
    /// conflict; a scalar arriving after the node was frozen for
    /// specificity is rejected.
    pub(crate) fn node_set_scalar(&mut self, v: VertexId, value: Value, pos: Pos) {
        let Some(state) = self.state_of(v) else { return };
        enum Outcome {
            Set,
            Conflict(Value, Pos),
            Frozen,
        }
        let outcome = {
            let mut n = state.borrow_mut();
            match &n.scalar {
                Some(existing) if *existing == value => Outcome::Set,
                Some(existing) => Outcome::Conflict(existing.clone(), n.scalar_pos),
                None => {
                    if n.sched.frozen.meets(sched::SCALAR_KNOWN) {
                        Outcome::Frozen
                    } else {
                        n.scalar = Some(value.clone());
                        n.scalar_pos = pos;
                        Outcome::Set
                    }
                }
            }
        };
        match outcome {
            Outcome::Set => {
                self.node_update_kind(v, value.kind(), pos);
                self.signal(v, sched::SCALAR_KNOWN);
            }
            Outcome::Conflict(existing, prev_pos) => {
                let msg = format!("conflicting values {} and {}", existing, value);
                let b = Rc::new(
                    Bottom::new(ErrorCode::Eval, msg)
                        .with_pos(prev_pos)
                        .with_pos(pos),
                );
                self.node_add_err(v, b);
            }
            Outcome::Frozen => {
                let msg = format!("cannot set value {} after value was frozen", value);
                let b = Rc::new(
                    Bottom::new(ErrorCode::Eval, msg)
                        .with_pos(pos),
                );
                self.node_add_err(v, b);
            }
        }
    }

    /// Adds a bound or validator, folding it against the accumulated set.
    pub(crate) fn node_add_check(&mut self, v: VertexId, check: Value, pos: Pos) {
        let Some(state) = self.state_of(v) else { return };
        self.node_update_kind(v, check.kind(), pos);
        if !self.config.simplify_bounds {
            state.borrow_mut().checks.push(check);
            return;
        }
        let conflict = {
            let mut n = state.borrow_mut();
            let mut checks = std::mem::take(&mut n.checks);
            let conflict = bounds::add_constraint(&mut self.regex_cache, &mut checks, check);
            n.checks = checks;
            conflict
        };
        if let Some(b) = conflict {
            let b = Rc::new((*b).clone().with_pos(pos));
            self.node_add_err(v, b);
        }
    }

    /// Folds a new list requirement into the node. Two closed lists of
    /// different length conflict; an open list unified with a closed one
    /// adopts the closed length when compatible.
    pub(crate) fn node_add_list(&mut self, v: VertexId, len: usize, open: bool, pos: Pos) {
        let Some(state) = self.state_of(v) else { return };
        let merged = {
            let n = state.borrow();
            match n.list {
                None => Ok(ListReq { len, open, pos }),
                Some(prev) => merge_list_reqs(prev, ListReq { len, open, pos }),
            }
        };
        match merged {
            Ok(req) => {
                state.borrow_mut().list = Some(req);
                self.node_update_kind(v, Kind::LIST, pos);
            }
            Err(msg) => {
                let b = Rc::new(Bottom::new(ErrorCode::Eval, msg).with_pos(pos));
                self.node_add_err(v, b);
            }
        }
    }
}

fn merge_list_reqs(a: ListReq, b: ListReq) -> Result<ListReq, String> {
    let (short, long) = if a.len <= b.len { (a, b) } else { (b, a) };
    match (short.open, long.open) {
        _ if short.len == long.len => Ok(ListReq {
            len: long.len,
            open: short.open && long.open,
            pos: long.pos,
        }),
        (false, false) => Err(format!(
            "incompatible list lengths ({} and {})",
            short.len, long.len
        )),
        // The shorter list must be open to adopt the longer length.
        (true, _) => Ok(ListReq {
            len: long.len,
            open: long.open,
            pos: long.pos,
        }),
        (false, true) => Err(format!(
            "incompatible list lengths ({} and {})",
            short.len, long.len
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::vertex::ArcType;

    fn node_with_state(ctx: &mut OpContext) -> VertexId {
        let v = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let id = ctx.acquire_node(v);
        ctx.vertex_mut(v).state = Some(id);
        v
    }

    #[test]
    fn scalar_conflict() {
        let mut ctx = OpContext::new();
        let v = node_with_state(&mut ctx);
        ctx.node_set_scalar(v, Value::Int(1), Pos::NONE);
        ctx.node_set_scalar(v, Value::Int(1), Pos::NONE);
        assert!(ctx.state_of(v).unwrap().borrow().errs.is_none());

        ctx.node_set_scalar(v, Value::Int(2), Pos::NONE);
        let errs = ctx.state_of(v).unwrap().borrow().errs.clone();
        assert_eq!(errs.unwrap().code, ErrorCode::Eval);
    }

    #[test]
    fn kind_meet_conflict() {
        let mut ctx = OpContext::new();
        let v = node_with_state(&mut ctx);
        ctx.node_update_kind(v, Kind::INT, Pos::NONE);
        ctx.node_update_kind(v, Kind::STRING, Pos::NONE);
        let errs = ctx.state_of(v).unwrap().borrow().errs.clone();
        assert!(errs.is_some());
    }

    #[test]
    fn checks_fold_eagerly() {
        let mut ctx = OpContext::new();
        let v = node_with_state(&mut ctx);
        use crate::op::RelOp;
        ctx.node_add_check(v, Value::from((RelOp::GreaterEqual, 3)), Pos::NONE);
        ctx.node_add_check(v, Value::from((RelOp::LessEqual, 3)), Pos::NONE);
        let checks = ctx.state_of(v).unwrap().borrow().checks.clone();
        assert_eq!(checks, vec![Value::Int(3)]);
    }

    #[test]
    fn list_requirements() {
        // closed 2 with closed 3 is an error
        assert!(merge_list_reqs(
            ListReq { len: 2, open: false, pos: Pos::NONE },
            ListReq { len: 3, open: false, pos: Pos::NONE },
        )
        .is_err());

        // open 2 with closed 3 adopts closed 3
        let req = merge_list_reqs(
            ListReq { len: 2, open: true, pos: Pos::NONE },
            ListReq { len: 3, open: false, pos: Pos::NONE },
        )
        .unwrap();
        assert_eq!((req.len, req.open), (3, false));

        // closed 3 with open 2 likewise, in either order
        let req = merge_list_reqs(
            ListReq { len: 3, open: false, pos: Pos::NONE },
            ListReq { len: 2, open: true, pos: Pos::NONE },
        )
        .unwrap();
        assert_eq!((req.len, req.open), (3, false));

        // open 4 cannot shrink to closed 3
        assert!(merge_list_reqs(
            ListReq { len: 4, open: true, pos: Pos::NONE },
            ListReq { len: 3, open: false, pos: Pos::NONE },
        )
        .is_err());

        // equal lengths: closed wins
        let req = merge_list_reqs(
            ListReq { len: 2, open: true, pos: Pos::NONE },
            ListReq { len: 2, open: false, pos: Pos::NONE },
        )
        .unwrap();
        assert_eq!((req.len, req.open), (2, false));
    }
}
