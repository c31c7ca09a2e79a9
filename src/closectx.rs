use crate::context::OpContext;
use crate::sched;
use crate::vertex::VertexId;

/// Index of a closeContext in the session arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseId(pub u32);

impl CloseId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The kinds of dependencies tracked with `inc_dependent`/`dec_dependent`.
/// Counters track *when* dependents finish, never concurrent access. For
/// each increment there must be a matching decrement; the dependency graph
/// emitter reports the per-kind balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Completion of parent contexts within the closedness tree.
    Parent,
    /// Completion of corresponding contexts in parent vertices.
    Arc,
    /// A note held while dependent conjuncts are being collected.
    Notify,
    /// Completion of a scheduled task.
    Task,
    /// A conjunct that has been scheduled but not yet evaluated.
    Eval,
    /// Holds the root context of a vertex until its conjuncts are known.
    Root,
    /// Ownership during initialization.
    Init,
    /// Recursive processing of a node (postponed cyclic conjuncts).
    Defer,
}

pub const NUM_DEP_KINDS: usize = 8;

impl DepKind {
    pub fn index(self) -> usize {
        match self {
            DepKind::Parent => 0,
            DepKind::Arc => 1,
            DepKind::Notify => 2,
            DepKind::Task => 3,
            DepKind::Eval => 4,
            DepKind::Root => 5,
            DepKind::Init => 6,
            DepKind::Defer => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DepKind::Parent => "PARENT",
            DepKind::Arc => "ARC",
            DepKind::Notify => "NOTIFY",
            DepKind::Task => "TASK",
            DepKind::Eval => "EVAL",
            DepKind::Root => "ROOT",
            DepKind::Init => "INIT",
            DepKind::Defer => "DEFER",
        }
    }
}

/// A closeContext is one closedness scope: a struct literal, embedding, or
/// definition boundary layered over a group of conjuncts. CloseContexts
/// form a tree mirroring, but distinct from, the vertex tree. A context
/// completes when its dependent count reaches zero; completion decrements
/// the parent and, at the root, unlocks finalization of the owner's field
/// conjuncts.
#[derive(Debug, Clone)]
pub struct CloseContext {
    pub parent: Option<CloseId>,
    pub src: VertexId,

    /// Outstanding dependents, all kinds combined.
    pub conjunct_count: i32,

    /// Outstanding disjunction branches.
    pub disjunct_count: i32,

    /// Per-kind ledger, kept for the diagnostic graph.
    pub dep_counts: [i32; NUM_DEP_KINDS],

    pub is_def: bool,
    pub is_embed: bool,
    pub is_closed: bool,

    /// An ellipsis at this scope keeps the owner open regardless of
    /// enclosing closed scopes.
    pub is_total: bool,

    pub is_decremented: bool,
    pub done: bool,
}

impl CloseContext {
    fn new(parent: Option<CloseId>, src: VertexId) -> CloseContext {
        CloseContext {
            parent,
            src,
            conjunct_count: 0,
            disjunct_count: 0,
            dep_counts: [0; NUM_DEP_KINDS],
            is_def: false,
            is_embed: false,
            is_closed: false,
            is_total: false,
            is_decremented: false,
            done: false,
        }
    }
}

impl OpContext {
    pub fn close_ctx(&self, id: CloseId) -> &CloseContext {
        &self.close_ctxs[id.index()]
    }

    pub fn close_ctx_mut(&mut self, id: CloseId) -> &mut CloseContext {
        &mut self.close_ctxs[id.index()]
    }

    /// The root closedness scope of a vertex, allocated lazily.
    pub fn root_close_ctx(&mut self, v: VertexId) -> CloseId {
        if let Some(cc) = self.vertex(v).cc {
            return cc;
        }
        let cc = CloseId(self.close_ctxs.len() as u32);
        self.close_ctxs.push(CloseContext::new(None, v));
        self.vertex_mut(v).cc = Some(cc);
        // Matched by the decrement once the node's conjuncts are known.
        self.inc_dependent(cc, DepKind::Root);
        cc
    }

    /// A child scope for a struct literal or embedding below `parent`.
    pub fn spawn_close_ctx(&mut self, parent: CloseId, src: VertexId) -> CloseId {
        let cc = CloseId(self.close_ctxs.len() as u32);
        self.close_ctxs.push(CloseContext::new(Some(parent), src));
        self.inc_dependent(parent, DepKind::Parent);
        cc
    }

    pub fn inc_dependent(&mut self, id: CloseId, kind: DepKind) {
        let reopened = {
            let cc = self.close_ctx_mut(id);
            let reopened = cc.done;
            cc.done = false;
            cc.conjunct_count += 1;
            cc.dep_counts[kind.index()] += 1;
            reopened
        };
        // Re-entrant evaluation may add dependents to a completed scope;
        // reopening restores the parent's count so completion balances.
        if reopened {
            if let Some(p) = self.close_ctx(id).parent {
                self.inc_dependent(p, DepKind::Parent);
            }
        }
    }

    /// Decrements a dependent; when the count reaches zero the context
    /// completes, which cascades to the parent and, at the root, signals
    /// the owner that its field conjuncts are known.
    pub fn dec_dependent(&mut self, id: CloseId, kind: DepKind) {
        let cc = self.close_ctx_mut(id);
        cc.conjunct_count -= 1;
        cc.dep_counts[kind.index()] -= 1;
        debug_assert!(cc.conjunct_count >= 0, "unbalanced {} decrement", kind.name());
        if cc.conjunct_count > 0 {
            return;
        }
        cc.done = true;
        let parent = cc.parent;
        let src = cc.src;
        match parent {
            Some(p) => self.dec_dependent(p, DepKind::Parent),
            None => self.on_close_ctx_complete(src),
        }
    }

    /// Completion hook of a root scope: all conjuncts below the vertex's
    /// closedness tree are accounted for.
    fn on_close_ctx_complete(&mut self, src: VertexId) {
        if let Some(state) = self.state_of(src) {
            let completed = {
                let mut n = state.borrow_mut();
                n.sched.provided = n.sched.provided | sched::FIELD_CONJUNCTS_KNOWN;
                sched::FIELD_CONJUNCTS_KNOWN
            };
            self.signal(src, completed);
        }
    }

    /// Marks a scope closed (definitions and explicitly closed structs).
    pub fn set_closed(&mut self, id: CloseId) {
        self.close_ctx_mut(id).is_closed = true;
    }

    /// Propagates an ellipsis: the scope and its ancestors can no longer
    /// reject fields at this level.
    pub fn set_total(&mut self, id: CloseId) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let cc = self.close_ctx_mut(c);
            cc.is_total = true;
            cur = cc.parent;
        }
    }

    /// Whether any scope on the chain closes the vertex without a total
    /// (open ellipsis) override at the same or an enclosing scope.
    pub fn chain_is_closed(&self, id: CloseId) -> bool {
        let mut cur = Some(id);
        let mut closed = false;
        while let Some(c) = cur {
            let cc = self.close_ctx(c);
            if cc.is_total {
                return false;
            }
            closed |= cc.is_closed || cc.is_def;
            cur = cc.parent;
        }
        closed
    }

    /// Outstanding dependents per kind, for tests and diagnostics.
    pub fn dep_balance(&self, id: CloseId) -> [i32; NUM_DEP_KINDS] {
        self.close_ctx(id).dep_counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Feature;
    use crate::vertex::ArcType;

    #[test]
    fn completion_cascades_to_parent() {
        let mut ctx = OpContext::new();
        let v = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let root = ctx.root_close_ctx(v);
        let child = ctx.spawn_close_ctx(root, v);

        ctx.inc_dependent(child, DepKind::Task);
        assert!(!ctx.close_ctx(child).done);

        ctx.dec_dependent(child, DepKind::Task);
        assert!(ctx.close_ctx(child).done);
        // The child's completion decrements the parent's PARENT count; the
        // ROOT count still holds the root open.
        assert!(!ctx.close_ctx(root).done);
        ctx.dec_dependent(root, DepKind::Root);
        assert!(ctx.close_ctx(root).done);
    }

    #[test]
    fn closed_chain_with_total_override() {
        let mut ctx = OpContext::new();
        let v = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let root = ctx.root_close_ctx(v);
        let child = ctx.spawn_close_ctx(root, v);

        assert!(!ctx.chain_is_closed(child));
        ctx.set_closed(root);
        assert!(ctx.chain_is_closed(child));
        ctx.set_total(child);
        assert!(!ctx.chain_is_closed(child));
    }

    #[test]
    fn dep_ledger_balances() {
        let mut ctx = OpContext::new();
        let v = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let cc = ctx.root_close_ctx(v);
        ctx.inc_dependent(cc, DepKind::Task);
        ctx.inc_dependent(cc, DepKind::Eval);
        ctx.dec_dependent(cc, DepKind::Eval);
        let counts = ctx.dep_balance(cc);
        assert_eq!(counts[DepKind::Task.index()], 1);
        assert_eq!(counts[DepKind::Eval.index()], 0);
        assert_eq!(counts[DepKind::Root.index()], 1);
    }
}
