use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Display;
use std::rc::Rc;

use crate::bounds::RegexCache;
use crate::closectx::CloseContext;
use crate::error::{self, Bottom, ErrorCode, Pos};
use crate::feature::{Feature, FeatureExt, Runtime, StringInterner};
use crate::node::NodeContext;
use crate::sched::{Task, TaskId};
use crate::value::Value;
use crate::vertex::{ArcType, NodeId, Vertex, VertexId};

/// Evaluator configuration, supplied by the embedder through the session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Eagerly fold bound pairs (§bounds). Disabling only affects
    /// performance and error positions, never results.
    pub simplify_bounds: bool,

    /// Upper limit on the evaluation depth, as a guard against runaway
    /// cycles the detector cannot classify.
    pub max_depth: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            simplify_bounds: true,
            max_depth: 10_000,
        }
    }
}

/// Cross-cutting evaluation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub unifications: u64,
    pub conjuncts: u64,
    pub disjuncts: u64,
    pub node_allocs: u64,
    pub node_reuses: u64,
    pub node_frees: u64,
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unifications: {}, conjuncts: {}, disjuncts: {}",
            self.unifications, self.conjuncts, self.disjuncts
        )
    }
}

/// A pooled slot for per-vertex scratch state. The generation tag
/// invalidates stale `NodeId`s after a slot is recycled.
#[derive(Debug)]
pub(crate) struct NodeSlot {
    pub generation: u32,
    pub node: Option<Rc<RefCell<NodeContext>>>,
}

/// OpContext is one evaluation session. It owns the vertex and closeContext
/// arenas, the scratch-state pool, error and position state, and the
/// cross-cutting counters. Sessions are single-threaded and must not be
/// shared; all concurrency is cooperative suspension through the scheduler.
pub struct OpContext {
    pub runtime: Rc<dyn Runtime>,
    pub config: Config,
    pub stats: Stats,
    pub regex_cache: RegexCache,

    pub(crate) vertices: Vec<Vertex>,
    pub(crate) close_ctxs: Vec<CloseContext>,
    pub(crate) tasks: Vec<Task>,

    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) free_nodes: Vec<u32>,

    /// Errors recorded by the current operation, merged deterministically.
    pub(crate) errs: Option<Rc<Bottom>>,

    /// Position stack for error attribution.
    pub(crate) positions: Vec<Pos>,

    /// Stack of vertices currently being processed.
    pub(crate) vertex_stack: Vec<VertexId>,

    /// Stack of running tasks.
    pub(crate) task_stack: Vec<TaskId>,

    /// All tasks blocked during the current round of evaluation.
    pub(crate) blocking: Vec<TaskId>,

    /// Set when the current task parked itself on an unmet condition;
    /// callers unwind without treating the missing value as an error.
    pub(crate) suspended: bool,

    pub(crate) eval_depth: u32,
    pub(crate) optional_mark: u32,

    /// Nodes to finalize outside the current evaluation stack, to avoid
    /// spurious structural cycle hits.
    pub(crate) to_finalize: Vec<VertexId>,

    /// Session-scoped names for diagnostics; never a process-wide map.
    pub(crate) debug_names: HashMap<VertexId, Rc<str>>,
}

impl OpContext {
    pub fn new() -> OpContext {
        OpContext::with_runtime(Rc::new(StringInterner::default()))
    }

    pub fn with_runtime(runtime: Rc<dyn Runtime>) -> OpContext {
        OpContext {
            runtime,
            config: Config::default(),
            stats: Stats::default(),
            regex_cache: RegexCache::default(),
            vertices: Vec::new(),
            close_ctxs: Vec::new(),
            tasks: Vec::new(),
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            errs: None,
            positions: Vec::new(),
            vertex_stack: Vec::new(),
            task_stack: Vec::new(),
            blocking: Vec::new(),
            suspended: false,
            eval_depth: 0,
            optional_mark: 0,
            to_finalize: Vec::new(),
            debug_names: HashMap::new(),
        }
    }

    // ---- vertex arena ----

    pub fn new_vertex(&mut self, parent: Option<VertexId>, label: Feature, t: ArcType) -> VertexId {
        let id = VertexId(self.vertices.len() as u32);
        self.vertices.push(Vertex::new(parent, label, t));
        id
    }

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.index()]
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> &mut Vertex {
        &mut self.vertices[id.index()]
    }

    /// A vertex computed as part of an expression, with no path from the
    /// root of the tree.
    pub fn new_inline_vertex(&mut self, parent: Option<VertexId>) -> VertexId {
        let id = self.new_vertex(parent, Feature::INVALID, ArcType::Member);
        self.vertex_mut(id).is_dynamic = true;
        id
    }

    /// Finds or creates the arc with the given label. Fails when the vertex
    /// is locked for new arcs.
    pub fn get_arc(&mut self, v: VertexId, label: Feature, t: ArcType) -> (VertexId, bool) {
        if let Some(&arc) = self
            .vertex(v)
            .arcs
            .iter()
            .find(|&&a| self.vertex(a).label == label)
        {
            self.vertex_mut(arc).update_arc_type(t);
            return (arc, false);
        }
        let arc = self.new_vertex(Some(v), label, t);
        self.vertex_mut(v).arcs.push(arc);
        (arc, true)
    }

    pub fn lookup_arc(&self, v: VertexId, label: Feature) -> Option<VertexId> {
        self.vertex(v)
            .arcs
            .iter()
            .copied()
            .find(|&a| self.vertex(a).label == label)
    }

    /// The path from the root to `v`, for error messages and diagnostics.
    pub fn path_of(&self, v: VertexId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(v);
        while let Some(id) = cur {
            let vx = self.vertex(id);
            if vx.label != Feature::INVALID {
                parts.push(self.runtime.label_str(vx.label));
            }
            cur = vx.parent;
        }
        parts.reverse();
        let mut s = String::new();
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                s.push('.');
            }
            s.push_str(p);
        }
        s
    }

    // ---- node pool ----

    /// Acquires a scratch workspace for `v` from the pool.
    pub(crate) fn acquire_node(&mut self, v: VertexId) -> NodeId {
        if let Some(index) = self.free_nodes.pop() {
            let slot = &mut self.nodes[index as usize];
            slot.generation += 1;
            let id = NodeId {
                index,
                generation: slot.generation,
            };
            slot.node = Some(Rc::new(RefCell::new(NodeContext::new(v))));
            self.stats.node_reuses += 1;
            return id;
        }
        let index = self.nodes.len() as u32;
        self.nodes.push(NodeSlot {
            generation: 0,
            node: Some(Rc::new(RefCell::new(NodeContext::new(v)))),
        });
        self.stats.node_allocs += 1;
        NodeId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn release_node(&mut self, id: NodeId) {
        let slot = &mut self.nodes[id.index as usize];
        if slot.generation != id.generation {
            return;
        }
        slot.node = None;
        self.free_nodes.push(id.index);
        self.stats.node_frees += 1;
    }

    pub(crate) fn node_rc(&self, id: NodeId) -> Rc<RefCell<NodeContext>> {
        let slot = &self.nodes[id.index as usize];
        debug_assert_eq!(slot.generation, id.generation, "stale node handle");
        slot.node.as_ref().expect("released node").clone()
    }

    /// The workspace of a vertex, if it is in progress.
    pub(crate) fn state_of(&self, v: VertexId) -> Option<Rc<RefCell<NodeContext>>> {
        self.vertex(v).state.map(|id| self.node_rc(id))
    }

    // ---- error state ----

    pub fn add_bottom(&mut self, b: Rc<Bottom>) {
        self.errs = error::combine(self.errs.take(), Some(b));
    }

    pub fn add_err(&mut self, code: ErrorCode, msg: impl Into<Rc<str>>) -> Rc<Bottom> {
        let mut b = Bottom::new(code, msg);
        if let Some(&pos) = self.positions.last() {
            b = b.with_pos(pos);
        }
        if let Some(&v) = self.vertex_stack.last() {
            b = b.at(v);
        }
        let b = Rc::new(b);
        self.add_bottom(b.clone());
        b
    }

    pub fn take_err(&mut self) -> Option<Rc<Bottom>> {
        self.errs.take()
    }

    pub fn has_err(&self) -> bool {
        self.errs.is_some()
    }

    // ---- stacks ----

    pub(crate) fn push_arc(&mut self, v: VertexId) {
        self.vertex_stack.push(v);
    }

    pub(crate) fn pop_arc(&mut self) {
        self.vertex_stack.pop();
    }

    pub(crate) fn push_pos(&mut self, p: Pos) {
        self.positions.push(p);
    }

    pub(crate) fn pop_pos(&mut self) {
        self.positions.pop();
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.task_stack.last().copied()
    }

    /// Names a vertex for the diagnostic side channel.
    pub fn set_debug_name(&mut self, v: VertexId, name: impl Into<Rc<str>>) {
        self.debug_names.insert(v, name.into());
    }

    pub fn debug_name(&self, v: VertexId) -> Rc<str> {
        if let Some(n) = self.debug_names.get(&v) {
            return n.clone();
        }
        let path = self.path_of(v);
        if path.is_empty() {
            format!("v{}", v.0).into()
        } else {
            path.into()
        }
    }

    /// Formats a value for messages, resolving interned labels.
    pub fn value_str(&self, v: &Value) -> String {
        match v {
            Value::Vertex(id) => format!("{{{}}}", self.path_of(*id)),
            other => format!("{}", other),
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        OpContext::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_creation_and_lookup() {
        let mut ctx = OpContext::new();
        let root = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let a = ctx.runtime.clone().field("a");
        let (arc, is_new) = ctx.get_arc(root, a, ArcType::Member);
        assert!(is_new);
        let (again, is_new) = ctx.get_arc(root, a, ArcType::Optional);
        assert_eq!(arc, again);
        assert!(!is_new);
        // Existing arc only narrows.
        assert_eq!(ctx.vertex(arc).arc_type, ArcType::Member);
        assert_eq!(ctx.lookup_arc(root, a), Some(arc));
    }

    #[test]
    fn node_pool_recycles_with_generations() {
        let mut ctx = OpContext::new();
        let v = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let n1 = ctx.acquire_node(v);
        ctx.release_node(n1);
        let n2 = ctx.acquire_node(v);
        assert_eq!(n1.index, n2.index);
        assert_ne!(n1.generation, n2.generation);
        assert_eq!(ctx.stats.node_allocs, 1);
        assert_eq!(ctx.stats.node_reuses, 1);
        // Releasing through the stale handle is a no-op.
        ctx.release_node(n1);
        assert_eq!(ctx.stats.node_frees, 1);
    }

    #[test]
    fn error_accumulation_prefers_severity() {
        let mut ctx = OpContext::new();
        ctx.add_err(ErrorCode::Incomplete, "missing");
        ctx.add_err(ErrorCode::Eval, "conflict");
        let err = ctx.take_err().unwrap();
        assert_eq!(err.code, ErrorCode::Eval);
        assert!(ctx.take_err().is_none());
    }

    #[test]
    fn path_formatting() {
        let mut ctx = OpContext::new();
        let rt = ctx.runtime.clone();
        let root = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let (a, _) = ctx.get_arc(root, rt.field("a"), ArcType::Member);
        let (b, _) = ctx.get_arc(a, rt.field("b"), ArcType::Member);
        assert_eq!(ctx.path_of(b), "a.b");
        assert_eq!(&*ctx.debug_name(b), "a.b");
        assert_eq!(&*ctx.debug_name(root), "v0");
    }
}
