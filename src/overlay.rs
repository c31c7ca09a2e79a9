//! Structural overlays: an independent copy of the in-progress part of a
//! vertex subtree, used to evaluate disjunction branches without
//! corrupting the original. Finalized substructure is immutable and shared
//! by arena id instead of being copied.

use std::collections::HashMap;
use std::rc::Rc;

use crate::closectx::CloseId;
use crate::conjunct::Conjunct;
use crate::context::OpContext;
use crate::environment::{Env, Environment};
use crate::sched::{SchedState, Task, TaskId, TaskState, NEVER_KNOWN};
use crate::value::{Disjunction, Value};
use crate::vertex::{VertexId, VertexStatus};

#[derive(Default)]
pub(crate) struct Overlay {
    vmap: HashMap<VertexId, VertexId>,
    cmap: HashMap<CloseId, CloseId>,
    emap: HashMap<usize, Env>,
}

impl OpContext {
    /// Clones the still-open state reachable from `root` into fresh arena
    /// slots. The original is left untouched.
    pub(crate) fn overlay_clone(&mut self, root: VertexId) -> VertexId {
        let mut o = Overlay::default();
        self.clone_vertex(&mut o, root)
    }

    fn clone_vertex(&mut self, o: &mut Overlay, x: VertexId) -> VertexId {
        if let Some(&mapped) = o.vmap.get(&x) {
            return mapped;
        }
        if self.vertex(x).status == VertexStatus::Finalized {
            return x;
        }

        let (parent, label, arc_type) = {
            let vx = self.vertex(x);
            (vx.parent, vx.label, vx.arc_type)
        };
        let parent = parent.map(|p| o.vmap.get(&p).copied().unwrap_or(p));
        let id = self.new_vertex(parent, label, arc_type);
        o.vmap.insert(x, id);

        {
            let src = &self.vertices[x.index()];
            let status = src.status;
            let child_errors = src.child_errors.clone();
            let closed_recursive = src.closed_recursive;
            let closed_non_recursive = src.closed_non_recursive;
            let has_ellipsis = src.has_ellipsis;
            let lock_arcs = src.lock_arcs;
            let is_dynamic = src.is_dynamic;
            let is_pattern_constraint = src.is_pattern_constraint;
            let is_cyclic = src.is_cyclic;
            let cyclic_references = src.cyclic_references.clone();

            let dst = &mut self.vertices[id.index()];
            dst.status = status;
            dst.child_errors = child_errors;
            dst.closed_recursive = closed_recursive;
            dst.closed_non_recursive = closed_non_recursive;
            dst.has_ellipsis = has_ellipsis;
            dst.lock_arcs = lock_arcs;
            dst.is_dynamic = is_dynamic;
            dst.is_pattern_constraint = is_pattern_constraint;
            dst.is_cyclic = is_cyclic;
            dst.cyclic_references = cyclic_references;
        }

        for a in self.vertex(x).arcs.clone() {
            let ca = self.clone_vertex(o, a);
            self.vertex_mut(id).arcs.push(ca);
        }

        let base = self.vertex(x).base_value.clone();
        if let Some(b) = base {
            let b = self.remap_value(o, &b);
            self.vertex_mut(id).base_value = Some(b);
        }

        let conjuncts = self.vertex(x).conjuncts.clone();
        let conjuncts = conjuncts
            .into_iter()
            .map(|c| self.remap_conjunct(o, c))
            .collect();
        self.vertex_mut(id).conjuncts = conjuncts;

        let mut structs = self.vertex(x).structs.clone();
        for si in &mut structs {
            si.cc = si.cc.map(|cc| self.remap_cc(o, cc));
        }
        self.vertex_mut(id).structs = structs;

        let mut patterns = self.vertex(x).pattern_constraints.clone();
        for pc in &mut patterns {
            pc.pattern = self.remap_value(o, &pc.pattern.clone());
            pc.conjuncts = pc
                .conjuncts
                .clone()
                .into_iter()
                .map(|c| self.remap_conjunct(o, c))
                .collect();
        }
        self.vertex_mut(id).pattern_constraints = patterns;

        if let Some(cc) = self.vertex(x).cc {
            let cc = self.remap_cc(o, cc);
            self.vertex_mut(id).cc = Some(cc);
        }

        if let Some(nid) = self.vertex(x).state {
            let src = self.node_rc(nid).borrow().clone();
            let new_nid = self.acquire_node(id);
            self.vertex_mut(id).state = Some(new_nid);
            let rc = self.node_rc(new_nid);
            {
                let mut n = rc.borrow_mut();
                *n = src;
                n.node = id;
                n.is_completing = 0;
                n.eval_depth = 0;
                n.underlying = Some(x);
            }

            // Remap env-carrying queues.
            {
                let disjunctions = rc.borrow().disjunctions.clone();
                let disjunctions = disjunctions
                    .into_iter()
                    .map(|mut d| {
                        d.env = self.remap_env(o, &d.env);
                        d.ci.cc = d.ci.cc.map(|cc| self.remap_cc(o, cc));
                        d
                    })
                    .collect();
                rc.borrow_mut().disjunctions = disjunctions;

                let cyclic = rc.borrow().cyclic_conjuncts.clone();
                let cyclic = cyclic
                    .into_iter()
                    .map(|mut cc| {
                        cc.c = self.remap_conjunct(o, cc.c);
                        cc
                    })
                    .collect();
                rc.borrow_mut().cyclic_conjuncts = cyclic;
            }

            // Rebuild the task queue from the tasks that have not yet
            // completed. Cloned tasks restart from ready; runners are
            // idempotent until they commit.
            let old_tasks = {
                let mut n = rc.borrow_mut();
                let old = n.sched.tasks.clone();
                n.sched.tasks.clear();
                n.sched.task_pos = 0;
                n.sched.blocking.clear();
                n.sched.state = SchedState::Running;
                old
            };
            for t in old_tasks {
                let task = self.task(t).clone();
                if !matches!(task.state, TaskState::Ready | TaskState::Waiting) {
                    continue;
                }
                let x = match &task.x {
                    crate::conjunct::Elem::Value(v) => {
                        crate::conjunct::Elem::Value(self.remap_value(o, &v.clone()))
                    }
                    other => other.clone(),
                };
                let cloned = Task {
                    state: TaskState::Ready,
                    node: id,
                    env: self.remap_env(o, &task.env),
                    x,
                    ci: {
                        let mut ci = task.ci.clone();
                        ci.cc = ci.cc.map(|cc| self.remap_cc(o, cc));
                        ci
                    },
                    pending_arcs: task
                        .pending_arcs
                        .iter()
                        .map(|a| o.vmap.get(a).copied().unwrap_or(*a))
                        .collect(),
                    blocked_on: None,
                    block_condition: NEVER_KNOWN,
                    err: None,
                    ..task
                };
                let new_id = TaskId(self.tasks.len() as u32);
                self.tasks.push(cloned);
                rc.borrow_mut().sched.tasks.push(new_id);
            }
        }

        id
    }

    fn remap_conjunct(&mut self, o: &mut Overlay, mut c: Conjunct) -> Conjunct {
        c.env = self.remap_env(o, &c.env);
        c.ci.cc = c.ci.cc.map(|cc| self.remap_cc(o, cc));
        if let crate::conjunct::Elem::Value(v) = &c.x {
            let v = self.remap_value(o, &v.clone());
            c.x = crate::conjunct::Elem::Value(v);
        }
        c
    }

    fn remap_value(&mut self, o: &mut Overlay, v: &Value) -> Value {
        match v {
            Value::Vertex(w) => match o.vmap.get(w) {
                Some(&mapped) => Value::Vertex(mapped),
                None => v.clone(),
            },
            Value::Disjunction(d) => {
                let values = d.values.iter().map(|x| self.remap_value(o, x)).collect();
                Value::Disjunction(Rc::new(Disjunction {
                    values,
                    num_defaults: d.num_defaults,
                    has_defaults: d.has_defaults,
                }))
            }
            Value::Conjunction(vals) => {
                let vals: Vec<Value> = vals.iter().map(|x| self.remap_value(o, x)).collect();
                Value::Conjunction(vals.into())
            }
            other => other.clone(),
        }
    }

    /// Rebuilds an environment chain with overlaid vertices substituted.
    /// Chains that do not touch the overlay are shared as-is.
    fn remap_env(&mut self, o: &mut Overlay, env: &Env) -> Env {
        let key = Rc::as_ptr(env) as usize;
        if let Some(e) = o.emap.get(&key) {
            return e.clone();
        }
        let up = env.up.as_ref().map(|u| self.remap_env(o, u));
        let vertex = o.vmap.get(&env.vertex).copied();

        let unchanged = vertex.is_none()
            && match (&up, &env.up) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            };
        let result = if unchanged {
            env.clone()
        } else {
            let mut e = Environment::new(vertex.unwrap_or(env.vertex));
            {
                let m = Rc::get_mut(&mut e).expect("fresh environment");
                m.up = up;
                m.dynamic_label = env.dynamic_label;
            }
            e
        };
        o.emap.insert(key, result.clone());
        result
    }

    /// Clones a closedness scope chain, preserving counters and flags.
    fn remap_cc(&mut self, o: &mut Overlay, cc: CloseId) -> CloseId {
        if let Some(&mapped) = o.cmap.get(&cc) {
            return mapped;
        }
        let src = self.close_ctx(cc).clone();
        let parent = src.parent.map(|p| self.remap_cc(o, p));
        let id = CloseId(self.close_ctxs.len() as u32);
        let mut cloned = src;
        cloned.parent = parent;
        cloned.src = o.vmap.get(&cloned.src).copied().unwrap_or(cloned.src);
        self.close_ctxs.push(cloned);
        o.cmap.insert(cc, id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{Feature, FeatureExt};
    use crate::vertex::ArcType;

    #[test]
    fn finalized_substructure_is_shared() {
        let mut ctx = OpContext::new();
        let rt = ctx.runtime.clone();
        let root = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let (a, _) = ctx.get_arc(root, rt.field("a"), ArcType::Member);
        let (b, _) = ctx.get_arc(root, rt.field("b"), ArcType::Member);
        ctx.vertex_mut(a).base_value = Some(Value::Int(1));
        ctx.vertex_mut(a).status = VertexStatus::Finalized;
        ctx.vertex_mut(b).base_value = Some(Value::Int(2));

        let clone = ctx.overlay_clone(root);
        assert_ne!(clone, root);
        let arcs = ctx.vertex(clone).arcs.clone();
        // The finalized arc is shared, the open one is copied.
        assert_eq!(arcs[0], a);
        assert_ne!(arcs[1], b);
        assert_eq!(ctx.vertex(arcs[1]).base_value, Some(Value::Int(2)));

        // Mutating the clone leaves the original untouched.
        ctx.vertex_mut(arcs[1]).base_value = Some(Value::Int(3));
        assert_eq!(ctx.vertex(b).base_value, Some(Value::Int(2)));
    }

    #[test]
    fn environment_chains_are_rewritten() {
        let mut ctx = OpContext::new();
        let root = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let outer = Environment::new(root);

        let mut o = Overlay::default();
        let clone = ctx.clone_vertex(&mut o, root);
        let env = ctx.remap_env(&mut o, &outer);
        assert_eq!(env.vertex, clone);

        // An environment pointing outside the overlay is shared.
        let unrelated = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        ctx.vertex_mut(unrelated).status = VertexStatus::Finalized;
        let outside = Environment::new(unrelated);
        let remapped = ctx.remap_env(&mut o, &outside);
        assert!(Rc::ptr_eq(&remapped, &outside));
    }
}
