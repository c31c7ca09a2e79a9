//! Cycle detection over the dynamically growing reference graph.
//!
//! Three kinds of cycles are distinguished:
//!
//! - *Structural* cycles: a field transitively refers to a live ancestor
//!   with no concrete new structure feeding it. Permanent error.
//! - *Reference* cycles: a field refers to itself through an identity
//!   chain, e.g. `a: a`. Resolves to unconstrained, not an error.
//! - *Inline* cycles: a self-referencing expression embedded directly in
//!   another expression. Always an error, since it has no stable
//!   field-path identity.
//!
//! Cycles are tracked per conjunct: every traversed reference is appended
//! to the conjunct's tracked-reference list. A vertex is a structural cycle
//! only if every conjunct is cyclic and none contributed new non-cyclic
//! structure; one non-cyclic conjunct keeps the field valid, since the
//! cycle may later be fed a concrete value. Conjuncts from optional
//! contexts get one grace iteration: on the first cycle their reference
//! history is cleared and they run once more before a structural cycle is
//! declared.

use std::rc::Rc;

use crate::closectx::DepKind;
use crate::conjunct::{CloseInfo, Conjunct, CyclicType, Elem};
use crate::context::OpContext;
use crate::environment::Env;
use crate::error::{Bottom, ErrorCode};
use crate::expr::RefId;
use crate::node::CyclicConjunct;
use crate::value::Value;
use crate::vertex::{VertexId, VertexStatus};

/// The decision for one reference traversal.
#[derive(Debug, PartialEq)]
pub enum CycleCheck {
    /// Not a cycle; the reference is now tracked in the conjunct.
    Continue(CloseInfo),

    /// Process with the conjunct marked cyclic (evidence of non-cyclic
    /// structure exists, or may still arrive).
    ContinueCyclic(CloseInfo),

    /// Skip this conjunct: either a valid reference cycle (treated as top)
    /// or a fully cyclic conjunct postponed until non-cyclic evidence
    /// arrives.
    Skip,
}

impl OpContext {
    /// Checks whether following reference `x`, which resolved to `arc`,
    /// creates a cycle for the conjunct described by `ci`, while evaluating
    /// vertex `v`.
    pub(crate) fn detect_cycle(
        &mut self,
        v: VertexId,
        env: &Env,
        x: &RefId,
        arc: VertexId,
        ci: &CloseInfo,
    ) -> CycleCheck {
        // A reference to a direct ancestor, or to any vertex currently on
        // the evaluation path, is a structural cycle candidate.
        if self.has_ancestor(v, arc) {
            if self.vertex(v).is_dynamic || ci.cycle.inline {
                self.report_cycle_error(v);
                return CycleCheck::Skip;
            }
            return self.mark_cyclic(v, env, x, arc, ci, true);
        }

        let (has_non_cyclic, node_depth) = match self.state_of(v) {
            Some(n) => {
                let n = n.borrow();
                (n.has_non_cyclic, n.depth)
            }
            None => (false, 0),
        };

        // Inside the grace iteration, cycles in optional conjuncts proceed
        // unchecked as long as the node has non-cyclic evidence.
        if has_non_cyclic && ci.cycle.cycle_type == CyclicType::MaybeCyclic {
            return CycleCheck::Continue(ci.clone());
        }

        if let Some(entry) = ci.cycle.seen(x, arc) {
            if self.vertex(v).is_dynamic || ci.cycle.inline {
                self.report_cycle_error(v);
                return CycleCheck::Skip;
            }

            // A repeat through a reference first seen at this very node is
            // an identity chain: a reference cycle, equal to top.
            if entry.node == v {
                return CycleCheck::Skip;
            }

            // An optional conjunct gets its single grace iteration while
            // non-cyclic conjuncts remain.
            if ci.cycle.cycle_type == CyclicType::IsOptional && has_non_cyclic {
                let mut ci = ci.clone();
                ci.cycle.grant_grace();
                return CycleCheck::Continue(ci);
            }

            let depth = entry.depth;
            if depth > 0 && self.has_new_structure(v, node_depth, depth, ci) {
                let mut ci = ci.clone();
                ci.cycle
                    .track(x.clone(), arc, v, node_depth);
                return CycleCheck::Continue(ci);
            }

            return self.mark_cyclic(v, env, x, arc, ci, false);
        }

        // Repeats recorded at the cycle root shorten detection for values
        // referencing an already diagnosed cyclic vertex.
        if self.vertex(arc).status == VertexStatus::Finalized {
            let known_cyclic = self
                .vertex(arc)
                .cyclic_references
                .iter()
                .any(|r| r.reference == *x);
            if known_cyclic
                && !matches!(&self.vertex(arc).base_value, Some(Value::Disjunction(_)))
            {
                return self.mark_cyclic(v, env, x, arc, ci, false);
            }
        }

        let mut ci = ci.clone();
        ci.cycle.track(x.clone(), arc, v, node_depth);
        CycleCheck::Continue(ci)
    }

    /// Whether `arc` is a live ancestor: a parent of `v`, or a vertex whose
    /// evaluation is still on the current path (detected through depth
    /// counters, which also captures inline structs without parents).
    fn has_ancestor(&self, v: VertexId, arc: VertexId) -> bool {
        if self.has_depth_cycle(arc) {
            return true;
        }
        let mut p = self.vertex(v).parent;
        while let Some(id) = p {
            if id == arc {
                return true;
            }
            p = self.vertex(id).parent;
        }
        false
    }

    pub(crate) fn has_depth_cycle(&self, arc: VertexId) -> bool {
        if self.vertex(arc).status == VertexStatus::Finalized {
            return false;
        }
        match self.state_of(arc) {
            Some(n) => {
                let d = n.borrow().eval_depth;
                d > 0 && d < self.eval_depth
            }
            None => false,
        }
    }

    /// Looks for evidence of new structure between the two ends of the
    /// cycle: a non-cyclic conjunct on any vertex between `v` and the
    /// ancestor the repeated reference points to invalidates the cycle.
    fn has_new_structure(&self, v: VertexId, node_depth: u32, ref_depth: u32, ci: &CloseInfo) -> bool {
        if node_depth <= ref_depth {
            return false;
        }
        let mut up_count = node_depth - ref_depth;
        let mut p = self.vertex(v).parent;
        while let Some(id) = p {
            if up_count <= 1 {
                break;
            }
            up_count -= 1;
            let mut count = 0i32;
            for c in &self.vertex(id).conjuncts {
                if !c.ci.cycle.is_cyclic {
                    count += 1;
                }
            }
            if !ci.cycle.is_cyclic {
                count -= 1;
            }
            if count > 0 {
                return true;
            }
            p = self.vertex(id).parent;
        }
        false
    }

    /// Marks the conjunct cyclic. In the absence of any non-cyclic
    /// evidence the conjunct is postponed; it is released again if a
    /// non-cyclic conjunct arrives later.
    fn mark_cyclic(
        &mut self,
        v: VertexId,
        env: &Env,
        x: &RefId,
        arc: VertexId,
        ci: &CloseInfo,
        ancestor: bool,
    ) -> CycleCheck {
        let mut ci = ci.clone();
        ci.cycle.cycle_type = CyclicType::IsCyclic;
        ci.cycle.is_cyclic = true;

        // Record the repeat at the cycle root to shorten later detection.
        if self.vertex(arc).status == VertexStatus::EvaluatingArcs {
            let already = self
                .vertex(arc)
                .cyclic_references
                .iter()
                .any(|r| r.reference == *x);
            if !already {
                let depth = self
                    .state_of(arc)
                    .map(|n| n.borrow().depth)
                    .unwrap_or(0);
                self.vertex_mut(arc).cyclic_references.push(
                    crate::conjunct::RefEntry {
                        reference: x.clone(),
                        arc,
                        node: arc,
                        depth,
                    },
                );
            }
        }

        let Some(state) = self.state_of(v) else {
            return CycleCheck::ContinueCyclic(ci);
        };
        let postpone = {
            let mut n = state.borrow_mut();
            n.has_any_cyclic_conjunct = true;
            if ancestor {
                n.has_ancestor_cycle = true;
            }
            !n.has_non_cycle
        };
        if postpone {
            let c = Conjunct::new(env.clone(), Elem::Expr(x.0.clone()), ci);
            let cc = self.root_close_ctx(v);
            self.inc_dependent(cc, DepKind::Defer);
            state
                .borrow_mut()
                .cyclic_conjuncts
                .push(CyclicConjunct { c, arc });
            return CycleCheck::Skip;
        }
        CycleCheck::ContinueCyclic(ci)
    }

    /// Called for every scheduled conjunct that is not cyclic: releases any
    /// postponed cyclic conjuncts, since the cycle may now be fed.
    pub(crate) fn update_cyclic_status(&mut self, v: VertexId, ci: &CloseInfo) {
        if ci.cycle.is_cyclic {
            return;
        }
        let Some(state) = self.state_of(v) else { return };
        let released = {
            let mut n = state.borrow_mut();
            n.has_non_cycle = true;
            n.has_non_cyclic = true;
            std::mem::take(&mut n.cyclic_conjuncts)
        };
        for cc in released {
            let arc = cc.arc;
            let ref_id = match &cc.c.x {
                Elem::Expr(e) => RefId(e.clone()),
                Elem::Value(_) => continue,
            };
            let env = cc.c.env.clone();
            self.schedule_vertex_conjuncts(v, &env, &ref_id, arc, &cc.c.ci);
            let root = self.root_close_ctx(v);
            self.dec_dependent(root, DepKind::Defer);
        }
    }

    /// Declares a structural cycle if, after all conjuncts were seen, every
    /// one of them is cyclic with no new structure. Postponed conjuncts are
    /// released unprocessed.
    pub(crate) fn assert_structural_cycle(&mut self, v: VertexId) -> bool {
        let Some(state) = self.state_of(v) else { return false };
        let (postponed, is_cycle) = {
            let mut n = state.borrow_mut();
            let postponed = std::mem::take(&mut n.cyclic_conjuncts).len();
            (postponed, n.has_only_cyclic_conjuncts())
        };
        for _ in 0..postponed {
            let root = self.root_close_ctx(v);
            self.dec_dependent(root, DepKind::Defer);
        }
        if is_cycle {
            self.report_cycle_error(v);
            return true;
        }
        false
    }

    pub(crate) fn report_cycle_error(&mut self, v: VertexId) {
        let b = Rc::new(
            Bottom::new(ErrorCode::StructuralCycle, "structural cycle").at(v),
        );
        self.vertex_mut(v).base_value = Some(Value::Bottom(b));
        self.vertex_mut(v).arcs.clear();
    }

    /// Marks entry into an optional construct: structural cycles found
    /// while the mark is active are not terminal.
    pub(crate) fn mark_optional(&mut self) -> u32 {
        let saved = self.optional_mark;
        self.optional_mark = self.eval_depth;
        saved
    }

    pub(crate) fn unmark_optional(&mut self, saved: u32) {
        self.optional_mark = saved;
    }
}
