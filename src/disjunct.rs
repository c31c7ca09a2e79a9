//! Disjunction processing: maintain surviving partial evaluations, unify
//! each disjunct into every survivor via structural overlays, deduplicate,
//! and fold the result back into the owning vertex.

use std::rc::Rc;

use crate::conjunct::{CloseInfo, Conjunct, CyclicType, Elem, SPAN_DISJUNCTION};
use crate::context::OpContext;
use crate::environment::Env;
use crate::error::{Bottom, ErrorCode, Pos};
use crate::expr::DisjunctionExpr;
use crate::sched::{self, RunMode};
use crate::value::{Disjunction, Value};
use crate::vertex::VertexId;

/// How default markers propagate through a branch: a branch is a default
/// only if every disjunction level it passed through chose a marked
/// alternative (levels without markers are neutral).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultMode {
    NotDefault,
    Maybe,
    IsDefault,
}

pub(crate) fn combine_default(a: DefaultMode, b: DefaultMode) -> DefaultMode {
    use DefaultMode::*;
    match (a, b) {
        (NotDefault, _) | (_, NotDefault) => NotDefault,
        (Maybe, x) => x,
        (x, Maybe) => x,
        (IsDefault, IsDefault) => IsDefault,
    }
}

/// One alternative of a queued disjunction.
#[derive(Debug, Clone, PartialEq)]
pub struct DisjunctAlt {
    pub x: Elem,
    pub default: bool,
}

/// A disjunction waiting to be resolved on a node, with the scope and
/// closedness metadata of the conjunct that introduced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvDisjunct {
    pub env: Env,
    pub alts: Vec<DisjunctAlt>,
    pub has_defaults: bool,
    pub ci: CloseInfo,
    pub pos: Pos,
}

impl OpContext {
    pub(crate) fn schedule_disjunction_expr(
        &mut self,
        v: VertexId,
        env: &Env,
        d: Rc<DisjunctionExpr>,
        ci: &CloseInfo,
        pos: Pos,
    ) {
        let alts = d
            .values
            .iter()
            .map(|x| DisjunctAlt {
                x: Elem::Expr(x.val.clone()),
                default: x.default,
            })
            .collect();
        self.queue_disjunction(
            v,
            EnvDisjunct {
                env: env.clone(),
                alts,
                has_defaults: d.has_defaults,
                ci: ci.clone(),
                pos,
            },
        );
    }

    pub(crate) fn schedule_value_disjunction(
        &mut self,
        v: VertexId,
        env: &Env,
        d: &Disjunction,
        ci: &CloseInfo,
        pos: Pos,
    ) {
        let alts = d
            .values
            .iter()
            .enumerate()
            .map(|(i, val)| DisjunctAlt {
                x: Elem::Value(val.clone()),
                default: i < d.num_defaults,
            })
            .collect();
        self.queue_disjunction(
            v,
            EnvDisjunct {
                env: env.clone(),
                alts,
                has_defaults: d.has_defaults,
                ci: ci.clone(),
                pos,
            },
        );
    }

    /// Queues a disjunction for resolution at node completion. The queued
    /// disjunction holds value-condition counters so that the node is not
    /// considered value-complete before resolution.
    fn queue_disjunction(&mut self, v: VertexId, d: EnvDisjunct) {
        let Some(state) = self.state_of(v) else { return };
        let mut n = state.borrow_mut();
        n.sched.provided =
            n.sched.provided | sched::GENERIC_CONJUNCT | sched::DISJUNCTION_TASK;
        n.sched.increment_counts(sched::GENERIC_CONJUNCT);
        n.disjunctions.push(d);
    }

    /// Resolves all queued disjunctions of a node by cross product over
    /// structural overlays.
    pub(crate) fn process_disjunctions(&mut self, v: VertexId, _mode: RunMode) {
        let Some(state) = self.state_of(v) else { return };
        let disjunctions = {
            let mut n = state.borrow_mut();
            std::mem::take(&mut n.disjunctions)
        };
        if disjunctions.is_empty() {
            return;
        }

        // Settle the counters held by the queue before cloning, deferring
        // the signal until the fold-back is complete.
        let mut newly = sched::NONE;
        {
            let mut n = state.borrow_mut();
            for _ in &disjunctions {
                newly = newly | n.sched.decrement_counts(sched::GENERIC_CONJUNCT);
            }
        }

        let mut cross: Vec<(VertexId, DefaultMode)> = vec![(v, DefaultMode::Maybe)];

        for d in &disjunctions {
            self.stats.disjuncts += d.alts.len() as u64;
            let mut next: Vec<(VertexId, DefaultMode)> = Vec::new();
            let mut errors: Vec<Rc<Bottom>> = Vec::new();

            for &(base, bmode) in &cross {
                for alt in &d.alts {
                    let clone = self.overlay_clone(base);

                    let mut ci = d.ci.clone();
                    ci.cc = None;
                    ci.spans |= SPAN_DISJUNCTION;
                    if ci.cycle.cycle_type == CyclicType::NoCycle {
                        ci.cycle.cycle_type = CyclicType::IsOptional;
                    }
                    self.schedule_conjunct(
                        clone,
                        Conjunct::new(d.env.clone(), alt.x.clone(), ci),
                    );
                    self.unify(clone, sched::ALL_KNOWN, RunMode::Finalize);

                    match self.vertex(clone).bottom().cloned() {
                        Some(b) => errors.push(b),
                        None => {
                            let alt_mode = if d.has_defaults {
                                if alt.default {
                                    DefaultMode::IsDefault
                                } else {
                                    DefaultMode::NotDefault
                                }
                            } else {
                                DefaultMode::Maybe
                            };
                            let m = combine_default(bmode, alt_mode);
                            // Deduplicate structurally equal survivors
                            // before the next cross product.
                            let dup = next
                                .iter()
                                .position(|&(w, _)| self.equal_partial(w, clone));
                            match dup {
                                Some(i) => {
                                    // A default-tagged duplicate upgrades
                                    // the surviving entry.
                                    if m == DefaultMode::IsDefault {
                                        next[i].1 = DefaultMode::IsDefault;
                                    }
                                }
                                None => next.push((clone, m)),
                            }
                        }
                    }
                }
            }

            if next.is_empty() {
                let mut msg = String::from("empty disjunction: ");
                let mut positions = Vec::new();
                for (i, b) in errors.iter().enumerate() {
                    if i > 0 {
                        msg.push_str("; ");
                    }
                    msg.push_str(&b.msg);
                    for p in &b.positions {
                        if !positions.contains(p) {
                            positions.push(*p);
                        }
                    }
                }
                let mut b = Bottom::new(ErrorCode::Eval, msg).at(v);
                b.positions = positions;
                if d.pos.is_some() {
                    b.positions.push(d.pos);
                }
                self.node_add_err(v, Rc::new(b));
                self.signal(v, newly | sched::SCALAR_KNOWN | sched::LIST_TYPE_KNOWN);
                return;
            }

            cross = next;
        }

        let has_defaults = disjunctions.iter().any(|d| d.has_defaults);
        if cross.len() == 1 {
            let (survivor, _) = cross[0];
            self.absorb_disjunct(v, survivor);
        } else {
            // Defaults are ordered first; the tag is externally visible
            // only when exactly one survivor carries it.
            let mut ordered: Vec<(VertexId, DefaultMode)> = Vec::with_capacity(cross.len());
            for &(w, m) in cross.iter().filter(|&&(_, m)| m == DefaultMode::IsDefault) {
                ordered.push((w, m));
            }
            let num_defaults = ordered.len();
            for &(w, m) in cross.iter().filter(|&&(_, m)| m != DefaultMode::IsDefault) {
                ordered.push((w, m));
            }
            let values = ordered
                .iter()
                .map(|&(w, _)| {
                    self.vertex_mut(w).is_disjunct = true;
                    self.leaf_value(w)
                })
                .collect();
            let vx = self.vertex_mut(v);
            vx.base_value = Some(Value::Disjunction(Rc::new(Disjunction {
                values,
                num_defaults,
                has_defaults,
            })));
            // The conjuncts no longer apply uniformly across alternatives.
            vx.conjuncts.clear();
            vx.arcs.clear();
        }

        self.signal(v, newly | sched::SCALAR_KNOWN | sched::LIST_TYPE_KNOWN);
    }

    /// The externally visible value of a surviving branch: leaf results
    /// collapse to their value; composites stay as vertex references.
    fn leaf_value(&self, w: VertexId) -> Value {
        let wx = self.vertex(w);
        match &wx.base_value {
            Some(v)
                if wx.arcs.is_empty()
                    && !matches!(v, Value::StructMarker | Value::ListMarker { .. }) =>
            {
                v.clone()
            }
            _ => Value::Vertex(w),
        }
    }

    /// Folds the single surviving branch back into the original vertex.
    fn absorb_disjunct(&mut self, v: VertexId, w: VertexId) {
        let (base, arcs, child_errors, closed, ellipsis, structs, patterns) = {
            let wx = self.vertex(w);
            (
                wx.base_value.clone(),
                wx.arcs.clone(),
                wx.child_errors.clone(),
                wx.closed_recursive,
                wx.has_ellipsis,
                wx.structs.clone(),
                wx.pattern_constraints.clone(),
            )
        };
        for &a in &arcs {
            self.vertex_mut(a).parent = Some(v);
        }
        let vx = self.vertex_mut(v);
        vx.base_value = base;
        vx.arcs = arcs;
        vx.child_errors = crate::error::combine(vx.child_errors.clone(), child_errors);
        vx.closed_recursive |= closed;
        vx.has_ellipsis |= ellipsis;
        vx.structs = structs;
        vx.pattern_constraints = patterns;
    }

    /// Structural equality of two partial evaluations: scalar kind and
    /// value, checks, arc set, and outstanding work.
    pub(crate) fn equal_partial(&self, a: VertexId, b: VertexId) -> bool {
        if a == b {
            return true;
        }
        let (ax, bx) = (self.vertex(a), self.vertex(b));
        if ax.base_value != bx.base_value {
            return false;
        }
        if ax.arcs.len() != bx.arcs.len() {
            return false;
        }
        for (&aa, &ba) in ax.arcs.iter().zip(bx.arcs.iter()) {
            let (av, bv) = (self.vertex(aa), self.vertex(ba));
            if av.label != bv.label || av.arc_type != bv.arc_type {
                return false;
            }
            if !self.equal_partial(aa, ba) {
                return false;
            }
        }
        let (an, bn) = (self.state_of(a), self.state_of(b));
        match (an, bn) {
            (None, None) => true,
            (Some(an), Some(bn)) => {
                let an = an.borrow();
                let bn = bn.borrow();
                an.checks == bn.checks
                    && an.scalar == bn.scalar
                    && an.kind == bn.kind
                    && an.sched.tasks.len() - an.sched.task_pos.min(an.sched.tasks.len())
                        == bn.sched.tasks.len() - bn.sched.task_pos.min(bn.sched.tasks.len())
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_combination() {
        use DefaultMode::*;
        assert_eq!(combine_default(Maybe, IsDefault), IsDefault);
        assert_eq!(combine_default(IsDefault, Maybe), IsDefault);
        assert_eq!(combine_default(IsDefault, NotDefault), NotDefault);
        assert_eq!(combine_default(NotDefault, IsDefault), NotDefault);
        assert_eq!(combine_default(Maybe, Maybe), Maybe);
        assert_eq!(combine_default(IsDefault, IsDefault), IsDefault);
    }
}
