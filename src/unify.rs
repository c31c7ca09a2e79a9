//! The unification driver: drives a vertex toward a required set of
//! conditions under one of three run modes, completes arcs recursively,
//! and enforces closedness.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bounds;
use crate::closectx::DepKind;
use crate::conjunct::Conjunct;
use crate::context::OpContext;
use crate::error::{self, Bottom, ErrorCode, ValidateError};
use crate::feature::Feature;
use crate::kind::Kind;
use crate::node::NodeContext;
use crate::sched::{self, RunMode, SchedState};
use crate::value::{Validator, Value};
use crate::vertex::{ArcType, VertexId, VertexStatus};

impl OpContext {
    /// Forces full evaluation of a vertex and its subtree. Anything still
    /// unmet afterwards has been converted into a permanent error.
    pub fn finalize(&mut self, v: VertexId) {
        self.unify(v, sched::ALL_KNOWN, RunMode::Finalize);
        // Nodes queued for evaluation outside the current stack, to avoid
        // spurious structural cycle hits.
        while let Some(w) = self.to_finalize.pop() {
            self.unify(w, sched::ALL_KNOWN, RunMode::Finalize);
        }
    }

    /// Forces full evaluation and surfaces the aggregate error, if any.
    pub fn validate(&mut self, v: VertexId) -> Result<(), ValidateError> {
        self.finalize(v);
        match self.aggregate_error(v) {
            Some(b) => Err(ValidateError::from_bottom(&b)),
            None => Ok(()),
        }
    }

    /// The worst error in the evaluated subtree. A child's error is
    /// included unless the child is a constraint arc, whose errors are
    /// allowed as long as the field is never instantiated.
    pub fn aggregate_error(&self, v: VertexId) -> Option<Rc<Bottom>> {
        let vx = self.vertex(v);
        let mut worst = vx.bottom().cloned();
        for &a in &vx.arcs {
            let ax = self.vertex(a);
            if ax.arc_type != ArcType::Member || ax.label.is_let() {
                continue;
            }
            worst = error::combine(worst, self.aggregate_error(a));
        }
        worst
    }

    /// Follows shared-value links to the vertex holding actual content.
    pub fn deref_vertex(&self, mut v: VertexId) -> VertexId {
        let mut guard = 0;
        while let Some(Value::Vertex(w)) = &self.vertex(v).base_value {
            v = *w;
            guard += 1;
            if guard > 1_000 {
                break;
            }
        }
        v
    }

    /// The workspace of a vertex, created on first use.
    pub(crate) fn get_state(&mut self, v: VertexId) -> Option<Rc<RefCell<NodeContext>>> {
        if self.vertex(v).status == VertexStatus::Finalized {
            return None;
        }
        if self.vertex(v).state.is_none() {
            let id = self.acquire_node(v);
            self.vertex_mut(v).state = Some(id);

            let mut depth = 0;
            let mut p = self.vertex(v).parent;
            while let Some(id) = p {
                depth += 1;
                p = self.vertex(id).parent;
            }
            {
                let rc = self.node_rc(id);
                let mut n = rc.borrow_mut();
                n.depth = depth;
                n.sched.block_on(
                    sched::ALL_ANCESTORS_PROCESSED
                        | sched::SCALAR_KNOWN
                        | sched::LIST_TYPE_KNOWN
                        | sched::ARC_TYPE_KNOWN,
                );
            }

            if self.vertex(v).label.is_def() {
                self.vertex_mut(v).closed_recursive = true;
            }
            if let Some(p) = self.vertex(v).parent {
                if self.vertex(p).closed_recursive {
                    self.vertex_mut(v).closed_recursive = true;
                }
            }
        }
        self.state_of(v)
    }

    /// Schedules the conjuncts accumulated on the vertex, exactly once.
    fn ensure_scheduled(&mut self, v: VertexId) {
        let Some(state) = self.state_of(v) else { return };
        {
            let mut n = state.borrow_mut();
            if n.is_initialized {
                return;
            }
            n.is_initialized = true;
        }
        self.stats.unifications += 1;
        if self.vertex(v).status == VertexStatus::Unprocessed {
            self.vertex_mut(v).update_status(VertexStatus::Evaluating);
        }

        let root = self.root_close_ctx(v);
        let is_def = self.vertex(v).label.is_def();
        self.inc_dependent(root, DepKind::Init);
        for c in self.vertex(v).conjuncts.clone() {
            let mut ci = c.ci.clone();
            ci.cc = Some(root);
            // The conjuncts of a definition close the struct they form.
            ci.from_def |= is_def;
            self.schedule_conjunct(v, Conjunct::new(c.env, c.x, ci));
        }
        self.dec_dependent(root, DepKind::Init);
    }

    /// Whether all conjuncts that ancestors could contribute to arcs of
    /// this vertex have been delivered.
    pub(crate) fn all_child_conjuncts_known(&self, v: VertexId) -> bool {
        if self.vertex(v).status == VertexStatus::Finalized {
            return true;
        }
        match self.state_of(v) {
            Some(n) => n
                .borrow()
                .sched
                .completed
                .meets(sched::FIELD_CONJUNCTS_KNOWN | sched::ALL_ANCESTORS_PROCESSED),
            None => false,
        }
    }

    /// Drives `v` toward `needs`. Returns whether the conditions were met.
    pub(crate) fn unify(&mut self, v: VertexId, needs: sched::Condition, mode: RunMode) -> bool {
        if mode == RunMode::Ignore {
            return false;
        }
        let top_level = self.eval_depth == 0;
        let Some(state) = self.get_state(v) else {
            return true; // already finalized
        };
        {
            let n = state.borrow();
            if n.is_completing > 64 {
                // A pathological re-entrant chain; report what we have.
                return n.sched.meets(needs);
            }
        }
        state.borrow_mut().is_completing += 1;
        self.eval_depth += 1;
        let saved_mark = {
            let mut n = state.borrow_mut();
            let saved = n.eval_depth;
            n.eval_depth = self.eval_depth;
            saved
        };
        log::trace!("unify {} needs {:?} mode {:?}", self.debug_name(v), needs, mode);

        self.ensure_scheduled(v);

        let parent_ok = match self.vertex(v).parent {
            None => true,
            Some(p) => self.all_child_conjuncts_known(p),
        };
        if !self.vertex(v).rooted() || parent_ok || mode == RunMode::Finalize {
            self.signal(v, sched::ALL_ANCESTORS_PROCESSED);
        }

        let node_only = needs.without(sched::SUB_FIELDS_PROCESSED);
        self.process(v, node_only, mode);

        let done = |ctx: &mut Self| {
            let mut n = state.borrow_mut();
            n.eval_depth = saved_mark;
            n.is_completing = n.is_completing.saturating_sub(1);
            drop(n);
            ctx.eval_depth -= 1;
            if top_level {
                ctx.eval_depth = 0;
            }
        };

        if self.suspended {
            done(self);
            return false;
        }

        self.update_scalar(v);

        // Once no more conjuncts can arrive, release the root closedness
        // scope; its completion signals that all field conjuncts are known.
        // Conditions that nothing here provides unblock at the same time.
        if self.sched_meets(v, sched::ALL_ANCESTORS_PROCESSED) || self.vertex(v).label.is_let() {
            let cc = self.root_close_ctx(v);
            if !self.close_ctx(cc).is_decremented {
                self.close_ctx_mut(cc).is_decremented = true;
                self.dec_dependent(cc, DepKind::Root);
                self.signal_done_adding(v);
            }
        }

        // Resolve disjunctions once the regular conjuncts have settled.
        let tasks_drained = {
            let n = state.borrow();
            n.sched.task_pos >= n.sched.tasks.len() && !n.disjunctions.is_empty()
        };
        if tasks_drained
            && (mode == RunMode::Finalize || self.sched_meets(v, sched::ALL_ANCESTORS_PROCESSED))
        {
            self.process_disjunctions(v, mode);
            if self.vertex(v).status == VertexStatus::Finalized {
                done(self);
                return true;
            }
            self.update_scalar(v);
        }

        if !self.sched_meets(v, node_only) && mode != RunMode::Finalize {
            done(self);
            return false;
        }

        if self.vertex(v).status < VertexStatus::Conjuncts {
            self.vertex_mut(v).update_status(VertexStatus::Conjuncts);
        }

        if needs.meets(sched::SUB_FIELDS_PROCESSED) {
            if !self.assert_structural_cycle(v) {
                self.complete_all_arcs(v, mode);
            }
            if mode == RunMode::Finalize {
                self.signal(v, sched::SUB_FIELDS_PROCESSED);
                state.borrow_mut().sched.state = SchedState::Finalizing;
            }
            self.set_final_value(v, mode);
            if mode == RunMode::Finalize {
                {
                    let mut n = state.borrow_mut();
                    n.sched.state = if self.vertex(v).is_err() {
                        SchedState::Failed
                    } else {
                        SchedState::Success
                    };
                }
                self.vertex_mut(v).update_status(VertexStatus::Finalized);
                let id = self.vertex_mut(v).state.take();
                if let Some(id) = id {
                    self.release_node(id);
                }
            }
        } else if needs.meets(sched::FIELD_SET_KNOWN) {
            self.eval_arc_types(v, mode);
            let derived = self.state_completions(v);
            self.signal(v, derived);
        }

        let result = self.vertex(v).status == VertexStatus::Finalized || self.sched_meets(v, needs);
        done(self);
        result
    }

    /// Copies an arrived scalar into the base value. Errors take
    /// precedence and are never discarded.
    pub(crate) fn update_scalar(&mut self, v: VertexId) {
        let Some(state) = self.state_of(v) else { return };
        let (scalar, has_err) = {
            let n = state.borrow();
            (n.scalar.clone(), n.errs.is_some())
        };
        if let Some(s) = scalar {
            if !has_err && !self.vertex(v).is_err() {
                self.vertex_mut(v).base_value = Some(s);
                self.signal(v, sched::SCALAR_KNOWN);
            }
        }
    }

    /// Recursively evaluates all arcs, enforcing closedness, required
    /// fields, and child-error propagation.
    fn complete_all_arcs(&mut self, v: VertexId, mode: RunMode) {
        if self.vertex(v).status < VertexStatus::EvaluatingArcs {
            self.vertex_mut(v).update_status(VertexStatus::EvaluatingArcs);
        }

        let closed = self.vertex(v).is_closed_struct();

        let mut i = 0;
        while i < self.vertex(v).arcs.len() {
            let a = self.vertex(v).arcs[i];
            i += 1;

            if self.vertex(a).arc_type == ArcType::Pending {
                self.unify(a, sched::ARC_TYPE_KNOWN, mode);
                if self.vertex(a).arc_type == ArcType::Pending {
                    self.vertex_mut(a).arc_type = ArcType::NotPresent;
                    continue;
                }
            }

            // Closedness: a member field of a closed struct must be
            // anticipated by an explicit field, a pattern, or an ellipsis.
            let (label, at) = {
                let ax = self.vertex(a);
                (ax.label, ax.arc_type)
            };
            if closed && at <= ArcType::Required && label.is_regular() && !self.accepts_label(v, label)
            {
                let msg = format!("field not allowed: {}", self.label_str(label));
                let b = Rc::new(Bottom::new(ErrorCode::Eval, msg).at(a));
                self.vertex_mut(a).base_value = Some(Value::Bottom(b.clone()));
                self.vertex_mut(a).status = VertexStatus::Finalized;
                if let Some(id) = self.vertex_mut(a).state.take() {
                    self.release_node(id);
                }
                self.add_child_error(v, b);
                continue;
            }

            self.unify(a, sched::ALL_KNOWN, mode);

            let at = self.vertex(a).arc_type;
            if at == ArcType::NotPresent {
                continue;
            }

            // A required field that never received a concrete value is an
            // error once evaluation is forced.
            if at == ArcType::Required && mode == RunMode::Finalize {
                let msg = format!(
                    "field is required but not present: {}",
                    self.label_str(label)
                );
                let mut b = Bottom::new(ErrorCode::Incomplete, msg).at(a);
                b.permanent = true;
                for c in &self.vertex(a).conjuncts {
                    if let crate::conjunct::Elem::Expr(e) = &c.x {
                        if e.src.is_some() {
                            b.positions.push(e.src);
                        }
                    }
                }
                let b = Rc::new(b);
                self.vertex_mut(a).base_value = Some(Value::Bottom(b.clone()));
                self.add_child_error(v, b);
                continue;
            }

            if !label.is_let() && at <= ArcType::Required {
                if let Some(b) = self.vertex(a).bottom().cloned() {
                    if !b.is_incomplete() && b.code != ErrorCode::StructuralCycle {
                        self.add_child_error(v, b);
                    } else if b.code == ErrorCode::StructuralCycle && at == ArcType::Member {
                        // Structural cycles are fatal but locally scoped;
                        // they surface through member fields only.
                        self.add_child_error(v, b);
                    }
                }
            }
        }

        let gone: Vec<VertexId> = self
            .vertex(v)
            .arcs
            .iter()
            .copied()
            .filter(|&a| self.vertex(a).arc_type == ArcType::NotPresent)
            .collect();
        if !gone.is_empty() {
            self.vertex_mut(v)
                .arcs
                .retain(|a| !gone.contains(a));
        }
    }

    /// Resolves the arc types of any pending arcs.
    fn eval_arc_types(&mut self, v: VertexId, mode: RunMode) {
        for a in self.vertex(v).arcs.clone() {
            if self.vertex(a).arc_type != ArcType::Pending {
                continue;
            }
            self.unify(a, sched::ARC_TYPE_KNOWN, mode);
            if self.vertex(a).arc_type == ArcType::Pending && mode == RunMode::Finalize {
                self.vertex_mut(a).arc_type = ArcType::NotPresent;
            }
        }
    }

    /// Whether the closed groups contributing to this vertex anticipate a
    /// field name. Closedness composes: every closed group must accept the
    /// name, while open groups impose nothing.
    pub(crate) fn accepts_label(&mut self, v: VertexId, f: Feature) -> bool {
        if !f.is_regular() {
            return true;
        }
        if self.vertex(v).has_ellipsis {
            return true;
        }

        let infos = self.vertex(v).structs.clone();
        let mut any_closed = false;
        for si in &infos {
            let group_closed =
                si.is_def || si.cc.map_or(false, |cc| self.chain_is_closed(cc));
            if !group_closed || !si.use_for_accept() {
                continue;
            }
            any_closed = true;
            if si.fields.contains(&f) || si.has_ellipsis {
                continue;
            }
            if si.has_patterns {
                let lv = self.label_value(f);
                let pats = self.vertex(v).pattern_constraints.clone();
                if pats.iter().any(|pc| {
                    let p = pc.pattern.clone();
                    self.pattern_matches(&p, &lv)
                }) {
                    continue;
                }
            }
            return false;
        }
        if any_closed {
            return true;
        }

        // Closed by inheritance only: fall back to the union of all
        // anticipated names.
        let lv = self.label_value(f);
        for si in &infos {
            if si.fields.contains(&f) || si.has_ellipsis {
                return true;
            }
        }
        let pats = self.vertex(v).pattern_constraints.clone();
        pats.iter().any(|pc| {
            let p = pc.pattern.clone();
            self.pattern_matches(&p, &lv)
        })
    }

    /// Computes the final base value from the accumulated state: errors
    /// first, then scalars (re-validated against all checks), then
    /// composite markers, then remaining constraints.
    fn set_final_value(&mut self, v: VertexId, mode: RunMode) {
        let Some(state) = self.state_of(v) else { return };
        let (mut errs, scalar, checks, kind, has_top, has_struct, list) = {
            let mut n = state.borrow_mut();
            (
                n.errs.take(),
                n.scalar.clone(),
                n.checks.clone(),
                n.kind,
                n.has_top,
                n.has_struct_conjunct,
                n.list,
            )
        };

        if let Some(b) = self.vertex(v).bottom() {
            errs = error::combine(errs, Some(b.clone()));
        }

        // Final concrete-value checks always re-validate, so eager bound
        // simplification is never load-bearing.
        if errs.is_none() {
            if let Some(s) = &scalar {
                for c in &checks {
                    if let Some(b) = self.check_value(c, s) {
                        errs = error::combine(errs, Some(b));
                    }
                }
            }
        }

        if let Some(err) = errs {
            let err = if mode == RunMode::Finalize && err.is_incomplete() {
                let mut e = (*err).clone();
                e.permanent = true;
                Rc::new(e)
            } else {
                err
            };
            self.vertex_mut(v).base_value = Some(Value::Bottom(err));
            return;
        }

        if self.vertex(v).base_value.is_some() && scalar.is_none() {
            // A disjunction or shared value was already folded in.
            if !matches!(&self.vertex(v).base_value, Some(Value::StructMarker)) {
                return;
            }
        }

        let value = if let Some(s) = scalar {
            s
        } else if let Some(req) = list {
            Value::ListMarker { open: req.open }
        } else if has_struct || !self.vertex(v).arcs.is_empty() {
            Value::StructMarker
        } else if !checks.is_empty() {
            if checks.len() == 1 {
                checks.into_iter().next().expect("len checked")
            } else {
                Value::Conjunction(checks.into())
            }
        } else if has_top || kind == Kind::TOP {
            Value::Top
        } else {
            Value::BasicType(kind)
        };
        self.vertex_mut(v).base_value = Some(value);
    }

    /// Validates a concrete value against one accumulated constraint.
    pub(crate) fn check_value(&mut self, constraint: &Value, v: &Value) -> Option<Rc<Bottom>> {
        match constraint {
            Value::Bound(op, b) => {
                match bounds::satisfies(&mut self.regex_cache, v, *op, b) {
                    Ok(true) => None,
                    Ok(false) => Some(Rc::new(Bottom::new(
                        ErrorCode::Eval,
                        format!("invalid value {} (out of bound {}{})", v, op, b),
                    ))),
                    Err(e) => Some(e),
                }
            }
            Value::Validator(val) => match val.validate(v) {
                Ok(()) => None,
                Err(msg) => Some(Rc::new(Bottom::new(ErrorCode::Eval, msg))),
            },
            Value::BasicType(k) => {
                if v.kind().is_anyof(*k) {
                    None
                } else {
                    Some(Rc::new(Bottom::new(
                        ErrorCode::Eval,
                        format!("conflicting values {} and {}", v, k),
                    )))
                }
            }
            Value::Conjunction(cs) => {
                for c in cs.iter() {
                    let c = c.clone();
                    if let Some(b) = self.check_value(&c, v) {
                        return Some(b);
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// Records that a descendant arc failed. Only permanent child errors
    /// fail the parent; a child's incomplete error never does.
    pub(crate) fn add_child_error(&mut self, v: VertexId, b: Rc<Bottom>) {
        let combined = error::combine(self.vertex(v).child_errors.clone(), Some(b.clone()));
        self.vertex_mut(v).child_errors = combined;
        if b.is_incomplete() {
            return;
        }
        match self.vertex(v).bottom() {
            Some(existing) => {
                let mut e = (**existing).clone();
                e.child_error = true;
                if b.code < e.code {
                    e.code = b.code;
                }
                self.vertex_mut(v).base_value = Some(Value::Bottom(Rc::new(e)));
            }
            None => {
                let mut e = Bottom::new(b.code, b.msg.clone());
                e.child_error = true;
                e.node = Some(v);
                e.positions = b.positions.clone();
                self.vertex_mut(v).base_value = Some(Value::Bottom(Rc::new(e)));
            }
        }
    }

    // ---- downstream queries ----

    /// Looks up a child by label in an evaluated vertex.
    pub fn lookup_label(&self, v: VertexId, f: Feature) -> Option<VertexId> {
        let v = self.deref_vertex(v);
        self.lookup_arc(v, f)
    }

    /// The elements of an evaluated list, in index order.
    pub fn elems(&self, v: VertexId) -> Vec<VertexId> {
        let v = self.deref_vertex(v);
        let mut out: Vec<VertexId> = self
            .vertex(v)
            .arcs
            .iter()
            .copied()
            .filter(|&a| self.vertex(a).label.is_int())
            .collect();
        out.sort_by_key(|&a| self.vertex(a).label.index());
        out
    }

    /// The final value of a vertex, with defaults left intact.
    pub fn value_of(&self, v: VertexId) -> Option<Value> {
        let v = self.deref_vertex(v);
        self.vertex(v).base_value.clone()
    }
}

/// A validator builtin usable from tests and embedders: requires a string
/// of at least `n` runes.
pub fn min_runes_builtin() -> Rc<crate::expr::Builtin> {
    fn min_runes(args: &[Value]) -> Value {
        match (&args[0], &args[1]) {
            (Value::Str(s), Value::Int(n)) => Value::Bool(s.chars().count() as i64 >= *n),
            _ => Value::Bottom(Rc::new(Bottom::new(
                ErrorCode::Eval,
                "invalid arguments to minRunes",
            ))),
        }
    }
    Rc::new(crate::expr::Builtin {
        name: "minRunes",
        arity: 2,
        result: Kind::BOOL,
        func: min_runes,
    })
}

/// Builds a validator value from a builtin and its bound arguments.
pub fn validator(builtin: Rc<crate::expr::Builtin>, args: Vec<Value>) -> Value {
    Value::Validator(Validator { builtin, args })
}
