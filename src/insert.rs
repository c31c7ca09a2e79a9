//! Conjunct insertion: decomposing scheduled conjuncts into tasks, arcs,
//! pattern constraints, and accumulated value state.

use std::rc::Rc;

use crate::bounds;
use crate::closectx::DepKind;
use crate::conjunct::{
    CloseInfo, Conjunct, CyclicType, Elem, SPAN_COMPREHENSION, SPAN_CONSTRAINT, SPAN_EMBEDDING,
};
use crate::context::OpContext;
use crate::environment::{Env, Environment};
use crate::error::{Bottom, ErrorCode, Pos};
use crate::expr::{Comprehension, Decl, Expr, ExprKind, ListElem, RefId, StructLit};
use crate::feature::{Feature, FeatureExt, LabelClass};
use crate::kind::Kind;
use crate::sched::{RunMode, RunnerKind, TaskExtras, TaskId};
use crate::value::Value;
use crate::vertex::{ArcType, PatternConstraint, StructInfo, VertexId, VertexStatus};

impl OpContext {
    /// Schedules one conjunct onto a vertex, decomposing struct literals
    /// eagerly and turning everything else into tasks.
    pub(crate) fn schedule_conjunct(&mut self, v: VertexId, mut c: Conjunct) {
        self.stats.conjuncts += 1;
        if c.ci.cc.is_none() {
            let root = self.root_close_ctx(v);
            c.ci.cc = Some(root);
        }
        self.update_cyclic_status(v, &c.ci);

        match c.x.clone() {
            Elem::Value(val) => self.insert_value_conjunct(v, &c.env, &val, &c.ci),
            Elem::Expr(e) => match &e.kind {
                ExprKind::Struct(lit) => self.schedule_struct(v, &c.env, lit, &c.ci),
                ExprKind::List(_) => {
                    self.insert_task(
                        v,
                        RunnerKind::ProcessList,
                        c.env,
                        Elem::Expr(e),
                        c.ci,
                        TaskExtras::default(),
                    );
                }
                ExprKind::Disjunction(d) => {
                    self.schedule_disjunction_expr(v, &c.env, d.clone(), &c.ci, e.src);
                }
                ExprKind::Comprehension(comp) => {
                    self.schedule_comprehension(v, c.env, comp.clone(), c.ci);
                }
                ExprKind::Top => {
                    if let Some(state) = self.state_of(v) {
                        state.borrow_mut().has_top = true;
                    }
                }
                ExprKind::Bottom => {
                    let b = Rc::new(
                        Bottom::new(ErrorCode::User, "explicit error (_|_ literal) in source")
                            .with_pos(e.src)
                            .at(v),
                    );
                    self.node_add_err(v, b);
                }
                _ => {
                    self.insert_task(
                        v,
                        RunnerKind::EvalConjunct,
                        c.env,
                        Elem::Expr(e),
                        c.ci,
                        TaskExtras::default(),
                    );
                }
            },
        }
    }

    /// Decomposes a struct literal: registers a closedness scope, creates
    /// arcs for static fields, and queues tasks for dynamic fields, pattern
    /// constraints, and comprehensions.
    pub(crate) fn schedule_struct(
        &mut self,
        v: VertexId,
        env: &Env,
        lit: &Rc<StructLit>,
        ci: &CloseInfo,
    ) {
        let parent_cc = match ci.cc {
            Some(cc) => cc,
            None => self.root_close_ctx(v),
        };
        let cc = self.spawn_close_ctx(parent_cc, v);
        {
            let c = self.close_ctx_mut(cc);
            c.is_def = ci.from_def;
            c.is_embed = ci.from_embed;
        }
        if ci.from_def {
            self.set_closed(cc);
        }
        self.inc_dependent(cc, DepKind::Init);

        let mut ci2 = ci.clone();
        ci2.cc = Some(cc);
        if ci.from_def {
            self.vertex_mut(v).closed_recursive = true;
        }

        let child_env = env.derive(v);

        let mut fields = Vec::new();
        let mut has_patterns = false;
        let mut has_ellipsis = false;
        // Embedding-only literals pass their value through; anything else,
        // including the empty literal, makes this a struct.
        let struct_forming = lit.decls.is_empty()
            || lit
                .decls
                .iter()
                .any(|d| !matches!(d, Decl::Embed { .. }));

        for decl in &lit.decls {
            match decl {
                Decl::Field { label, arc, value } => {
                    fields.push(*label);
                    let Some(arc_v) = self.get_arc_checked(v, *label, *arc, lit.src) else {
                        continue;
                    };
                    let mut cin = ci2.clone();
                    if *arc == ArcType::Optional {
                        cin.spans |= SPAN_CONSTRAINT;
                        if cin.cycle.cycle_type == CyclicType::NoCycle {
                            cin.cycle.cycle_type = CyclicType::IsOptional;
                        }
                    }
                    self.add_conjunct_to_arc(
                        arc_v,
                        Conjunct::new(child_env.clone(), value.clone(), cin),
                    );
                }
                Decl::Dynamic { key, arc, value } => {
                    self.insert_task(
                        v,
                        RunnerKind::ProcessDynamic,
                        child_env.clone(),
                        Elem::Expr(key.clone()),
                        ci2.clone(),
                        TaskExtras {
                            aux: Some(value.clone()),
                            arc_flag: *arc,
                            pending_arcs: Vec::new(),
                        },
                    );
                }
                Decl::Pattern { filter, value } => {
                    has_patterns = true;
                    self.insert_task(
                        v,
                        RunnerKind::ProcessPattern,
                        child_env.clone(),
                        Elem::Expr(filter.clone()),
                        ci2.clone(),
                        TaskExtras {
                            aux: Some(value.clone()),
                            arc_flag: ArcType::Optional,
                            pending_arcs: Vec::new(),
                        },
                    );
                }
                Decl::Ellipsis { value } => {
                    has_ellipsis = true;
                    self.vertex_mut(v).has_ellipsis = true;
                    self.set_total(cc);
                    if let Some(x) = value {
                        let mut cin = ci2.spawn_span(SPAN_CONSTRAINT);
                        cin.cycle.cycle_type = CyclicType::IsOptional;
                        self.add_pattern_constraint(
                            v,
                            PatternConstraint {
                                pattern: Value::Top,
                                conjuncts: vec![Conjunct::new(
                                    child_env.clone(),
                                    x.clone(),
                                    cin,
                                )],
                            },
                        );
                    }
                }
                Decl::Let { .. } => {
                    // Let bindings are resolved through their references.
                }
                Decl::Embed { value } => {
                    let ecc = self.spawn_close_ctx(cc, v);
                    self.close_ctx_mut(ecc).is_embed = true;
                    let mut cie = ci2.clone();
                    cie.cc = Some(ecc);
                    cie.from_embed = true;
                    cie.from_def = false;
                    cie.spans |= SPAN_EMBEDDING;
                    self.schedule_conjunct(
                        v,
                        Conjunct::new(child_env.clone(), value.clone(), cie),
                    );
                }
                Decl::Comprehension(comp) => {
                    let cic = ci2.spawn_span(SPAN_COMPREHENSION);
                    self.schedule_comprehension(v, child_env.clone(), comp.clone(), cic);
                }
            }
        }

        if struct_forming {
            if let Some(state) = self.state_of(v) {
                state.borrow_mut().has_struct_conjunct = true;
            }
            self.node_update_kind(v, Kind::STRUCT, lit.src);
        }

        self.vertex_mut(v).structs.push(StructInfo {
            fields,
            has_patterns,
            has_ellipsis,
            is_def: ci.from_def,
            is_embed: ci.from_embed,
            cc: Some(cc),
        });

        self.dec_dependent(cc, DepKind::Init);
    }

    /// Queues a comprehension task, provisionally registering arcs for the
    /// statically known labels of its template so that the field set is not
    /// concluded early.
    pub(crate) fn schedule_comprehension(
        &mut self,
        v: VertexId,
        env: Env,
        comp: Rc<Comprehension>,
        ci: CloseInfo,
    ) {
        let mut pending = Vec::new();
        for decl in &comp.value.decls {
            if let Decl::Field {
                label,
                arc: ArcType::Member,
                ..
            } = decl
            {
                if self.lookup_arc(v, *label).is_none() && !self.vertex(v).lock_arcs {
                    if let Some(a) = self.get_arc_checked(v, *label, ArcType::Pending, comp.src) {
                        let cc = self.root_close_ctx(a);
                        self.inc_dependent(cc, DepKind::Notify);
                        pending.push(a);
                    }
                }
            }
        }
        let x = Expr::at(ExprKind::Comprehension(comp.clone()), comp.src);
        self.insert_task(
            v,
            RunnerKind::ProcessComprehension,
            env,
            Elem::Expr(x),
            ci,
            TaskExtras {
                aux: None,
                arc_flag: ArcType::Member,
                pending_arcs: pending,
            },
        );
    }

    /// Creates or finds an arc, applying existing pattern constraints to a
    /// newly created one. Rejects new arcs on locked vertices.
    pub(crate) fn get_arc_checked(
        &mut self,
        v: VertexId,
        label: Feature,
        t: ArcType,
        pos: Pos,
    ) -> Option<VertexId> {
        if self.lookup_arc(v, label).is_none() && self.vertex(v).lock_arcs {
            let name = self.runtime.label_str(label);
            let b = Rc::new(
                Bottom::new(
                    ErrorCode::Eval,
                    format!("adding field {} not allowed as field set was already referenced", name),
                )
                .with_pos(pos)
                .at(v),
            );
            self.node_add_err(v, b);
            return None;
        }
        let (arc, is_new) = self.get_arc(v, label, t);
        if is_new && label.is_regular() {
            for pc in self.vertex(v).pattern_constraints.clone() {
                self.apply_pattern_to_arc(&pc, arc);
            }
        }
        Some(arc)
    }

    /// Adds a conjunct to an arc's accumulating list, scheduling it
    /// immediately when the arc is already being evaluated.
    pub(crate) fn add_conjunct_to_arc(&mut self, arc: VertexId, c: Conjunct) {
        let status = self.vertex(arc).status;
        if status == VertexStatus::Finalized {
            let b = Rc::new(
                Bottom::new(
                    ErrorCode::Eval,
                    "cannot add constraints to fully evaluated value",
                )
                .at(arc),
            );
            self.node_add_err(arc, b);
            return;
        }
        self.vertex_mut(arc).add_conjunct(c.clone());
        let initialized = self
            .state_of(arc)
            .map(|n| n.borrow().is_initialized)
            .unwrap_or(false);
        if initialized {
            if status == VertexStatus::Conjuncts {
                // The permitted one-step regression for re-entrant
                // evaluation.
                self.vertex_mut(arc).update_status(VertexStatus::Partial);
            }
            // The conjunct joins the arc's own closedness tree.
            let mut c = c;
            c.ci.cc = None;
            self.schedule_conjunct(arc, c);
        }
    }

    /// Folds an already evaluated value into the node.
    pub(crate) fn insert_value_conjunct(
        &mut self,
        v: VertexId,
        env: &Env,
        val: &Value,
        ci: &CloseInfo,
    ) {
        let pos = self.positions.last().copied().unwrap_or(Pos::NONE);
        match val {
            Value::Top => {
                if let Some(state) = self.state_of(v) {
                    state.borrow_mut().has_top = true;
                }
            }
            Value::BasicType(k) => self.node_update_kind(v, *k, pos),
            Value::Bound(..) | Value::Validator(_) => {
                self.node_add_check(v, val.clone(), pos)
            }
            Value::Conjunction(vals) => {
                for x in vals.iter() {
                    self.insert_value_conjunct(v, env, x, ci);
                }
            }
            Value::Disjunction(d) => {
                self.schedule_value_disjunction(v, env, d, ci, pos);
            }
            Value::StructMarker => {
                if let Some(state) = self.state_of(v) {
                    state.borrow_mut().has_struct_conjunct = true;
                }
                self.node_update_kind(v, Kind::STRUCT, pos);
            }
            Value::ListMarker { .. } => self.node_update_kind(v, Kind::LIST, pos),
            Value::Bottom(b) => self.node_add_err(v, b.clone()),
            Value::Vertex(w) => self.unify_vertex_value(v, env, *w, ci),
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Str(_)
            | Value::Bytes(_) => self.node_set_scalar(v, val.clone(), pos),
        }
    }

    /// Unifies the content of an evaluated vertex into the node: its value,
    /// arcs, closedness, and pattern constraints.
    fn unify_vertex_value(&mut self, v: VertexId, env: &Env, w: VertexId, ci: &CloseInfo) {
        if v == w {
            return;
        }
        let pos = self.positions.last().copied().unwrap_or(Pos::NONE);
        let base = self.vertex(w).base_value.clone();
        match base {
            Some(Value::StructMarker) => {
                if let Some(state) = self.state_of(v) {
                    state.borrow_mut().has_struct_conjunct = true;
                }
                self.node_update_kind(v, Kind::STRUCT, pos);
                if self.vertex(w).closed_recursive && !ci.from_embed {
                    self.vertex_mut(v).closed_recursive = true;
                }
                if self.vertex(w).has_ellipsis {
                    self.vertex_mut(v).has_ellipsis = true;
                }
                let infos = self.vertex(w).structs.clone();
                self.vertex_mut(v).structs.extend(infos);
                for pc in self.vertex(w).pattern_constraints.clone() {
                    self.add_pattern_constraint(v, pc);
                }
                self.copy_arcs(v, env, w, ci);
            }
            Some(Value::ListMarker { open }) => {
                let len = self
                    .vertex(w)
                    .arcs
                    .iter()
                    .filter(|&&a| self.vertex(a).label.is_int())
                    .count();
                self.node_add_list(v, len, open, pos);
                self.copy_arcs(v, env, w, ci);
            }
            Some(Value::Disjunction(d)) => {
                self.schedule_value_disjunction(v, env, &d, ci, pos);
            }
            Some(other) => self.insert_value_conjunct(v, env, &other, ci),
            None => {
                // Not yet evaluated: fall back to its conjuncts.
                for c in self.vertex(w).conjuncts.clone() {
                    let mut mci = c.ci.clone();
                    mci.cc = ci.cc;
                    self.schedule_conjunct(v, Conjunct::new(c.env, c.x, mci));
                }
            }
        }
    }

    fn copy_arcs(&mut self, v: VertexId, env: &Env, w: VertexId, ci: &CloseInfo) {
        for arc in self.vertex(w).arcs.clone() {
            let (label, at) = {
                let a = self.vertex(arc);
                (a.label, a.arc_type)
            };
            if at == ArcType::NotPresent {
                continue;
            }
            let Some(dst) = self.get_arc_checked(v, label, at, Pos::NONE) else {
                continue;
            };
            let mut cin = ci.clone();
            if at == ArcType::Optional {
                cin.spans |= SPAN_CONSTRAINT;
                if cin.cycle.cycle_type == CyclicType::NoCycle {
                    cin.cycle.cycle_type = CyclicType::IsOptional;
                }
            }
            self.add_conjunct_to_arc(
                dst,
                Conjunct::new(env.clone(), Elem::Value(Value::Vertex(arc)), cin),
            );
        }
    }

    /// Expands a reference that resolved to `arc` into this node: either
    /// the finalized value, or a copy of the target's conjuncts carrying
    /// merged cycle-tracking state.
    pub(crate) fn schedule_vertex_conjuncts(
        &mut self,
        v: VertexId,
        env: &Env,
        x: &RefId,
        arc: VertexId,
        ci: &CloseInfo,
    ) {
        let ci2 = match self.detect_cycle(v, env, x, arc, ci) {
            crate::cycle::CycleCheck::Skip => return,
            crate::cycle::CycleCheck::Continue(ci)
            | crate::cycle::CycleCheck::ContinueCyclic(ci) => ci,
        };

        if self.vertex(arc).status == VertexStatus::Finalized {
            self.insert_value_conjunct(v, env, &Value::Vertex(arc), &ci2);
            return;
        }

        let mut ci2 = ci2;
        if self.vertex(arc).label.is_def() {
            ci2.from_def = true;
        }
        if ci2.from_def || self.vertex(arc).closed_recursive {
            self.vertex_mut(v).closed_recursive = true;
        }

        for c in self.vertex(arc).conjuncts.clone() {
            let mut mci = c.ci.clone();
            mci.cc = ci2.cc;
            mci.from_def |= ci2.from_def;
            mci.spans |= ci2.spans;
            mci.cycle.inline |= ci2.cycle.inline;
            mci.cycle.is_cyclic |= ci2.cycle.is_cyclic;
            if ci2.cycle.cycle_type > mci.cycle.cycle_type {
                mci.cycle.cycle_type = ci2.cycle.cycle_type;
            }
            // Tracked references of the parent conjunct extend the child's.
            for r in ci2.cycle.refs.iter() {
                mci.cycle.refs = mci.cycle.refs.push_front(r.clone());
            }
            self.schedule_conjunct(v, Conjunct::new(c.env, c.x, mci));
        }
    }

    // ---- pattern constraints ----

    /// Registers a pattern constraint and applies it to existing arcs.
    pub(crate) fn add_pattern_constraint(&mut self, v: VertexId, pc: PatternConstraint) {
        for arc in self.vertex(v).arcs.clone() {
            self.apply_pattern_to_arc(&pc, arc);
        }
        self.vertex_mut(v).pattern_constraints.push(pc);
    }

    fn apply_pattern_to_arc(&mut self, pc: &PatternConstraint, arc: VertexId) {
        let label = self.vertex(arc).label;
        if !label.is_regular() {
            return;
        }
        let lv = self.label_value(label);
        if !self.pattern_matches(&pc.pattern, &lv) {
            return;
        }
        for c in &pc.conjuncts {
            let env = Environment::with_dynamic(&c.env, label);
            self.add_conjunct_to_arc(arc, Conjunct::new(env, c.x.clone(), c.ci.clone()));
        }
    }

    pub(crate) fn label_value(&self, f: Feature) -> Value {
        match f.class() {
            LabelClass::Int => Value::Int(f.index() as i64),
            _ => Value::Str(self.runtime.label_name(f.index())),
        }
    }

    /// Whether a label value matches a pattern constraint filter.
    pub(crate) fn pattern_matches(&mut self, pattern: &Value, label: &Value) -> bool {
        match pattern {
            Value::Top => true,
            Value::BasicType(k) => label.kind().is_anyof(*k),
            Value::Bound(op, b) => {
                matches!(bounds::satisfies(&mut self.regex_cache, label, *op, b), Ok(true))
            }
            Value::Conjunction(vals) => {
                vals.iter().all(|p| {
                    // Iteration requires a reborrow per element.
                    let p = p.clone();
                    self.pattern_matches(&p, label)
                })
            }
            Value::Disjunction(d) => {
                let values = d.values.clone();
                values.iter().any(|p| self.pattern_matches(p, label))
            }
            concrete => concrete == label,
        }
    }

    // ---- runners ----
}

/// Evaluates a dynamic field's label and inserts the field.
pub(crate) fn run_dynamic_task(ctx: &mut OpContext, tid: TaskId, mode: RunMode) {
    let (env, key, ci, owner, value, at) = {
        let t = ctx.task(tid);
        let Elem::Expr(key) = t.x.clone() else { return };
        (
            t.env.clone(),
            key,
            t.ci.clone(),
            t.node,
            t.aux.clone().expect("dynamic field without value"),
            t.arc_flag,
        )
    };
    let Some(kv) = ctx.eval_cached(&env, &key, mode) else {
        return;
    };
    let kv = kv.default().clone();
    let label = match kv {
        Value::Str(s) => ctx.runtime.field(&s),
        Value::Int(i) if i >= 0 => ctx.runtime.elem(i as usize),
        Value::Bottom(b) => {
            ctx.add_bottom(b);
            return;
        }
        other => {
            ctx.add_err(
                ErrorCode::Eval,
                format!("invalid dynamic field label {}", ctx.value_str(&other)),
            );
            return;
        }
    };
    let Some(arc) = ctx.get_arc_checked(owner, label, at, key.src) else {
        return;
    };
    let mut cin = ci;
    if at == ArcType::Optional {
        cin.spans |= SPAN_CONSTRAINT;
        if cin.cycle.cycle_type == CyclicType::NoCycle {
            cin.cycle.cycle_type = CyclicType::IsOptional;
        }
    }
    ctx.add_conjunct_to_arc(arc, Conjunct::new(env, value, cin));
}

/// Evaluates a pattern constraint's filter and registers the constraint.
pub(crate) fn run_pattern_task(ctx: &mut OpContext, tid: TaskId, mode: RunMode) {
    let (env, filter, ci, owner, value) = {
        let t = ctx.task(tid);
        let Elem::Expr(filter) = t.x.clone() else { return };
        (
            t.env.clone(),
            filter,
            t.ci.clone(),
            t.node,
            t.aux.clone().expect("pattern constraint without value"),
        )
    };
    let Some(pattern) = ctx.eval_cached(&env, &filter, mode) else {
        return;
    };
    if let Value::Bottom(b) = pattern {
        ctx.add_bottom(b);
        return;
    }
    let mut cin = ci.spawn_span(SPAN_CONSTRAINT);
    if cin.cycle.cycle_type == CyclicType::NoCycle {
        cin.cycle.cycle_type = CyclicType::IsOptional;
    }
    ctx.add_pattern_constraint(
        owner,
        PatternConstraint {
            pattern,
            conjuncts: vec![Conjunct::new(env, value, cin)],
        },
    );
}

/// Unifies a list literal into the node: integer-labelled arcs plus a
/// length/openness requirement.
pub(crate) fn run_list_task(ctx: &mut OpContext, tid: TaskId, mode: RunMode) {
    let (env, e, ci, owner) = {
        let t = ctx.task(tid);
        let Elem::Expr(e) = t.x.clone() else { return };
        (t.env.clone(), e, t.ci.clone(), t.node)
    };
    let ExprKind::List(lit) = &e.kind else { return };

    let mut idx = 0usize;
    let mut open = false;
    for elem in &lit.elems {
        match elem {
            ListElem::Value(x) => {
                let label = ctx.runtime.elem(idx);
                let Some(arc) = ctx.get_arc_checked(owner, label, ArcType::Member, e.src) else {
                    continue;
                };
                ctx.add_conjunct_to_arc(arc, Conjunct::new(env.clone(), x.clone(), ci.clone()));
                idx += 1;
            }
            ListElem::Ellipsis(constraint) => {
                open = true;
                if let Some(x) = constraint {
                    let mut cin = ci.spawn_span(SPAN_CONSTRAINT);
                    cin.cycle.cycle_type = CyclicType::IsOptional;
                    ctx.add_pattern_constraint(
                        owner,
                        PatternConstraint {
                            pattern: Value::Bound(
                                crate::op::RelOp::GreaterEqual,
                                Rc::new(Value::Int(idx as i64)),
                            ),
                            conjuncts: vec![Conjunct::new(env.clone(), x.clone(), cin)],
                        },
                    );
                }
            }
            ListElem::Comprehension(comp) => {
                let Some(envs) = crate::comprehension::expand_comprehension(ctx, &env, comp, mode)
                else {
                    return;
                };
                for e2 in envs {
                    let label = ctx.runtime.elem(idx);
                    let Some(arc) =
                        ctx.get_arc_checked(owner, label, ArcType::Member, comp.src)
                    else {
                        continue;
                    };
                    let x = Expr::at(ExprKind::Struct(comp.value.clone()), comp.src);
                    ctx.add_conjunct_to_arc(
                        arc,
                        Conjunct::new(e2, x, ci.spawn_span(SPAN_COMPREHENSION)),
                    );
                    idx += 1;
                }
            }
        }
    }
    ctx.node_add_list(owner, idx, open, e.src);
}
