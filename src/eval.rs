//! Expression evaluation: reference resolution, operators, interpolation,
//! and builtin application. Evaluation never performs I/O; resolving a
//! reference into an insufficiently evaluated vertex suspends the current
//! task instead of recursing unboundedly.

use std::rc::Rc;

use crate::bounds;
use crate::conjunct::{CloseInfo, Conjunct, Elem};
use crate::context::OpContext;
use crate::environment::Env;
use crate::error::{Bottom, ErrorCode, Pos};
use crate::expr::{Disjunct, DisjunctionExpr, Expr, ExprKind, RefId};
use crate::feature::{Feature, FeatureExt};
use crate::kind::Kind;
use crate::op::Op;
use crate::sched::{self, RunMode, TaskId};
use crate::value::{Validator, Value};
use crate::vertex::{ArcType, VertexId, VertexStatus};

/// The outcome of resolving a reference expression.
pub(crate) enum Resolution {
    /// Resolved to a vertex in the tree.
    Vertex(VertexId),

    /// Resolved to a plain value (label references, let values).
    Val(Value),

    /// Not resolvable now: the task suspended or an error was recorded.
    Pending,
}

/// Runs one conjunct-evaluation task: the generic task for everything that
/// is not a struct literal, list, or disjunction.
pub(crate) fn run_conjunct_task(ctx: &mut OpContext, tid: TaskId, mode: RunMode) {
    let (env, x, ci, owner) = {
        let t = ctx.task(tid);
        (t.env.clone(), t.x.clone(), t.ci.clone(), t.node)
    };
    let e = match x {
        Elem::Expr(e) => e,
        Elem::Value(v) => {
            ctx.insert_value_conjunct(owner, &env, &v, &ci);
            return;
        }
    };

    match &e.kind {
        // Unification distributes over its operands: both sides become
        // conjuncts of this node.
        ExprKind::Binary { op: Op::And, x, y } => {
            ctx.schedule_conjunct(owner, Conjunct::new(env.clone(), x.clone(), ci.clone()));
            ctx.schedule_conjunct(owner, Conjunct::new(env, y.clone(), ci));
        }

        ExprKind::Binary { op: Op::Or, x, y } => {
            let d = Rc::new(DisjunctionExpr {
                values: vec![
                    Disjunct {
                        val: x.clone(),
                        default: false,
                    },
                    Disjunct {
                        val: y.clone(),
                        default: false,
                    },
                ],
                has_defaults: false,
            });
            ctx.schedule_disjunction_expr(owner, &env, d, &ci, e.src);
        }

        _ if e.is_resolver() || matches!(e.kind, ExprKind::Selector { .. } | ExprKind::Index { .. }) =>
        {
            match ctx.resolve(&env, &e, &ci, mode) {
                Resolution::Vertex(arc) => {
                    ctx.schedule_vertex_conjuncts(owner, &env, &RefId(e.clone()), arc, &ci);
                }
                Resolution::Val(v) => ctx.insert_value_conjunct(owner, &env, &v, &ci),
                Resolution::Pending => {}
            }
        }

        _ => {
            let Some(v) = ctx.eval_expr(&env, &e, mode) else { return };
            ctx.insert_value_conjunct(owner, &env, &v, &ci);
        }
    }
}

impl OpContext {
    /// Resolves a reference expression to a vertex or value.
    pub(crate) fn resolve(
        &mut self,
        env: &Env,
        e: &Rc<Expr>,
        ci: &CloseInfo,
        mode: RunMode,
    ) -> Resolution {
        match &e.kind {
            ExprKind::FieldRef { up, label } => {
                let Some(scope) = env.up(*up) else {
                    self.add_err(ErrorCode::Eval, "reference out of scope");
                    return Resolution::Pending;
                };
                self.lookup(scope.vertex, *label, e.src, mode)
            }

            ExprKind::LabelRef { up } => match env.dynamic_label_at(*up) {
                Some(f) => Resolution::Val(self.label_value(f)),
                None => {
                    self.add_err(ErrorCode::Eval, "no label in scope");
                    Resolution::Pending
                }
            },

            ExprKind::LetRef { up, x, .. } => {
                let Some(scope) = env.up(*up) else {
                    self.add_err(ErrorCode::Eval, "reference out of scope");
                    return Resolution::Pending;
                };
                match self.eval_cached(&scope, x, mode) {
                    Some(v) => Resolution::Val(v),
                    None => Resolution::Pending,
                }
            }

            ExprKind::Selector { x, sel } => {
                let Some(w) = self.resolve_to_vertex(env, x, ci, mode) else {
                    return Resolution::Pending;
                };
                self.lookup(w, *sel, e.src, mode)
            }

            ExprKind::Index { x, index } => {
                let Some(w) = self.resolve_to_vertex(env, x, ci, mode) else {
                    return Resolution::Pending;
                };
                let Some(iv) = self.eval_concrete(env, index, mode) else {
                    return Resolution::Pending;
                };
                let label = match iv.default() {
                    Value::Int(i) if *i >= 0 => self.runtime.elem(*i as usize),
                    Value::Str(s) => self.runtime.field(s),
                    Value::Bottom(b) => {
                        let b = b.clone();
                        self.add_bottom(b);
                        return Resolution::Pending;
                    }
                    other => {
                        let msg = format!("invalid index {}", self.value_str(other));
                        self.add_err(ErrorCode::Eval, msg);
                        return Resolution::Pending;
                    }
                };
                self.lookup(w, label, e.src, mode)
            }

            _ => {
                let msg = format!("not a reference: {:?}", e.kind);
                self.add_err(ErrorCode::Eval, msg);
                Resolution::Pending
            }
        }
    }

    /// Resolves the operand of a selector or index to a vertex, creating an
    /// inline vertex for computed operands.
    fn resolve_to_vertex(
        &mut self,
        env: &Env,
        x: &Rc<Expr>,
        ci: &CloseInfo,
        mode: RunMode,
    ) -> Option<VertexId> {
        match &x.kind {
            ExprKind::FieldRef { .. }
            | ExprKind::Selector { .. }
            | ExprKind::Index { .. }
            | ExprKind::LetRef { .. } => match self.resolve(env, x, ci, mode) {
                Resolution::Vertex(arc) => Some(arc),
                Resolution::Val(Value::Vertex(w)) => Some(w),
                Resolution::Val(v) => {
                    let msg = format!("cannot select into {}", self.value_str(&v));
                    self.add_err(ErrorCode::Eval, msg);
                    None
                }
                Resolution::Pending => None,
            },
            _ => {
                // A computed operand: evaluate in a detached vertex. Cycles
                // through it have no stable field-path identity, so they are
                // flagged as inline.
                let v = self.eval_inline(env, x, ci, mode)?;
                match v {
                    Value::Vertex(w) => Some(w),
                    Value::Bottom(b) => {
                        self.add_bottom(b);
                        None
                    }
                    other => {
                        let msg = format!("cannot select into {}", self.value_str(&other));
                        self.add_err(ErrorCode::Eval, msg);
                        None
                    }
                }
            }
        }
    }

    /// Evaluates an expression in a fresh inline (dynamic) vertex.
    pub(crate) fn eval_inline(
        &mut self,
        env: &Env,
        x: &Rc<Expr>,
        ci: &CloseInfo,
        mode: RunMode,
    ) -> Option<Value> {
        let parent = self.vertex_stack.last().copied();
        let iv = self.new_inline_vertex(parent);
        let mut cii = ci.clone();
        cii.cc = None;
        cii.cycle.inline = true;
        self.vertex_mut(iv).add_conjunct(Conjunct::new(env.clone(), x.clone(), cii));
        let needs = sched::ALL_KNOWN.without(sched::SUB_FIELDS_PROCESSED);
        // Inline values have no later chance to complete: force them now,
        // whatever the caller's mode.
        let _ = mode;
        self.unify(iv, needs, RunMode::Finalize);
        Some(Value::Vertex(iv))
    }

    /// Looks up a field in a vertex, driving the vertex far enough to know
    /// whether the field exists. Missing fields are incomplete errors
    /// unless the struct is closed, in which case they are permanent.
    pub(crate) fn lookup(
        &mut self,
        scope: VertexId,
        label: Feature,
        pos: Pos,
        mode: RunMode,
    ) -> Resolution {
        let scope = self.deref_vertex(scope);
        for attempt in 0..2 {
            if let Some(arc) = self.lookup_arc(scope, label) {
                match self.vertex(arc).arc_type {
                    ArcType::Member => return Resolution::Vertex(arc),
                    ArcType::Pending => {
                        if attempt == 0 {
                            self.unify(arc, sched::ARC_TYPE_KNOWN, mode);
                            if self.suspended {
                                return Resolution::Pending;
                            }
                            continue;
                        }
                        let msg = format!("unresolved field {}", self.label_str(label));
                        self.add_err(ErrorCode::Incomplete, msg);
                        return Resolution::Pending;
                    }
                    ArcType::Optional | ArcType::Required => {
                        let suffix = self.vertex(arc).arc_type.suffix();
                        let msg = format!(
                            "cannot reference constraint field {}{}",
                            self.label_str(label),
                            suffix
                        );
                        self.add_err(ErrorCode::Incomplete, msg);
                        return Resolution::Pending;
                    }
                    ArcType::NotPresent => break,
                }
            }

            if self.vertex(scope).status == VertexStatus::Finalized
                || self.sched_meets(scope, sched::FIELD_SET_KNOWN)
            {
                break;
            }

            match mode {
                RunMode::Ignore | RunMode::AttemptOnly => {
                    let msg = format!("undefined field: {}", self.label_str(label));
                    let mut b = Bottom::new(ErrorCode::Incomplete, msg).with_pos(pos);
                    b.not_exists = true;
                    self.add_bottom(Rc::new(b));
                    return Resolution::Pending;
                }
                RunMode::Yield | RunMode::Finalize => {
                    if attempt == 0 {
                        self.unify(scope, sched::NEED_FIELD_SET_KNOWN, mode);
                        if self.suspended {
                            return Resolution::Pending;
                        }
                        continue;
                    }
                    break;
                }
            }
        }

        // The field does not exist. Closedness determines the severity.
        let closed = self.vertex(scope).is_closed_struct();
        let accepted = self.accepts_label(scope, label);
        let code = if closed && !accepted {
            ErrorCode::Eval
        } else {
            ErrorCode::Incomplete
        };
        let msg = format!("undefined field: {}", self.label_str(label));
        let mut b = Bottom::new(code, msg).with_pos(pos).at(scope);
        b.not_exists = true;
        self.add_bottom(Rc::new(b));
        Resolution::Pending
    }

    pub(crate) fn label_str(&self, f: Feature) -> Rc<str> {
        self.runtime.label_str(f)
    }

    /// The value of a vertex for use inside an expression. Drives the
    /// vertex to scalar-known first.
    pub(crate) fn vertex_value(&mut self, arc: VertexId, mode: RunMode) -> Option<Value> {
        if self.vertex(arc).status != VertexStatus::Finalized {
            if self.has_depth_cycle(arc) || self.vertex(arc).status == VertexStatus::Evaluating {
                self.add_err(ErrorCode::Cycle, "cycle in reference");
                return None;
            }
            self.unify(arc, sched::SCALAR_KNOWN, mode);
            if self.suspended {
                return None;
            }
        }
        let state_scalar = self
            .state_of(arc)
            .and_then(|n| n.borrow().scalar.clone());
        let base = self.vertex(arc).base_value.clone().or(state_scalar);
        match base {
            Some(Value::Bottom(b)) => Some(Value::Bottom(b)),
            Some(Value::Disjunction(d)) => match d.default() {
                Some(v) => Some(v.clone()),
                None => {
                    self.add_err(
                        ErrorCode::Incomplete,
                        "unresolved disjunction (no default)",
                    );
                    None
                }
            },
            Some(Value::StructMarker) | Some(Value::ListMarker { .. }) => {
                Some(Value::Vertex(arc))
            }
            Some(v) if v.is_concrete() => Some(v),
            Some(v) => {
                let msg = format!("non-concrete value {}", self.value_str(&v));
                self.add_err(ErrorCode::Incomplete, msg);
                None
            }
            None => {
                self.add_err(ErrorCode::Incomplete, "incomplete value");
                None
            }
        }
    }

    /// Evaluates an expression through the per-environment cache. Dynamic
    /// labels and pattern filters must evaluate consistently across
    /// repeated instantiations.
    pub(crate) fn eval_cached(&mut self, env: &Env, x: &Rc<Expr>, mode: RunMode) -> Option<Value> {
        if let Some(v) = env.cached(x) {
            return Some(v);
        }
        let v = self.eval_expr(env, x, mode)?;
        let incomplete = matches!(&v, Value::Bottom(b) if b.is_incomplete());
        if !incomplete {
            env.insert_cache(x, v.clone());
        }
        Some(v)
    }

    /// Evaluates an expression to a value. Returns None when the current
    /// task suspended or an error was recorded on the session.
    pub(crate) fn eval_expr(&mut self, env: &Env, e: &Rc<Expr>, mode: RunMode) -> Option<Value> {
        match &e.kind {
            ExprKind::Null => Some(Value::Null),
            ExprKind::Bool(b) => Some(Value::Bool(*b)),
            ExprKind::Int(i) => Some(Value::Int(*i)),
            ExprKind::Float(f) => Some(Value::Float(*f)),
            ExprKind::Str(s) => Some(Value::Str(s.clone())),
            ExprKind::Bytes(b) => Some(Value::Bytes(b.clone())),

            ExprKind::Top => Some(Value::Top),
            ExprKind::BasicType(k) => Some(Value::BasicType(*k)),

            ExprKind::Bound(op, inner) => {
                let v = self.eval_concrete(env, inner, mode)?;
                match v.default() {
                    Value::Bottom(b) => Some(Value::Bottom(b.clone())),
                    x if x.kind().is_anyof(Kind::SCALAR) && x.is_concrete() => {
                        Some(Value::Bound(*op, Rc::new(x.clone())))
                    }
                    other => {
                        let msg =
                            format!("invalid operand {} for bound {}", self.value_str(other), op);
                        Some(self.bottom_value(ErrorCode::Eval, msg, e.src))
                    }
                }
            }

            ExprKind::FieldRef { .. }
            | ExprKind::LabelRef { .. }
            | ExprKind::LetRef { .. }
            | ExprKind::Selector { .. }
            | ExprKind::Index { .. } => {
                let ci = CloseInfo::default();
                match self.resolve(env, e, &ci, mode) {
                    Resolution::Vertex(arc) => self.vertex_value(arc, mode),
                    Resolution::Val(v) => Some(v),
                    Resolution::Pending => None,
                }
            }

            ExprKind::Struct(_) | ExprKind::List(_) => {
                self.eval_inline(env, e, &CloseInfo::default(), mode)
            }

            ExprKind::Disjunction(_) => {
                let v = self.eval_inline(env, e, &CloseInfo::default(), mode)?;
                match v {
                    Value::Vertex(iv) => self.vertex_value(iv, mode),
                    other => Some(other),
                }
            }

            ExprKind::Interpolation { kind, parts } => {
                let mut out = String::new();
                for p in parts {
                    let v = self.eval_concrete(env, p, mode)?;
                    match v.default() {
                        Value::Str(s) => out.push_str(s),
                        Value::Bytes(s) => out.push_str(s),
                        Value::Int(i) => out.push_str(&i.to_string()),
                        Value::Float(f) => out.push_str(&f.to_string()),
                        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                        Value::Bottom(b) => return Some(Value::Bottom(b.clone())),
                        other => {
                            let msg = format!(
                                "invalid interpolation value {}",
                                self.value_str(other)
                            );
                            return Some(self.bottom_value(ErrorCode::Eval, msg, e.src));
                        }
                    }
                }
                Some(if *kind == Kind::BYTES {
                    Value::Bytes(out.into())
                } else {
                    Value::Str(out.into())
                })
            }

            ExprKind::Unary { op, x } => {
                let v = self.eval_concrete(env, x, mode)?;
                Some(self.unary_op(*op, v.default().clone(), e.src))
            }

            ExprKind::Binary { op, x, y } => match op {
                Op::And | Op::Or => {
                    let v = self.eval_inline(env, e, &CloseInfo::default(), mode)?;
                    match v {
                        Value::Vertex(iv) => {
                            let composite = matches!(
                                &self.vertex(iv).base_value,
                                Some(Value::StructMarker) | Some(Value::ListMarker { .. })
                            );
                            if composite {
                                Some(Value::Vertex(iv))
                            } else {
                                self.vertex_value(iv, mode)
                            }
                        }
                        other => Some(other),
                    }
                }
                _ => {
                    let a = self.eval_concrete(env, x, mode)?;
                    let b = self.eval_concrete(env, y, mode)?;
                    Some(self.binary_op(*op, a.default().clone(), b.default().clone(), e.src))
                }
            },

            ExprKind::Call { fun, args } => {
                let f = self.eval_expr(env, fun, mode)?;
                let builtin = match f {
                    Value::Validator(val) if val.args.is_empty() => val.builtin,
                    Value::Bottom(b) => return Some(Value::Bottom(b)),
                    other => {
                        let msg = format!("cannot call {}", self.value_str(&other));
                        return Some(self.bottom_value(ErrorCode::Eval, msg, e.src));
                    }
                };
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    let v = self.eval_concrete(env, a, mode)?;
                    if let Value::Bottom(b) = &v {
                        if b.is_incomplete() {
                            return Some(v);
                        }
                    }
                    vals.push(v.default().clone());
                }
                if vals.len() == builtin.arity {
                    Some((builtin.func)(&vals))
                } else if vals.len() + 1 == builtin.arity && builtin.is_validator() {
                    Some(Value::Validator(Validator {
                        builtin,
                        args: vals,
                    }))
                } else {
                    let msg = format!(
                        "wrong number of arguments for {}: got {}, want {}",
                        builtin.name,
                        vals.len(),
                        builtin.arity
                    );
                    Some(self.bottom_value(ErrorCode::Eval, msg, e.src))
                }
            }

            ExprKind::Builtin(b) => {
                if b.is_validator() {
                    Some(Value::Validator(Validator {
                        builtin: b.clone(),
                        args: Vec::new(),
                    }))
                } else {
                    let msg = format!("builtin {} is not a value", b.name);
                    Some(self.bottom_value(ErrorCode::Eval, msg, e.src))
                }
            }

            ExprKind::Comprehension(_) => {
                Some(self.bottom_value(
                    ErrorCode::Eval,
                    "comprehension not allowed in this position",
                    e.src,
                ))
            }

            ExprKind::Bottom => Some(Value::Bottom(Rc::new(
                Bottom::new(ErrorCode::User, "explicit error (_|_ literal) in source")
                    .with_pos(e.src),
            ))),
        }
    }

    /// Evaluates to a concrete scalar where possible, reading through
    /// vertex references and defaults.
    pub(crate) fn eval_concrete(&mut self, env: &Env, e: &Rc<Expr>, mode: RunMode) -> Option<Value> {
        let v = self.eval_expr(env, e, mode)?;
        match v {
            Value::Vertex(w) => self.vertex_value(w, mode),
            other => Some(other),
        }
    }

    fn bottom_value(&mut self, code: ErrorCode, msg: impl Into<Rc<str>>, pos: Pos) -> Value {
        Value::Bottom(Rc::new(Bottom::new(code, msg).with_pos(pos)))
    }

    fn unary_op(&mut self, op: Op, v: Value, pos: Pos) -> Value {
        if let Value::Bottom(_) = v {
            return v;
        }
        match (op, &v) {
            (Op::Not, Value::Bool(b)) => Value::Bool(!b),
            (Op::Subtract, Value::Int(i)) => Value::Int(-i),
            (Op::Subtract, Value::Float(f)) => Value::Float(-f),
            (Op::Add, Value::Int(_)) | (Op::Add, Value::Float(_)) => v,
            _ => {
                let msg = format!("invalid operation {}{}", op, self.value_str(&v));
                self.bottom_value(ErrorCode::Eval, msg, pos)
            }
        }
    }

    fn binary_op(&mut self, op: Op, a: Value, b: Value, pos: Pos) -> Value {
        if let Value::Bottom(_) = a {
            return a;
        }
        if let Value::Bottom(_) = b {
            return b;
        }

        match op {
            Op::BoolAnd | Op::BoolOr => match (&a, &b) {
                (Value::Bool(x), Value::Bool(y)) => {
                    Value::Bool(if op == Op::BoolAnd { *x && *y } else { *x || *y })
                }
                _ => {
                    let msg = format!(
                        "invalid operands {} and {} to {}",
                        self.value_str(&a),
                        self.value_str(&b),
                        op
                    );
                    self.bottom_value(ErrorCode::Eval, msg, pos)
                }
            },

            Op::Equal | Op::NotEqual => {
                let eq = match (&a, &b) {
                    (Value::Null, Value::Null) => true,
                    (Value::Null, _) | (_, Value::Null) => false,
                    (Value::Bool(x), Value::Bool(y)) => x == y,
                    _ => match bounds::scalar_cmp(&a, &b) {
                        Some(ord) => ord == std::cmp::Ordering::Equal,
                        None => {
                            let msg = format!(
                                "invalid operands {} and {} to {}",
                                self.value_str(&a),
                                self.value_str(&b),
                                op
                            );
                            return self.bottom_value(ErrorCode::Eval, msg, pos);
                        }
                    },
                };
                Value::Bool(if op == Op::Equal { eq } else { !eq })
            }

            Op::LessThan | Op::LessEqual | Op::GreaterThan | Op::GreaterEqual => {
                let rel = op.rel_op().expect("ordered comparison");
                match bounds::satisfies(&mut self.regex_cache, &a, rel, &b) {
                    Ok(res) => Value::Bool(res),
                    Err(e) => Value::Bottom(e),
                }
            }

            Op::Match | Op::NotMatch => {
                let rel = op.rel_op().expect("match comparison");
                match bounds::satisfies(&mut self.regex_cache, &a, rel, &b) {
                    Ok(res) => Value::Bool(res),
                    Err(e) => Value::Bottom(e),
                }
            }

            Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::IntDivide | Op::IntModulo => {
                self.arith(op, a, b, pos)
            }

            Op::And | Op::Or | Op::Not => {
                let msg = format!("operator {} is not a binary scalar operation", op);
                self.bottom_value(ErrorCode::Eval, msg, pos)
            }
        }
    }

    fn arith(&mut self, op: Op, a: Value, b: Value, pos: Pos) -> Value {
        use Value::{Float, Int, Str};

        if op == Op::Add {
            if let (Str(x), Str(y)) = (&a, &b) {
                return Value::Str(format!("{}{}", x, y).into());
            }
            if let (Value::Bytes(x), Value::Bytes(y)) = (&a, &b) {
                return Value::Bytes(format!("{}{}", x, y).into());
            }
        }

        let fail = |ctx: &mut Self| {
            let msg = format!(
                "invalid operands {} and {} to {}",
                ctx.value_str(&a),
                ctx.value_str(&b),
                op
            );
            ctx.bottom_value(ErrorCode::Eval, msg, pos)
        };

        match (&a, &b) {
            (Int(x), Int(y)) => match op {
                Op::Add => Int(x + y),
                Op::Subtract => Int(x - y),
                Op::Multiply => Int(x * y),
                Op::Divide => {
                    if *y == 0 {
                        self.bottom_value(ErrorCode::Eval, "division by zero", pos)
                    } else {
                        Float(*x as f64 / *y as f64)
                    }
                }
                Op::IntDivide => {
                    if *y == 0 {
                        self.bottom_value(ErrorCode::Eval, "division by zero", pos)
                    } else {
                        Int(x.div_euclid(*y))
                    }
                }
                Op::IntModulo => {
                    if *y == 0 {
                        self.bottom_value(ErrorCode::Eval, "division by zero", pos)
                    } else {
                        Int(x.rem_euclid(*y))
                    }
                }
                _ => fail(self),
            },
            (Int(_), Float(_)) | (Float(_), Int(_)) | (Float(_), Float(_)) => {
                let x = match &a {
                    Int(i) => *i as f64,
                    Float(f) => *f,
                    _ => return fail(self),
                };
                let y = match &b {
                    Int(i) => *i as f64,
                    Float(f) => *f,
                    _ => return fail(self),
                };
                match op {
                    Op::Add => Float(x + y),
                    Op::Subtract => Float(x - y),
                    Op::Multiply => Float(x * y),
                    Op::Divide => {
                        if y == 0.0 {
                            self.bottom_value(ErrorCode::Eval, "division by zero", pos)
                        } else {
                            Float(x / y)
                        }
                    }
                    _ => fail(self),
                }
            }
            _ => fail(self),
        }
    }
}
