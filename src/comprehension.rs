//! Comprehensions: for/if/let clause chains yielding struct declarations.
//! A comprehension task suspends while its sources are insufficiently
//! evaluated and commits all of its yields at once when the clause chain
//! can be fully expanded, so re-runs never duplicate arcs.

use std::rc::Rc;

use crate::closectx::DepKind;
use crate::conjunct::{Conjunct, Elem};
use crate::context::OpContext;
use crate::environment::Env;
use crate::error::ErrorCode;
use crate::expr::{Clause, Comprehension, Expr, ExprKind};
use crate::sched::{self, RunMode, TaskId};
use crate::value::Value;
use crate::vertex::{ArcType, VertexId, VertexStatus};

pub(crate) fn run_comprehension_task(ctx: &mut OpContext, tid: TaskId, mode: RunMode) {
    let (env, e, ci, owner) = {
        let t = ctx.task(tid);
        let Elem::Expr(e) = t.x.clone() else { return };
        (t.env.clone(), e, t.ci.clone(), t.node)
    };
    let ExprKind::Comprehension(comp) = &e.kind else { return };
    let comp = comp.clone();

    let envs = expand_comprehension(ctx, &env, &comp, mode);
    if ctx.suspended {
        return;
    }

    if let Some(envs) = envs {
        for env2 in envs {
            let x = Expr::at(ExprKind::Struct(comp.value.clone()), comp.src);
            ctx.schedule_conjunct(owner, Conjunct::new(env2, x, ci.clone()));
        }
    }

    // Release the provisionally registered arcs; any that received no
    // conjuncts resolve to not-present when the field set completes.
    let pending = std::mem::take(&mut ctx.task_mut(tid).pending_arcs);
    for a in pending {
        let cc = ctx.root_close_ctx(a);
        ctx.dec_dependent(cc, DepKind::Notify);
    }
}

/// Expands the clause chain into one environment per yielded binding
/// combination. Returns None if expansion suspended or failed; nothing is
/// committed in that case.
pub(crate) fn expand_comprehension(
    ctx: &mut OpContext,
    env: &Env,
    comp: &Rc<Comprehension>,
    mode: RunMode,
) -> Option<Vec<Env>> {
    let mut envs = vec![env.clone()];

    for clause in &comp.clauses {
        match clause {
            Clause::For { key, value, src } => {
                let mut next = Vec::new();
                for e in &envs {
                    let w = source_vertex(ctx, e, src, mode)?;
                    // The arc set is now fixed: iterating and then growing
                    // the source would make results order-dependent.
                    ctx.vertex_mut(w).lock_arcs = true;
                    for arc in ctx.vertex(w).arcs.clone() {
                        let (label, at) = {
                            let a = ctx.vertex(arc);
                            (a.label, a.arc_type)
                        };
                        if at != ArcType::Member || !label.is_regular() {
                            continue;
                        }
                        let b = ctx.new_inline_vertex(None);
                        if let Some(k) = key {
                            let kv = ctx.label_value(label);
                            bind(ctx, b, *k, kv);
                        }
                        bind(ctx, b, *value, Value::Vertex(arc));
                        seal_binding(ctx, b);
                        next.push(e.derive(b));
                    }
                }
                envs = next;
            }

            Clause::If(cond) => {
                let mut next = Vec::new();
                for e in &envs {
                    let v = ctx.eval_concrete(e, cond, mode)?;
                    match v.default() {
                        Value::Bool(true) => next.push(e.clone()),
                        Value::Bool(false) => {}
                        Value::Bottom(b) => {
                            let b = b.clone();
                            ctx.add_bottom(b);
                            return None;
                        }
                        other => {
                            let msg = format!(
                                "invalid condition {} in comprehension",
                                ctx.value_str(other)
                            );
                            ctx.add_err(ErrorCode::Eval, msg);
                            return None;
                        }
                    }
                }
                envs = next;
            }

            Clause::Let { label, expr } => {
                let mut next = Vec::new();
                for e in &envs {
                    let v = ctx.eval_expr(e, expr, mode)?;
                    let b = ctx.new_inline_vertex(None);
                    bind(ctx, b, *label, v);
                    seal_binding(ctx, b);
                    next.push(e.derive(b));
                }
                envs = next;
            }
        }
    }

    Some(envs)
}

/// Resolves a for-clause source to a vertex with a known field set.
fn source_vertex(
    ctx: &mut OpContext,
    env: &Env,
    src: &Rc<Expr>,
    mode: RunMode,
) -> Option<VertexId> {
    let w = match &src.kind {
        ExprKind::FieldRef { .. }
        | ExprKind::LetRef { .. }
        | ExprKind::Selector { .. }
        | ExprKind::Index { .. } => {
            match ctx.resolve(env, src, &Default::default(), mode) {
                crate::eval::Resolution::Vertex(w) => w,
                crate::eval::Resolution::Val(Value::Vertex(w)) => w,
                crate::eval::Resolution::Val(v) => {
                    let msg = format!("cannot range over {}", ctx.value_str(&v));
                    ctx.add_err(ErrorCode::Eval, msg);
                    return None;
                }
                crate::eval::Resolution::Pending => return None,
            }
        }
        _ => match ctx.eval_inline(env, src, &Default::default(), mode)? {
            Value::Vertex(w) => w,
            v => {
                let msg = format!("cannot range over {}", ctx.value_str(&v));
                ctx.add_err(ErrorCode::Eval, msg);
                return None;
            }
        },
    };

    if ctx.vertex(w).status != VertexStatus::Finalized {
        ctx.unify(w, sched::NEED_FIELD_SET_KNOWN, mode);
        if ctx.suspended {
            return None;
        }
    }

    let w = ctx.deref_vertex(w);
    let kind = ctx.vertex(w).kind();
    if !kind.is_anyof(crate::kind::Kind::STRUCT | crate::kind::Kind::LIST) {
        let msg = format!("cannot range over value of type {}", kind);
        ctx.add_err(ErrorCode::Eval, msg);
        return None;
    }
    Some(w)
}

/// Adds one finalized binding arc to a binding scope vertex.
fn bind(ctx: &mut OpContext, scope: VertexId, label: crate::feature::Feature, v: Value) {
    let (arc, _) = ctx.get_arc(scope, label, ArcType::Member);
    let vx = ctx.vertex_mut(arc);
    vx.base_value = Some(v);
    vx.status = VertexStatus::Finalized;
}

fn seal_binding(ctx: &mut OpContext, scope: VertexId) {
    let vx = ctx.vertex_mut(scope);
    vx.base_value = Some(Value::StructMarker);
    vx.status = VertexStatus::Finalized;
}
