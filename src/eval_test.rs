//! End-to-end evaluator tests: programs are built as expression trees and
//! driven through a full finalize.

use std::rc::Rc;

use pretty_assertions::assert_eq;

use crate::build::*;
use crate::expr::Expr;
use crate::feature::{FeatureExt, StringInterner};
use crate::kind::Kind;
use crate::op::{Op, RelOp};
use crate::value::Value;
use crate::vertex::{ArcType, VertexId};
use crate::{ErrorCode, OpContext, ValidateError};

fn rt() -> Rc<StringInterner> {
    Rc::new(StringInterner::default())
}

fn eval_with(rt: Rc<StringInterner>, xs: Vec<Rc<Expr>>) -> (OpContext, VertexId) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut ctx = OpContext::with_runtime(rt);
    let root = ctx.root_vertex_all(xs);
    ctx.finalize(root);
    (ctx, root)
}

fn value_at(ctx: &OpContext, mut v: VertexId, path: &[&str]) -> Value {
    for p in path {
        let f = ctx.runtime.field(p);
        v = ctx
            .lookup_label(v, f)
            .unwrap_or_else(|| panic!("no field {} in {:?}", p, ctx.path_of(v)));
    }
    ctx.value_of(v).expect("unevaluated vertex")
}

fn err_at(ctx: &OpContext, v: VertexId, path: &[&str]) -> Rc<crate::Bottom> {
    match value_at(ctx, v, path) {
        Value::Bottom(b) => b,
        other => panic!("expected error at {:?}, got {}", path, other),
    }
}

/// A canonical rendering of an evaluated tree, arcs sorted by label, for
/// order-independence comparisons.
fn snapshot(ctx: &OpContext, v: VertexId) -> String {
    let v = ctx.deref_vertex(v);
    let vx = ctx.vertex(v);
    match &vx.base_value {
        Some(Value::StructMarker) => {
            let mut arcs: Vec<VertexId> = vx
                .arcs
                .iter()
                .copied()
                .filter(|&a| {
                    ctx.vertex(a).arc_type == ArcType::Member
                        && ctx.vertex(a).label.is_regular()
                })
                .collect();
            arcs.sort_by_key(|&a| ctx.runtime.label_str(ctx.vertex(a).label));
            let mut s = String::from("{");
            for (i, a) in arcs.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                s.push_str(&ctx.runtime.label_str(ctx.vertex(*a).label));
                s.push_str(": ");
                s.push_str(&snapshot(ctx, *a));
            }
            s.push('}');
            s
        }
        Some(Value::ListMarker { .. }) => {
            let mut s = String::from("[");
            for (i, a) in ctx.elems(v).iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                s.push_str(&snapshot(ctx, *a));
            }
            s.push(']');
            s
        }
        Some(Value::Disjunction(d)) => {
            let mut parts: Vec<String> = Vec::new();
            for (i, val) in d.values.iter().enumerate() {
                let rendered = match val {
                    Value::Vertex(w) => snapshot(ctx, *w),
                    other => format!("{}", other),
                };
                if i < d.num_defaults {
                    parts.push(format!("*{}", rendered));
                } else {
                    parts.push(rendered);
                }
            }
            parts.sort();
            format!("({})", parts.join("|"))
        }
        Some(Value::Bottom(b)) => format!("_|_({:?})", b.code),
        Some(other) => format!("{}", other),
        None => String::from("?"),
    }
}

// ---- scalars and structs ----

#[test]
fn equal_scalars_unify() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, int(1))]),
            struct_lit(vec![field(a, int(1))]),
        ],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(1));
}

#[test]
fn conflicting_scalars_fail() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, int(1))]),
            struct_lit(vec![field(a, int(2))]),
        ],
    );
    let b = err_at(&ctx, root, &["a"]);
    assert_eq!(b.code, ErrorCode::Eval);
    assert!(b.msg.contains("conflicting values"));
}

#[test]
fn struct_unification_unions_fields() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, int(1))]),
            struct_lit(vec![field(b, str_lit("x"))]),
        ],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(1));
    assert_eq!(value_at(&ctx, root, &["b"]), Value::from("x"));
    assert_eq!(snapshot(&ctx, root), r#"{a: 1, b: "x"}"#);
}

#[test]
fn same_label_conjuncts_merge() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, basic(Kind::INT))]),
            struct_lit(vec![field(a, int(3))]),
        ],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(3));
}

#[test]
fn scalar_with_struct_conflicts() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, int(1))]),
            struct_lit(vec![field(a, struct_lit(vec![]))]),
        ],
    );
    let b = err_at(&ctx, root, &["a"]);
    assert_eq!(b.code, ErrorCode::Eval);
}

#[test]
fn mixed_kind_types_conflict() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(Op::And, basic(Kind::INT), basic(Kind::STRING)),
        )])],
    );
    let b = err_at(&ctx, root, &["a"]);
    assert_eq!(b.code, ErrorCode::Eval);
}

// ---- order independence ----

#[test]
fn unification_is_commutative_and_associative() {
    let build = |r: &Rc<StringInterner>| {
        let (a, b, c) = (r.field("a"), r.field("b"), r.field("c"));
        vec![
            struct_lit(vec![field(a, int(1)), field(b, basic(Kind::INT))]),
            struct_lit(vec![field(b, int(2)), field(c, str_lit("s"))]),
            struct_lit(vec![field(a, basic(Kind::NUM))]),
        ]
    };

    let r1 = rt();
    let xs = build(&r1);
    let (ctx1, root1) = eval_with(r1, xs);
    let want = snapshot(&ctx1, root1);

    let r2 = rt();
    let mut xs = build(&r2);
    xs.swap(0, 2);
    let (ctx2, root2) = eval_with(r2, xs);
    assert_eq!(snapshot(&ctx2, root2), want);

    let r3 = rt();
    let mut xs = build(&r3);
    xs.swap(1, 2);
    xs.swap(0, 1);
    let (ctx3, root3) = eval_with(r3, xs);
    assert_eq!(snapshot(&ctx3, root3), want);

    assert_eq!(want, r#"{a: 1, b: 2, c: "s"}"#);
}

#[test]
fn unification_is_idempotent() {
    let build = |r: &Rc<StringInterner>| {
        let (a, b) = (r.field("a"), r.field("b"));
        struct_lit(vec![
            field(a, int(1)),
            field(b, struct_lit(vec![field(a, basic(Kind::INT))])),
        ])
    };

    let r1 = rt();
    let x = build(&r1);
    let (ctx1, root1) = eval_with(r1, vec![x]);

    let r2 = rt();
    let x = build(&r2);
    let y = build(&r2);
    let (ctx2, root2) = eval_with(r2, vec![x, y]);

    assert_eq!(snapshot(&ctx1, root1), snapshot(&ctx2, root2));
}

// ---- references ----

#[test]
fn reference_resolves_sibling() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(a, int(1)),
            field(b, field_ref(0, a)),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["b"]), Value::Int(1));
}

#[test]
fn selector_into_nested_struct() {
    let r = rt();
    let (a, b, c) = (r.field("a"), r.field("b"), r.field("c"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(b, struct_lit(vec![field(c, int(4))])),
            field(a, select(field_ref(0, b), c)),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(4));
}

#[test]
fn index_into_list() {
    let r = rt();
    let (l, a) = (r.field("l"), r.field("a"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(l, list_lit(vec![elem(int(10)), elem(int(11))])),
            field(a, index(field_ref(0, l), int(1))),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(11));
}

#[test]
fn undefined_field_is_incomplete_then_permanent() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(a, select(field_ref(0, b), a))])],
    );
    let _ = err_at(&ctx, root, &["a"]);
    let mut ctx = ctx;
    assert!(matches!(
        ctx.validate(root),
        Err(ValidateError::Incomplete { .. }) | Err(ValidateError::Eval { .. })
    ));
}

#[test]
fn let_binding_resolves() {
    let r = rt();
    let (x, a) = (r.let_label("x"), r.field("a"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            let_decl(x, int(3)),
            field(a, let_ref(0, x, int(3))),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(3));
}

// ---- bounds and validators ----

#[test]
fn bounds_collapse_to_scalar() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(
                Op::And,
                bound(RelOp::GreaterEqual, int(3)),
                bound(RelOp::LessEqual, int(3)),
            ),
        )])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(3));
}

#[test]
fn contradictory_bounds_fail() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(
                Op::And,
                bound(RelOp::GreaterThan, int(3)),
                bound(RelOp::LessThan, int(3)),
            ),
        )])],
    );
    assert_eq!(err_at(&ctx, root, &["a"]).code, ErrorCode::Eval);
}

#[test]
fn not_equal_eliminated_by_bound() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(
                Op::And,
                bound(RelOp::NotEqual, int(5)),
                bound(RelOp::LessThan, int(5)),
            ),
        )])],
    );
    assert_eq!(
        value_at(&ctx, root, &["a"]),
        Value::from((RelOp::LessThan, 5))
    );
}

#[test]
fn concrete_value_checked_against_bounds() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, bound(RelOp::GreaterThan, int(5)))]),
            struct_lit(vec![field(a, int(7))]),
        ],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(7));

    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, bound(RelOp::GreaterThan, int(5)))]),
            struct_lit(vec![field(a, int(3))]),
        ],
    );
    assert_eq!(err_at(&ctx, root, &["a"]).code, ErrorCode::Eval);
}

#[test]
fn pattern_bound_on_strings() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, bound(RelOp::Match, str_lit("^h")))]),
            struct_lit(vec![field(a, str_lit("hello"))]),
        ],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::from("hello"));
}

#[test]
fn validator_builtin_checks_value() {
    let r = rt();
    let a = r.field("a");
    let min3 = call(builtin(crate::min_runes_builtin()), vec![int(3)]);
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, min3)]),
            struct_lit(vec![field(a, str_lit("abcd"))]),
        ],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::from("abcd"));

    let r = rt();
    let a = r.field("a");
    let min3 = call(builtin(crate::min_runes_builtin()), vec![int(3)]);
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, min3)]),
            struct_lit(vec![field(a, str_lit("ab"))]),
        ],
    );
    assert_eq!(err_at(&ctx, root, &["a"]).code, ErrorCode::Eval);
}

// ---- closedness ----

#[test]
fn closed_struct_rejects_unknown_field() {
    let r = rt();
    let (t, x, a, b) = (r.def("T"), r.field("x"), r.field("a"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(t, struct_lit(vec![field(a, basic(Kind::INT))])),
            field(
                x,
                binop(
                    Op::And,
                    field_ref(0, t),
                    struct_lit(vec![field(b, str_lit("s"))]),
                ),
            ),
        ])],
    );
    let berr = err_at(&ctx, root, &["x", "b"]);
    assert_eq!(berr.code, ErrorCode::Eval);
    assert!(berr.msg.contains("field not allowed"));
    assert!(berr.msg.contains('b'));
    assert!(ctx.validate(root).is_err());
}

#[test]
fn ellipsis_keeps_struct_open() {
    let r = rt();
    let (t, x, a, b) = (r.def("T"), r.field("x"), r.field("a"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(t, struct_lit(vec![field(a, basic(Kind::INT)), ellipsis()])),
            field(
                x,
                binop(
                    Op::And,
                    field_ref(0, t),
                    struct_lit(vec![field(b, str_lit("s"))]),
                ),
            ),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["x", "b"]), Value::from("s"));
    assert!(ctx.validate(root).is_ok());
}

#[test]
fn closed_struct_accepts_pattern_matched_field() {
    let r = rt();
    let (t, x, b) = (r.def("T"), r.field("x"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(
                t,
                struct_lit(vec![pattern(basic(Kind::STRING), basic(Kind::INT))]),
            ),
            field(
                x,
                binop(Op::And, field_ref(0, t), struct_lit(vec![field(b, int(1))])),
            ),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["x", "b"]), Value::Int(1));
    assert!(ctx.validate(root).is_ok());
}

// ---- optional, required, dynamic, pattern fields ----

#[test]
fn optional_field_applies_only_when_present() {
    let r = rt();
    let (a, foo) = (r.field("a"), r.field("foo"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![optional(foo, bound(RelOp::GreaterThan, int(5)))]),
        )])],
    );
    assert!(ctx.validate(root).is_ok());
    let a_id = ctx.lookup_label(root, ctx.runtime.field("a")).unwrap();
    // The constraint arc is not a member.
    assert!(ctx
        .lookup_label(a_id, ctx.runtime.field("foo"))
        .map(|f| ctx.vertex(f).arc_type)
        .map_or(true, |t| t == ArcType::Optional));
}

#[test]
fn optional_constraint_applies_to_member() {
    let r = rt();
    let (a, foo) = (r.field("a"), r.field("foo"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![
                optional(foo, bound(RelOp::GreaterThan, int(5))),
                field(foo, int(3)),
            ]),
        )])],
    );
    assert_eq!(err_at(&ctx, root, &["a", "foo"]).code, ErrorCode::Eval);
}

#[test]
fn required_field_fails_when_absent() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![required(b, basic(Kind::INT))]),
        )])],
    );
    assert!(ctx.validate(root).is_err());
    let berr = err_at(&ctx, root, &["a", "b"]);
    assert!(berr.msg.contains("required"));
    assert!(berr.permanent);
}

#[test]
fn required_field_satisfied_by_value() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(
                a,
                struct_lit(vec![required(b, basic(Kind::INT))]),
            )]),
            struct_lit(vec![field(a, struct_lit(vec![field(b, int(3))]))]),
        ],
    );
    assert!(ctx.validate(root).is_ok());
    assert_eq!(value_at(&ctx, root, &["a", "b"]), Value::Int(3));
}

#[test]
fn dynamic_field_label_from_expression() {
    let r = rt();
    let (a, k) = (r.field("a"), r.field("k"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(k, str_lit("computed")),
            field(
                a,
                struct_lit(vec![dynamic(field_ref(1, k), int(7))]),
            ),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["a", "computed"]), Value::Int(7));
}

#[test]
fn pattern_constraint_checks_matching_fields() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![
                pattern(basic(Kind::STRING), basic(Kind::INT)),
                field(b, str_lit("x")),
            ]),
        )])],
    );
    assert_eq!(err_at(&ctx, root, &["a", "b"]).code, ErrorCode::Eval);

    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![
                pattern(basic(Kind::STRING), basic(Kind::INT)),
                field(b, int(1)),
            ]),
        )])],
    );
    assert_eq!(value_at(&ctx, root, &["a", "b"]), Value::Int(1));
}

// ---- cycles ----

#[test]
fn self_reference_is_unconstrained() {
    let r = rt();
    let a = r.field("a");
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(a, field_ref(0, a))])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Top);
    assert!(ctx.validate(root).is_ok());
}

#[test]
fn mutual_references_are_unconstrained() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(a, field_ref(0, b)),
            field(b, field_ref(0, a)),
        ])],
    );
    assert!(ctx.validate(root).is_ok());
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Top);
    assert_eq!(value_at(&ctx, root, &["b"]), Value::Top);
}

#[test]
fn structural_cycle_is_detected() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    // a: b: a
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![field(b, field_ref(1, a))]),
        )])],
    );
    match ctx.validate(root) {
        Err(ValidateError::StructuralCycle { .. }) => {}
        other => panic!("expected structural cycle, got {:?}", other),
    }
    let berr = err_at(&ctx, root, &["a", "b"]);
    assert_eq!(berr.code, ErrorCode::StructuralCycle);
}

#[test]
fn pattern_only_cycle_is_no_error() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    // a: [string]: b: a  -- never instantiated, so no cycle.
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![pattern(
                basic(Kind::STRING),
                struct_lit(vec![field(b, field_ref(2, a))]),
            )]),
        )])],
    );
    assert!(ctx.validate(root).is_ok());
}

#[test]
fn optional_cycle_terminates_without_error() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    // a: b?: a
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![optional(b, field_ref(1, a))]),
        )])],
    );
    assert!(ctx.validate(root).is_ok());
    assert_eq!(value_at(&ctx, root, &["a"]), Value::StructMarker);
}

#[test]
fn fed_optional_cycle_is_structural() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    // a: b?: a, a: b: {} -- the optional cycle is fed, so it reproduces.
    let (mut ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(
                a,
                struct_lit(vec![optional(b, field_ref(1, a))]),
            )]),
            struct_lit(vec![field(a, struct_lit(vec![field(b, struct_lit(vec![]))]))]),
        ],
    );
    assert!(matches!(
        ctx.validate(root),
        Err(ValidateError::StructuralCycle { .. })
    ));
}

// ---- disjunctions ----

#[test]
fn disjunction_narrows_to_single_value() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(
                Op::And,
                disj(vec![int(1), int(2)]),
                disj(vec![int(2), int(3)]),
            ),
        )])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(2));
}

#[test]
fn empty_disjunction_collects_branch_errors() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(
                Op::And,
                disj(vec![int(1), int(2)]),
                disj(vec![int(3), int(4)]),
            ),
        )])],
    );
    let b = err_at(&ctx, root, &["a"]);
    assert_eq!(b.code, ErrorCode::Eval);
    assert!(b.msg.contains("empty disjunction"));
    // Errors of both failing branches are collected.
    assert!(b.msg.contains('3'));
    assert!(b.msg.contains('4'));
}

#[test]
fn surviving_disjunction_keeps_alternatives() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(Op::And, disj(vec![int(1), int(2)]), basic(Kind::INT)),
        )])],
    );
    match value_at(&ctx, root, &["a"]) {
        Value::Disjunction(d) => {
            assert_eq!(d.values.len(), 2);
            assert_eq!(d.num_defaults, 0);
        }
        other => panic!("expected disjunction, got {}", other),
    }
}

#[test]
fn single_default_is_exposed() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            disj_with_defaults(vec![(int(1), true), (int(2), false)]),
        )])],
    );
    match value_at(&ctx, root, &["a"]) {
        Value::Disjunction(d) => {
            assert_eq!(d.num_defaults, 1);
            assert_eq!(d.default(), Some(&Value::Int(1)));
        }
        other => panic!("expected disjunction, got {}", other),
    }
}

#[test]
fn default_is_used_in_expressions() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(a, disj_with_defaults(vec![(int(1), true), (int(2), false)])),
            field(b, binop(Op::Add, field_ref(0, a), int(10))),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["b"]), Value::Int(11));
}

#[test]
fn struct_disjuncts_cross_product() {
    let r = rt();
    let (a, x) = (r.field("a"), r.field("x"));
    // a: ({x: 1} | {x: 2}) & {x: 2}
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            binop(
                Op::And,
                disj(vec![
                    struct_lit(vec![field(x, int(1))]),
                    struct_lit(vec![field(x, int(2))]),
                ]),
                struct_lit(vec![field(x, int(2))]),
            ),
        )])],
    );
    assert_eq!(value_at(&ctx, root, &["a", "x"]), Value::Int(2));
}

#[test]
fn equal_disjuncts_are_deduplicated() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            disj(vec![int(1), int(1), int(2)]),
        )])],
    );
    match value_at(&ctx, root, &["a"]) {
        Value::Disjunction(d) => assert_eq!(d.values.len(), 2),
        other => panic!("expected disjunction, got {}", other),
    }
}

// ---- lists ----

#[test]
fn closed_lists_require_equal_length() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(a, list_lit(vec![elem(int(1)), elem(int(2))]))]),
            struct_lit(vec![field(
                a,
                list_lit(vec![elem(int(1)), elem(int(2)), elem(int(3))]),
            )]),
        ],
    );
    let b = err_at(&ctx, root, &["a"]);
    assert!(b.msg.contains("incompatible list lengths"));
}

#[test]
fn open_list_adopts_closed_length() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(
                a,
                list_lit(vec![elem(int(1)), elem(int(2)), elem_ellipsis()]),
            )]),
            struct_lit(vec![field(
                a,
                list_lit(vec![elem(int(1)), elem(int(2)), elem(int(3))]),
            )]),
        ],
    );
    assert_eq!(
        value_at(&ctx, root, &["a"]),
        Value::ListMarker { open: false }
    );
    let a_id = ctx.lookup_label(root, ctx.runtime.field("a")).unwrap();
    assert_eq!(ctx.elems(a_id).len(), 3);
    assert_eq!(snapshot(&ctx, a_id), "[1, 2, 3]");
}

#[test]
fn list_elements_unify() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(
                a,
                list_lit(vec![elem(basic(Kind::INT)), elem(basic(Kind::BOOL))]),
            )]),
            struct_lit(vec![field(
                a,
                list_lit(vec![elem(int(1)), elem(bool_lit(true))]),
            )]),
        ],
    );
    let a_id = ctx.lookup_label(root, ctx.runtime.field("a")).unwrap();
    assert_eq!(snapshot(&ctx, a_id), "[1, true]");
}

#[test]
fn list_ellipsis_constrains_extra_elements() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![
            struct_lit(vec![field(
                a,
                list_lit(vec![elem_ellipsis_with(basic(Kind::INT))]),
            )]),
            struct_lit(vec![field(a, list_lit(vec![elem(str_lit("x"))]))]),
        ],
    );
    let a_id = ctx.lookup_label(root, ctx.runtime.field("a")).unwrap();
    let first = ctx.elems(a_id)[0];
    match ctx.value_of(first) {
        Some(Value::Bottom(b)) => assert_eq!(b.code, ErrorCode::Eval),
        other => panic!("expected error element, got {:?}", other),
    }
}

// ---- expressions ----

#[test]
fn arithmetic_and_comparison() {
    let r = rt();
    let (a, b, c, d) = (r.field("a"), r.field("b"), r.field("c"), r.field("d"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(a, binop(Op::Add, int(1), int(2))),
            field(b, binop(Op::Multiply, field_ref(0, a), int(4))),
            field(c, binop(Op::LessThan, field_ref(0, a), field_ref(0, b))),
            field(d, unary(Op::Subtract, int(5))),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(3));
    assert_eq!(value_at(&ctx, root, &["b"]), Value::Int(12));
    assert_eq!(value_at(&ctx, root, &["c"]), Value::Bool(true));
    assert_eq!(value_at(&ctx, root, &["d"]), Value::Int(-5));
}

#[test]
fn division_by_zero_fails() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(a, binop(Op::Divide, int(1), int(0)))])],
    );
    assert!(err_at(&ctx, root, &["a"]).msg.contains("division by zero"));
}

#[test]
fn string_interpolation() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(a, str_lit("world")),
            field(
                b,
                interpolation(
                    Kind::STRING,
                    vec![str_lit("hello "), field_ref(0, a), str_lit("!")],
                ),
            ),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["b"]), Value::from("hello world!"));
}

#[test]
fn mutual_arithmetic_cycle_is_an_error() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(a, binop(Op::Add, field_ref(0, b), int(1))),
            field(b, binop(Op::Subtract, field_ref(0, a), int(1))),
        ])],
    );
    assert!(ctx.validate(root).is_err());
}

#[test]
fn arithmetic_cycle_broken_by_concrete_value() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    // b: a - 10, a: 5 -- reference to a is resolvable, no cycle.
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(b, binop(Op::Subtract, field_ref(0, a), int(10))),
            field(a, int(5)),
        ])],
    );
    assert!(ctx.validate(root).is_ok());
    assert_eq!(value_at(&ctx, root, &["b"]), Value::Int(-5));
}

// ---- comprehensions ----

#[test]
fn for_comprehension_copies_fields() {
    let r = rt();
    let (src, a, k, v) = (r.field("src"), r.field("a"), r.field("k"), r.field("v"));
    let (x, y) = (r.field("x"), r.field("y"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(
                src,
                struct_lit(vec![field(x, int(1)), field(y, int(2))]),
            ),
            field(
                a,
                struct_lit(vec![comprehension(
                    vec![for_clause(Some(k), v, field_ref(1, src))],
                    struct_lit(vec![dynamic(field_ref(1, k), field_ref(1, v))]),
                )]),
            ),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["a", "x"]), Value::Int(1));
    assert_eq!(value_at(&ctx, root, &["a", "y"]), Value::Int(2));
}

#[test]
fn if_comprehension_false_yields_pending_then_absent() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (mut ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![comprehension(
                vec![if_clause(bool_lit(false))],
                struct_lit(vec![field(b, int(1))]),
            )]),
        )])],
    );
    assert!(ctx.validate(root).is_ok());
    let a_id = ctx.lookup_label(root, ctx.runtime.field("a")).unwrap();
    assert!(ctx.lookup_label(a_id, ctx.runtime.field("b")).is_none());
}

#[test]
fn if_comprehension_true_yields_field() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![comprehension(
                vec![if_clause(bool_lit(true))],
                struct_lit(vec![field(b, int(1))]),
            )]),
        )])],
    );
    assert_eq!(value_at(&ctx, root, &["a", "b"]), Value::Int(1));
}

#[test]
fn comprehension_condition_over_reference() {
    let r = rt();
    let (flag, a, b) = (r.field("flag"), r.field("a"), r.field("b"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![
            field(flag, bool_lit(true)),
            field(
                a,
                struct_lit(vec![comprehension(
                    vec![if_clause(field_ref(1, flag))],
                    struct_lit(vec![field(b, int(1))]),
                )]),
            ),
        ])],
    );
    assert_eq!(value_at(&ctx, root, &["a", "b"]), Value::Int(1));
}

// ---- embeddings ----

#[test]
fn embedded_scalar_becomes_the_value() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![embed(int(4))]),
        )])],
    );
    assert_eq!(value_at(&ctx, root, &["a"]), Value::Int(4));
}

#[test]
fn embedded_struct_contributes_fields() {
    let r = rt();
    let (a, b, c) = (r.field("a"), r.field("b"), r.field("c"));
    let (ctx, root) = eval_with(
        r,
        vec![struct_lit(vec![field(
            a,
            struct_lit(vec![
                embed(struct_lit(vec![field(b, int(1))])),
                field(c, int(2)),
            ]),
        )])],
    );
    assert_eq!(value_at(&ctx, root, &["a", "b"]), Value::Int(1));
    assert_eq!(value_at(&ctx, root, &["a", "c"]), Value::Int(2));
}

// ---- session bookkeeping ----

#[test]
fn stats_track_work() {
    let r = rt();
    let (a, b) = (r.field("a"), r.field("b"));
    let (ctx, _) = eval_with(
        r,
        vec![struct_lit(vec![
            field(a, disj(vec![int(1), int(2)])),
            field(b, int(3)),
        ])],
    );
    assert!(ctx.stats.unifications > 0);
    assert!(ctx.stats.conjuncts > 0);
    assert_eq!(ctx.stats.disjuncts, 2);
    assert!(ctx.stats.node_allocs > 0);
}

#[test]
fn dependency_graph_renders_after_evaluation() {
    let r = rt();
    let a = r.field("a");
    let (ctx, root) = eval_with(r, vec![struct_lit(vec![field(a, int(1))])]);
    let graph = ctx.dependency_graph(root);
    assert!(graph.starts_with("graph TD"));
    assert!(graph.contains("Finalized"));
}

#[test]
fn finalize_is_idempotent() {
    let r = rt();
    let a = r.field("a");
    let (mut ctx, root) = eval_with(r, vec![struct_lit(vec![field(a, int(1))])]);
    let before = snapshot(&ctx, root);
    ctx.finalize(root);
    ctx.finalize(root);
    assert_eq!(snapshot(&ctx, root), before);
}
