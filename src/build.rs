//! Builders for the compiled expression tree. The compiler stage that
//! normally produces these trees lives outside this crate; embedders and
//! tests construct them through these helpers.

use std::rc::Rc;

use crate::error::Pos;
use crate::expr::{
    Clause, Comprehension, Decl, Disjunct, DisjunctionExpr, Expr, ExprKind, ListElem, ListLit,
    StructLit,
};
use crate::feature::Feature;
use crate::kind::Kind;
use crate::op::{Op, RelOp};
use crate::vertex::ArcType;

pub fn null() -> Rc<Expr> {
    Expr::new(ExprKind::Null)
}

pub fn bool_lit(b: bool) -> Rc<Expr> {
    Expr::new(ExprKind::Bool(b))
}

pub fn int(i: i64) -> Rc<Expr> {
    Expr::new(ExprKind::Int(i))
}

pub fn float(f: f64) -> Rc<Expr> {
    Expr::new(ExprKind::Float(f))
}

pub fn str_lit(s: &str) -> Rc<Expr> {
    Expr::new(ExprKind::Str(s.into()))
}

pub fn bytes_lit(s: &str) -> Rc<Expr> {
    Expr::new(ExprKind::Bytes(s.into()))
}

pub fn top() -> Rc<Expr> {
    Expr::new(ExprKind::Top)
}

pub fn bottom() -> Rc<Expr> {
    Expr::new(ExprKind::Bottom)
}

pub fn basic(k: Kind) -> Rc<Expr> {
    Expr::new(ExprKind::BasicType(k))
}

pub fn bound(op: RelOp, x: Rc<Expr>) -> Rc<Expr> {
    Expr::new(ExprKind::Bound(op, x))
}

pub fn field_ref(up: u32, label: Feature) -> Rc<Expr> {
    Expr::new(ExprKind::FieldRef { up, label })
}

pub fn label_ref(up: u32) -> Rc<Expr> {
    Expr::new(ExprKind::LabelRef { up })
}

pub fn let_ref(up: u32, label: Feature, x: Rc<Expr>) -> Rc<Expr> {
    Expr::new(ExprKind::LetRef { up, label, x })
}

pub fn select(x: Rc<Expr>, sel: Feature) -> Rc<Expr> {
    Expr::new(ExprKind::Selector { x, sel })
}

pub fn index(x: Rc<Expr>, i: Rc<Expr>) -> Rc<Expr> {
    Expr::new(ExprKind::Index { x, index: i })
}

pub fn unary(op: Op, x: Rc<Expr>) -> Rc<Expr> {
    Expr::new(ExprKind::Unary { op, x })
}

pub fn binop(op: Op, x: Rc<Expr>, y: Rc<Expr>) -> Rc<Expr> {
    Expr::new(ExprKind::Binary { op, x, y })
}

pub fn interpolation(kind: Kind, parts: Vec<Rc<Expr>>) -> Rc<Expr> {
    Expr::new(ExprKind::Interpolation { kind, parts })
}

pub fn call(fun: Rc<Expr>, args: Vec<Rc<Expr>>) -> Rc<Expr> {
    Expr::new(ExprKind::Call { fun, args })
}

pub fn builtin(b: Rc<crate::expr::Builtin>) -> Rc<Expr> {
    Expr::new(ExprKind::Builtin(b))
}

/// `a | b | c`, with no defaults marked.
pub fn disj(values: Vec<Rc<Expr>>) -> Rc<Expr> {
    disj_with_defaults(values.into_iter().map(|v| (v, false)).collect())
}

/// A disjunction with explicit default markers per alternative.
pub fn disj_with_defaults(values: Vec<(Rc<Expr>, bool)>) -> Rc<Expr> {
    let has_defaults = values.iter().any(|(_, d)| *d);
    Expr::new(ExprKind::Disjunction(Rc::new(DisjunctionExpr {
        values: values
            .into_iter()
            .map(|(val, default)| Disjunct { val, default })
            .collect(),
        has_defaults,
    })))
}

pub fn struct_lit(decls: Vec<Decl>) -> Rc<Expr> {
    Expr::new(ExprKind::Struct(Rc::new(StructLit {
        decls,
        src: Pos::NONE,
    })))
}

pub fn list_lit(elems: Vec<ListElem>) -> Rc<Expr> {
    Expr::new(ExprKind::List(Rc::new(ListLit {
        elems,
        src: Pos::NONE,
    })))
}

pub fn elem(x: Rc<Expr>) -> ListElem {
    ListElem::Value(x)
}

pub fn elem_ellipsis() -> ListElem {
    ListElem::Ellipsis(None)
}

pub fn elem_ellipsis_with(x: Rc<Expr>) -> ListElem {
    ListElem::Ellipsis(Some(x))
}

pub fn field(label: Feature, value: Rc<Expr>) -> Decl {
    Decl::Field {
        label,
        arc: ArcType::Member,
        value,
    }
}

pub fn optional(label: Feature, value: Rc<Expr>) -> Decl {
    Decl::Field {
        label,
        arc: ArcType::Optional,
        value,
    }
}

pub fn required(label: Feature, value: Rc<Expr>) -> Decl {
    Decl::Field {
        label,
        arc: ArcType::Required,
        value,
    }
}

pub fn dynamic(key: Rc<Expr>, value: Rc<Expr>) -> Decl {
    Decl::Dynamic {
        key,
        arc: ArcType::Member,
        value,
    }
}

pub fn pattern(filter: Rc<Expr>, value: Rc<Expr>) -> Decl {
    Decl::Pattern { filter, value }
}

pub fn ellipsis() -> Decl {
    Decl::Ellipsis { value: None }
}

pub fn ellipsis_with(value: Rc<Expr>) -> Decl {
    Decl::Ellipsis { value: Some(value) }
}

pub fn let_decl(label: Feature, value: Rc<Expr>) -> Decl {
    Decl::Let { label, value }
}

pub fn embed(value: Rc<Expr>) -> Decl {
    Decl::Embed { value }
}

pub fn comprehension(clauses: Vec<Clause>, value: Rc<Expr>) -> Decl {
    let ExprKind::Struct(lit) = &value.kind else {
        panic!("comprehension value must be a struct literal");
    };
    Decl::Comprehension(Rc::new(Comprehension {
        clauses,
        value: lit.clone(),
        src: Pos::NONE,
    }))
}

pub fn for_clause(key: Option<Feature>, value: Feature, src: Rc<Expr>) -> Clause {
    Clause::For { key, value, src }
}

pub fn if_clause(cond: Rc<Expr>) -> Clause {
    Clause::If(cond)
}

pub fn let_clause(label: Feature, expr: Rc<Expr>) -> Clause {
    Clause::Let { label, expr }
}
