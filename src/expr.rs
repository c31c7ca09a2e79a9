use std::fmt::{self, Debug};
use std::rc::Rc;

use crate::error::Pos;
use crate::feature::Feature;
use crate::kind::Kind;
use crate::op::{Op, RelOp};
use crate::value::Value;
use crate::vertex::ArcType;

/// An Expr is one node of the compiled expression tree consumed by the
/// evaluator. The tree is produced by a separate compiler stage; expressions
/// are immutable and shared via `Rc`. Reference expressions are identified by
/// `Rc` pointer identity for cycle tracking.
#[derive(Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub src: Pos,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Rc<Expr> {
        Rc::new(Expr {
            kind,
            src: Pos::NONE,
        })
    }

    pub fn at(kind: ExprKind, src: Pos) -> Rc<Expr> {
        Rc::new(Expr { kind, src })
    }

    /// Reports whether this expression is a reference that must be resolved
    /// through the environment chain.
    pub fn is_resolver(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::FieldRef { .. } | ExprKind::LetRef { .. } | ExprKind::LabelRef { .. }
        )
    }
}

#[derive(Debug, PartialEq)]
pub enum ExprKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<str>),

    /// `_`: matches any value.
    Top,
    /// A type restriction such as `int` or `string`.
    BasicType(Kind),
    /// A bound such as `>=3` or `=~"^a"`.
    Bound(RelOp, Rc<Expr>),

    Struct(Rc<StructLit>),
    List(Rc<ListLit>),

    /// A reference to a field of the vertex `up` scopes outward.
    FieldRef { up: u32, label: Feature },
    /// A reference to the dynamically matched label `up` scopes outward,
    /// usable inside pattern constraint bodies.
    LabelRef { up: u32 },
    /// A reference to a let binding, carrying its expression.
    LetRef { up: u32, label: Feature, x: Rc<Expr> },

    Selector { x: Rc<Expr>, sel: Feature },
    Index { x: Rc<Expr>, index: Rc<Expr> },

    /// String or bytes interpolation; parts alternate fixed and computed.
    Interpolation { kind: Kind, parts: Vec<Rc<Expr>> },

    Unary { op: Op, x: Rc<Expr> },
    Binary { op: Op, x: Rc<Expr>, y: Rc<Expr> },

    Call { fun: Rc<Expr>, args: Vec<Rc<Expr>> },
    Builtin(Rc<Builtin>),

    Disjunction(Rc<DisjunctionExpr>),

    Comprehension(Rc<Comprehension>),

    /// An error authored in the source (explicit bottom).
    Bottom,
}

/// A struct literal: one closedness scope worth of declarations.
#[derive(Debug, PartialEq)]
pub struct StructLit {
    pub decls: Vec<Decl>,
    pub src: Pos,
}

impl StructLit {
    pub fn has_ellipsis(&self) -> bool {
        self.decls.iter().any(|d| matches!(d, Decl::Ellipsis { .. }))
    }
}

#[derive(Debug, PartialEq)]
pub enum Decl {
    /// A regular, optional (`?`), or required (`!`) field.
    Field {
        label: Feature,
        arc: ArcType,
        value: Rc<Expr>,
    },

    /// A field whose label is computed, e.g. `(key): value`.
    Dynamic {
        key: Rc<Expr>,
        arc: ArcType,
        value: Rc<Expr>,
    },

    /// A pattern constraint, e.g. `[string]: value`.
    Pattern { filter: Rc<Expr>, value: Rc<Expr> },

    /// `...` or `...value`; opens the struct.
    Ellipsis { value: Option<Rc<Expr>> },

    /// A let binding scoped to this struct.
    Let { label: Feature, value: Rc<Expr> },

    /// An embedded expression contributing conjuncts to the whole struct.
    Embed { value: Rc<Expr> },

    /// A comprehension yielding declarations into this struct.
    Comprehension(Rc<Comprehension>),
}

/// A list literal. Lists evaluate as integer-labelled arcs; `...` makes the
/// list open at its tail.
#[derive(Debug, PartialEq)]
pub struct ListLit {
    pub elems: Vec<ListElem>,
    pub src: Pos,
}

#[derive(Debug, PartialEq)]
pub enum ListElem {
    Value(Rc<Expr>),
    Ellipsis(Option<Rc<Expr>>),
    Comprehension(Rc<Comprehension>),
}

impl ListLit {
    pub fn is_open(&self) -> bool {
        matches!(self.elems.last(), Some(ListElem::Ellipsis(_)))
    }
}

/// A disjunction expression. `num_defaults` counts the values marked with a
/// `*` prefix.
#[derive(Debug, PartialEq)]
pub struct DisjunctionExpr {
    pub values: Vec<Disjunct>,
    pub has_defaults: bool,
}

#[derive(Debug, PartialEq)]
pub struct Disjunct {
    pub val: Rc<Expr>,
    pub default: bool,
}

/// A comprehension: a chain of clauses ending in a struct to yield once per
/// binding combination.
#[derive(Debug, PartialEq)]
pub struct Comprehension {
    pub clauses: Vec<Clause>,
    pub value: Rc<StructLit>,
    pub src: Pos,
}

#[derive(Debug, PartialEq)]
pub enum Clause {
    For {
        key: Option<Feature>,
        value: Feature,
        src: Rc<Expr>,
    },
    If(Rc<Expr>),
    Let {
        label: Feature,
        expr: Rc<Expr>,
    },
}

/// A builtin function. The library of builtins lives outside the core; the
/// evaluator only knows how to call one and how to use a partially applied
/// builtin as a validator.
pub struct Builtin {
    pub name: &'static str,
    pub arity: usize,
    pub result: Kind,
    pub func: fn(&[Value]) -> Value,
}

impl Builtin {
    /// A builtin whose result is bool can act as a validator when partially
    /// applied.
    pub fn is_validator(&self) -> bool {
        self.result == Kind::BOOL
    }
}

impl PartialEq for Builtin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.arity == other.arity
    }
}

impl Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// An identity key for a reference expression, used by the cycle detector.
#[derive(Debug, Clone)]
pub struct RefId(pub Rc<Expr>);

impl PartialEq for RefId {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RefId {}

#[test]
fn test_ref_identity() {
    let a = Expr::new(ExprKind::FieldRef {
        up: 0,
        label: Feature::INVALID,
    });
    let b = Expr::new(ExprKind::FieldRef {
        up: 0,
        label: Feature::INVALID,
    });
    assert_eq!(RefId(a.clone()), RefId(a.clone()));
    assert_ne!(RefId(a), RefId(b));
}

#[test]
fn test_list_openness() {
    let open = ListLit {
        elems: vec![
            ListElem::Value(Expr::new(ExprKind::Int(1))),
            ListElem::Ellipsis(None),
        ],
        src: Pos::NONE,
    };
    let closed = ListLit {
        elems: vec![ListElem::Value(Expr::new(ExprKind::Int(1)))],
        src: Pos::NONE,
    };
    assert!(open.is_open());
    assert!(!closed.is_open());
}
