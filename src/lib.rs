//! A unification evaluator for a declarative, constraint-based
//! configuration language. Values are not assigned once; they are
//! progressively narrowed through order-independent intersection of many
//! partial definitions (conjuncts).
//!
//! The evaluator consumes a compiled expression tree (see [`expr`] and the
//! [`build`] helpers) and produces an evaluated vertex tree, queryable by
//! label and index. It handles self-referential definitions, disjunctions
//! with defaults, open and closed structs, and optional, required, and
//! pattern-matched fields. Scheduling is cooperative and single-threaded:
//! work that cannot proceed parks on per-vertex condition bits and is
//! resumed, or forced at finalization, by the task engine.
//!
//! ```
//! use unify::{build, FeatureExt, OpContext, Value};
//!
//! let mut ctx = OpContext::new();
//! let rt = ctx.runtime.clone();
//! let root = ctx.root_vertex(build::struct_lit(vec![
//!     build::field(rt.field("a"), build::int(1)),
//!     build::field(rt.field("b"), build::field_ref(0, rt.field("a"))),
//! ]));
//! ctx.finalize(root);
//!
//! let b = ctx.lookup_label(root, rt.field("b")).unwrap();
//! assert_eq!(ctx.value_of(b), Some(Value::Int(1)));
//! ```

pub mod bounds;
pub mod build;
mod closectx;
mod comprehension;
mod conjunct;
mod context;
mod cycle;
mod debug;
mod disjunct;
mod environment;
mod error;
mod eval;
mod expr;
mod feature;
mod insert;
mod kind;
mod node;
mod op;
mod overlay;
mod sched;
mod unify;
mod value;
mod vertex;

#[cfg(test)]
mod eval_test;

pub use conjunct::{CloseInfo, Conjunct, Elem};
pub use context::{Config, OpContext, Stats};
pub use disjunct::DefaultMode;
pub use environment::{Env, Environment};
pub use error::{Bottom, ErrorCode, Pos, ValidateError};
pub use expr::{
    Builtin, Clause, Comprehension, Decl, Disjunct, DisjunctionExpr, Expr, ExprKind, ListElem,
    ListLit, StructLit,
};
pub use feature::{Feature, FeatureExt, LabelClass, Runtime, StringInterner};
pub use kind::{Concreteness, Kind};
pub use op::{Op, RelOp};
pub use sched::RunMode;
pub use unify::{min_runes_builtin, validator};
pub use value::{Disjunction, Validator, Value};
pub use vertex::{ArcType, Vertex, VertexId, VertexStatus};

use std::rc::Rc;

impl OpContext {
    /// Creates the root of an evaluation: a vertex holding the given
    /// expression as its single conjunct.
    pub fn root_vertex(&mut self, x: Rc<Expr>) -> VertexId {
        let v = self.new_vertex(None, Feature::INVALID, ArcType::Member);
        let env = Environment::new(v);
        self.vertex_mut(v)
            .add_conjunct(Conjunct::new(env, x, CloseInfo::default()));
        v
    }

    /// Creates a root vertex unifying several expressions.
    pub fn root_vertex_all(&mut self, xs: Vec<Rc<Expr>>) -> VertexId {
        let v = self.new_vertex(None, Feature::INVALID, ArcType::Member);
        let env = Environment::new(v);
        for x in xs {
            self.vertex_mut(v)
                .add_conjunct(Conjunct::new(env.clone(), x, CloseInfo::default()));
        }
        v
    }
}
