use std::rc::Rc;

use rpds::List;

use crate::closectx::CloseId;
use crate::environment::Env;
use crate::expr::{Expr, RefId};
use crate::value::Value;
use crate::vertex::VertexId;

/// A Conjunct is one unevaluated contribution to a vertex's value: an
/// expression (or already-evaluated value) paired with the scope it must be
/// evaluated in, plus closedness and cycle metadata. Conjuncts are immutable
/// and owned by exactly one vertex's list, or transiently by the per-vertex
/// workspace while being scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct Conjunct {
    pub env: Env,
    pub x: Elem,
    pub ci: CloseInfo,
}

impl Conjunct {
    pub fn new(env: Env, x: impl Into<Elem>, ci: CloseInfo) -> Conjunct {
        Conjunct {
            env,
            x: x.into(),
            ci,
        }
    }
}

/// The payload of a conjunct.
#[derive(Debug, Clone, PartialEq)]
pub enum Elem {
    Expr(Rc<Expr>),
    Value(Value),
}

impl From<Rc<Expr>> for Elem {
    fn from(x: Rc<Expr>) -> Elem {
        Elem::Expr(x)
    }
}

impl From<Value> for Elem {
    fn from(v: Value) -> Elem {
        Elem::Value(v)
    }
}

/// Span bits recording which optional constructs a conjunct passed through
/// on its way to a vertex. They determine closedness checking and whether
/// the cycle detector treats the conjunct as optional.
pub type SpanMask = u8;

pub const SPAN_EMBEDDING: SpanMask = 1 << 0;
pub const SPAN_CONSTRAINT: SpanMask = 1 << 1;
pub const SPAN_COMPREHENSION: SpanMask = 1 << 2;
pub const SPAN_DEFINITION: SpanMask = 1 << 3;
pub const SPAN_DISJUNCTION: SpanMask = 1 << 4;

/// CloseInfo is the closedness and cycle metadata carried by a conjunct.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloseInfo {
    /// The closedness scope this conjunct belongs to, if any.
    pub cc: Option<CloseId>,

    pub from_def: bool,
    pub from_embed: bool,
    pub spans: SpanMask,

    pub cycle: CycleInfo,
}

impl CloseInfo {
    pub fn spawn_span(&self, span: SpanMask) -> CloseInfo {
        let mut ci = self.clone();
        ci.spans |= span;
        ci
    }

    /// Whether this conjunct reached the vertex through a construct that
    /// tolerates cycles (pattern constraints, optional fields, disjunction
    /// branches).
    pub fn is_optional_path(&self) -> bool {
        self.spans & (SPAN_CONSTRAINT | SPAN_DISJUNCTION) != 0
    }
}

/// The per-conjunct cycle bookkeeping of the cycle detector.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleInfo {
    pub cycle_type: CyclicType,

    /// This conjunct, or one of its ancestors, had a violating cycle.
    pub is_cyclic: bool,

    /// The conjunct is part of an expression referencing itself, e.g. the
    /// result of evaluating `{x: out, out: x}.out`.
    pub inline: bool,

    /// Tracked references: every reference traversed while evaluating this
    /// conjunct or its ancestors. Persistent so that conjunct splitting
    /// shares the tail.
    pub refs: List<RefEntry>,
}

/// The cycle classification of a conjunct; it may only increase in value for
/// child conjuncts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CyclicType {
    #[default]
    NoCycle,

    /// Derived from an optional construct; on a first cycle this moves to
    /// MaybeCyclic instead of IsCyclic.
    IsOptional,

    /// A cycle was detected within an optional construct; the reference
    /// history was cleared and the conjunct granted one more iteration.
    MaybeCyclic,

    /// The conjunct has a structural cycle.
    IsCyclic,
}

/// One tracked reference: the reference expression, the vertex it resolved
/// to, the vertex whose conjunct traversed it, and the tree depth at the
/// time of traversal (used to find "new structure" between the cycle ends).
#[derive(Debug, Clone, PartialEq)]
pub struct RefEntry {
    pub reference: RefId,
    pub arc: VertexId,
    pub node: VertexId,
    pub depth: u32,
}

impl Default for CycleInfo {
    fn default() -> CycleInfo {
        CycleInfo {
            cycle_type: CyclicType::default(),
            is_cyclic: false,
            inline: false,
            refs: List::new(),
        }
    }
}

impl CycleInfo {
    pub fn track(&mut self, reference: RefId, arc: VertexId, node: VertexId, depth: u32) {
        self.refs = self.refs.push_front(RefEntry {
            reference,
            arc,
            node,
            depth,
        });
    }

    pub fn seen(&self, reference: &RefId, arc: VertexId) -> Option<&RefEntry> {
        self.refs
            .iter()
            .find(|r| r.reference == *reference || r.arc == arc)
    }

    /// Grants the single grace iteration: history is cleared and the
    /// conjunct allowed to run once more before a structural cycle is
    /// declared.
    pub fn grant_grace(&mut self) {
        self.cycle_type = CyclicType::MaybeCyclic;
        self.refs = List::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::expr::ExprKind;

    #[test]
    fn tracked_references_are_shared_on_clone() {
        let r = RefId(Expr::new(ExprKind::FieldRef {
            up: 0,
            label: crate::feature::Feature::INVALID,
        }));
        let mut ci = CycleInfo::default();
        ci.track(r.clone(), VertexId(1), VertexId(0), 1);

        let child = ci.clone();
        assert!(child.seen(&r, VertexId(9)).is_some());
        assert!(child.seen(&r, VertexId(1)).is_some());

        let other = RefId(Expr::new(ExprKind::FieldRef {
            up: 1,
            label: crate::feature::Feature::INVALID,
        }));
        // Same arc counts as a repeat even through a different reference.
        assert!(child.seen(&other, VertexId(1)).is_some());
        assert!(child.seen(&other, VertexId(2)).is_none());
    }

    #[test]
    fn grace_clears_history() {
        let r = RefId(Expr::new(ExprKind::FieldRef {
            up: 0,
            label: crate::feature::Feature::INVALID,
        }));
        let mut ci = CycleInfo::default();
        ci.cycle_type = CyclicType::IsOptional;
        ci.track(r.clone(), VertexId(1), VertexId(0), 1);
        ci.grant_grace();
        assert_eq!(ci.cycle_type, CyclicType::MaybeCyclic);
        assert!(ci.seen(&r, VertexId(1)).is_none());
    }

    #[test]
    fn conjunct_construction() {
        let env = Environment::new(VertexId(0));
        let c = Conjunct::new(env, Value::Int(1), CloseInfo::default());
        assert!(matches!(c.x, Elem::Value(Value::Int(1))));
        assert!(!c.ci.is_optional_path());
        let c2 = Conjunct {
            ci: c.ci.spawn_span(SPAN_CONSTRAINT),
            ..c
        };
        assert!(c2.ci.is_optional_path());
    }
}
