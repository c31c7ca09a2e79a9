use std::rc::Rc;

use crate::closectx::CloseId;
use crate::conjunct::{CloseInfo, Conjunct, RefEntry};
use crate::error::Bottom;
use crate::feature::Feature;
use crate::kind::Kind;
use crate::value::Value;

/// Index of a vertex in the session arena. Only the parent-to-child arc edge
/// is owning; all other edges (parent back-references, notifications,
/// dependency edges) are bare ids with no ownership implication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub u32);

impl VertexId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The index of an in-progress per-vertex workspace in the session pool,
/// tagged with the pool generation to catch stale handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId {
    pub index: u32,
    pub generation: u32,
}

/// ArcType indicates the level of optionality of an arc. The order matters:
/// an arc type may only be updated to a smaller (more definite) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArcType {
    /// A normal member field, including hidden and definition fields.
    Member,

    /// A field that must be specified, of the form `foo!`.
    Required,

    /// A constraint of the form `foo?`, applied only if the field is defined.
    Optional,

    /// Not yet known whether the arc exists; its conjuncts need processing
    /// to find out. Used for arcs provisionally added by comprehensions.
    Pending,

    /// The arc turned out not to be present; needs no further processing.
    NotPresent,
}

impl ArcType {
    pub fn definitely_exists(self) -> bool {
        self < ArcType::Pending
    }

    pub fn is_constraint(self) -> bool {
        matches!(self, ArcType::Optional | ArcType::Required)
    }

    pub fn suffix(self) -> &'static str {
        match self {
            ArcType::Optional => "?",
            ArcType::Required => "!",
            _ => "",
        }
    }
}

/// The evaluation progress of a vertex. Monotonic, except that a vertex at
/// `Conjuncts` may regress one step to `Partial` for re-entrant evaluation.
/// `Evaluating` and `EvaluatingArcs` double as cycle flags: reaching a
/// vertex in one of these states through a reference indicates a reference
/// or structural cycle respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VertexStatus {
    Unprocessed,
    Evaluating,
    Partial,
    Conjuncts,
    EvaluatingArcs,
    Finalized,
}

/// A Vertex is a node in the evaluated value tree. Arcs are ordered and have
/// unique labels; conjuncts only accumulate; the base value may be replaced
/// only by something no less specific.
#[derive(Debug)]
pub struct Vertex {
    pub parent: Option<VertexId>,
    pub label: Feature,

    pub arc_type: ArcType,
    pub status: VertexStatus,

    /// The value of this vertex: a scalar, a struct/list marker, a
    /// disjunction, an error, or a reference to a shared vertex.
    pub base_value: Option<Value>,

    /// Aggregate error of descendant arcs.
    pub child_errors: Option<Rc<Bottom>>,

    pub arcs: Vec<VertexId>,
    pub conjuncts: Vec<Conjunct>,

    /// One entry per struct literal conjunct; used for closedness checking.
    pub structs: Vec<StructInfo>,

    /// Constraints matching labels dynamically; conjuncts for matching
    /// existing arcs are mixed in as the arcs appear.
    pub pattern_constraints: Vec<PatternConstraint>,

    /// Recursively closed: the vertex is part of a definition, or one of its
    /// (ancestor) conjuncts is.
    pub closed_recursive: bool,

    /// Closed at this level only.
    pub closed_non_recursive: bool,

    /// Open by means of an ellipsis.
    pub has_ellipsis: bool,

    /// Once locked, no new arcs may be created.
    pub lock_arcs: bool,

    /// Computed as part of an expression; not part of the static tree.
    pub is_dynamic: bool,

    /// This vertex holds an entry of another vertex's pattern constraints.
    pub is_pattern_constraint: bool,

    /// A disjunct produced by the disjunction engine.
    pub is_disjunct: bool,

    pub is_cyclic: bool,

    /// In-progress workspace, if any.
    pub state: Option<NodeId>,

    /// Root closedness scope, created lazily.
    pub cc: Option<CloseId>,

    /// References that were found to cycle through this vertex; used to
    /// shorten the detection path for values referencing this one.
    pub cyclic_references: Vec<RefEntry>,
}

impl Vertex {
    pub fn new(parent: Option<VertexId>, label: Feature, arc_type: ArcType) -> Vertex {
        Vertex {
            parent,
            label,
            arc_type,
            status: VertexStatus::Unprocessed,
            base_value: None,
            child_errors: None,
            arcs: Vec::new(),
            conjuncts: Vec::new(),
            structs: Vec::new(),
            pattern_constraints: Vec::new(),
            closed_recursive: false,
            closed_non_recursive: false,
            has_ellipsis: false,
            lock_arcs: false,
            is_dynamic: false,
            is_pattern_constraint: false,
            is_disjunct: false,
            is_cyclic: false,
            state: None,
            cc: None,
            cyclic_references: Vec::new(),
        }
    }

    /// Updates the arc type if `t` is more definite. NotPresent is terminal.
    pub fn update_arc_type(&mut self, t: ArcType) {
        if t >= self.arc_type || self.arc_type == ArcType::NotPresent {
            return;
        }
        self.arc_type = t;
    }

    /// A "value" field, not a constraint or pending arc.
    pub fn is_defined(&self) -> bool {
        self.arc_type == ArcType::Member
    }

    pub fn update_status(&mut self, s: VertexStatus) {
        debug_assert!(
            s >= self.status
                || (self.status == VertexStatus::Conjuncts && s == VertexStatus::Partial),
            "status regression {:?} -> {:?}",
            self.status,
            s
        );
        self.status = s;
    }

    pub fn is_finalized(&self) -> bool {
        self.status == VertexStatus::Finalized
    }

    pub fn value(&self) -> Option<&Value> {
        self.base_value.as_ref()
    }

    pub fn bottom(&self) -> Option<&Rc<Bottom>> {
        match &self.base_value {
            Some(Value::Bottom(b)) => Some(b),
            _ => None,
        }
    }

    pub fn is_err(&self) -> bool {
        self.bottom().is_some()
    }

    pub fn kind(&self) -> Kind {
        match &self.base_value {
            Some(v) => v.kind(),
            None => Kind::TOP,
        }
    }

    /// Whether this vertex rejects field names not explicitly anticipated.
    /// Closedness composes: any closing conjunct closes the vertex unless a
    /// total ellipsis keeps it open.
    pub fn is_closed_struct(&self) -> bool {
        if self.has_ellipsis {
            return false;
        }
        self.closed_recursive || self.closed_non_recursive
    }

    pub fn is_closed_list(&self) -> bool {
        matches!(self.base_value, Some(Value::ListMarker { open: false }))
    }

    pub fn is_list(&self) -> bool {
        matches!(self.base_value, Some(Value::ListMarker { .. }))
    }

    /// Whether there is a path from the root of the tree to this vertex.
    pub fn rooted(&self) -> bool {
        !self.is_dynamic && !self.label.is_let()
    }

    pub fn add_conjunct(&mut self, c: Conjunct) {
        self.conjuncts.push(c);
    }
}

/// One struct literal that contributed conjuncts to a vertex. The field list
/// plus pattern/ellipsis information drives the "field not allowed" check.
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub fields: Vec<Feature>,
    pub has_patterns: bool,
    pub has_ellipsis: bool,
    pub is_def: bool,
    pub is_embed: bool,
    pub cc: Option<CloseId>,
}

impl StructInfo {
    /// A struct only participates in acceptance checking when it closes the
    /// vertex on its own account.
    pub fn use_for_accept(&self) -> bool {
        !self.is_embed
    }
}

/// A pattern constraint: the evaluated filter value and the conjuncts to
/// apply to every arc whose label matches the filter.
#[derive(Debug, Clone)]
pub struct PatternConstraint {
    pub pattern: Value,
    pub conjuncts: Vec<Conjunct>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_type_ordering() {
        assert!(ArcType::Member < ArcType::Required);
        assert!(ArcType::Required < ArcType::Optional);
        assert!(ArcType::Optional < ArcType::Pending);
        assert!(ArcType::Pending < ArcType::NotPresent);
        assert!(ArcType::Member.definitely_exists());
        assert!(ArcType::Optional.definitely_exists());
        assert!(!ArcType::Pending.definitely_exists());
    }

    #[test]
    fn arc_type_only_narrows() {
        let mut v = Vertex::new(None, Feature::INVALID, ArcType::Optional);
        v.update_arc_type(ArcType::Member);
        assert_eq!(v.arc_type, ArcType::Member);
        v.update_arc_type(ArcType::Optional);
        assert_eq!(v.arc_type, ArcType::Member);

        let mut v = Vertex::new(None, Feature::INVALID, ArcType::NotPresent);
        v.update_arc_type(ArcType::Member);
        assert_eq!(v.arc_type, ArcType::NotPresent);
    }

    #[test]
    fn status_progression() {
        let mut v = Vertex::new(None, Feature::INVALID, ArcType::Member);
        v.update_status(VertexStatus::Evaluating);
        v.update_status(VertexStatus::Partial);
        v.update_status(VertexStatus::Conjuncts);
        // The one permitted regression, for re-entrant partial evaluation.
        v.update_status(VertexStatus::Partial);
        v.update_status(VertexStatus::EvaluatingArcs);
        v.update_status(VertexStatus::Finalized);
        assert!(v.is_finalized());
    }

    #[test]
    fn closedness_composition() {
        let mut v = Vertex::new(None, Feature::INVALID, ArcType::Member);
        assert!(!v.is_closed_struct());
        v.closed_recursive = true;
        assert!(v.is_closed_struct());
        v.has_ellipsis = true;
        assert!(!v.is_closed_struct());
    }
}
