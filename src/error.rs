use std::fmt::{self, Display};
use std::rc::Rc;

use crate::vertex::VertexId;

/// A source position carried by expressions and accumulated into errors.
/// The evaluator never interprets positions; it only collects and reports
/// them. `Pos::NONE` marks synthesized expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pos(pub u32);

impl Pos {
    pub const NONE: Pos = Pos(u32::MAX);

    pub fn is_some(self) -> bool {
        self != Pos::NONE
    }
}

/// ErrorCode indicates the type of error. The type of error may influence
/// control flow; no other aspect of an error may. Smaller discriminants are
/// more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCode {
    /// A fatal evaluation error: conflicting values, disallowed fields.
    Eval,

    /// A fatal error authored by the user (explicit bottom).
    User,

    /// A structural cycle. Permanent, but locally scoped: unifying a cyclic
    /// value with a non-cyclic one may still succeed, so it is not passed up
    /// recursively.
    StructuralCycle,

    /// Missing information that may still be supplied later.
    Incomplete,

    /// A reference cycle. Recoverable: a concrete value may break it.
    Cycle,
}

impl ErrorCode {
    pub fn is_incomplete(self) -> bool {
        matches!(self, ErrorCode::Incomplete | ErrorCode::Cycle)
    }
}

/// Bottom is the error value. It flows through the same channels as any
/// computed value and doubles as a control signal via its code.
#[derive(Debug, Clone, PartialEq)]
pub struct Bottom {
    pub code: ErrorCode,
    pub msg: Rc<str>,

    /// Positions of the conjuncts that contributed to this error.
    pub positions: Vec<Pos>,

    /// An incomplete error that can no longer be resolved by adding
    /// information, e.g. after a forced finalize.
    pub permanent: bool,

    /// The error originates from a child arc rather than this node itself.
    pub child_error: bool,

    /// The error originates from a failed lookup.
    pub not_exists: bool,

    /// The node at which the error occurred.
    pub node: Option<VertexId>,
}

impl Bottom {
    pub fn new(code: ErrorCode, msg: impl Into<Rc<str>>) -> Bottom {
        Bottom {
            code,
            msg: msg.into(),
            positions: Vec::new(),
            permanent: false,
            child_error: false,
            not_exists: false,
            node: None,
        }
    }

    pub fn with_pos(mut self, pos: Pos) -> Bottom {
        if pos.is_some() {
            self.positions.push(pos);
        }
        self
    }

    pub fn at(mut self, node: VertexId) -> Bottom {
        self.node = Some(node);
        self
    }

    pub fn is_incomplete(&self) -> bool {
        !self.permanent && self.code.is_incomplete()
    }
}

impl Display for Bottom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

/// Combines two errors originating at the same vertex. The worse code wins;
/// identical errors collapse; errors of the same severity merge their
/// messages and positions.
pub fn combine(x: Option<Rc<Bottom>>, y: Option<Rc<Bottom>>) -> Option<Rc<Bottom>> {
    let (a, b) = match (x, y) {
        (None, None) => return None,
        (Some(a), None) => return Some(a),
        (None, Some(b)) => return Some(b),
        (Some(a), Some(b)) => (a, b),
    };
    if Rc::ptr_eq(&a, &b) || *a == *b {
        return Some(a);
    }
    if a.code != b.code {
        let (worse, better) = if a.code < b.code { (a, b) } else { (b, a) };
        if better.code.is_incomplete() {
            return Some(worse);
        }
        let mut merged = (*worse).clone();
        merged.positions.extend(better.positions.iter().copied());
        return Some(Rc::new(merged));
    }
    let mut merged = (*a).clone();
    if a.msg != b.msg {
        merged.msg = format!("{} (and {})", a.msg, b.msg).into();
    }
    for p in &b.positions {
        if !merged.positions.contains(p) {
            merged.positions.push(*p);
        }
    }
    merged.permanent = a.permanent || b.permanent;
    Some(Rc::new(merged))
}

/// The error surfaced by the validate entry point once evaluation has been
/// forced to completion.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ValidateError {
    #[error("{msg}")]
    Eval { msg: Rc<str> },
    #[error("structural cycle: {msg}")]
    StructuralCycle { msg: Rc<str> },
    #[error("incomplete value: {msg}")]
    Incomplete { msg: Rc<str> },
}

impl ValidateError {
    pub fn from_bottom(b: &Bottom) -> ValidateError {
        match b.code {
            ErrorCode::StructuralCycle => ValidateError::StructuralCycle { msg: b.msg.clone() },
            ErrorCode::Incomplete | ErrorCode::Cycle => {
                ValidateError::Incomplete { msg: b.msg.clone() }
            }
            _ => ValidateError::Eval { msg: b.msg.clone() },
        }
    }
}

#[test]
fn test_severity_order() {
    assert!(ErrorCode::Eval < ErrorCode::User);
    assert!(ErrorCode::User < ErrorCode::StructuralCycle);
    assert!(ErrorCode::StructuralCycle < ErrorCode::Incomplete);
    assert!(ErrorCode::Incomplete < ErrorCode::Cycle);
    assert!(ErrorCode::Cycle.is_incomplete());
    assert!(!ErrorCode::StructuralCycle.is_incomplete());
}

#[test]
fn test_combine_severity_wins() {
    let eval = Rc::new(Bottom::new(ErrorCode::Eval, "conflict"));
    let inc = Rc::new(Bottom::new(ErrorCode::Incomplete, "missing"));
    let out = combine(Some(inc.clone()), Some(eval.clone())).unwrap();
    assert_eq!(out.code, ErrorCode::Eval);
    assert_eq!(out.msg, eval.msg);

    let out = combine(Some(eval.clone()), Some(eval.clone())).unwrap();
    assert_eq!(out.code, ErrorCode::Eval);
}

#[test]
fn test_combine_accumulates_positions() {
    let a = Rc::new(Bottom::new(ErrorCode::Eval, "boom").with_pos(Pos(1)));
    let b = Rc::new(Bottom::new(ErrorCode::Eval, "boom").with_pos(Pos(2)));
    let out = combine(Some(a), Some(b)).unwrap();
    assert_eq!(out.positions, vec![Pos(1), Pos(2)]);
}
