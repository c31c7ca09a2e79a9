use std::fmt::{self, Display};

/// RelOp is a relational operator that narrows a scalar value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    NotEqual,

    LessThan,
    LessEqual,

    GreaterThan,
    GreaterEqual,

    Match,
    NotMatch,
}

impl RelOp {
    /// The complementary bound, e.g. `>` for `<=`.
    pub fn negated(self) -> RelOp {
        match self {
            RelOp::NotEqual => RelOp::NotEqual,
            RelOp::LessThan => RelOp::GreaterEqual,
            RelOp::LessEqual => RelOp::GreaterThan,
            RelOp::GreaterThan => RelOp::LessEqual,
            RelOp::GreaterEqual => RelOp::LessThan,
            RelOp::Match => RelOp::NotMatch,
            RelOp::NotMatch => RelOp::Match,
        }
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            RelOp::LessThan | RelOp::LessEqual | RelOp::GreaterThan | RelOp::GreaterEqual
        )
    }

    pub fn is_upper(self) -> bool {
        matches!(self, RelOp::LessThan | RelOp::LessEqual)
    }

    pub fn is_lower(self) -> bool {
        matches!(self, RelOp::GreaterThan | RelOp::GreaterEqual)
    }
}

impl Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::NotEqual => "!=",
            RelOp::LessThan => "<",
            RelOp::LessEqual => "<=",
            RelOp::GreaterThan => ">",
            RelOp::GreaterEqual => ">=",
            RelOp::Match => "=~",
            RelOp::NotMatch => "!~",
        };
        write!(f, "{}", s)
    }
}

/// Op is the operator of a unary or binary expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    And,
    Or,

    BoolAnd,
    BoolOr,

    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Match,
    NotMatch,

    Add,
    Subtract,
    Multiply,
    Divide,

    IntDivide,
    IntModulo,

    Not,
}

impl Op {
    /// The RelOp for comparison operators that double as bounds.
    pub fn rel_op(self) -> Option<RelOp> {
        match self {
            Op::NotEqual => Some(RelOp::NotEqual),
            Op::LessThan => Some(RelOp::LessThan),
            Op::LessEqual => Some(RelOp::LessEqual),
            Op::GreaterThan => Some(RelOp::GreaterThan),
            Op::GreaterEqual => Some(RelOp::GreaterEqual),
            Op::Match => Some(RelOp::Match),
            Op::NotMatch => Some(RelOp::NotMatch),
            _ => None,
        }
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::And => "&",
            Op::Or => "|",
            Op::BoolAnd => "&&",
            Op::BoolOr => "||",
            Op::Equal => "==",
            Op::NotEqual => "!=",
            Op::LessThan => "<",
            Op::LessEqual => "<=",
            Op::GreaterThan => ">",
            Op::GreaterEqual => ">=",
            Op::Match => "=~",
            Op::NotMatch => "!~",
            Op::Add => "+",
            Op::Subtract => "-",
            Op::Multiply => "*",
            Op::Divide => "/",
            Op::IntDivide => "div",
            Op::IntModulo => "mod",
            Op::Not => "!",
        };
        write!(f, "{}", s)
    }
}
