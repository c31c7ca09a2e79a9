use std::fmt::{self, Display};
use std::rc::Rc;

use crate::error::Bottom;
use crate::expr::Builtin;
use crate::kind::{Concreteness, Kind};
use crate::op::RelOp;
use crate::vertex::VertexId;

/// A Value is a fully or partially evaluated result. Values are immutable;
/// larger payloads are shared via `Rc` so cloning is cheap.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Top,

    /// A type restriction such as `int` or `string`.
    BasicType(Kind),

    /// A bound such as `>=3`; the operand is always a concrete scalar.
    Bound(RelOp, Rc<Value>),

    /// A partially applied builtin acting as a validator.
    Validator(Validator),

    /// A set of bounds/validators that could not be folded into one value.
    Conjunction(Rc<[Value]>),

    /// One-of-several alternatives, defaults ordered first.
    Disjunction(Rc<Disjunction>),

    /// Marks a vertex as a struct. Closedness is tracked on the vertex.
    StructMarker,

    /// Marks a vertex as a list; `open` lists accept further elements.
    ListMarker { open: bool },

    /// A reference to an evaluated vertex (shared subtree or disjunct).
    Vertex(VertexId),

    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<str>),

    Bottom(Rc<Bottom>),
}

/// A disjunction result: the surviving alternatives of a disjunction
/// cross product. The first `num_defaults` values are marked defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Disjunction {
    pub values: Vec<Value>,
    pub num_defaults: usize,
    pub has_defaults: bool,
}

impl Disjunction {
    /// The externally visible value: the single default if there is exactly
    /// one, otherwise none.
    pub fn default(&self) -> Option<&Value> {
        if self.num_defaults == 1 {
            self.values.first()
        } else {
            None
        }
    }
}

/// A validator: a builtin plus the arguments it was applied to, minus the
/// value under validation.
#[derive(Debug, Clone)]
pub struct Validator {
    pub builtin: Rc<Builtin>,
    pub args: Vec<Value>,
}

impl PartialEq for Validator {
    fn eq(&self, other: &Self) -> bool {
        self.builtin == other.builtin && self.args == other.args
    }
}

impl Validator {
    /// Applies the validator to a concrete value. Returns the error message
    /// on failure.
    pub fn validate(&self, v: &Value) -> Result<(), String> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(v.clone());
        args.extend(self.args.iter().cloned());
        match (self.builtin.func)(&args) {
            Value::Bool(true) => Ok(()),
            Value::Bottom(b) => Err(b.msg.to_string()),
            _ => Err(format!(
                "invalid value {} (does not satisfy {})",
                v, self.builtin.name
            )),
        }
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Top => Kind::TOP,
            Value::BasicType(k) => *k,
            Value::Bound(_, v) => v.kind(),
            Value::Validator(_) => Kind::TOP,
            Value::Conjunction(vals) => vals.iter().fold(Kind::TOP, |k, v| k & v.kind()),
            Value::Disjunction(d) => d.values.iter().fold(Kind::BOTTOM, |k, v| k | v.kind()),
            Value::StructMarker => Kind::STRUCT,
            Value::ListMarker { .. } => Kind::LIST,
            Value::Vertex(_) => Kind::TOP,
            Value::Null => Kind::NULL,
            Value::Bool(_) => Kind::BOOL,
            Value::Int(_) => Kind::INT,
            Value::Float(_) => Kind::FLOAT,
            Value::Str(_) => Kind::STRING,
            Value::Bytes(_) => Kind::BYTES,
            Value::Bottom(_) => Kind::BOTTOM,
        }
    }

    pub fn concreteness(&self) -> Concreteness {
        match self {
            Value::Top => Concreteness::Any,
            Value::BasicType(_) => Concreteness::Type,
            Value::Bound(..) | Value::Validator(_) | Value::Conjunction(_) => {
                Concreteness::Constraint
            }
            Value::Disjunction(d) => d
                .values
                .iter()
                .map(Value::concreteness)
                .max()
                .unwrap_or(Concreteness::Any),
            Value::Bottom(_) => Concreteness::BottomLevel,
            _ => Concreteness::Concrete,
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.concreteness() <= Concreteness::Concrete
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Value::Bottom(_))
    }

    pub fn bottom(&self) -> Option<&Rc<Bottom>> {
        match self {
            Value::Bottom(b) => Some(b),
            _ => None,
        }
    }

    pub fn to_option(self) -> Option<Value> {
        match self {
            Value::Bottom(_) => None,
            other => Some(other),
        }
    }

    /// Strips a disjunction down to its default, if it has exactly one.
    pub fn default(&self) -> &Value {
        match self {
            Value::Disjunction(d) => d.default().unwrap_or(self),
            _ => self,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        macro_rules! write_separated {
            ($items:expr, $sep:literal) => {{
                let mut first = true;
                for item in $items {
                    if !first {
                        write!(f, $sep)?;
                    }
                    Display::fmt(item, f)?;
                    first = false;
                }
                Ok(())
            }};
        }

        match self {
            Value::Top => write!(f, "_"),

            Value::BasicType(k) => Display::fmt(k, f),
            Value::Bound(op, v) => write!(f, "{}{}", op, v),
            Value::Validator(x) => write!(f, "{}()", x.builtin.name),

            Value::Conjunction(items) => write_separated!(items.iter(), " & "),
            Value::Disjunction(d) => {
                let mut first = true;
                for (i, v) in d.values.iter().enumerate() {
                    if !first {
                        write!(f, " | ")?;
                    }
                    if i < d.num_defaults {
                        write!(f, "*")?;
                    }
                    Display::fmt(v, f)?;
                    first = false;
                }
                Ok(())
            }

            Value::StructMarker => write!(f, "{{...}}"),
            Value::ListMarker { .. } => write!(f, "[...]"),
            Value::Vertex(_) => write!(f, "<node>"),

            Value::Str(val) => write!(f, "\"{}\"", val),
            Value::Bytes(val) => write!(f, "'{}'", val),
            Value::Float(val) => Display::fmt(val, f),
            Value::Int(val) => Display::fmt(val, f),

            Value::Bool(true) => write!(f, "true"),
            Value::Bool(false) => write!(f, "false"),

            Value::Null => write!(f, "null"),

            Value::Bottom(_) => write!(f, "_|_"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.into())
    }
}

impl From<(RelOp, i64)> for Value {
    fn from(value: (RelOp, i64)) -> Value {
        Value::Bound(value.0, Value::Int(value.1).into())
    }
}

impl From<(RelOp, f64)> for Value {
    fn from(value: (RelOp, f64)) -> Value {
        Value::Bound(value.0, Value::Float(value.1).into())
    }
}

impl From<(RelOp, &str)> for Value {
    fn from(value: (RelOp, &str)) -> Value {
        Value::Bound(value.0, Value::Str(value.1.into()).into())
    }
}

impl From<Rc<Bottom>> for Value {
    fn from(value: Rc<Bottom>) -> Value {
        Value::Bottom(value)
    }
}

#[test]
fn test_kind_of_values() {
    assert_eq!(Value::Int(1).kind(), Kind::INT);
    assert_eq!(Value::from((RelOp::GreaterThan, 1)).kind(), Kind::INT);
    assert_eq!(Value::BasicType(Kind::NUM).kind(), Kind::NUM);
    assert_eq!(Value::StructMarker.kind(), Kind::STRUCT);
}

#[test]
fn test_concreteness() {
    assert!(Value::Int(1).is_concrete());
    assert!(Value::Null.is_concrete());
    assert!(!Value::BasicType(Kind::INT).is_concrete());
    assert!(!Value::from((RelOp::GreaterThan, 1)).is_concrete());
    assert!(!Value::Top.is_concrete());
}

#[test]
fn test_format() {
    assert_eq!(format!("{}", Value::Int(1)), "1");
    assert_eq!(format!("{}", Value::from((RelOp::GreaterThan, 1))), ">1");
    assert_eq!(format!("{}", Value::from((RelOp::LessEqual, 1))), "<=1");
    assert_eq!(format!("{}", Value::from("hello")), "\"hello\"");
    assert_eq!(
        format!("{}", Value::from((RelOp::NotEqual, "hello"))),
        "!=\"hello\""
    );
    assert_eq!(format!("{}", Value::BasicType(Kind::STRING)), "string");

    let d = Value::Disjunction(Rc::new(Disjunction {
        values: vec![Value::Int(1), Value::Int(2)],
        num_defaults: 1,
        has_defaults: true,
    }));
    assert_eq!(format!("{}", d), "*1 | 2");
}

#[test]
fn test_default_selection() {
    let d = Value::Disjunction(Rc::new(Disjunction {
        values: vec![Value::Int(1), Value::Int(2)],
        num_defaults: 1,
        has_defaults: true,
    }));
    assert_eq!(d.default(), &Value::Int(1));

    let no_default = Value::Disjunction(Rc::new(Disjunction {
        values: vec![Value::Int(1), Value::Int(2)],
        num_defaults: 0,
        has_defaults: false,
    }));
    assert_eq!(no_default.default(), &no_default);
}
