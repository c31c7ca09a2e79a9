use std::fmt::{self, Display};
use std::ops::{BitAnd, BitOr};

/// Kind is a bit set of value kinds. Composite kinds like `NUM` are unions
/// of the base bits, so intersecting two kinds is a bitwise and.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Kind(pub u16);

impl Kind {
    pub const BOTTOM: Kind = Kind(0);

    pub const NULL: Kind = Kind(1 << 0);
    pub const BOOL: Kind = Kind(1 << 1);
    pub const INT: Kind = Kind(1 << 2);
    pub const FLOAT: Kind = Kind(1 << 3);
    pub const STRING: Kind = Kind(1 << 4);
    pub const BYTES: Kind = Kind(1 << 5);
    pub const LIST: Kind = Kind(1 << 6);
    pub const STRUCT: Kind = Kind(1 << 7);

    pub const NUM: Kind = Kind(Self::INT.0 | Self::FLOAT.0);
    pub const SCALAR: Kind = Kind(
        Self::NULL.0 | Self::BOOL.0 | Self::INT.0 | Self::FLOAT.0 | Self::STRING.0 | Self::BYTES.0,
    );
    pub const TOP: Kind = Kind(Self::SCALAR.0 | Self::LIST.0 | Self::STRUCT.0);

    pub fn is_anyof(self, of: Kind) -> bool {
        self.0 & of.0 != 0
    }

    pub fn is_bottom(self) -> bool {
        self.0 == 0
    }

    /// Reports whether this kind corresponds to exactly one base kind.
    pub fn is_single(self) -> bool {
        self.0 != 0 && self.0 & (self.0 - 1) == 0
    }
}

impl BitAnd for Kind {
    type Output = Kind;
    fn bitand(self, rhs: Kind) -> Kind {
        Kind(self.0 & rhs.0)
    }
}

impl BitOr for Kind {
    type Output = Kind;
    fn bitor(self, rhs: Kind) -> Kind {
        Kind(self.0 | rhs.0)
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Kind::BOTTOM => write!(f, "_|_"),
            Kind::TOP => write!(f, "_"),
            Kind::NULL => write!(f, "null"),
            Kind::BOOL => write!(f, "bool"),
            Kind::INT => write!(f, "int"),
            Kind::FLOAT => write!(f, "float"),
            Kind::NUM => write!(f, "number"),
            Kind::STRING => write!(f, "string"),
            Kind::BYTES => write!(f, "bytes"),
            Kind::LIST => write!(f, "list"),
            Kind::STRUCT => write!(f, "struct"),
            k => {
                let mut first = true;
                for (bit, name) in [
                    (Kind::NULL, "null"),
                    (Kind::BOOL, "bool"),
                    (Kind::INT, "int"),
                    (Kind::FLOAT, "float"),
                    (Kind::STRING, "string"),
                    (Kind::BYTES, "bytes"),
                    (Kind::LIST, "list"),
                    (Kind::STRUCT, "struct"),
                ] {
                    if k.is_anyof(bit) {
                        if !first {
                            write!(f, "|")?;
                        }
                        write!(f, "{}", name)?;
                        first = false;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Concreteness is a measure of the level of concreteness of a value, where
/// lower values mean more concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Concreteness {
    BottomLevel,
    Concrete,
    Constraint,
    Type,
    Any,
}

#[test]
fn test_kind_meet() {
    assert_eq!(Kind::NUM & Kind::INT, Kind::INT);
    assert_eq!(Kind::SCALAR & Kind::STRUCT, Kind::BOTTOM);
    assert_eq!(Kind::TOP & Kind::LIST, Kind::LIST);
    assert!((Kind::INT | Kind::STRING).is_anyof(Kind::STRING));
    assert!(!Kind::NUM.is_single());
    assert!(Kind::INT.is_single());
}

#[test]
fn test_kind_format() {
    assert_eq!(format!("{}", Kind::INT), "int");
    assert_eq!(format!("{}", Kind::NUM), "number");
    assert_eq!(format!("{}", Kind::INT | Kind::STRING), "int|string");
    assert_eq!(format!("{}", Kind::BOTTOM), "_|_");
}
