use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;

use crate::error::{Bottom, ErrorCode};
use crate::op::RelOp;
use crate::value::Value;

/// Session-scoped cache of compiled patterns, keyed by pattern text.
#[derive(Debug, Default)]
pub struct RegexCache {
    map: HashMap<Rc<str>, Rc<Regex>>,
}

impl RegexCache {
    pub fn get(&mut self, pattern: &Rc<str>) -> Result<Rc<Regex>, Rc<Bottom>> {
        if let Some(re) = self.map.get(pattern) {
            return Ok(re.clone());
        }
        match Regex::new(pattern) {
            Ok(re) => {
                let re = Rc::new(re);
                self.map.insert(pattern.clone(), re.clone());
                Ok(re)
            }
            Err(e) => Err(Rc::new(Bottom::new(
                ErrorCode::Eval,
                format!("invalid regexp {:?}: {}", pattern, e),
            ))),
        }
    }
}

/// The result of folding two scalar constraints.
#[derive(Debug, PartialEq)]
pub enum Folded {
    /// The pair collapses to a single value (possibly an exact scalar).
    One(Value),
    /// The pair is contradictory.
    Conflict(Rc<Bottom>),
    /// No simplification applies; keep both.
    Keep,
}

fn conflict(a: &Value, b: &Value) -> Folded {
    Folded::Conflict(Rc::new(Bottom::new(
        ErrorCode::Eval,
        format!("incompatible bounds {} and {}", a, b),
    )))
}

/// Numeric or string ordering of two concrete scalars. Mixed int/float pairs
/// compare numerically. Returns None for non-comparable kinds.
pub fn scalar_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Str(x), Value::Str(y)) => Some(x.as_ref().cmp(y.as_ref())),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.as_ref().cmp(y.as_ref())),
        _ => None,
    }
}

/// Reports whether the concrete scalar `v` satisfies the bound `op b`.
/// Fails with a bottom for kind mismatches and invalid patterns.
pub fn satisfies(
    cache: &mut RegexCache,
    v: &Value,
    op: RelOp,
    b: &Value,
) -> Result<bool, Rc<Bottom>> {
    match op {
        RelOp::Match | RelOp::NotMatch => {
            let (s, pat) = match (v, b) {
                (Value::Str(s), Value::Str(p)) => (s, p),
                (Value::Bytes(s), Value::Bytes(p)) => (s, p),
                _ => {
                    return Err(Rc::new(Bottom::new(
                        ErrorCode::Eval,
                        format!("invalid operand {} for {}{}", v, op, b),
                    )))
                }
            };
            let re = cache.get(pat)?;
            let m = re.is_match(s);
            Ok(if op == RelOp::Match { m } else { !m })
        }
        _ => match scalar_cmp(v, b) {
            Some(ord) => Ok(match op {
                RelOp::NotEqual => ord != Ordering::Equal,
                RelOp::LessThan => ord == Ordering::Less,
                RelOp::LessEqual => ord != Ordering::Greater,
                RelOp::GreaterThan => ord == Ordering::Greater,
                RelOp::GreaterEqual => ord != Ordering::Less,
                _ => false,
            }),
            None => Err(Rc::new(Bottom::new(
                ErrorCode::Eval,
                format!("invalid operand {} for bound {}{}", v, op, b),
            ))),
        },
    }
}

fn bound(op: RelOp, v: &Value) -> Value {
    Value::Bound(op, Rc::new(v.clone()))
}

/// Eagerly folds two scalar-narrowing constraints from different conjuncts.
/// Not required for correctness (concrete values are always re-validated)
/// but required for performance and precise error locations.
pub fn meet_constraints(cache: &mut RegexCache, x: &Value, y: &Value) -> Folded {
    match (x, y) {
        (Value::Bound(opa, a), Value::Bound(opb, b)) => {
            meet_bounds(cache, *opa, a, *opb, b, x, y)
        }
        (Value::Validator(a), Value::Validator(b)) if a == b => Folded::One(x.clone()),
        _ => Folded::Keep,
    }
}

fn meet_bounds(
    cache: &mut RegexCache,
    opa: RelOp,
    a: &Value,
    opb: RelOp,
    b: &Value,
    x: &Value,
    y: &Value,
) -> Folded {
    use RelOp::*;

    // Pattern bounds only interact with identical patterns.
    if !opa.is_ordered() || !opb.is_ordered() {
        return match (opa, opb) {
            (Match, Match) | (NotMatch, NotMatch) if a == b => Folded::One(x.clone()),
            (Match, NotMatch) | (NotMatch, Match) if a == b => conflict(x, y),
            (NotEqual, NotEqual) if a == b => Folded::One(x.clone()),
            (NotEqual, op) if op.is_ordered() => ne_elimination(cache, a, opb, b, x, y),
            (op, NotEqual) if op.is_ordered() => ne_elimination(cache, b, opa, a, y, x),
            _ => Folded::Keep,
        };
    }

    let ord = match scalar_cmp(a, b) {
        Some(ord) => ord,
        None => return conflict(x, y),
    };

    // Same-direction bounds keep the tighter one.
    if opa.is_lower() && opb.is_lower() {
        return Folded::One(match ord {
            Ordering::Greater => x.clone(),
            Ordering::Less => y.clone(),
            Ordering::Equal if opa == GreaterThan => x.clone(),
            Ordering::Equal => y.clone(),
        });
    }
    if opa.is_upper() && opb.is_upper() {
        return Folded::One(match ord {
            Ordering::Less => x.clone(),
            Ordering::Greater => y.clone(),
            Ordering::Equal if opa == LessThan => x.clone(),
            Ordering::Equal => y.clone(),
        });
    }

    // Opposite directions. Normalize to (lower bound lo, upper bound hi).
    let (lo_op, lo, hi_op, hi, lo_val, hi_val) = if opa.is_lower() {
        (opa, a, opb, b, x, y)
    } else {
        (opb, b, opa, a, y, x)
    };
    let ord = scalar_cmp(lo, hi).expect("compared above");

    match ord {
        Ordering::Greater => conflict(lo_val, hi_val),
        Ordering::Equal => match (lo_op, hi_op) {
            (GreaterEqual, LessEqual) => Folded::One(lo.clone()),
            _ => conflict(lo_val, hi_val),
        },
        Ordering::Less => {
            // An integer gap of zero to two collapses to an exact value or a
            // contradiction.
            if let (Value::Int(l), Value::Int(h)) = (lo, hi) {
                let gap = h - l;
                match (lo_op, hi_op) {
                    (GreaterThan, LessThan) if gap == 1 => return conflict(lo_val, hi_val),
                    (GreaterThan, LessThan) if gap == 2 => {
                        return Folded::One(Value::Int(l + 1))
                    }
                    (GreaterEqual, LessThan) if gap == 1 => return Folded::One(Value::Int(*l)),
                    (GreaterThan, LessEqual) if gap == 1 => return Folded::One(Value::Int(*h)),
                    _ => {}
                }
            }
            Folded::Keep
        }
    }
}

/// `!=` combines with inequalities by elimination: if no value can satisfy
/// the inequality while equalling the excluded value, the `!=` is implied;
/// on the boundary the inequality tightens.
fn ne_elimination(
    cache: &mut RegexCache,
    excluded: &Value,
    op: RelOp,
    b: &Value,
    ne_val: &Value,
    bound_val: &Value,
) -> Folded {
    match scalar_cmp(excluded, b) {
        Some(Ordering::Equal) => match op {
            RelOp::LessEqual => Folded::One(bound(RelOp::LessThan, b)),
            RelOp::GreaterEqual => Folded::One(bound(RelOp::GreaterThan, b)),
            // != b & < b, != b & > b: the bound already excludes b.
            _ => Folded::One(bound_val.clone()),
        },
        Some(_) => match satisfies(cache, excluded, op, b) {
            Ok(true) => Folded::Keep,
            Ok(false) => Folded::One(bound_val.clone()),
            Err(e) => Folded::Conflict(e),
        },
        None => conflict(ne_val, bound_val),
    }
}

/// Folds a new constraint into an accumulated list, pairwise. Returns the
/// contradiction, if any.
pub fn add_constraint(
    cache: &mut RegexCache,
    checks: &mut Vec<Value>,
    mut v: Value,
) -> Option<Rc<Bottom>> {
    let mut i = 0;
    while i < checks.len() {
        match meet_constraints(cache, &checks[i], &v) {
            Folded::One(folded) => {
                // The folded value subsumes the pair; restart the scan since
                // it may now fold with earlier entries.
                checks.remove(i);
                v = folded;
                i = 0;
            }
            Folded::Conflict(b) => return Some(b),
            Folded::Keep => i += 1,
        }
    }
    checks.push(v);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(op: RelOp, v: i64) -> Value {
        Value::from((op, v))
    }

    fn fold(x: Value, y: Value) -> Folded {
        meet_constraints(&mut RegexCache::default(), &x, &y)
    }

    macro_rules! assert_fold {
        (($($a:tt)+) & ($($b:tt)+) == keep) => {
            assert_eq!(fold(bnd!($($a)+), bnd!($($b)+)), Folded::Keep)
        };
        (($($a:tt)+) & ($($b:tt)+) == conflict) => {
            assert!(matches!(fold(bnd!($($a)+), bnd!($($b)+)), Folded::Conflict(_)))
        };
        (($($a:tt)+) & ($($b:tt)+) == ($($c:tt)+)) => {
            assert_eq!(fold(bnd!($($a)+), bnd!($($b)+)), Folded::One(bnd!($($c)+)))
        };
    }

    macro_rules! bnd {
        (> $a:literal) => { b(RelOp::GreaterThan, $a) };
        (>= $a:literal) => { b(RelOp::GreaterEqual, $a) };
        (< $a:literal) => { b(RelOp::LessThan, $a) };
        (<= $a:literal) => { b(RelOp::LessEqual, $a) };
        (!= $a:literal) => { b(RelOp::NotEqual, $a) };
        ($a:literal) => { Value::Int($a) };
    }

    #[test]
    fn same_direction_keeps_tighter() {
        assert_fold!((>10) & (>1) == (>10));
        assert_fold!((>10) & (>100) == (>100));
        assert_fold!((>10) & (>=10) == (>10));
        assert_fold!((>10) & (>=100) == (>=100));
        assert_fold!((>=10) & (>=1) == (>=10));
        assert_fold!((<10) & (<1) == (<1));
        assert_fold!((<10) & (<=1) == (<=1));
        assert_fold!((<10) & (<=10) == (<10));
        assert_fold!((<=10) & (<100) == (<=10));
    }

    #[test]
    fn opposite_direction_collapse() {
        assert_fold!((>=3) & (<=3) == (3));
        assert_fold!((>3) & (<3) == conflict);
        assert_fold!((>3) & (<4) == conflict);
        assert_fold!((>3) & (<5) == (4));
        assert_fold!((>=3) & (<4) == (3));
        assert_fold!((>3) & (<=4) == (4));
        assert_fold!((>=10) & (<=1) == conflict);
        assert_fold!((>10) & (<=10) == conflict);
        assert_fold!((>=10) & (<100) == keep);
    }

    #[test]
    fn not_equal_elimination() {
        assert_fold!((!=5) & (<5) == (<5));
        assert_fold!((!=10) & (>10) == (>10));
        assert_fold!((!=10) & (>=10) == (>10));
        assert_fold!((!=10) & (<=10) == (<10));
        assert_fold!((!=10) & (<100) == keep);
        assert_fold!((!=1) & (<10) == keep);
        assert_fold!((!=10) & (!=10) == (!=10));
        assert_fold!((!=10) & (!=11) == keep);
    }

    #[test]
    fn float_bounds_do_not_collapse_gaps() {
        let x = Value::from((RelOp::GreaterThan, 3.0));
        let y = Value::from((RelOp::LessThan, 5.0));
        assert_eq!(fold(x, y), Folded::Keep);

        let x = Value::from((RelOp::GreaterThan, 5.0));
        let y = Value::from((RelOp::LessThan, 3.0));
        assert!(matches!(fold(x, y), Folded::Conflict(_)));
    }

    #[test]
    fn pattern_bounds() {
        let m = Value::from((RelOp::Match, "^a"));
        let nm = Value::from((RelOp::NotMatch, "^a"));
        let other = Value::from((RelOp::Match, "^b"));
        assert_eq!(fold(m.clone(), m.clone()), Folded::One(m.clone()));
        assert!(matches!(fold(m.clone(), nm), Folded::Conflict(_)));
        assert_eq!(fold(m, other), Folded::Keep);
    }

    #[test]
    fn satisfies_concrete() {
        let mut cache = RegexCache::default();
        let mut ok = |v: Value, op, b: Value| satisfies(&mut cache, &v, op, &b).unwrap();
        assert!(ok(Value::Int(2), RelOp::GreaterThan, Value::Int(1)));
        assert!(!ok(Value::Int(1), RelOp::GreaterThan, Value::Int(1)));
        assert!(ok(Value::Int(1), RelOp::GreaterEqual, Value::Int(1)));
        assert!(ok(Value::from("abc"), RelOp::Match, Value::from("^a")));
        assert!(!ok(Value::from("abc"), RelOp::NotMatch, Value::from("^a")));
        assert!(ok(Value::Float(1.5), RelOp::LessThan, Value::Int(2)));
    }

    #[test]
    fn satisfies_kind_mismatch() {
        let mut cache = RegexCache::default();
        let err = satisfies(
            &mut cache,
            &Value::from("x"),
            RelOp::GreaterThan,
            &Value::Int(1),
        );
        assert!(err.is_err());
    }

    #[test]
    fn constraint_accumulation() {
        let mut cache = RegexCache::default();
        let mut checks = Vec::new();
        assert!(add_constraint(&mut cache, &mut checks, bnd!(>=3)).is_none());
        assert!(add_constraint(&mut cache, &mut checks, bnd!(<=3)).is_none());
        assert_eq!(checks, vec![Value::Int(3)]);

        let mut checks = Vec::new();
        assert!(add_constraint(&mut cache, &mut checks, bnd!(>3)).is_none());
        assert!(add_constraint(&mut cache, &mut checks, bnd!(<3)).is_some());
    }
}
