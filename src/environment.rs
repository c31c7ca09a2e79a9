use std::cell::RefCell;
use std::rc::Rc;

use rpds::HashTrieMap;

use crate::expr::Expr;
use crate::feature::Feature;
use crate::value::Value;
use crate::vertex::VertexId;

pub type Env = Rc<Environment>;

/// Environment is the lexical scope chain used to resolve references.
/// References carry a relative up-count; walking `up` that many links yields
/// the vertex the reference is relative to.
#[derive(Debug, Clone)]
pub struct Environment {
    pub up: Option<Env>,
    pub vertex: VertexId,

    /// Set when instantiating a field from a pattern constraint; resolves
    /// label references inside the constraint body.
    pub dynamic_label: Option<Feature>,

    /// Caches evaluation of dynamic label and pattern filter expressions so
    /// repeated instantiations agree.
    cache: RefCell<HashTrieMap<usize, Value>>,
}

impl Environment {
    pub fn new(vertex: VertexId) -> Env {
        Rc::new(Environment {
            up: None,
            vertex,
            dynamic_label: None,
            cache: RefCell::new(HashTrieMap::new()),
        })
    }

    pub fn derive(self: &Env, vertex: VertexId) -> Env {
        Rc::new(Environment {
            up: Some(self.clone()),
            vertex,
            dynamic_label: None,
            cache: RefCell::new(HashTrieMap::new()),
        })
    }

    pub fn derive_dynamic(self: &Env, vertex: VertexId, label: Feature) -> Env {
        Rc::new(Environment {
            up: Some(self.clone()),
            vertex,
            dynamic_label: Some(label),
            cache: RefCell::new(HashTrieMap::new()),
        })
    }

    /// A copy of this scope with the dynamic label set, used when
    /// instantiating a pattern constraint for a matched field.
    pub fn with_dynamic(env: &Env, label: Feature) -> Env {
        Rc::new(Environment {
            up: env.up.clone(),
            vertex: env.vertex,
            dynamic_label: Some(label),
            cache: RefCell::new(HashTrieMap::new()),
        })
    }

    /// Walks `count` scopes outward. The chain is built by the evaluator, so
    /// a too-large up-count is a compiler bug; it reports None rather than
    /// panicking so the caller can produce an error value.
    pub fn up(self: &Env, count: u32) -> Option<Env> {
        let mut e = self.clone();
        for _ in 0..count {
            e = e.up.clone()?;
        }
        Some(e)
    }

    /// The nearest dynamic label in scope after walking `count` scopes out.
    pub fn dynamic_label_at(self: &Env, count: u32) -> Option<Feature> {
        self.up(count)?.dynamic_label
    }

    pub fn cached(&self, x: &Rc<Expr>) -> Option<Value> {
        self.cache.borrow().get(&(Rc::as_ptr(x) as usize)).cloned()
    }

    pub fn insert_cache(&self, x: &Rc<Expr>, v: Value) {
        let mut cache = self.cache.borrow_mut();
        let next = cache.insert(Rc::as_ptr(x) as usize, v);
        *cache = next;
    }
}

impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        self.vertex == other.vertex
            && self.dynamic_label == other.dynamic_label
            && match (&self.up, &other.up) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b) || a == b,
                _ => false,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprKind;

    #[test]
    fn up_count_walking() {
        let root = Environment::new(VertexId(0));
        let child = root.derive(VertexId(1));
        let grand = child.derive(VertexId(2));

        assert_eq!(grand.up(0).unwrap().vertex, VertexId(2));
        assert_eq!(grand.up(1).unwrap().vertex, VertexId(1));
        assert_eq!(grand.up(2).unwrap().vertex, VertexId(0));
        assert!(grand.up(3).is_none());
    }

    #[test]
    fn eval_cache_roundtrip() {
        let env = Environment::new(VertexId(0));
        let x = Expr::new(ExprKind::Int(1));
        assert_eq!(env.cached(&x), None);
        env.insert_cache(&x, Value::Int(1));
        assert_eq!(env.cached(&x), Some(Value::Int(1)));
    }
}
