//! Diagnostic side channel: renders the dependency state of an evaluation
//! as a mermaid graph, with closeContexts as nodes and typed dependency
//! counts on them. Useful for debugging non-terminating or leaking
//! evaluations; never required for correctness.

use std::fmt::Write;

use crate::closectx::{CloseId, DepKind, NUM_DEP_KINDS};
use crate::context::OpContext;
use crate::vertex::VertexId;

const DEP_KINDS: [DepKind; NUM_DEP_KINDS] = [
    DepKind::Parent,
    DepKind::Arc,
    DepKind::Notify,
    DepKind::Task,
    DepKind::Eval,
    DepKind::Root,
    DepKind::Init,
    DepKind::Defer,
];

impl OpContext {
    /// Renders the dependency graph of the subtree under `root`.
    pub fn dependency_graph(&self, root: VertexId) -> String {
        let mut out = String::from("graph TD\n");
        self.write_vertex(&mut out, root);
        out
    }

    fn write_vertex(&self, out: &mut String, v: VertexId) {
        let name = self.debug_name(v);
        let overlay = self
            .state_of(v)
            .and_then(|n| n.borrow().underlying)
            .map(|u| format!(" overlay of v{}", u.0))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  v{}[\"{} ({:?}){}\"]",
            v.0,
            name,
            self.vertex(v).status,
            overlay
        );
        if let Some(cc) = self.vertex(v).cc {
            self.write_close_ctx(out, v, cc);
        }
        for &a in &self.vertex(v).arcs {
            self.write_vertex(out, a);
            let _ = writeln!(out, "  v{} --> v{}", v.0, a.0);
        }
    }

    fn write_close_ctx(&self, out: &mut String, v: VertexId, cc: CloseId) {
        let c = self.close_ctx(cc);
        let mut counts = String::new();
        for kind in DEP_KINDS {
            let n = c.dep_counts[kind.index()];
            if n != 0 {
                let _ = write!(counts, " {}:{}", kind.name(), n);
            }
        }
        let mut flags = String::new();
        if c.is_def {
            flags.push_str(" def");
        }
        if c.is_embed {
            flags.push_str(" embed");
        }
        if c.is_closed {
            flags.push_str(" closed");
        }
        if c.is_total {
            flags.push_str(" total");
        }
        if c.done {
            flags.push_str(" done");
        }
        let _ = writeln!(out, "  cc{}[\"cc{}{}{}\"]", cc.0, cc.0, flags, counts);
        let _ = writeln!(out, "  v{} -.- cc{}", v.0, cc.0);
        match c.parent {
            Some(p) => {
                let _ = writeln!(out, "  cc{} -->|PARENT| cc{}", cc.0, p.0);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::OpContext;
    use crate::feature::{Feature, FeatureExt};
    use crate::vertex::ArcType;

    #[test]
    fn graph_contains_vertices_and_contexts() {
        let mut ctx = OpContext::new();
        let rt = ctx.runtime.clone();
        let root = ctx.new_vertex(None, Feature::INVALID, ArcType::Member);
        let (_a, _) = ctx.get_arc(root, rt.field("a"), ArcType::Member);
        let cc = ctx.root_close_ctx(root);
        ctx.set_debug_name(root, "root");

        let graph = ctx.dependency_graph(root);
        assert!(graph.starts_with("graph TD"));
        assert!(graph.contains("root"));
        assert!(graph.contains(&format!("cc{}", cc.0)));
        assert!(graph.contains("ROOT:1"));
        assert!(graph.contains("-->"));
    }
}
