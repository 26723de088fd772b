use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::builder::Graph;

/// Topological layers of a graph.
///
/// Layer 0 holds nodes without predecessors; a node sits one layer after its
/// deepest predecessor. Members of a layer never depend on each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    layers: Vec<BTreeSet<String>>,
}

impl ExecutionPlan {
    pub(crate) fn from_graph(graph: &Graph) -> Self {
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        for name in graph.topological_order() {
            let d = graph
                .predecessors(name)
                .filter_map(|p| depth.get(p))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(name.as_str(), d);
        }

        let mut layers: Vec<BTreeSet<String>> = Vec::new();
        for (name, d) in depth {
            if layers.len() <= d {
                layers.resize_with(d + 1, BTreeSet::new);
            }
            layers[d].insert(name.to_string());
        }
        Self { layers }
    }

    pub fn layers(&self) -> &[BTreeSet<String>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.layers.iter().map(BTreeSet::len).sum()
    }

    pub fn layer_of(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.contains(name))
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, layer) in self.layers.iter().enumerate() {
            let names: Vec<&str> = layer.iter().map(String::as_str).collect();
            writeln!(f, "  layer {}: {}", i, names.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::Edge;
    use crate::graph::node::NodeSpec;
    use crate::graph::state::StateUpdate;

    fn node(name: &str) -> NodeSpec {
        NodeSpec::from_fn(name, |_| async { Ok(StateUpdate::new()) })
    }

    fn fan_out_join() -> Graph {
        Graph::build(
            vec![
                node("clean").requires("input").produces("cleaned"),
                node("classify").requires("cleaned").produces("intent"),
                node("detect_crash").requires("cleaned").produces("is_crash"),
                node("join").requires("intent").requires("is_crash"),
            ],
            vec![],
            ["input"],
        )
        .unwrap()
    }

    #[test]
    fn test_layers_fan_out_join() {
        let plan = fan_out_join().plan();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.layers()[0], BTreeSet::from(["clean".to_string()]));
        assert_eq!(
            plan.layers()[1],
            BTreeSet::from(["classify".to_string(), "detect_crash".to_string()])
        );
        assert_eq!(plan.layer_of("join"), Some(2));
    }

    #[test]
    fn test_layers_cover_every_node_once() {
        let g = Graph::build(
            vec![node("a"), node("b"), node("c"), node("d"), node("e")],
            vec![Edge::new("a", "c"), Edge::new("b", "c"), Edge::new("a", "e")],
            Vec::<String>::new(),
        )
        .unwrap();
        let plan = g.plan();
        assert_eq!(plan.node_count(), g.len());
        let union: BTreeSet<&str> = plan
            .layers()
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        assert_eq!(union, g.node_names().collect::<BTreeSet<_>>());
        // Each layer only depends on earlier ones
        for name in g.node_names() {
            let at = plan.layer_of(name).unwrap();
            for p in g.predecessors(name) {
                assert!(plan.layer_of(p).unwrap() < at);
            }
        }
    }

    #[test]
    fn test_longest_path_decides_layer() {
        let g = Graph::build(
            vec![node("a"), node("b"), node("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("a", "c")],
            Vec::<String>::new(),
        )
        .unwrap();
        assert_eq!(g.plan().layer_of("c"), Some(2));
    }

    #[test]
    fn test_plan_idempotent() {
        let g = fan_out_join();
        assert_eq!(g.plan(), g.plan());
    }

    #[test]
    fn test_display() {
        let text = fan_out_join().plan().to_string();
        assert!(text.contains("layer 1: classify, detect_crash"));
    }
}
