use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::edge::Edge;
use super::error::ValidationError;
use super::node::NodeSpec;
use super::plan::ExecutionPlan;

/// A validated, acyclic set of nodes with their effective dependencies.
///
/// Effective in-edges of a node are its declared edges plus one edge from
/// the writer of every key it requires. An updater of a key also depends on
/// the key's producer, and readers of an updated key depend on the updater.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<String, NodeSpec>,
    edges: BTreeSet<Edge>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
    entry_keys: BTreeSet<String>,
    topo_order: Vec<String>,
}

impl Graph {
    /// Validate and assemble a graph. Pure: no state is created.
    pub fn build<I, S>(nodes: Vec<NodeSpec>, edges: Vec<Edge>, entry_keys: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry_keys: BTreeSet<String> = entry_keys.into_iter().map(Into::into).collect();

        let mut node_map = BTreeMap::new();
        for node in nodes {
            if node_map.contains_key(&node.name) {
                return Err(ValidationError::DuplicateNode(node.name));
            }
            node_map.insert(node.name.clone(), node);
        }

        for edge in &edges {
            for end in [&edge.from, &edge.to] {
                if !node_map.contains_key(end) {
                    return Err(ValidationError::UnknownNode {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: end.clone(),
                    });
                }
            }
        }

        let producers = writers_of(&node_map, |n| &n.produces)?;
        let updaters = writers_of(&node_map, |n| &n.updates)?;

        for key in &entry_keys {
            if let Some(node) = producers.get(key) {
                return Err(ValidationError::SeededKeyProduced {
                    key: key.clone(),
                    node: node.clone(),
                });
            }
        }

        // Effective predecessors: declared edges plus implied data edges
        let mut predecessors: BTreeMap<String, BTreeSet<String>> = node_map
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for edge in &edges {
            if let Some(preds) = predecessors.get_mut(&edge.to) {
                preds.insert(edge.from.clone());
            }
        }
        for (name, node) in &node_map {
            let Some(preds) = predecessors.get_mut(name) else {
                continue;
            };
            for key in &node.requires {
                for writer in [producers.get(key), updaters.get(key)].into_iter().flatten() {
                    if writer != name {
                        preds.insert(writer.clone());
                    }
                }
            }
            for key in &node.updates {
                if let Some(producer) = producers.get(key) {
                    if producer != name {
                        preds.insert(producer.clone());
                    }
                }
            }
        }

        let topo_order = topological_order(&predecessors)?;

        for (name, node) in &node_map {
            for key in &node.requires {
                let satisfied = entry_keys.contains(key)
                    || producers.get(key).is_some_and(|w| w != name)
                    || updaters.get(key).is_some_and(|w| w != name);
                if !satisfied {
                    return Err(ValidationError::UnsatisfiedDependency {
                        node: name.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        Ok(Self {
            nodes: node_map,
            edges: edges.into_iter().collect(),
            predecessors,
            entry_keys,
            topo_order,
        })
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Declared edges only.
    pub fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    pub fn entry_keys(&self) -> &BTreeSet<String> {
        &self.entry_keys
    }

    /// Effective predecessors of `name`, declared and implied.
    pub fn predecessors(&self, name: &str) -> impl Iterator<Item = &str> {
        self.predecessors
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn successors<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.predecessors
            .iter()
            .filter(move |(_, preds)| preds.contains(name))
            .map(|(n, _)| n.as_str())
    }

    /// A topological order of all nodes (ties broken by name).
    pub fn topological_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Compute the layered execution plan.
    pub fn plan(&self) -> ExecutionPlan {
        ExecutionPlan::from_graph(self)
    }
}

/// Map every key to its single writer under `select`, rejecting duplicates.
fn writers_of(
    nodes: &BTreeMap<String, NodeSpec>,
    select: impl Fn(&NodeSpec) -> &BTreeSet<String>,
) -> Result<BTreeMap<String, String>, ValidationError> {
    let mut writers: BTreeMap<String, String> = BTreeMap::new();
    for (name, node) in nodes {
        for key in select(node) {
            if let Some(first) = writers.get(key) {
                return Err(ValidationError::DuplicateProducer {
                    key: key.clone(),
                    first: first.clone(),
                    second: name.clone(),
                });
            }
            writers.insert(key.clone(), name.clone());
        }
    }
    Ok(writers)
}

/// Kahn's algorithm. Nodes left over when the queue drains sit on a cycle
/// or behind one.
fn topological_order(
    predecessors: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, ValidationError> {
    let mut in_degree: BTreeMap<&str, usize> = predecessors
        .iter()
        .map(|(name, preds)| (name.as_str(), preds.len()))
        .collect();
    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, preds) in predecessors {
        for p in preds {
            successors.entry(p.as_str()).or_default().push(name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(predecessors.len());

    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        for next in successors.get(name).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if order.len() < predecessors.len() {
        let done: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let nodes = predecessors
            .keys()
            .filter(|n| !done.contains(n.as_str()))
            .cloned()
            .collect();
        return Err(ValidationError::Cycle { nodes });
    }
    Ok(order)
}
