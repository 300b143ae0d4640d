//! Dependency graph over workstream keys.
//!
//! The graph validates duplicate keys, unknown dependencies and cycles, and
//! yields a topological order with declaration order as the tie-break.

use std::collections::{BTreeSet, HashMap};

use crate::errors::DecompositionError;

/// Index into the node list (declaration order).
pub type NodeIndex = usize;

/// A directed acyclic graph of workstreams.
#[derive(Debug)]
pub struct DependencyGraph {
    keys: Vec<String>,
    index_map: HashMap<String, NodeIndex>,
    /// index -> nodes that depend on it
    forward_edges: Vec<Vec<NodeIndex>>,
    /// index -> nodes it depends on
    reverse_edges: Vec<Vec<NodeIndex>>,
}

impl DependencyGraph {
    /// Build a graph from `(key, blocked_by)` pairs.
    ///
    /// Fails on duplicate keys, unknown dependencies and cycles.
    pub fn build<I, D, S>(nodes: I) -> Result<Self, DecompositionError>
    where
        I: IntoIterator<Item = (String, D)>,
        D: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nodes: Vec<(String, Vec<String>)> = nodes
            .into_iter()
            .map(|(key, deps)| {
                (
                    key,
                    deps.into_iter().map(|d| d.as_ref().to_string()).collect(),
                )
            })
            .collect();

        let mut index_map = HashMap::new();
        for (i, (key, _)) in nodes.iter().enumerate() {
            if index_map.insert(key.clone(), i).is_some() {
                return Err(DecompositionError::DuplicateKey(key.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];

        for (to_idx, (key, deps)) in nodes.iter().enumerate() {
            for dep in deps {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    DecompositionError::UnknownDependency {
                        workstream: key.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                if reverse_edges[to_idx].contains(&from_idx) {
                    continue;
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            keys: nodes.into_iter().map(|(key, _)| key).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        graph.topological_order()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, index: NodeIndex) -> Option<&str> {
        self.keys.get(index).map(String::as_str)
    }

    pub fn index_of(&self, key: &str) -> Option<NodeIndex> {
        self.index_map.get(key).copied()
    }

    /// Nodes that depend on the given node.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Nodes the given node depends on.
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Topological order using Kahn's algorithm. Among ready nodes the one
    /// declared first goes first.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, DecompositionError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.len() {
            let members = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.keys[i].clone())
                .collect();
            return Err(DecompositionError::Cycle(members));
        }

        Ok(order)
    }

    /// Every node reachable through forward edges, excluding `index` itself.
    pub fn transitive_dependents(&self, index: NodeIndex) -> BTreeSet<NodeIndex> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeIndex> = self.dependents(index).to_vec();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend_from_slice(self.dependents(node));
            }
        }
        seen
    }
}
