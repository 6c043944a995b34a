// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

mod brent;
mod scc;

pub use crate::brent::{CycleDetector, DetectedCycle, DEFAULT_MAX_HISTORY};
pub use crate::scc::{SccAnalysis, SccError, TransitionGraph};

use std::collections::VecDeque;

use fixedbitset::FixedBitSet;
use fnv::FnvHashMap as HashMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{VisitMap, Visitable};
use petgraph::Direction;

type PGraph = DiGraph<String, (), u32>;

#[derive(Debug, Eq, PartialEq)]
pub enum EdgeError {
    SelfEdge(String),
    WouldCycle { from: String, to: String },
}

impl std::fmt::Display for EdgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeError::SelfEdge(node) => write!(f, "Self edge on node {node}"),
            EdgeError::WouldCycle { from, to } => {
                write!(f, "Edge {from} -> {to} would create a cycle")
            }
        }
    }
}

///
/// A directed dependency graph over string node ids: a DAG, enforced on mutation.
///
/// Nodes are interned on first use and never deleted; edges may be added (subject to the
/// acyclicity check) and removed.
///
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, NodeIndex<u32>>,
    pg: PGraph,
}

impl DependencyGraph {
    pub fn new() -> DependencyGraph {
        DependencyGraph {
            nodes: HashMap::default(),
            pg: DiGraph::new(),
        }
    }

    fn ensure_node(&mut self, node: &str) -> NodeIndex<u32> {
        if let Some(&id) = self.nodes.get(node) {
            return id;
        }
        let id = self.pg.add_node(node.to_owned());
        self.nodes.insert(node.to_owned(), id);
        id
    }

    ///
    /// Adds the given edge, and returns true if it was not already present.
    ///
    /// Rejects self edges, and edges which would make the graph cyclic.
    ///
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<bool, EdgeError> {
        if from == to {
            return Err(EdgeError::SelfEdge(from.to_owned()));
        }
        if self.has_path(to, from) {
            return Err(EdgeError::WouldCycle {
                from: from.to_owned(),
                to: to.to_owned(),
            });
        }

        let from_id = self.ensure_node(from);
        let to_id = self.ensure_node(to);
        if self.pg.find_edge(from_id, to_id).is_some() {
            return Ok(false);
        }
        self.pg.add_edge(from_id, to_id, ());
        Ok(true)
    }

    ///
    /// Removes the given edge, and returns true if it was present.
    ///
    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        let (Some(&from_id), Some(&to_id)) = (self.nodes.get(from), self.nodes.get(to)) else {
            return false;
        };
        if let Some(edge_id) = self.pg.find_edge(from_id, to_id) {
            self.pg.remove_edge(edge_id);
            true
        } else {
            false
        }
    }

    ///
    /// Whether adding all of the given edges (in order, on top of the current graph) would create
    /// a cycle. Used to validate a batch of edge additions before any of them is applied.
    ///
    pub fn would_cycle(&self, new_edges: &[(String, String)]) -> bool {
        let mut scratch = self.clone();
        for (from, to) in new_edges {
            match scratch.add_edge(from, to) {
                Ok(_) => (),
                Err(_) => return true,
            }
        }
        false
    }

    /// The direct dependencies of the given node (outgoing edges).
    pub fn depends_on(&self, node: &str) -> Vec<String> {
        self.neighbors(node, Direction::Outgoing)
    }

    /// The direct dependents of the given node (incoming edges).
    pub fn depended_by(&self, node: &str) -> Vec<String> {
        self.neighbors(node, Direction::Incoming)
    }

    fn neighbors(&self, node: &str, direction: Direction) -> Vec<String> {
        let Some(&id) = self.nodes.get(node) else {
            return vec![];
        };
        self.pg
            .neighbors_directed(id, direction)
            .map(|n| self.pg[n].clone())
            .collect()
    }

    ///
    /// True if a walk from the given node can reach it again. Always false while the acyclicity
    /// check on `add_edge` is the only way edges are introduced; exposed because snapshot
    /// consumers probe it.
    ///
    pub fn has_cycle(&self, node: &str) -> bool {
        let Some(&id) = self.nodes.get(node) else {
            return false;
        };
        self.walk(
            self.pg
                .neighbors_directed(id, Direction::Outgoing)
                .collect(),
            Direction::Outgoing,
        )
        .any(|reached| reached == id)
    }

    /// True if any path leads from `from` to `to`.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        let (Some(&from_id), Some(&to_id)) = (self.nodes.get(from), self.nodes.get(to)) else {
            return false;
        };
        if from_id == to_id {
            return true;
        }
        self.walk(VecDeque::from(vec![from_id]), Direction::Outgoing)
            .any(|reached| reached == to_id)
    }

    ///
    /// The transitive dependents of the given node, visited breadth first up to the given depth.
    /// The start node itself is not included.
    ///
    pub fn dependents_within(&self, start: &str, max_depth: usize) -> Vec<String> {
        let Some(&start_id) = self.nodes.get(start) else {
            return vec![];
        };

        let mut walked = self.pg.visit_map();
        walked.visit(start_id);
        let mut deque: VecDeque<(NodeIndex<u32>, usize)> = self
            .pg
            .neighbors_directed(start_id, Direction::Incoming)
            .map(|id| (id, 1))
            .collect();
        let mut result = Vec::new();

        while let Some((id, depth)) = deque.pop_front() {
            if !walked.visit(id) || depth > max_depth {
                continue;
            }
            result.push(self.pg[id].clone());
            deque.extend(
                self.pg
                    .neighbors_directed(id, Direction::Incoming)
                    .map(|next| (next, depth + 1)),
            );
        }

        result
    }

    pub fn all_edges(&self) -> Vec<(String, String)> {
        self.pg
            .edge_indices()
            .filter_map(|e| self.pg.edge_endpoints(e))
            .map(|(a, b)| (self.pg[a].clone(), self.pg[b].clone()))
            .collect()
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_count(&self) -> usize {
        self.pg.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.pg.edge_count()
    }

    ///
    /// Begins a Walk from the given roots.
    ///
    /// The Walk will iterate over all nodes that descend from the roots in the direction of
    /// traversal but won't necessarily be in topological order.
    ///
    fn walk(&self, roots: VecDeque<NodeIndex<u32>>, direction: Direction) -> Walk<'_> {
        Walk {
            graph: self,
            direction: direction,
            deque: roots,
            walked: self.pg.visit_map(),
        }
    }
}

///
/// Represents the state of a particular walk through a DependencyGraph. Implements Iterator and
/// has the same lifetime as the graph itself.
///
struct Walk<'a> {
    graph: &'a DependencyGraph,
    direction: Direction,
    deque: VecDeque<NodeIndex<u32>>,
    walked: FixedBitSet,
}

impl<'a> Iterator for Walk<'a> {
    type Item = NodeIndex<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.deque.pop_front() {
            if !self.walked.visit(id) {
                continue;
            }

            self.deque
                .extend(self.graph.pg.neighbors_directed(id, self.direction));
            return Some(id);
        }

        None
    }
}

#[cfg(test)]
mod tests;
