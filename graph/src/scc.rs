// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::FnvHashMap as HashMap;

///
/// A small directed graph over state keys, built from consecutive session transitions, on which
/// strongly connected components are computed post hoc.
///
/// Tarjan's algorithm is implemented iteratively here rather than via `petgraph::algo` because
/// analysis of unbounded session histories needs two properties the library versions do not
/// expose: a configurable depth cap, and periodic cancellation polling.
///
#[derive(Clone, Debug, Default)]
pub struct TransitionGraph {
    nodes: HashMap<String, usize>,
    names: Vec<String>,
    edges: Vec<Vec<usize>>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum SccError {
    Cancelled,
    DepthLimitExceeded(usize),
}

impl std::fmt::Display for SccError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SccError::Cancelled => write!(f, "SCC analysis was cancelled"),
            SccError::DepthLimitExceeded(limit) => {
                write!(f, "SCC analysis exceeded the depth limit of {limit}")
            }
        }
    }
}

///
/// The result of an SCC pass: every component (singletons included), in reverse topological
/// order as Tarjan emits them.
///
#[derive(Clone, Debug)]
pub struct SccAnalysis {
    pub components: Vec<Vec<String>>,
}

impl SccAnalysis {
    /// Components of size > 1: each one certainly contains a cycle.
    pub fn cyclic_components(&self) -> Vec<&Vec<String>> {
        self.components.iter().filter(|c| c.len() > 1).collect()
    }

    pub fn largest_component_size(&self) -> usize {
        self.components.iter().map(|c| c.len()).max().unwrap_or(0)
    }
}

// How many internal operations may elapse between cancellation polls.
const CANCELLATION_POLL_OPS: usize = 100;

impl TransitionGraph {
    pub fn new() -> TransitionGraph {
        TransitionGraph::default()
    }

    pub fn ensure_node(&mut self, name: &str) -> usize {
        if let Some(&id) = self.nodes.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_owned());
        self.edges.push(Vec::new());
        self.nodes.insert(name.to_owned(), id);
        id
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        let from_id = self.ensure_node(from);
        let to_id = self.ensure_node(to);
        if !self.edges[from_id].contains(&to_id) {
            self.edges[from_id].push(to_id);
        }
    }

    pub fn node_count(&self) -> usize {
        self.names.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(|e| e.len()).sum()
    }

    ///
    /// Computes all strongly connected components, polling `cancelled` every
    /// `CANCELLATION_POLL_OPS` internal operations and failing if the DFS stack grows beyond
    /// `max_depth`.
    ///
    pub fn strongly_connected_components(
        &self,
        max_depth: usize,
        mut cancelled: impl FnMut() -> bool,
    ) -> Result<SccAnalysis, SccError> {
        let n = self.names.len();
        let mut index = vec![usize::MAX; n];
        let mut lowlink = vec![usize::MAX; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0_usize;
        let mut components: Vec<Vec<String>> = Vec::new();
        let mut ops = 0_usize;

        // Iterative Tarjan: each frame is (node, next child edge offset).
        let mut call_stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..n {
            if index[root] != usize::MAX {
                continue;
            }
            call_stack.push((root, 0));

            while let Some(&(v, child)) = call_stack.last() {
                ops += 1;
                if ops % CANCELLATION_POLL_OPS == 0 && cancelled() {
                    return Err(SccError::Cancelled);
                }
                if call_stack.len() > max_depth {
                    return Err(SccError::DepthLimitExceeded(max_depth));
                }

                if child == 0 {
                    // First visit.
                    index[v] = next_index;
                    lowlink[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }

                if let Some(&w) = self.edges[v].get(child) {
                    let top = call_stack.len() - 1;
                    call_stack[top].1 += 1;
                    if index[w] == usize::MAX {
                        call_stack.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    continue;
                }

                // All children of v visited: pop the frame, fold the lowlink into the parent, and
                // emit a component if v is a root.
                call_stack.pop();
                if let Some(&(parent, _)) = call_stack.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    loop {
                        let w = stack.pop().expect("Tarjan stack invariant violated");
                        on_stack[w] = false;
                        component.push(self.names[w].clone());
                        if w == v {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }

        Ok(SccAnalysis { components })
    }
}
