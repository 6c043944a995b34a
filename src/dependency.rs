// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use graph::DependencyGraph;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

///
/// A directed dependency edge between two nodes.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

impl DependencyEdge {
    pub fn new(from: &str, to: &str) -> DependencyEdge {
        DependencyEdge {
            from: from.to_owned(),
            to: to.to_owned(),
        }
    }
}

///
/// A symbol in the externally owned code graph.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymbolInfo {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub file_path: String,
}

///
/// Read-only queries against the externally owned code graph. The engine never mutates the
/// graph; it has its own lifecycle and persistence.
///
/// The `has_cycle_from` and `call_edge_count` capabilities are optional: implementations without
/// them return `None` and callers fall back to the portable path.
///
pub trait GraphQuery: Send + Sync {
    fn find_symbol_by_id(&self, id: &str) -> Option<SymbolInfo>;
    fn find_symbols_by_name(&self, name: &str) -> Vec<SymbolInfo>;
    fn find_symbols_by_kind(&self, kind: &str) -> Vec<SymbolInfo>;
    fn find_symbols_in_file(&self, path: &str) -> Vec<SymbolInfo>;
    fn find_callers(&self, id: &str) -> Vec<SymbolInfo>;
    fn find_callees(&self, id: &str) -> Vec<SymbolInfo>;
    fn find_implementations(&self, id: &str) -> Vec<SymbolInfo>;
    fn find_references(&self, id: &str) -> Vec<SymbolInfo>;
    fn get_call_chain(&self, from: &str, to: &str, max_depth: usize) -> Vec<String>;
    fn shortest_path(&self, from: &str, to: &str) -> Vec<String>;
    fn analytics(&self) -> Option<&dyn GraphAnalyticsQuery> {
        None
    }
    fn node_count(&self) -> usize;
    fn edge_count(&self) -> usize;
    fn generation(&self) -> u64;
    fn last_refresh_time_ms(&self) -> i64;
    fn close(&self);

    // Optional capabilities.
    fn has_cycle_from(&self, _node: &str) -> Option<bool> {
        None
    }
    fn call_edge_count(&self) -> Option<usize> {
        None
    }
    fn invalidate_cache(&self) {}
}

///
/// Aggregate analytics over the code graph.
///
pub trait GraphAnalyticsQuery: Send + Sync {
    fn hot_spots(&self, k: usize) -> Vec<(String, f64)>;
    fn dead_code(&self) -> Vec<String>;
    fn cyclic_dependencies(&self) -> Vec<Vec<String>>;
    fn page_rank(&self) -> Vec<(String, f64)>;
    fn communities(&self) -> Vec<Vec<String>>;
}

#[derive(Clone, Copy, Debug, Default)]
struct EdgeCountCache {
    count: Option<usize>,
    // Bumped on invalidation, so a computation begun before an invalidation cannot overwrite the
    // fresher empty state.
    generation: u64,
}

///
/// The graph-backed realization of the dependency index: delegates to the external `GraphQuery`
/// (dependency edges are call edges there), caching the edge count until invalidated.
///
pub struct GraphBackedDependencies {
    graph: Arc<dyn GraphQuery>,
    cache: Mutex<EdgeCountCache>,
}

impl GraphBackedDependencies {
    pub fn new(graph: Arc<dyn GraphQuery>) -> GraphBackedDependencies {
        GraphBackedDependencies {
            graph,
            cache: Mutex::new(EdgeCountCache::default()),
        }
    }

    pub fn graph(&self) -> &Arc<dyn GraphQuery> {
        &self.graph
    }

    pub fn depends_on(&self, node: &str) -> Vec<String> {
        self.graph
            .find_callees(node)
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    pub fn depended_by(&self, node: &str) -> Vec<String> {
        self.graph
            .find_callers(node)
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    pub fn has_cycle(&self, node: &str) -> bool {
        self.graph.has_cycle_from(node).unwrap_or(false)
    }

    pub fn edge_count(&self) -> usize {
        let generation = {
            let cache = self.cache.lock();
            if let Some(count) = cache.count {
                return count;
            }
            cache.generation
        };

        let computed = self
            .graph
            .call_edge_count()
            .unwrap_or_else(|| self.graph.edge_count());

        let mut cache = self.cache.lock();
        if cache.generation == generation {
            cache.count = Some(computed);
        }
        computed
    }

    pub fn invalidate(&self) {
        let mut cache = self.cache.lock();
        cache.count = None;
        cache.generation += 1;
    }
}

///
/// The read side of the dependency index. The engine's own adjacency graph serves unless an
/// external graph is registered, in which case the graph-backed adapter takes over and
/// `all_edges` returns nothing (the edges live in the external graph).
///
#[derive(Clone)]
pub enum DependencyView {
    Internal(Arc<DependencyGraph>),
    GraphBacked(Arc<GraphBackedDependencies>),
}

impl DependencyView {
    pub fn is_graph_backed(&self) -> bool {
        matches!(self, DependencyView::GraphBacked(_))
    }

    pub fn depends_on(&self, node: &str) -> Vec<String> {
        match self {
            DependencyView::Internal(graph) => graph.depends_on(node),
            DependencyView::GraphBacked(backed) => backed.depends_on(node),
        }
    }

    pub fn depended_by(&self, node: &str) -> Vec<String> {
        match self {
            DependencyView::Internal(graph) => graph.depended_by(node),
            DependencyView::GraphBacked(backed) => backed.depended_by(node),
        }
    }

    pub fn has_cycle(&self, node: &str) -> bool {
        match self {
            DependencyView::Internal(graph) => graph.has_cycle(node),
            DependencyView::GraphBacked(backed) => backed.has_cycle(node),
        }
    }

    pub fn edge_count(&self) -> usize {
        match self {
            DependencyView::Internal(graph) => graph.edge_count(),
            DependencyView::GraphBacked(backed) => backed.edge_count(),
        }
    }

    pub fn all_edges(&self) -> Vec<DependencyEdge> {
        match self {
            DependencyView::Internal(graph) => graph
                .all_edges()
                .into_iter()
                .map(|(from, to)| DependencyEdge { from, to })
                .collect(),
            DependencyView::GraphBacked(_) => vec![],
        }
    }
}
