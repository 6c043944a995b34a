// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use graph::DependencyGraph;

use crate::analytics::{AnalyticsLog, AnalyticsQueryType, AnalyticsRecord};
use crate::clause::ClauseStore;
use crate::constraint::ConstraintIndex;
use crate::dependency::{DependencyView, GraphBackedDependencies, GraphQuery};
use crate::history::HistoryIndex;
use crate::proof::ProofIndex;
use crate::similarity::SimilarityIndex;
use crate::streaming::StreamingIndex;

///
/// An immutable, generational point-in-time view over every index, the clause store and the
/// analytics log. Capturing one is cheap (reference counted index handles); mutations applied
/// after capture are never visible through it.
///
#[derive(Clone)]
pub struct Snapshot {
    pub(crate) generation: u64,
    pub(crate) proof: Arc<ProofIndex>,
    pub(crate) constraints: Arc<ConstraintIndex>,
    pub(crate) similarity: Arc<SimilarityIndex>,
    pub(crate) dependencies: Arc<DependencyGraph>,
    pub(crate) history: Arc<HistoryIndex>,
    pub(crate) streaming: Arc<StreamingIndex>,
    pub(crate) clauses: Arc<ClauseStore>,
    pub(crate) analytics: Arc<AnalyticsLog>,
    pub(crate) graph_backed: Option<Arc<GraphBackedDependencies>>,
}

impl Snapshot {
    /// The generation of the producing engine at the moment of capture.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn proof(&self) -> &ProofIndex {
        &self.proof
    }

    pub fn constraints(&self) -> &ConstraintIndex {
        &self.constraints
    }

    pub fn similarity(&self) -> &SimilarityIndex {
        &self.similarity
    }

    pub fn history(&self) -> &HistoryIndex {
        &self.history
    }

    pub fn streaming(&self) -> &StreamingIndex {
        &self.streaming
    }

    pub fn clauses(&self) -> &ClauseStore {
        &self.clauses
    }

    ///
    /// The dependency view: graph-backed when an external graph was registered at capture time,
    /// the engine's own adjacency graph otherwise.
    ///
    pub fn dependencies(&self) -> DependencyView {
        match &self.graph_backed {
            Some(backed) => DependencyView::GraphBacked(backed.clone()),
            None => DependencyView::Internal(self.dependencies.clone()),
        }
    }

    ///
    /// The engine-owned adjacency graph, regardless of graph-backed registration. Dependency
    /// delta validation always runs against this: the external graph is read-only and not
    /// affected by deltas.
    ///
    pub(crate) fn internal_dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }

    pub fn graph_query(&self) -> Option<Arc<dyn GraphQuery>> {
        self.graph_backed.as_ref().map(|b| b.graph().clone())
    }

    /// The frozen analytics ring, oldest first.
    pub fn analytics_history(&self) -> Vec<AnalyticsRecord> {
        self.analytics.history()
    }

    pub fn last_analytics(&self, query_type: AnalyticsQueryType) -> Option<AnalyticsRecord> {
        self.analytics.last(query_type)
    }

    pub fn has_run_analytics(&self, query_type: AnalyticsQueryType) -> bool {
        self.analytics.has_run(query_type)
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod snapshot_tests;
