// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fnv::FnvHashMap as HashMap;
use graph::DependencyGraph;
use journal::Journal;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use task_executor::Executor;

use crate::analytics::{
    AnalyticsLog, DEFAULT_ANALYTICS_CAPACITY, DEFAULT_MAX_RESULTS_PER_RECORD,
};
use crate::clause::{ClauseStore, ClauseStoreOptions};
use crate::constraint::ConstraintIndex;
use crate::context::Context;
use crate::delta::{Delta, DeltaKind, IndexMask};
use crate::dependency::{GraphBackedDependencies, GraphQuery};
use crate::error::Error;
use crate::history::HistoryIndex;
use crate::history_worker::{DeltaHistory, DeltaHistoryOptions, DeltaRecord};
use crate::proof::{ProofIndex, ProofUpdate};
use crate::similarity::SimilarityIndex;
use crate::snapshot::Snapshot;
use crate::steps::StepRecord;
use crate::streaming::StreamingIndex;

#[derive(Clone, Debug)]
pub struct CrsOptions {
    pub delta_history: DeltaHistoryOptions,
    pub clause_store: ClauseStoreOptions,
    pub analytics_capacity: usize,
    pub max_results_per_record: usize,
    /// Without proof data, the circuit breaker fires at this many executions of a tool.
    pub breaker_threshold: usize,
    /// The BFS depth cap for disproof propagation.
    pub disproof_depth_cap: usize,
    /// The DFS depth cap for session SCC analysis.
    pub scc_depth_cap: usize,
    /// The bounded history of the per-session online cycle detectors.
    pub cycle_max_history: usize,
}

impl Default for CrsOptions {
    fn default() -> CrsOptions {
        CrsOptions {
            delta_history: DeltaHistoryOptions::default(),
            clause_store: ClauseStoreOptions::default(),
            analytics_capacity: DEFAULT_ANALYTICS_CAPACITY,
            max_results_per_record: DEFAULT_MAX_RESULTS_PER_RECORD,
            breaker_threshold: 2,
            disproof_depth_cap: 100,
            scc_depth_cap: 10_000,
            cycle_max_history: graph::DEFAULT_MAX_HISTORY,
        }
    }
}

///
/// The metrics returned by every successful Apply.
///
#[derive(Clone, Debug)]
pub struct ApplyMetrics {
    pub delta_kind: DeltaKind,
    pub validate_duration: Duration,
    pub mutate_duration: Duration,
    pub total_duration: Duration,
    pub indexes_updated: IndexMask,
    pub entries_modified: usize,
    pub old_generation: u64,
    pub new_generation: u64,
}

///
/// A restorable in-process marker: the engine's full index state at a generation. Restoring one
/// rolls every index back and truncates the journal, so the discarded deltas are not replayed
/// next session.
///
#[derive(Clone)]
pub struct Checkpoint {
    pub id: String,
    pub generation: u64,
    pub created_at_ms: i64,
    state: IndexState,
}

#[derive(Clone)]
pub(crate) struct IndexState {
    pub(crate) proof: Arc<ProofIndex>,
    pub(crate) constraints: Arc<ConstraintIndex>,
    pub(crate) similarity: Arc<SimilarityIndex>,
    pub(crate) dependencies: Arc<DependencyGraph>,
    pub(crate) history: Arc<HistoryIndex>,
    pub(crate) streaming: Arc<StreamingIndex>,
    pub(crate) clauses: Arc<ClauseStore>,
    pub(crate) analytics: Arc<AnalyticsLog>,
}

impl IndexState {
    fn new(options: &CrsOptions) -> IndexState {
        IndexState {
            proof: Arc::new(ProofIndex::new()),
            constraints: Arc::new(ConstraintIndex::new()),
            similarity: Arc::new(SimilarityIndex::new()),
            dependencies: Arc::new(DependencyGraph::new()),
            history: Arc::new(HistoryIndex::new()),
            streaming: Arc::new(StreamingIndex::new()),
            clauses: Arc::new(ClauseStore::new()),
            analytics: Arc::new(AnalyticsLog::new(options.analytics_capacity)),
        }
    }
}

struct MutationOutcome {
    mask: IndexMask,
    entries_modified: usize,
}

///
/// The Constraint Reasoning System core: six synchronized indexes plus a learned-clause store,
/// mutated atomically by typed deltas under a single writer lock.
///
/// Writers (`apply`, `restore`) take the write lock; `snapshot` takes the read lock just long
/// enough to clone index handles; `generation` is an atomic load. Each index sits behind an
/// `Arc`, so a snapshot is O(indexes) to capture, and a mutation copies only the indexes it
/// touches (the handle is cloned on write while any snapshot still references it).
///
pub struct Crs {
    pub(crate) state: RwLock<IndexState>,
    generation: AtomicU64,
    journal: Mutex<Option<Journal<Delta>>>,
    delta_history: DeltaHistory,
    graph_backed: RwLock<Option<Arc<GraphBackedDependencies>>>,
    pub(crate) steps: Mutex<HashMap<String, Vec<StepRecord>>>,
    pub(crate) options: CrsOptions,
    closed: AtomicBool,
    #[allow(dead_code)]
    executor: Executor,
}

impl Crs {
    pub fn new(executor: Executor, options: CrsOptions) -> Crs {
        Crs {
            state: RwLock::new(IndexState::new(&options)),
            generation: AtomicU64::new(0),
            journal: Mutex::new(None),
            delta_history: DeltaHistory::new(&executor, options.delta_history.clone()),
            graph_backed: RwLock::new(None),
            steps: Mutex::new(HashMap::default()),
            options,
            closed: AtomicBool::new(false),
            executor,
        }
    }

    ///
    /// Attaches the write-ahead journal. Applies after this point are appended to it.
    ///
    pub fn set_journal(&self, journal: Journal<Delta>) {
        *self.journal.lock() = Some(journal);
    }

    pub(crate) fn journal(&self) -> Option<Journal<Delta>> {
        self.journal.lock().clone()
    }

    ///
    /// Registers the external code graph. Snapshots taken after this point use the graph-backed
    /// dependency view.
    ///
    pub fn register_graph_query(&self, graph: Arc<dyn GraphQuery>) {
        *self.graph_backed.write() = Some(Arc::new(GraphBackedDependencies::new(graph)));
    }

    pub fn graph_backed(&self) -> Option<Arc<GraphBackedDependencies>> {
        self.graph_backed.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn delta_history(&self) -> &DeltaHistory {
        &self.delta_history
    }

    ///
    /// An immutable view of the current state. Cheap: clones one handle per index under the
    /// read lock.
    ///
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &IndexState) -> Snapshot {
        Snapshot {
            generation: self.generation.load(Ordering::SeqCst),
            proof: state.proof.clone(),
            constraints: state.constraints.clone(),
            similarity: state.similarity.clone(),
            dependencies: state.dependencies.clone(),
            history: state.history.clone(),
            streaming: state.streaming.clone(),
            clauses: state.clauses.clone(),
            analytics: state.analytics.clone(),
            graph_backed: self.graph_backed.read().clone(),
        }
    }

    pub async fn apply(&self, ctx: &Context, delta: Delta) -> Result<ApplyMetrics, Error> {
        self.apply_with_source(ctx, delta, None, BTreeMap::new())
            .await
    }

    ///
    /// Applies one delta atomically: validate against the latest state, mutate (with rollback on
    /// partial failure), bump the generation, record delta history, and append to the journal.
    ///
    /// A journal failure after the state change is logged, not returned: the mutation is
    /// already visible, and the shutdown backup captures full state regardless.
    ///
    pub async fn apply_with_source(
        &self,
        ctx: &Context,
        delta: Delta,
        source_name: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ApplyMetrics, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        ctx.check()?;
        let start = Instant::now();

        let metrics = {
            let mut state = self.state.write();

            let validate_start = Instant::now();
            let snapshot = self.snapshot_of(&state);
            delta.validate(&snapshot)?;
            let validate_duration = validate_start.elapsed();

            let pre_state = state.clone();
            let mutate_start = Instant::now();
            let outcome = match Self::mutate(&mut state, &delta, &self.options) {
                Ok(outcome) => outcome,
                Err(cause) => {
                    // Restore every pre-image before the lock is released.
                    *state = pre_state;
                    return Err(Error::ApplyRollback {
                        kind: delta.kind(),
                        cause,
                    });
                }
            };
            let mutate_duration = mutate_start.elapsed();

            let old_generation = self.generation.fetch_add(1, Ordering::SeqCst);
            let new_generation = old_generation + 1;

            // Enqueued inside the critical section, so worker order is generation order.
            self.delta_history.record(DeltaRecord {
                id: format!("delta-{new_generation}"),
                generation: new_generation,
                delta_kind: delta.kind(),
                source: delta.source(),
                session_id: self
                    .journal
                    .lock()
                    .as_ref()
                    .map(|j| j.session_id().to_owned())
                    .unwrap_or_default(),
                applied_at_ms: crate::now_ms(),
                indexes_affected: outcome.mask,
                affected_nodes: delta.affected_nodes(),
                source_name: source_name.map(str::to_owned),
                metadata,
            });

            ApplyMetrics {
                delta_kind: delta.kind(),
                validate_duration,
                mutate_duration,
                total_duration: start.elapsed(),
                indexes_updated: outcome.mask,
                entries_modified: outcome.entries_modified,
                old_generation,
                new_generation,
            }
        };

        if let Some(journal) = self.journal() {
            if let Err(err) = journal.append(&delta).await {
                // Deliberately not fatal: the in-memory mutation stands, and the next backup
                // captures full state.
                warn!(
                    "Journal append failed for generation {}: {err}",
                    metrics.new_generation
                );
            }
        }

        Ok(metrics)
    }

    fn mutate(
        state: &mut IndexState,
        delta: &Delta,
        options: &CrsOptions,
    ) -> Result<MutationOutcome, String> {
        match delta {
            Delta::Proof(d) => {
                let index = Arc::make_mut(&mut state.proof);
                let mut modified = 0;
                for (node, update) in &d.updates {
                    if index.apply_update(node, update, d.source, d.timestamp_ms) {
                        modified += 1;
                    }
                }
                Ok(MutationOutcome {
                    mask: IndexMask::PROOF,
                    entries_modified: modified,
                })
            }
            Delta::Constraint(d) => {
                let index = Arc::make_mut(&mut state.constraints);
                let mut modified = 0;
                for constraint in &d.add {
                    if index.insert(constraint.clone()) {
                        modified += 1;
                    }
                }
                for id in &d.remove {
                    if index.remove(id) {
                        modified += 1;
                    }
                }
                Ok(MutationOutcome {
                    mask: IndexMask::CONSTRAINT,
                    entries_modified: modified,
                })
            }
            Delta::Similarity(d) => {
                let index = Arc::make_mut(&mut state.similarity);
                let mut modified = 0;
                for pair in &d.pairs {
                    if index.set(&pair.a, &pair.b, pair.distance) {
                        modified += 1;
                    }
                }
                Ok(MutationOutcome {
                    mask: IndexMask::SIMILARITY,
                    entries_modified: modified,
                })
            }
            Delta::Dependency(d) => {
                let graph = Arc::make_mut(&mut state.dependencies);
                let mut modified = 0;
                for edge in &d.add {
                    if graph
                        .add_edge(&edge.from, &edge.to)
                        .map_err(|e| e.to_string())?
                    {
                        modified += 1;
                    }
                }
                for edge in &d.remove {
                    if graph.remove_edge(&edge.from, &edge.to) {
                        modified += 1;
                    }
                }
                Ok(MutationOutcome {
                    mask: IndexMask::DEPENDENCY,
                    entries_modified: modified,
                })
            }
            Delta::History(d) => {
                let index = Arc::make_mut(&mut state.history);
                let mut modified = 0;
                for entry in &d.entries {
                    if index.append(entry.clone()) {
                        modified += 1;
                    }
                }
                Ok(MutationOutcome {
                    mask: IndexMask::HISTORY,
                    entries_modified: modified,
                })
            }
            Delta::Streaming(d) => {
                let index = Arc::make_mut(&mut state.streaming);
                let mut modified = 0;
                for (item, count) in &d.increments {
                    if index.observe(item, *count) {
                        modified += 1;
                    }
                }
                Ok(MutationOutcome {
                    mask: IndexMask::STREAMING,
                    entries_modified: modified,
                })
            }
            Delta::Analytics(d) => {
                let record = d
                    .record
                    .as_ref()
                    .ok_or_else(|| "Analytics delta lost its record".to_owned())?;
                let log = Arc::make_mut(&mut state.analytics);
                log.append(record.clone(), options.max_results_per_record);

                // Completion markers in the proof index: "done" always, "found" only when the
                // query returned results.
                let proof = Arc::make_mut(&mut state.proof);
                let mut modified = 1;
                if proof.apply_update(
                    &record.query_type.done_marker(),
                    &ProofUpdate::MarkProven,
                    d.source,
                    d.timestamp_ms,
                ) {
                    modified += 1;
                }
                if record.result_count > 0
                    && proof.apply_update(
                        &record.query_type.found_marker(),
                        &ProofUpdate::MarkProven,
                        d.source,
                        d.timestamp_ms,
                    )
                {
                    modified += 1;
                }
                Ok(MutationOutcome {
                    mask: IndexMask::ANALYTICS.union(IndexMask::PROOF),
                    entries_modified: modified,
                })
            }
            Delta::Composite(d) => {
                let mut mask = IndexMask::empty();
                let mut modified = 0;
                for child in &d.children {
                    let outcome = Self::mutate(state, child, options)?;
                    mask = mask.union(outcome.mask);
                    modified += outcome.entries_modified;
                }
                Ok(MutationOutcome {
                    mask,
                    entries_modified: modified,
                })
            }
        }
    }

    ///
    /// Captures a restorable marker of the full index state.
    ///
    pub fn checkpoint(&self, ctx: &Context) -> Result<Checkpoint, Error> {
        ctx.check()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let state = self.state.read();
        let generation = self.generation.load(Ordering::SeqCst);
        let created_at_ms = crate::now_ms();
        Ok(Checkpoint {
            id: format!("checkpoint-{generation}-{created_at_ms}"),
            generation,
            created_at_ms,
            state: state.clone(),
        })
    }

    ///
    /// Atomically replaces every index with the checkpoint's state, and truncates the journal so
    /// the discarded deltas are not replayed next session.
    ///
    pub async fn restore(&self, ctx: &Context, checkpoint: &Checkpoint) -> Result<(), Error> {
        ctx.check()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        {
            let mut state = self.state.write();
            *state = checkpoint.state.clone();
            self.generation.store(checkpoint.generation, Ordering::SeqCst);
        }
        if let Some(journal) = self.journal() {
            journal.checkpoint().await?;
        }
        debug!(
            "Restored engine to checkpoint {} at generation {}",
            checkpoint.id, checkpoint.generation
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    ///
    /// Stops the background worker and closes the journal. Idempotent.
    ///
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.delta_history.close().await;
        if let Some(journal) = self.journal.lock().take() {
            journal.close();
        }
        debug!("Engine closed");
    }
}

///
/// The generic diagnostics contract: anything that can report its health, identity, static
/// properties, and live metrics.
///
pub trait Evaluable {
    fn name(&self) -> &'static str;
    fn health_check(&self) -> HealthStatus;
    fn properties(&self) -> BTreeMap<String, String>;
    fn metrics(&self) -> BTreeMap<String, f64>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl Evaluable for Crs {
    fn name(&self) -> &'static str {
        "constraint-reasoning-system"
    }

    fn health_check(&self) -> HealthStatus {
        if self.closed.load(Ordering::SeqCst) {
            return HealthStatus::Unhealthy("Engine is closed".to_owned());
        }
        if let Some(journal) = self.journal.lock().as_ref() {
            if journal.is_degraded() {
                return HealthStatus::Degraded("Journal is degraded".to_owned());
            }
        }
        HealthStatus::Healthy
    }

    fn properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        properties.insert("graph_backed".to_owned(), self.graph_backed.read().is_some().to_string());
        properties.insert(
            "journal_attached".to_owned(),
            self.journal.lock().is_some().to_string(),
        );
        properties.insert(
            "delta_history_capacity".to_owned(),
            self.options.delta_history.max_records.to_string(),
        );
        properties
    }

    fn metrics(&self) -> BTreeMap<String, f64> {
        let state = self.state.read();
        let mut metrics = BTreeMap::new();
        metrics.insert("generation".to_owned(), self.generation() as f64);
        metrics.insert("proof_entries".to_owned(), state.proof.len() as f64);
        metrics.insert("constraints".to_owned(), state.constraints.len() as f64);
        metrics.insert("similarity_pairs".to_owned(), state.similarity.len() as f64);
        metrics.insert(
            "dependency_edges".to_owned(),
            state.dependencies.edge_count() as f64,
        );
        metrics.insert("history_entries".to_owned(), state.history.len() as f64);
        metrics.insert("clauses".to_owned(), state.clauses.len() as f64);
        metrics.insert("analytics_records".to_owned(), state.analytics.len() as f64);
        if let Some(journal) = self.journal.lock().as_ref() {
            let stats = journal.stats();
            metrics.insert("journal_entries".to_owned(), stats.entry_count as f64);
            metrics.insert("journal_bytes".to_owned(), stats.byte_count as f64);
        }
        metrics
    }
}

#[cfg(test)]
#[path = "core_tests.rs"]
mod core_tests;
