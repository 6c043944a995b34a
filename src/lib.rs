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

//! The Constraint Reasoning System: the central mutable state container of a search agent that
//! reasons over a code graph. Concurrent activities read immutable snapshots and submit typed
//! deltas; the engine applies them atomically, journals them, learns from failures, and restores
//! itself across process restarts.

pub mod analytics;
pub mod clause;
pub mod constraint;
mod context;
pub mod core;
pub mod cycle;
pub mod delta;
pub mod dependency;
mod error;
pub mod history;
mod history_worker;
pub mod proof;
pub mod session;
pub mod similarity;
pub mod snapshot;
pub mod steps;
pub mod streaming;

pub use crate::analytics::{AnalyticsParams, AnalyticsQueryType, AnalyticsRecord};
pub use crate::clause::{AddClauseOutcome, Clause, ClauseScope, ClauseStoreOptions, Literal};
pub use crate::constraint::{Constraint, ConstraintType};
pub use crate::context::{CancellationHandle, Context};
pub use crate::core::{ApplyMetrics, Checkpoint, Crs, CrsOptions, Evaluable, HealthStatus};
pub use crate::cycle::{CycleDetectionResult, CycleTracker, SessionCycleAnalysis};
pub use crate::delta::{Delta, DeltaKind, IndexMask};
pub use crate::dependency::{
    DependencyEdge, DependencyView, GraphAnalyticsQuery, GraphBackedDependencies, GraphQuery,
    SymbolInfo,
};
pub use crate::error::Error;
pub use crate::history::HistoryEntry;
pub use crate::history_worker::{DeltaHistory, DeltaHistoryOptions, DeltaRecord};
pub use crate::proof::{ProofEntry, ProofStatus, ProofUpdate, SignalSource, INFINITE_PROOF};
pub use crate::session::{
    find_files_modified_since, ModifiedFilesOptions, RestoreOutcome, SessionIdentifier,
    SessionRestorer, SessionRestorerOptions,
};
pub use crate::similarity::SimilarityPair;
pub use crate::snapshot::Snapshot;
pub use crate::steps::{
    state_key, tool_state_key, BreakerDecision, ErrorCategory, StepActor, StepDecision,
    StepOutcome, StepRecord,
};

pub use persistence::RefreshCoordinator as GraphRefreshCoordinator;

use std::time::{SystemTime, UNIX_EPOCH};

/// Unix milliseconds, the timestamp representation used everywhere durability or cross-process
/// comparison matters.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Surely you're not before the unix epoch?")
        .as_millis() as i64
}
