// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use journal::JournalError;
use persistence::PersistenceError;

use crate::delta::DeltaKind;
use crate::proof::SignalSource;

///
/// Every failure the engine surfaces at its boundary. Variants are grouped by the component that
/// produces them; journal and persistence failures are carried intact.
///
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The operation's context was cancelled. Long loops poll for this at a bounded cadence and
    /// return it unchanged, never converted into a domain error.
    Cancelled,
    /// The engine has been closed.
    Closed,
    /// A delta failed validation against the latest snapshot; no state was changed.
    DeltaValidation(String),
    /// A delta carried a `Disproven` status from a source that is not hard. Only deterministic
    /// oracles may disprove.
    HardSoftBoundaryViolation { node: String, source: SignalSource },
    /// Two deltas could not be merged (differing kinds, or a kind without merge support).
    DeltaMerge(String),
    /// A mutator failed midway through an apply; all indexes were rolled back to their
    /// pre-apply state.
    ApplyRollback { kind: DeltaKind, cause: String },
    Journal(JournalError),
    Persistence(PersistenceError),
    /// A step record failed validation.
    Step(String),
    /// A clause could not be added to the store.
    Clause(String),
    /// The checkpoint on disk is older than the restorer accepts.
    CheckpointTooOld { age_ms: i64, max_age_ms: i64 },
    /// A modified-file scan exceeded its result limit.
    TooManyModifiedFiles { limit: usize },
    /// A session identifier could not be computed.
    SessionIdentifier(String),
    /// An operation required a registered external graph, and none is available.
    GraphNotAvailable,
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled => write!(f, "Operation was cancelled"),
            Error::Closed => write!(f, "The engine is closed"),
            Error::DeltaValidation(msg) => write!(f, "Delta validation failed: {msg}"),
            Error::HardSoftBoundaryViolation { node, source } => write!(
                f,
                "Only hard sources may disprove: node {node} was disproven by {source:?}"
            ),
            Error::DeltaMerge(msg) => write!(f, "Deltas could not be merged: {msg}"),
            Error::ApplyRollback { kind, cause } => {
                write!(f, "Apply of {kind} delta rolled back: {cause}")
            }
            Error::Journal(err) => write!(f, "{err}"),
            Error::Persistence(err) => write!(f, "{err}"),
            Error::Step(msg) => write!(f, "Invalid step record: {msg}"),
            Error::Clause(msg) => write!(f, "Clause rejected: {msg}"),
            Error::CheckpointTooOld { age_ms, max_age_ms } => write!(
                f,
                "Checkpoint is too old: {age_ms}ms exceeds the {max_age_ms}ms limit"
            ),
            Error::TooManyModifiedFiles { limit } => {
                write!(f, "More than {limit} files were modified")
            }
            Error::SessionIdentifier(msg) => {
                write!(f, "Failed to compute session identifier: {msg}")
            }
            Error::GraphNotAvailable => write!(f, "No external graph is registered"),
            Error::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<JournalError> for Error {
    fn from(err: JournalError) -> Self {
        Error::Journal(err)
    }
}

impl From<PersistenceError> for Error {
    fn from(err: PersistenceError) -> Self {
        Error::Persistence(err)
    }
}
