// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::FnvHashMap as HashMap;
use serde::{Deserialize, Serialize};

/// Marks a node as disproven: no finite effort will prove it.
pub const INFINITE_PROOF: u64 = u64::MAX;

///
/// The proof-number search status of a node.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ProofStatus {
    Unknown,
    Expanded,
    Proven,
    Disproven,
}

///
/// Where a piece of evidence came from. The trust order is total:
/// `Unknown < Soft < Hard == Safety`. Only hard sources (deterministic oracles: tests, the
/// compiler, the safety gate) may mark a node `Disproven`; soft sources (LLM routing) may adjust
/// numbers but never disprove.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum SignalSource {
    Unknown,
    Soft,
    Hard,
    Safety,
}

impl SignalSource {
    pub fn is_hard(&self) -> bool {
        matches!(self, SignalSource::Hard | SignalSource::Safety)
    }

    fn trust_rank(&self) -> u8 {
        match self {
            SignalSource::Unknown => 0,
            SignalSource::Soft => 1,
            SignalSource::Hard | SignalSource::Safety => 2,
        }
    }

    ///
    /// The source of a merged delta: hard iff either input is hard.
    ///
    pub fn merge(self, other: SignalSource) -> SignalSource {
        if other.trust_rank() > self.trust_rank() {
            other
        } else {
            self
        }
    }
}

///
/// One node's proof-number record. `proof` estimates cost to prove (lower is better);
/// `INFINITE_PROOF` marks a disproven node.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProofEntry {
    pub proof: u64,
    pub disproof: u64,
    pub status: ProofStatus,
    pub source: SignalSource,
    pub updated_at_ms: i64,
}

impl ProofEntry {
    fn unknown(updated_at_ms: i64) -> ProofEntry {
        ProofEntry {
            proof: 0,
            disproof: 0,
            status: ProofStatus::Unknown,
            source: SignalSource::Unknown,
            updated_at_ms,
        }
    }
}

///
/// One update against a single node's proof record.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProofUpdate {
    Set {
        proof: u64,
        disproof: u64,
        status: ProofStatus,
    },
    /// Raises the proof number (the node got harder to prove).
    Increment { delta: u64 },
    /// Lowers the proof number.
    Decrement { delta: u64 },
    MarkProven,
    MarkDisproven,
}

impl ProofUpdate {
    ///
    /// Whether this update would put the node into `Disproven` status, which requires a hard
    /// source.
    ///
    pub fn disproves(&self) -> bool {
        match self {
            ProofUpdate::MarkDisproven => true,
            ProofUpdate::Set { status, .. } => *status == ProofStatus::Disproven,
            _ => false,
        }
    }
}

///
/// The proof index: node id to proof record.
///
#[derive(Clone, Debug, Default)]
pub struct ProofIndex {
    entries: HashMap<String, ProofEntry>,
}

impl ProofIndex {
    pub fn new() -> ProofIndex {
        ProofIndex::default()
    }

    pub fn get(&self, node_id: &str) -> Option<ProofEntry> {
        self.entries.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.entries.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A defensive copy of every entry.
    pub fn all(&self) -> Vec<(String, ProofEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn disproven_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.status == ProofStatus::Disproven)
            .map(|(k, _)| k.clone())
            .collect();
        nodes.sort();
        nodes
    }

    ///
    /// Applies one update to one node, creating the record if absent. Returns true if the stored
    /// entry changed.
    ///
    pub(crate) fn apply_update(
        &mut self,
        node_id: &str,
        update: &ProofUpdate,
        source: SignalSource,
        timestamp_ms: i64,
    ) -> bool {
        let entry = self
            .entries
            .entry(node_id.to_owned())
            .or_insert_with(|| ProofEntry::unknown(timestamp_ms));
        let before = entry.clone();

        match update {
            ProofUpdate::Set {
                proof,
                disproof,
                status,
            } => {
                entry.proof = *proof;
                entry.disproof = *disproof;
                entry.status = *status;
            }
            ProofUpdate::Increment { delta } => {
                entry.proof = entry.proof.saturating_add(*delta);
            }
            ProofUpdate::Decrement { delta } => {
                entry.proof = entry.proof.saturating_sub(*delta);
            }
            ProofUpdate::MarkProven => {
                entry.status = ProofStatus::Proven;
                entry.proof = 0;
            }
            ProofUpdate::MarkDisproven => {
                entry.status = ProofStatus::Disproven;
                entry.proof = INFINITE_PROOF;
            }
        }
        entry.source = source;
        entry.updated_at_ms = timestamp_ms;

        *entry != before
    }
}
