// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::proof::SignalSource;

///
/// One recorded action against a node, in arrival order.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub node_id: String,
    pub action: String,
    pub result: String,
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct HistoryIndex {
    entries: Vec<HistoryEntry>,
    seen_ids: HashSet<String>,
}

impl HistoryIndex {
    pub fn new() -> HistoryIndex {
        HistoryIndex::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A defensive copy of the full ordered history.
    pub fn all(&self) -> Vec<HistoryEntry> {
        self.entries.clone()
    }

    /// Entries touching the given node, oldest first.
    pub fn for_node(&self, node_id: &str) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.node_id == node_id)
            .cloned()
            .collect()
    }

    /// The most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].to_vec()
    }

    /// Appends the entry unless its id was already recorded. Returns true if appended.
    pub(crate) fn append(&mut self, entry: HistoryEntry) -> bool {
        if self.seen_ids.contains(&entry.id) {
            return false;
        }
        self.seen_ids.insert(entry.id.clone());
        self.entries.push(entry);
        true
    }
}
