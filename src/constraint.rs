// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::FnvHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::proof::SignalSource;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ConstraintType {
    MutualExclusion,
    Implication,
    Ordering,
    Resource,
}

///
/// A declarative constraint over a set of nodes, produced by constraint propagation.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub constraint_type: ConstraintType,
    pub nodes: Vec<String>,
    pub expression: String,
    pub active: bool,
    pub source: SignalSource,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Default)]
pub struct ConstraintIndex {
    constraints: HashMap<String, Constraint>,
}

impl ConstraintIndex {
    pub fn new() -> ConstraintIndex {
        ConstraintIndex::default()
    }

    pub fn get(&self, id: &str) -> Option<Constraint> {
        self.constraints.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constraints.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// A defensive copy of every constraint, ordered by id.
    pub fn all(&self) -> Vec<Constraint> {
        let mut constraints: Vec<_> = self.constraints.values().cloned().collect();
        constraints.sort_by(|a, b| a.id.cmp(&b.id));
        constraints
    }

    /// Active constraints mentioning the given node.
    pub fn for_node(&self, node_id: &str) -> Vec<Constraint> {
        let mut constraints: Vec<_> = self
            .constraints
            .values()
            .filter(|c| c.active && c.nodes.iter().any(|n| n == node_id))
            .cloned()
            .collect();
        constraints.sort_by(|a, b| a.id.cmp(&b.id));
        constraints
    }

    /// Returns true if the constraint replaced or differed from an existing one.
    pub(crate) fn insert(&mut self, constraint: Constraint) -> bool {
        let changed = self.constraints.get(&constraint.id) != Some(&constraint);
        self.constraints.insert(constraint.id.clone(), constraint);
        changed
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        self.constraints.remove(id).is_some()
    }
}
