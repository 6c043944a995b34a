// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use hashlink::LinkedHashMap;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::proof::SignalSource;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

///
/// How long a learned clause lives, and how it is reviewed.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ClauseScope {
    /// Lives until the owning session ends.
    Session,
    /// The default: expires after a week.
    Project,
    /// Long-lived; removed by manual review or the 30 day TTL.
    Global,
}

#[derive(Clone, Debug)]
pub struct ClauseStoreOptions {
    /// The per-scope LRU capacity.
    pub max_clauses: usize,
    pub project_ttl_ms: i64,
    pub global_ttl_ms: i64,
}

impl Default for ClauseStoreOptions {
    fn default() -> ClauseStoreOptions {
        ClauseStoreOptions {
            max_clauses: 1000,
            project_ttl_ms: 7 * DAY_MS,
            global_ttl_ms: 30 * DAY_MS,
        }
    }
}

///
/// One literal over a `"<kind>:<value>"` variable (e.g. `"tool:shell"`, `"outcome:success"`).
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Literal {
    pub variable: String,
    pub negated: bool,
}

impl Literal {
    pub fn new(variable: &str, negated: bool) -> Literal {
        Literal {
            variable: variable.to_owned(),
            negated,
        }
    }

    ///
    /// Evaluates under the given partial assignment: None while the variable is unassigned.
    ///
    fn eval(&self, assignment: &HashMap<String, bool>) -> Option<bool> {
        assignment
            .get(&self.variable)
            .map(|&value| value != self.negated)
    }
}

///
/// A learned CDCL clause: a disjunction of literals recording a combination that must not recur.
/// The clause is violated iff every literal is assigned false; it is not violated while any
/// literal remains unassigned.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub id: String,
    pub literals: Vec<Literal>,
    pub source: SignalSource,
    pub learned_at_ms: i64,
    pub failure_type: String,
    pub session_id: String,
    pub scope: ClauseScope,
    pub use_count: u64,
    pub last_used_ms: i64,
}

///
/// The learned-clause store: LRU bounded per scope, TTL garbage collected, deduplicated by
/// literal multiset.
///
#[derive(Clone, Debug, Default)]
pub struct ClauseStore {
    // Iteration order is least recently used first.
    clauses: LinkedHashMap<String, Clause>,
    // Canonical literal signature -> clause id, for semantic deduplication.
    signatures: HashMap<String, String>,
}

///
/// The outcome of an add: either a newly stored clause, or the id of the semantically equal
/// clause that was already present.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AddClauseOutcome {
    Added(String),
    Duplicate(String),
}

impl ClauseStore {
    pub fn new() -> ClauseStore {
        ClauseStore::default()
    }

    ///
    /// The canonical signature of a literal set: sorted, so permutations of the same multiset
    /// collapse to one clause.
    ///
    fn signature(literals: &[Literal]) -> String {
        let mut sorted = literals.to_vec();
        sorted.sort();
        sorted
            .iter()
            .map(|l| format!("{}{}", if l.negated { "!" } else { "" }, l.variable))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub(crate) fn add(
        &mut self,
        clause: Clause,
        options: &ClauseStoreOptions,
    ) -> Result<AddClauseOutcome, Error> {
        if !clause.source.is_hard() {
            return Err(Error::Clause(format!(
                "Clauses require a hard source, got {:?}",
                clause.source
            )));
        }
        if clause.literals.is_empty() {
            return Err(Error::Clause("Clauses require at least one literal".to_owned()));
        }
        if clause.literals.iter().any(|l| l.variable.is_empty()) {
            return Err(Error::Clause("Literal variables must be non-empty".to_owned()));
        }

        let signature = Self::signature(&clause.literals);
        if let Some(existing) = self.signatures.get(&signature) {
            return Ok(AddClauseOutcome::Duplicate(existing.clone()));
        }

        // At capacity for this scope: evict its least recently used clause.
        let scope_count = self
            .clauses
            .values()
            .filter(|c| c.scope == clause.scope)
            .count();
        if scope_count >= options.max_clauses {
            let evict_id = self
                .clauses
                .iter()
                .find(|(_, c)| c.scope == clause.scope)
                .map(|(id, _)| id.clone());
            if let Some(id) = evict_id {
                self.remove(&id);
            }
        }

        let id = clause.id.clone();
        self.signatures.insert(signature, id.clone());
        self.clauses.insert(id.clone(), clause);
        Ok(AddClauseOutcome::Added(id))
    }

    pub fn get(&self, id: &str) -> Option<Clause> {
        self.clauses.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// A defensive copy of all clauses, least recently used first.
    pub fn all(&self) -> Vec<Clause> {
        self.clauses.values().cloned().collect()
    }

    ///
    /// The ids of clauses violated by the given assignment. Each clause scan stops at the first
    /// literal that is unassigned or true, since a single such literal keeps a clause satisfied
    /// or undecided.
    ///
    pub fn violated_clauses(&self, assignment: &HashMap<String, bool>) -> Vec<String> {
        self.clauses
            .iter()
            .filter(|(_, clause)| {
                clause
                    .literals
                    .iter()
                    .all(|literal| literal.eval(assignment) == Some(false))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    ///
    /// Records a use of the clause: bumps its use count and moves it to the recently used end.
    ///
    pub(crate) fn touch(&mut self, id: &str, now_ms: i64) -> bool {
        if let Some(clause) = self.clauses.get_mut(id) {
            clause.use_count += 1;
            clause.last_used_ms = now_ms;
            self.clauses.to_back(id);
            true
        } else {
            false
        }
    }

    ///
    /// Removes clauses past their scope's TTL, returning how many were removed. Session scoped
    /// clauses are not TTL collected; see `Self::clear_session`.
    ///
    pub(crate) fn garbage_collect(&mut self, now_ms: i64, options: &ClauseStoreOptions) -> usize {
        let expired: Vec<String> = self
            .clauses
            .iter()
            .filter(|(_, clause)| match clause.scope {
                ClauseScope::Session => false,
                ClauseScope::Project => now_ms - clause.learned_at_ms > options.project_ttl_ms,
                ClauseScope::Global => now_ms - clause.learned_at_ms > options.global_ttl_ms,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired.len()
    }

    /// Removes every session-scoped clause learned by the given session.
    pub(crate) fn clear_session(&mut self, session_id: &str) -> usize {
        let stale: Vec<String> = self
            .clauses
            .iter()
            .filter(|(_, c)| c.scope == ClauseScope::Session && c.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.remove(id);
        }
        stale.len()
    }

    fn remove(&mut self, id: &str) -> bool {
        if let Some(clause) = self.clauses.remove(id) {
            self.signatures.remove(&Self::signature(&clause.literals));
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
#[path = "clause_tests.rs"]
mod clause_tests;
