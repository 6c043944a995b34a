// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::analytics::{AnalyticsQueryType, AnalyticsRecord};
use crate::constraint::Constraint;
use crate::dependency::DependencyEdge;
use crate::error::Error;
use crate::history::HistoryEntry;
use crate::proof::{ProofUpdate, SignalSource};
use crate::similarity::SimilarityPair;
use crate::snapshot::Snapshot;

///
/// Which indexes a delta touches, as a small bitmask. Serializes as an array of index names for
/// backward compatible JSON; the parser also accepts the raw integer form.
///
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct IndexMask(u8);

impl IndexMask {
    pub const PROOF: IndexMask = IndexMask(1 << 0);
    pub const CONSTRAINT: IndexMask = IndexMask(1 << 1);
    pub const SIMILARITY: IndexMask = IndexMask(1 << 2);
    pub const DEPENDENCY: IndexMask = IndexMask(1 << 3);
    pub const HISTORY: IndexMask = IndexMask(1 << 4);
    pub const STREAMING: IndexMask = IndexMask(1 << 5);
    pub const ANALYTICS: IndexMask = IndexMask(1 << 6);

    const NAMES: [(IndexMask, &'static str); 7] = [
        (IndexMask::PROOF, "proof"),
        (IndexMask::CONSTRAINT, "constraint"),
        (IndexMask::SIMILARITY, "similarity"),
        (IndexMask::DEPENDENCY, "dependency"),
        (IndexMask::HISTORY, "history"),
        (IndexMask::STREAMING, "streaming"),
        (IndexMask::ANALYTICS, "analytics"),
    ];

    pub fn empty() -> IndexMask {
        IndexMask(0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> IndexMask {
        IndexMask(bits)
    }

    pub fn contains(&self, other: IndexMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(&self, other: IndexMask) -> IndexMask {
        IndexMask(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The names of the set bits, in canonical order.
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(mask, _)| self.contains(*mask))
            .map(|(_, name)| *name)
            .collect()
    }

    fn from_name(name: &str) -> Option<IndexMask> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(mask, _)| *mask)
    }
}

impl Serialize for IndexMask {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(self.names())
    }
}

impl<'de> Deserialize<'de> for IndexMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IndexMaskVisitor;

        impl<'de> Visitor<'de> for IndexMaskVisitor {
            type Value = IndexMask;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an array of index names or an integer bitmask")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<IndexMask, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut mask = IndexMask::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    let bit = IndexMask::from_name(&name).ok_or_else(|| {
                        serde::de::Error::custom(format!("Unknown index name: {name:?}"))
                    })?;
                    mask = mask.union(bit);
                }
                Ok(mask)
            }

            fn visit_u64<E>(self, v: u64) -> Result<IndexMask, E>
            where
                E: serde::de::Error,
            {
                u8::try_from(v)
                    .map(IndexMask::from_bits)
                    .map_err(|_| E::custom(format!("Bitmask out of range: {v}")))
            }

            fn visit_i64<E>(self, v: i64) -> Result<IndexMask, E>
            where
                E: serde::de::Error,
            {
                u8::try_from(v)
                    .map(IndexMask::from_bits)
                    .map_err(|_| E::custom(format!("Bitmask out of range: {v}")))
            }
        }

        deserializer.deserialize_any(IndexMaskVisitor)
    }
}

///
/// The kind tag of a delta.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum DeltaKind {
    Proof,
    Constraint,
    Similarity,
    Dependency,
    History,
    Streaming,
    Composite,
    Analytics,
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeltaKind::Proof => "proof",
            DeltaKind::Constraint => "constraint",
            DeltaKind::Similarity => "similarity",
            DeltaKind::Dependency => "dependency",
            DeltaKind::History => "history",
            DeltaKind::Streaming => "streaming",
            DeltaKind::Composite => "composite",
            DeltaKind::Analytics => "analytics",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProofDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub updates: BTreeMap<String, ProofUpdate>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub add: Vec<Constraint>,
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarityDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub pairs: Vec<SimilarityPair>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DependencyDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub add: Vec<DependencyEdge>,
    pub remove: Vec<DependencyEdge>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub entries: Vec<HistoryEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamingDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub increments: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    pub children: Vec<Delta>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsDelta {
    pub source: SignalSource,
    pub timestamp_ms: i64,
    /// Absent records fail validation; the Option mirrors the wire format, where the record is a
    /// separate optional message.
    pub record: Option<AnalyticsRecord>,
}

///
/// An atomic, validated change request against engine state: a closed sum dispatched by
/// exhaustive match in Apply, so no unknown kind can enter the critical section.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Proof(ProofDelta),
    Constraint(ConstraintDelta),
    Similarity(SimilarityDelta),
    Dependency(DependencyDelta),
    History(HistoryDelta),
    Streaming(StreamingDelta),
    Composite(CompositeDelta),
    Analytics(AnalyticsDelta),
}

impl Delta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Delta::Proof(_) => DeltaKind::Proof,
            Delta::Constraint(_) => DeltaKind::Constraint,
            Delta::Similarity(_) => DeltaKind::Similarity,
            Delta::Dependency(_) => DeltaKind::Dependency,
            Delta::History(_) => DeltaKind::History,
            Delta::Streaming(_) => DeltaKind::Streaming,
            Delta::Composite(_) => DeltaKind::Composite,
            Delta::Analytics(_) => DeltaKind::Analytics,
        }
    }

    pub fn source(&self) -> SignalSource {
        match self {
            Delta::Proof(d) => d.source,
            Delta::Constraint(d) => d.source,
            Delta::Similarity(d) => d.source,
            Delta::Dependency(d) => d.source,
            Delta::History(d) => d.source,
            Delta::Streaming(d) => d.source,
            Delta::Composite(d) => d.source,
            Delta::Analytics(d) => d.source,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Delta::Proof(d) => d.timestamp_ms,
            Delta::Constraint(d) => d.timestamp_ms,
            Delta::Similarity(d) => d.timestamp_ms,
            Delta::Dependency(d) => d.timestamp_ms,
            Delta::History(d) => d.timestamp_ms,
            Delta::Streaming(d) => d.timestamp_ms,
            Delta::Composite(d) => d.timestamp_ms,
            Delta::Analytics(d) => d.timestamp_ms,
        }
    }

    ///
    /// A single-node proof delta. Disproving requires a hard source, which validation enforces.
    ///
    pub fn proof_update(node_id: &str, update: ProofUpdate, source: SignalSource) -> Delta {
        let mut updates = BTreeMap::new();
        updates.insert(node_id.to_owned(), update);
        Delta::Proof(ProofDelta {
            source,
            timestamp_ms: crate::now_ms(),
            updates,
        })
    }

    ///
    /// Checks this delta against the given snapshot. A delta that validates cleanly will not
    /// fail Apply validation against the same state.
    ///
    pub fn validate(&self, snapshot: &Snapshot) -> Result<(), Error> {
        match self {
            Delta::Proof(d) => {
                for (node, update) in &d.updates {
                    if update.disproves() && !d.source.is_hard() {
                        return Err(Error::HardSoftBoundaryViolation {
                            node: node.clone(),
                            source: d.source,
                        });
                    }
                    match update {
                        ProofUpdate::Increment { delta } | ProofUpdate::Decrement { delta }
                            if *delta == 0 =>
                        {
                            return Err(Error::DeltaValidation(format!(
                                "Zero increment for node {node}"
                            )));
                        }
                        _ => (),
                    }
                }
                Ok(())
            }
            Delta::Constraint(d) => {
                let mut ids = HashSet::new();
                for constraint in &d.add {
                    if !ids.insert(constraint.id.as_str()) {
                        return Err(Error::DeltaValidation(format!(
                            "Duplicate constraint id in add list: {}",
                            constraint.id
                        )));
                    }
                }
                for id in &d.remove {
                    if !snapshot.constraints().contains(id) {
                        return Err(Error::DeltaValidation(format!(
                            "Cannot remove absent constraint: {id}"
                        )));
                    }
                }
                Ok(())
            }
            Delta::Similarity(d) => {
                for pair in &d.pairs {
                    if pair.a == pair.b {
                        return Err(Error::DeltaValidation(format!(
                            "Self similarity pair: {}",
                            pair.a
                        )));
                    }
                    if pair.distance.is_nan() || pair.distance < 0.0 {
                        return Err(Error::DeltaValidation(format!(
                            "Invalid distance {} for pair ({}, {})",
                            pair.distance, pair.a, pair.b
                        )));
                    }
                }
                Ok(())
            }
            Delta::Dependency(d) => {
                for edge in d.add.iter().chain(d.remove.iter()) {
                    if edge.from == edge.to {
                        return Err(Error::DeltaValidation(format!(
                            "Self dependency edge on {}",
                            edge.from
                        )));
                    }
                }
                let new_edges: Vec<(String, String)> = d
                    .add
                    .iter()
                    .map(|e| (e.from.clone(), e.to.clone()))
                    .collect();
                if snapshot.internal_dependencies().would_cycle(&new_edges) {
                    return Err(Error::DeltaValidation(
                        "Dependency additions would create a cycle".to_owned(),
                    ));
                }
                Ok(())
            }
            Delta::History(d) => {
                for entry in &d.entries {
                    if entry.id.is_empty() {
                        return Err(Error::DeltaValidation(
                            "History entries require an id".to_owned(),
                        ));
                    }
                }
                Ok(())
            }
            Delta::Streaming(_) => Ok(()),
            Delta::Composite(d) => {
                for child in &d.children {
                    child.validate(snapshot)?;
                }
                Ok(())
            }
            Delta::Analytics(d) => {
                let Some(record) = &d.record else {
                    return Err(Error::DeltaValidation(
                        "Analytics delta requires a record".to_owned(),
                    ));
                };
                if record.query_time_ms == 0 {
                    return Err(Error::DeltaValidation(
                        "Analytics records require a query time".to_owned(),
                    ));
                }
                if record.result_count < 0 {
                    return Err(Error::DeltaValidation(format!(
                        "Negative result count: {}",
                        record.result_count
                    )));
                }
                if record.execution_ms < 0 {
                    return Err(Error::DeltaValidation(format!(
                        "Negative execution time: {}",
                        record.execution_ms
                    )));
                }
                if record.result_count > 0 {
                    match record.query_type {
                        AnalyticsQueryType::Cycles if record.cycles.is_none() => {
                            return Err(Error::DeltaValidation(
                                "Cycles records with results require the cycles payload"
                                    .to_owned(),
                            ));
                        }
                        AnalyticsQueryType::Path if record.path.is_none() => {
                            return Err(Error::DeltaValidation(
                                "Path records with results require the path payload".to_owned(),
                            ));
                        }
                        _ => (),
                    }
                }
                Ok(())
            }
        }
    }

    ///
    /// Merges `other` into this delta. Only same-kind merges are supported, and only for the
    /// kinds with a meaningful combination: per-key timestamp-wins for Proof, set dedup for
    /// Constraint, summed increments for Streaming, union for History, and concatenation for
    /// Composite. The merged source is hard iff either input was.
    ///
    pub fn merge(self, other: Delta) -> Result<Delta, Error> {
        match (self, other) {
            (Delta::Proof(mut a), Delta::Proof(b)) => {
                let b_wins = b.timestamp_ms >= a.timestamp_ms;
                for (node, update) in b.updates {
                    if b_wins || !a.updates.contains_key(&node) {
                        a.updates.insert(node, update);
                    }
                }
                a.source = a.source.merge(b.source);
                a.timestamp_ms = a.timestamp_ms.max(b.timestamp_ms);
                Ok(Delta::Proof(a))
            }
            (Delta::Constraint(mut a), Delta::Constraint(b)) => {
                let known: HashSet<String> = a.add.iter().map(|c| c.id.clone()).collect();
                for constraint in b.add {
                    if !known.contains(&constraint.id) {
                        a.add.push(constraint);
                    }
                }
                let removals: BTreeSet<String> =
                    a.remove.drain(..).chain(b.remove.into_iter()).collect();
                a.remove = removals.into_iter().collect();
                a.source = a.source.merge(b.source);
                a.timestamp_ms = a.timestamp_ms.max(b.timestamp_ms);
                Ok(Delta::Constraint(a))
            }
            (Delta::Streaming(mut a), Delta::Streaming(b)) => {
                for (item, count) in b.increments {
                    *a.increments.entry(item).or_insert(0) += count;
                }
                a.source = a.source.merge(b.source);
                a.timestamp_ms = a.timestamp_ms.max(b.timestamp_ms);
                Ok(Delta::Streaming(a))
            }
            (Delta::History(mut a), Delta::History(b)) => {
                let known: HashSet<String> = a.entries.iter().map(|e| e.id.clone()).collect();
                for entry in b.entries {
                    if !known.contains(&entry.id) {
                        a.entries.push(entry);
                    }
                }
                a.source = a.source.merge(b.source);
                a.timestamp_ms = a.timestamp_ms.max(b.timestamp_ms);
                Ok(Delta::History(a))
            }
            (Delta::Composite(mut a), Delta::Composite(b)) => {
                a.children.extend(b.children);
                a.source = a.source.merge(b.source);
                a.timestamp_ms = a.timestamp_ms.max(b.timestamp_ms);
                Ok(Delta::Composite(a))
            }
            (a, b) => Err(Error::DeltaMerge(format!(
                "Cannot merge {} with {}",
                a.kind(),
                b.kind()
            ))),
        }
    }

    ///
    /// Whether the two deltas touch the same logical key. Analytics, History and Streaming
    /// deltas never conflict.
    ///
    pub fn conflicts_with(&self, other: &Delta) -> bool {
        match (self, other) {
            (Delta::Composite(a), _) => a.children.iter().any(|c| c.conflicts_with(other)),
            (_, Delta::Composite(b)) => b.children.iter().any(|c| self.conflicts_with(c)),
            (Delta::Proof(a), Delta::Proof(b)) => {
                a.updates.keys().any(|k| b.updates.contains_key(k))
            }
            (Delta::Constraint(a), Delta::Constraint(b)) => {
                let a_ids: HashSet<&str> = a
                    .add
                    .iter()
                    .map(|c| c.id.as_str())
                    .chain(a.remove.iter().map(String::as_str))
                    .collect();
                b.add
                    .iter()
                    .map(|c| c.id.as_str())
                    .chain(b.remove.iter().map(String::as_str))
                    .any(|id| a_ids.contains(id))
            }
            (Delta::Similarity(a), Delta::Similarity(b)) => {
                let a_keys: HashSet<(String, String)> =
                    a.pairs.iter().map(SimilarityPair::canonical_key).collect();
                b.pairs.iter().any(|p| a_keys.contains(&p.canonical_key()))
            }
            (Delta::Dependency(a), Delta::Dependency(b)) => {
                let a_edges: HashSet<&DependencyEdge> =
                    a.add.iter().chain(a.remove.iter()).collect();
                b.add
                    .iter()
                    .chain(b.remove.iter())
                    .any(|e| a_edges.contains(e))
            }
            _ => false,
        }
    }

    ///
    /// The indexes an Apply of this delta will touch. Analytics deltas touch the proof index as
    /// well, via the completion markers they write.
    ///
    pub fn indexes_affected(&self) -> IndexMask {
        match self {
            Delta::Proof(_) => IndexMask::PROOF,
            Delta::Constraint(_) => IndexMask::CONSTRAINT,
            Delta::Similarity(_) => IndexMask::SIMILARITY,
            Delta::Dependency(_) => IndexMask::DEPENDENCY,
            Delta::History(_) => IndexMask::HISTORY,
            Delta::Streaming(_) => IndexMask::STREAMING,
            Delta::Analytics(_) => IndexMask::ANALYTICS.union(IndexMask::PROOF),
            Delta::Composite(d) => d
                .children
                .iter()
                .fold(IndexMask::empty(), |mask, child| {
                    mask.union(child.indexes_affected())
                }),
        }
    }

    ///
    /// The node ids this delta touches: the canonical extraction used by both the delta-history
    /// worker and conflict explanation. History, Streaming and Analytics deltas touch no nodes.
    ///
    pub fn affected_nodes(&self) -> Vec<String> {
        let mut nodes = BTreeSet::new();
        self.collect_affected_nodes(&mut nodes);
        nodes.into_iter().collect()
    }

    fn collect_affected_nodes(&self, nodes: &mut BTreeSet<String>) {
        match self {
            Delta::Proof(d) => {
                nodes.extend(d.updates.keys().cloned());
            }
            Delta::Similarity(d) => {
                for pair in &d.pairs {
                    nodes.insert(pair.a.clone());
                    nodes.insert(pair.b.clone());
                }
            }
            Delta::Constraint(d) => {
                for constraint in &d.add {
                    nodes.extend(constraint.nodes.iter().cloned());
                }
            }
            Delta::Dependency(d) => {
                for edge in d.add.iter().chain(d.remove.iter()) {
                    nodes.insert(edge.from.clone());
                    nodes.insert(edge.to.clone());
                }
            }
            Delta::Composite(d) => {
                for child in &d.children {
                    child.collect_affected_nodes(nodes);
                }
            }
            Delta::History(_) | Delta::Streaming(_) | Delta::Analytics(_) => (),
        }
    }
}

#[cfg(test)]
#[path = "delta_tests.rs"]
mod delta_tests;
