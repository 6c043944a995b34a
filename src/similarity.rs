// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

///
/// One symmetric similarity observation. Stored under the canonical ordering `a < b`, so forward
/// and reverse lookups are equivalent.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarityPair {
    pub a: String,
    pub b: String,
    pub distance: f64,
}

impl SimilarityPair {
    ///
    /// The canonical `(low, high)` key for this pair.
    ///
    pub fn canonical_key(&self) -> (String, String) {
        canonical_key(&self.a, &self.b)
    }
}

pub(crate) fn canonical_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

///
/// The similarity index: a symmetric mapping from node pairs to distances in `[0, +inf)`.
/// Self pairs are rejected by delta validation and never stored.
///
#[derive(Clone, Debug, Default)]
pub struct SimilarityIndex {
    distances: BTreeMap<(String, String), f64>,
}

impl SimilarityIndex {
    pub fn new() -> SimilarityIndex {
        SimilarityIndex::default()
    }

    pub fn distance(&self, a: &str, b: &str) -> Option<f64> {
        self.distances.get(&canonical_key(a, b)).copied()
    }

    pub fn len(&self) -> usize {
        self.distances.len()
    }

    ///
    /// The `k` nearest neighbours of the given node, ascending by distance.
    ///
    pub fn nearest(&self, node: &str, k: usize) -> Vec<(String, f64)> {
        let mut neighbours: Vec<(String, f64)> = self
            .distances
            .iter()
            .filter_map(|((a, b), &distance)| {
                if a == node {
                    Some((b.clone(), distance))
                } else if b == node {
                    Some((a.clone(), distance))
                } else {
                    None
                }
            })
            .collect();
        neighbours.sort_by(|x, y| x.1.partial_cmp(&y.1).expect("Distances are never NaN"));
        neighbours.truncate(k);
        neighbours
    }

    ///
    /// All stored pairs with `a < b`, optionally truncated. Defensive copies.
    ///
    pub fn pairs(&self, cap: Option<usize>) -> Vec<SimilarityPair> {
        let iter = self.distances.iter().map(|((a, b), &distance)| SimilarityPair {
            a: a.clone(),
            b: b.clone(),
            distance,
        });
        match cap {
            Some(cap) => iter.take(cap).collect(),
            None => iter.collect(),
        }
    }

    /// Returns true if the stored distance changed.
    pub(crate) fn set(&mut self, a: &str, b: &str, distance: f64) -> bool {
        let key = canonical_key(a, b);
        let changed = self.distances.get(&key) != Some(&distance);
        self.distances.insert(key, distance);
        changed
    }
}
