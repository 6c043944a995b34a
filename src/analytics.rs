// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

pub const DEFAULT_ANALYTICS_CAPACITY: usize = 100;
pub const DEFAULT_MAX_RESULTS_PER_RECORD: usize = 200;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum AnalyticsQueryType {
    HotSpots,
    DeadCode,
    Cycles,
    Path,
    PageRank,
    Communities,
}

impl AnalyticsQueryType {
    ///
    /// The stable lowercase name used in proof marker keys
    /// (`analytics:<name>:done` / `analytics:<name>:found`).
    ///
    pub fn name(&self) -> &'static str {
        match self {
            AnalyticsQueryType::HotSpots => "hotspots",
            AnalyticsQueryType::DeadCode => "dead_code",
            AnalyticsQueryType::Cycles => "cycles",
            AnalyticsQueryType::Path => "path",
            AnalyticsQueryType::PageRank => "pagerank",
            AnalyticsQueryType::Communities => "communities",
        }
    }

    pub fn done_marker(&self) -> String {
        format!("analytics:{}:done", self.name())
    }

    pub fn found_marker(&self) -> String {
        format!("analytics:{}:found", self.name())
    }
}

///
/// The typed parameters an analytics query ran with.
///
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsParams {
    pub k: Option<usize>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub max_depth: Option<usize>,
}

///
/// One analytics query execution, as recorded in the bounded analytics log.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub id: String,
    pub query_type: AnalyticsQueryType,
    pub query_time_ms: i64,
    pub result_count: i64,
    pub execution_ms: i64,
    /// A bounded sample of rendered results.
    pub results: Vec<String>,
    pub params: AnalyticsParams,
    /// Cycles found, required when `query_type` is `Cycles` and `result_count > 0`.
    pub cycles: Option<Vec<Vec<String>>>,
    /// The path found, required when `query_type` is `Path` and `result_count > 0`.
    pub path: Option<Vec<String>>,
    pub graph_generation: u64,
}

///
/// The bounded, append-only analytics log.
///
#[derive(Clone, Debug)]
pub struct AnalyticsLog {
    records: VecDeque<AnalyticsRecord>,
    capacity: usize,
}

impl Default for AnalyticsLog {
    fn default() -> AnalyticsLog {
        AnalyticsLog::new(DEFAULT_ANALYTICS_CAPACITY)
    }
}

impl AnalyticsLog {
    pub fn new(capacity: usize) -> AnalyticsLog {
        AnalyticsLog {
            records: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    ///
    /// Appends a record, truncating its results to `max_results` and evicting the oldest record
    /// when full.
    ///
    pub(crate) fn append(&mut self, mut record: AnalyticsRecord, max_results: usize) {
        record.results.truncate(max_results);
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// A defensive copy of the log, oldest first.
    pub fn history(&self) -> Vec<AnalyticsRecord> {
        self.records.iter().cloned().collect()
    }

    /// The most recent record of the given type.
    pub fn last(&self, query_type: AnalyticsQueryType) -> Option<AnalyticsRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.query_type == query_type)
            .cloned()
    }

    pub fn has_run(&self, query_type: AnalyticsQueryType) -> bool {
        self.records.iter().any(|r| r.query_type == query_type)
    }
}

#[cfg(test)]
#[path = "analytics_tests.rs"]
mod analytics_tests;
