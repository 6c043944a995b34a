// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::analytics::{AnalyticsLog, AnalyticsParams, AnalyticsQueryType, AnalyticsRecord};

fn record(id: &str, query_type: AnalyticsQueryType, result_count: i64) -> AnalyticsRecord {
    AnalyticsRecord {
        id: id.to_owned(),
        query_type,
        query_time_ms: 1000,
        result_count,
        execution_ms: 2,
        results: (0..result_count).map(|i| format!("r{i}")).collect(),
        params: AnalyticsParams::default(),
        cycles: None,
        path: None,
        graph_generation: 0,
    }
}

#[test]
fn ring_is_bounded_and_chronological() {
    let mut log = AnalyticsLog::new(3);
    for i in 0..5 {
        log.append(record(&format!("q{i}"), AnalyticsQueryType::HotSpots, 0), 200);
    }

    let history = log.history();
    assert_eq!(log.len(), 3);
    let ids: Vec<&str> = history.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["q2", "q3", "q4"]);
}

#[test]
fn results_are_truncated_on_append() {
    let mut log = AnalyticsLog::new(10);
    log.append(record("big", AnalyticsQueryType::PageRank, 500), 200);
    assert_eq!(log.history()[0].results.len(), 200);
    assert_eq!(log.history()[0].result_count, 500);
}

#[test]
fn last_and_has_run_are_per_type() {
    let mut log = AnalyticsLog::new(10);
    log.append(record("first", AnalyticsQueryType::HotSpots, 1), 200);
    log.append(record("other", AnalyticsQueryType::DeadCode, 0), 200);
    log.append(record("second", AnalyticsQueryType::HotSpots, 2), 200);

    assert!(log.has_run(AnalyticsQueryType::HotSpots));
    assert!(log.has_run(AnalyticsQueryType::DeadCode));
    assert!(!log.has_run(AnalyticsQueryType::Cycles));

    assert_eq!(log.last(AnalyticsQueryType::HotSpots).unwrap().id, "second");
    assert_eq!(log.last(AnalyticsQueryType::DeadCode).unwrap().id, "other");
    assert_eq!(log.last(AnalyticsQueryType::Path), None);
}

#[test]
fn marker_keys() {
    assert_eq!(
        AnalyticsQueryType::HotSpots.done_marker(),
        "analytics:hotspots:done"
    );
    assert_eq!(
        AnalyticsQueryType::DeadCode.found_marker(),
        "analytics:dead_code:found"
    );
}
