// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeMap;

use task_executor::Executor;

use crate::context::Context;
use crate::delta::{DeltaKind, IndexMask};
use crate::history_worker::{DeltaHistory, DeltaHistoryOptions, DeltaRecord};
use crate::proof::SignalSource;

fn record(generation: u64, nodes: &[&str]) -> DeltaRecord {
    DeltaRecord {
        id: format!("delta-{generation}"),
        generation,
        delta_kind: DeltaKind::Proof,
        source: SignalSource::Hard,
        session_id: "session-1".to_owned(),
        applied_at_ms: 1000 + generation as i64,
        indexes_affected: IndexMask::PROOF,
        affected_nodes: nodes.iter().map(|n| (*n).to_owned()).collect(),
        source_name: None,
        metadata: BTreeMap::new(),
    }
}

fn new_history(max_records: usize) -> DeltaHistory {
    DeltaHistory::new(
        &Executor::new(),
        DeltaHistoryOptions {
            max_records,
            queue_size: 64,
        },
    )
}

#[tokio::test]
async fn ring_evicts_oldest_and_keeps_secondary_indexes_consistent() {
    let history = new_history(3);
    let ctx = Context::background();

    for generation in 1..=10 {
        history.record(record(generation, &["node1"]));
    }
    // Close drains the queue, making the state deterministic.
    history.close().await;

    let all = history.all(&ctx).unwrap();
    assert_eq!(all.len(), 3);
    let generations: Vec<u64> = all.iter().map(|r| r.generation).collect();
    assert_eq!(generations, vec![8, 9, 10]);

    assert_eq!(history.get_by_generation(&ctx, 1).unwrap(), None);
    assert_eq!(
        history.get_by_generation(&ctx, 10).unwrap().unwrap().generation,
        10
    );

    // The node index agrees with the ring.
    let by_node = history.get_by_node(&ctx, "node1").unwrap();
    let node_generations: Vec<u64> = by_node.iter().map(|r| r.generation).collect();
    assert_eq!(node_generations, vec![8, 9, 10]);
    assert_eq!(history.size(&ctx).unwrap(), 3);
}

#[tokio::test]
async fn range_is_exclusive_low_inclusive_high() {
    let history = new_history(100);
    let ctx = Context::background();
    for generation in 1..=5 {
        history.record(record(generation, &[]));
    }
    history.close().await;

    let range = history.get_range(&ctx, 1, 4).unwrap();
    let generations: Vec<u64> = range.iter().map(|r| r.generation).collect();
    assert_eq!(generations, vec![2, 3, 4]);
}

#[tokio::test]
async fn explain_is_chronological_per_node() {
    let history = new_history(100);
    let ctx = Context::background();
    history.record(record(1, &["a", "b"]));
    history.record(record(2, &["b"]));
    history.record(record(3, &["a"]));
    history.close().await;

    let explain_a = history.explain(&ctx, "a").unwrap();
    let generations: Vec<u64> = explain_a.iter().map(|r| r.generation).collect();
    assert_eq!(generations, vec![1, 3]);

    assert!(history.explain(&ctx, "missing").unwrap().is_empty());

    // Once every record touching a node is evicted, the node index entry goes too.
    let history = new_history(1);
    history.record(record(1, &["gone"]));
    history.record(record(2, &["kept"]));
    history.close().await;
    assert!(history.get_by_node(&ctx, "gone").unwrap().is_empty());
    assert_eq!(history.get_by_node(&ctx, "kept").unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_context_is_respected() {
    let history = new_history(10);
    let (ctx, handle) = Context::cancellable();
    handle.cancel();
    assert!(history.all(&ctx).is_err());
    assert!(history.size(&ctx).is_err());
}

#[tokio::test]
async fn close_is_idempotent_and_drops_later_records() {
    let history = new_history(10);
    let ctx = Context::background();
    history.record(record(1, &[]));
    history.close().await;
    history.close().await;

    // Records after close are dropped, not errors.
    history.record(record(2, &[]));
    assert_eq!(history.size(&ctx).unwrap(), 1);
}
