// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;

use crate::clause::{
    AddClauseOutcome, Clause, ClauseScope, ClauseStore, ClauseStoreOptions, Literal,
};
use crate::proof::SignalSource;

fn clause(id: &str, literals: Vec<Literal>) -> Clause {
    Clause {
        id: id.to_owned(),
        literals,
        source: SignalSource::Hard,
        learned_at_ms: 1000,
        failure_type: "tool_failure".to_owned(),
        session_id: "session-1".to_owned(),
        scope: ClauseScope::Project,
        use_count: 0,
        last_used_ms: 0,
    }
}

fn assignment(pairs: &[(&str, bool)]) -> HashMap<String, bool> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), *v))
        .collect()
}

#[test]
fn add_requires_hard_source() {
    let mut store = ClauseStore::new();
    let options = ClauseStoreOptions::default();

    let mut soft = clause("c1", vec![Literal::new("tool:x", true)]);
    soft.source = SignalSource::Soft;
    store.add(soft, &options).unwrap_err();

    let mut safety = clause("c2", vec![Literal::new("tool:x", true)]);
    safety.source = SignalSource::Safety;
    assert_eq!(
        store.add(safety, &options).unwrap(),
        AddClauseOutcome::Added("c2".to_owned())
    );
}

#[test]
fn add_rejects_empty_literals() {
    let mut store = ClauseStore::new();
    let options = ClauseStoreOptions::default();
    store.add(clause("c1", vec![]), &options).unwrap_err();
    store
        .add(clause("c2", vec![Literal::new("", true)]), &options)
        .unwrap_err();
}

#[test]
fn dedup_is_by_literal_multiset() {
    let mut store = ClauseStore::new();
    let options = ClauseStoreOptions::default();

    store
        .add(
            clause(
                "c1",
                vec![Literal::new("tool:x", true), Literal::new("outcome:success", false)],
            ),
            &options,
        )
        .unwrap();

    // The same literals in a different order are the same clause.
    let outcome = store
        .add(
            clause(
                "c2",
                vec![Literal::new("outcome:success", false), Literal::new("tool:x", true)],
            ),
            &options,
        )
        .unwrap();
    assert_eq!(outcome, AddClauseOutcome::Duplicate("c1".to_owned()));
    assert_eq!(store.len(), 1);

    // A genuinely different literal set is a new clause.
    let outcome = store
        .add(clause("c3", vec![Literal::new("tool:x", false)]), &options)
        .unwrap();
    assert_eq!(outcome, AddClauseOutcome::Added("c3".to_owned()));
}

#[test]
fn violation_requires_every_literal_false() {
    let mut store = ClauseStore::new();
    let options = ClauseStoreOptions::default();
    // Violated iff tool:x is true and outcome:success is false (both literals false).
    store
        .add(
            clause(
                "c1",
                vec![Literal::new("tool:x", true), Literal::new("outcome:success", false)],
            ),
            &options,
        )
        .unwrap();

    // Both literals false: violated.
    let violated = store.violated_clauses(&assignment(&[("tool:x", true), ("outcome:success", false)]));
    assert_eq!(violated, vec!["c1".to_owned()]);

    // One literal true: not violated.
    assert!(store
        .violated_clauses(&assignment(&[("tool:x", false), ("outcome:success", false)]))
        .is_empty());

    // One literal unassigned: not violated.
    assert!(store
        .violated_clauses(&assignment(&[("tool:x", true)]))
        .is_empty());
}

#[test]
fn lru_eviction_at_scope_capacity() {
    let mut store = ClauseStore::new();
    let options = ClauseStoreOptions {
        max_clauses: 2,
        ..ClauseStoreOptions::default()
    };

    store
        .add(clause("old", vec![Literal::new("tool:a", true)]), &options)
        .unwrap();
    store
        .add(clause("mid", vec![Literal::new("tool:b", true)]), &options)
        .unwrap();

    // Touch "old" so that "mid" becomes least recently used.
    assert!(store.touch("old", 2000));

    store
        .add(clause("new", vec![Literal::new("tool:c", true)]), &options)
        .unwrap();
    assert_eq!(store.len(), 2);
    assert!(store.get("mid").is_none());
    assert!(store.get("old").is_some());
    assert!(store.get("new").is_some());

    // The evicted clause's signature is free for re-learning.
    store
        .add(clause("mid-again", vec![Literal::new("tool:b", true)]), &options)
        .unwrap();
}

#[test]
fn touch_tracks_usage() {
    let mut store = ClauseStore::new();
    let options = ClauseStoreOptions::default();
    store
        .add(clause("c1", vec![Literal::new("tool:a", true)]), &options)
        .unwrap();

    assert!(store.touch("c1", 5000));
    assert!(store.touch("c1", 6000));
    assert!(!store.touch("missing", 6000));

    let stored = store.get("c1").unwrap();
    assert_eq!(stored.use_count, 2);
    assert_eq!(stored.last_used_ms, 6000);
}

#[test]
fn garbage_collect_respects_scope_ttls() {
    let mut store = ClauseStore::new();
    let options = ClauseStoreOptions::default();

    let mut session = clause("session", vec![Literal::new("tool:a", true)]);
    session.scope = ClauseScope::Session;
    let mut project = clause("project", vec![Literal::new("tool:b", true)]);
    project.scope = ClauseScope::Project;
    let mut global = clause("global", vec![Literal::new("tool:c", true)]);
    global.scope = ClauseScope::Global;
    for c in [session, project, global] {
        store.add(c, &options).unwrap();
    }

    // Ten days on: the project clause (7d TTL) expires, the global (30d) and session ones stay.
    let ten_days = 1000 + 10 * 24 * 60 * 60 * 1000;
    assert_eq!(store.garbage_collect(ten_days, &options), 1);
    assert!(store.get("project").is_none());
    assert!(store.get("global").is_some());
    assert!(store.get("session").is_some());

    // Session clauses go when their session is cleared.
    assert_eq!(store.clear_session("session-1"), 1);
    assert!(store.get("session").is_none());
    assert_eq!(store.clear_session("session-1"), 0);
}
