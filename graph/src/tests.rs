// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashSet;

use crate::{CycleDetector, DependencyGraph, EdgeError, TransitionGraph};

#[test]
fn add_and_query_edges() {
    let mut graph = DependencyGraph::new();
    assert!(graph.add_edge("a", "b").unwrap());
    assert!(graph.add_edge("b", "c").unwrap());
    // Adding the same edge again is a no-op.
    assert!(!graph.add_edge("a", "b").unwrap());

    assert_eq!(graph.depends_on("a"), vec!["b".to_owned()]);
    assert_eq!(graph.depended_by("c"), vec!["b".to_owned()]);
    assert_eq!(graph.node_count(), 3);
    assert_eq!(graph.edge_count(), 2);

    let edges: HashSet<_> = graph.all_edges().into_iter().collect();
    assert!(edges.contains(&("a".to_owned(), "b".to_owned())));
    assert!(edges.contains(&("b".to_owned(), "c".to_owned())));
}

#[test]
fn rejects_self_edges() {
    let mut graph = DependencyGraph::new();
    assert_eq!(
        graph.add_edge("a", "a"),
        Err(EdgeError::SelfEdge("a".to_owned()))
    );
}

#[test]
fn rejects_cycles() {
    let mut graph = DependencyGraph::new();
    graph.add_edge("a", "b").unwrap();
    graph.add_edge("b", "c").unwrap();
    assert_eq!(
        graph.add_edge("c", "a"),
        Err(EdgeError::WouldCycle {
            from: "c".to_owned(),
            to: "a".to_owned(),
        })
    );
    // The graph remains acyclic after a rejected add.
    assert!(!graph.has_cycle("a"));
    assert!(!graph.has_cycle("c"));
}

#[test]
fn would_cycle_considers_pending_edges() {
    let mut graph = DependencyGraph::new();
    graph.add_edge("a", "b").unwrap();

    // Neither new edge alone cycles with the graph, but together they do.
    assert!(!graph.would_cycle(&[("b".to_owned(), "c".to_owned())]));
    assert!(graph.would_cycle(&[
        ("b".to_owned(), "c".to_owned()),
        ("c".to_owned(), "a".to_owned()),
    ]));
    // The probe must not have mutated the graph.
    assert_eq!(graph.edge_count(), 1);
}

#[test]
fn remove_edge() {
    let mut graph = DependencyGraph::new();
    graph.add_edge("a", "b").unwrap();
    assert!(graph.remove_edge("a", "b"));
    assert!(!graph.remove_edge("a", "b"));
    assert!(graph.depends_on("a").is_empty());

    // Removal makes room for the reverse edge.
    graph.add_edge("b", "a").unwrap();
}

#[test]
fn dependents_within_depth() {
    let mut graph = DependencyGraph::new();
    // d -> c -> b -> a
    graph.add_edge("d", "c").unwrap();
    graph.add_edge("c", "b").unwrap();
    graph.add_edge("b", "a").unwrap();

    assert_eq!(graph.dependents_within("a", 1), vec!["b".to_owned()]);
    assert_eq!(
        graph.dependents_within("a", 2),
        vec!["b".to_owned(), "c".to_owned()]
    );
    let all = graph.dependents_within("a", 100);
    assert_eq!(all.len(), 3);
    assert!(graph.dependents_within("missing", 100).is_empty());
}

#[test]
fn has_path() {
    let mut graph = DependencyGraph::new();
    graph.add_edge("a", "b").unwrap();
    graph.add_edge("b", "c").unwrap();
    assert!(graph.has_path("a", "c"));
    assert!(!graph.has_path("c", "a"));
    assert!(!graph.has_path("a", "missing"));
}

#[test]
fn brent_detects_two_cycle() {
    let mut detector = CycleDetector::new(100);
    assert_eq!(detector.add_step("A"), None);
    assert_eq!(detector.add_step("B"), None);
    let detected = detector.add_step("A").expect("Want a cycle");
    assert_eq!(detected.states, vec!["A".to_owned(), "B".to_owned()]);
    assert_eq!(detected.cycle_length, 2);
    assert_eq!(detected.tail_length, 0);
    assert_eq!(detector.cycles_detected(), 1);
}

#[test]
fn brent_detects_immediate_repeat() {
    let mut detector = CycleDetector::new(100);
    assert_eq!(detector.add_step("A"), None);
    let detected = detector.add_step("A").expect("Want a cycle");
    assert!(detected.cycle_length >= 1);
    assert_eq!(detected.tail_length, 0);
}

#[test]
fn brent_linear_sequence_has_no_cycle() {
    let mut detector = CycleDetector::new(100);
    for state in ["A", "B", "C", "D"] {
        assert_eq!(detector.add_step(state), None);
    }
    assert_eq!(detector.cycles_detected(), 0);
}

#[test]
fn brent_three_cycle() {
    let mut detector = CycleDetector::new(100);
    assert_eq!(detector.add_step("A"), None);
    assert_eq!(detector.add_step("B"), None);
    assert_eq!(detector.add_step("C"), None);
    let detected = detector.add_step("A").expect("Want a cycle");
    assert_eq!(
        detected.states,
        vec!["A".to_owned(), "B".to_owned(), "C".to_owned()]
    );
    assert_eq!(detected.cycle_length, 3);
    assert_eq!(detected.tail_length, 0);
}

#[test]
fn brent_resets_after_detection() {
    let mut detector = CycleDetector::new(100);
    detector.add_step("A");
    detector.add_step("B");
    detector.add_step("A").expect("Want a cycle");

    // The pointers were reset: a fresh cycle is detected from scratch.
    assert_eq!(detector.add_step("X"), None);
    assert_eq!(detector.add_step("Y"), None);
    let detected = detector.add_step("X").expect("Want a second cycle");
    assert_eq!(detected.cycle_length, 2);
    assert_eq!(detector.cycles_detected(), 2);
}

#[test]
fn brent_bounded_history_slides() {
    let mut detector = CycleDetector::new(4);
    for state in ["A", "B", "C", "D", "E", "F"] {
        assert_eq!(detector.add_step(state), None);
    }
    assert_eq!(detector.steps(), 6);
}

#[test]
fn tarjan_three_cycle_is_one_component() {
    let mut graph = TransitionGraph::new();
    graph.add_edge("A", "B");
    graph.add_edge("B", "C");
    graph.add_edge("C", "A");

    let analysis = graph
        .strongly_connected_components(10_000, || false)
        .unwrap();
    assert_eq!(analysis.components.len(), 1);
    assert_eq!(analysis.largest_component_size(), 3);
    assert_eq!(analysis.cyclic_components().len(), 1);
}

#[test]
fn tarjan_two_disjoint_two_cycles() {
    let mut graph = TransitionGraph::new();
    graph.add_edge("A", "B");
    graph.add_edge("B", "A");
    graph.add_edge("C", "D");
    graph.add_edge("D", "C");

    let analysis = graph
        .strongly_connected_components(10_000, || false)
        .unwrap();
    let cyclic = analysis.cyclic_components();
    assert_eq!(cyclic.len(), 2);
    assert!(cyclic.iter().all(|c| c.len() == 2));
}

#[test]
fn tarjan_linear_chain_is_singletons() {
    let mut graph = TransitionGraph::new();
    graph.add_edge("A", "B");
    graph.add_edge("B", "C");
    graph.add_edge("C", "D");

    let analysis = graph
        .strongly_connected_components(10_000, || false)
        .unwrap();
    assert_eq!(analysis.components.len(), 4);
    assert_eq!(analysis.largest_component_size(), 1);
    assert!(analysis.cyclic_components().is_empty());
}

#[test]
fn tarjan_mixed_graph() {
    let mut graph = TransitionGraph::new();
    // A tail into a 2-cycle, plus an isolated node.
    graph.add_edge("tail", "A");
    graph.add_edge("A", "B");
    graph.add_edge("B", "A");
    graph.ensure_node("lonely");

    let analysis = graph
        .strongly_connected_components(10_000, || false)
        .unwrap();
    assert_eq!(analysis.components.len(), 3);
    assert_eq!(analysis.largest_component_size(), 2);
}

#[test]
fn tarjan_respects_cancellation() {
    let mut graph = TransitionGraph::new();
    // A long chain, so that the poll cadence certainly fires.
    for i in 0..500 {
        graph.add_edge(&format!("n{i}"), &format!("n{}", i + 1));
    }

    let result = graph.strongly_connected_components(10_000, || true);
    assert_eq!(result.unwrap_err(), crate::SccError::Cancelled);
}

#[test]
fn tarjan_depth_limit() {
    let mut graph = TransitionGraph::new();
    for i in 0..100 {
        graph.add_edge(&format!("n{i}"), &format!("n{}", i + 1));
    }

    let result = graph.strongly_connected_components(10, || false);
    assert_eq!(result.unwrap_err(), crate::SccError::DepthLimitExceeded(10));
}
