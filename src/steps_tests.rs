// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use task_executor::Executor;

use crate::clause::{Clause, ClauseScope, Literal};
use crate::context::Context;
use crate::core::{Crs, CrsOptions};
use crate::delta::{Delta, DependencyDelta};
use crate::dependency::DependencyEdge;
use crate::error::Error;
use crate::proof::{ProofStatus, ProofUpdate, SignalSource, INFINITE_PROOF};
use crate::steps::{
    state_key, tool_state_key, ErrorCategory, StepActor, StepDecision, StepOutcome, StepRecord,
};

fn new_crs() -> Crs {
    Crs::new(Executor::new(), CrsOptions::default())
}

fn step(session: &str, number: i64, tool: Option<&str>, outcome: StepOutcome) -> StepRecord {
    StepRecord {
        session_id: session.to_owned(),
        step_number: number,
        actor: StepActor::Agent,
        decision: if tool.is_some() {
            StepDecision::ExecuteTool
        } else {
            StepDecision::Respond
        },
        tool: tool.map(str::to_owned),
        outcome,
        reasoning: "test step".to_owned(),
        duration_ms: 10,
        confidence: 0.9,
        error_category: if outcome == StepOutcome::Failure {
            Some(ErrorCategory::Execution)
        } else {
            None
        },
        propagate: false,
        terminal: false,
        timestamp_ms: 1000 + number,
    }
}

#[tokio::test]
async fn record_step_validates() {
    let crs = new_crs();

    // Empty session id.
    let mut bad = step("", 1, None, StepOutcome::Success);
    bad.session_id = String::new();
    assert!(matches!(crs.record_step(bad).unwrap_err(), Error::Step(_)));

    // Negative duration.
    let mut bad = step("s", 1, None, StepOutcome::Success);
    bad.duration_ms = -1;
    crs.record_step(bad).unwrap_err();

    // Confidence out of range.
    let mut bad = step("s", 1, None, StepOutcome::Success);
    bad.confidence = 1.5;
    crs.record_step(bad).unwrap_err();

    // Failure without an error category.
    let mut bad = step("s", 1, None, StepOutcome::Failure);
    bad.error_category = None;
    crs.record_step(bad).unwrap_err();

    // A valid step lands in the session history.
    crs.record_step(step("s", 1, Some("shell"), StepOutcome::Success))
        .unwrap();
    assert_eq!(crs.session_step_count("s"), 1);
    assert_eq!(crs.session_steps("s")[0].step_number, 1);
}

#[test]
fn state_keys() {
    let with_tool = step("s", 1, Some("shell"), StepOutcome::Success);
    assert_eq!(state_key(&with_tool), "execute_tool:shell:success:agent");
    assert_eq!(tool_state_key(&with_tool), "shell:success");

    let without_tool = step("s", 1, None, StepOutcome::Failure);
    assert_eq!(state_key(&without_tool), "respond:no_tool:failure:agent");
    assert_eq!(tool_state_key(&without_tool), "no_tool:failure");
}

#[tokio::test]
async fn count_tool_executions_only_counts_execute_decisions() {
    let crs = new_crs();
    crs.record_step(step("s", 1, Some("shell"), StepOutcome::Success))
        .unwrap();
    crs.record_step(step("s", 2, Some("shell"), StepOutcome::Failure))
        .unwrap();
    crs.record_step(step("s", 3, Some("grep"), StepOutcome::Success))
        .unwrap();

    // A Respond step mentioning the tool does not count.
    let mut respond = step("s", 4, None, StepOutcome::Success);
    respond.tool = Some("shell".to_owned());
    crs.record_step(respond).unwrap();

    assert_eq!(crs.count_tool_executions("s", "shell"), 2);
    assert_eq!(crs.count_tool_executions("s", "grep"), 1);
    assert_eq!(crs.count_tool_executions("s", "missing"), 0);
    assert_eq!(crs.count_tool_executions("other-session", "shell"), 0);
}

#[tokio::test]
async fn breaker_fires_on_execution_count_without_proof_data() {
    let crs = new_crs();
    crs.record_step(step("s", 1, Some("shell"), StepOutcome::Failure))
        .unwrap();
    let decision = crs.check_circuit_breaker("s", "shell");
    assert!(!decision.should_fire);

    crs.record_step(step("s", 2, Some("shell"), StepOutcome::Failure))
        .unwrap();
    let decision = crs.check_circuit_breaker("s", "shell");
    assert!(decision.should_fire, "Want the fallback threshold to fire");
    assert_eq!(decision.status, ProofStatus::Unknown);
}

#[tokio::test]
async fn breaker_fires_on_disproven_state() {
    let crs = new_crs();
    let ctx = Context::background();

    let recorded = step("s", 1, Some("shell"), StepOutcome::Failure);
    crs.record_step(recorded.clone()).unwrap();

    // Proof-number search disproved the state this step reached.
    let node_id = format!("session:s:state:{}", state_key(&recorded));
    crs.apply(
        &ctx,
        Delta::proof_update(&node_id, ProofUpdate::MarkDisproven, SignalSource::Hard),
    )
    .await
    .unwrap();

    let decision = crs.check_circuit_breaker("s", "shell");
    assert!(decision.should_fire);
    assert_eq!(decision.status, ProofStatus::Disproven);
    assert_eq!(decision.proof_number, INFINITE_PROOF);

    // A different tool is unaffected.
    assert!(!crs.check_circuit_breaker("s", "grep").should_fire);
}

#[tokio::test]
async fn propagate_disproof_walks_dependents() {
    let crs = new_crs();
    let ctx = Context::background();

    // c -> b -> a: disproving a raises proof numbers for b and c.
    crs.apply(
        &ctx,
        Delta::Dependency(DependencyDelta {
            source: SignalSource::Hard,
            timestamp_ms: 1000,
            add: vec![DependencyEdge::new("c", "b"), DependencyEdge::new("b", "a")],
            remove: vec![],
        }),
    )
    .await
    .unwrap();

    let affected = crs.propagate_disproof(&ctx, "a").await.unwrap();
    assert_eq!(affected, 2);

    let snapshot = crs.snapshot();
    assert_eq!(snapshot.proof().get("b").unwrap().proof, 1);
    assert_eq!(snapshot.proof().get("c").unwrap().proof, 1);
    assert!(snapshot.proof().get("a").is_none());

    // No dependents, no delta.
    assert_eq!(crs.propagate_disproof(&ctx, "isolated").await.unwrap(), 0);
}

#[tokio::test]
async fn check_decision_allowed_consults_learned_clauses() {
    let crs = new_crs();

    // Learned: "do not run shell again after an outcome:failure".
    crs.add_clause(Clause {
        id: "no-shell-after-failure".to_owned(),
        literals: vec![
            Literal::new("tool:shell", true),
            Literal::new("outcome:failure", true),
        ],
        source: SignalSource::Hard,
        learned_at_ms: 1000,
        failure_type: "repeated_failure".to_owned(),
        session_id: "s".to_owned(),
        scope: ClauseScope::Session,
        use_count: 0,
        last_used_ms: 0,
    })
    .unwrap();

    // Before any failure, shell is allowed.
    let (allowed, _) = crs.check_decision_allowed("s", "shell");
    assert!(allowed);

    crs.record_step(step("s", 1, Some("shell"), StepOutcome::Failure))
        .unwrap();
    let (allowed, reason) = crs.check_decision_allowed("s", "shell");
    assert!(!allowed);
    assert!(reason.contains("no-shell-after-failure"));

    // The consulted clause's usage was recorded.
    let snapshot = crs.snapshot();
    assert_eq!(snapshot.clauses().get("no-shell-after-failure").unwrap().use_count, 1);

    // A different tool is allowed.
    let (allowed, _) = crs.check_decision_allowed("s", "grep");
    assert!(allowed);
}

#[tokio::test]
async fn add_clause_requires_hard_source_via_engine() {
    let crs = new_crs();
    let mut clause = Clause {
        id: "c".to_owned(),
        literals: vec![Literal::new("tool:x", true)],
        source: SignalSource::Soft,
        learned_at_ms: 1000,
        failure_type: String::new(),
        session_id: "s".to_owned(),
        scope: ClauseScope::Project,
        use_count: 0,
        last_used_ms: 0,
    };
    crs.add_clause(clause.clone()).unwrap_err();

    clause.source = SignalSource::Hard;
    crs.add_clause(clause).unwrap();
    assert_eq!(crs.snapshot().clauses().len(), 1);
}

#[tokio::test]
async fn clear_session_drops_steps_and_session_clauses() {
    let crs = new_crs();
    crs.record_step(step("s", 1, Some("shell"), StepOutcome::Success))
        .unwrap();
    crs.add_clause(Clause {
        id: "session-clause".to_owned(),
        literals: vec![Literal::new("tool:x", true)],
        source: SignalSource::Hard,
        learned_at_ms: 1000,
        failure_type: String::new(),
        session_id: "s".to_owned(),
        scope: ClauseScope::Session,
        use_count: 0,
        last_used_ms: 0,
    })
    .unwrap();

    crs.clear_session("s");
    assert_eq!(crs.session_step_count("s"), 0);
    assert_eq!(crs.snapshot().clauses().len(), 0);
}
