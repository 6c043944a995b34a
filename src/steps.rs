// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clause::{AddClauseOutcome, Clause};
use crate::context::Context;
use crate::core::Crs;
use crate::delta::Delta;
use crate::error::Error;
use crate::proof::{ProofStatus, ProofUpdate, INFINITE_PROOF};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum StepActor {
    Agent,
    System,
    User,
}

impl fmt::Display for StepActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepActor::Agent => "agent",
            StepActor::System => "system",
            StepActor::User => "user",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum StepDecision {
    ExecuteTool,
    Respond,
    Reflect,
    Terminate,
}

impl fmt::Display for StepDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepDecision::ExecuteTool => "execute_tool",
            StepDecision::Respond => "respond",
            StepDecision::Reflect => "reflect",
            StepDecision::Terminate => "terminate",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success,
    Failure,
    Timeout,
    Skipped,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
            StepOutcome::Timeout => "timeout",
            StepOutcome::Skipped => "skipped",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Timeout,
    Validation,
    Execution,
    Resource,
    Unknown,
}

///
/// One decision an activity took in a session. Negative step numbers are reserved for
/// system-injected steps (the cycle breaker).
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub session_id: String,
    pub step_number: i64,
    pub actor: StepActor,
    pub decision: StepDecision,
    pub tool: Option<String>,
    pub outcome: StepOutcome,
    pub reasoning: String,
    pub duration_ms: i64,
    pub confidence: f64,
    pub error_category: Option<ErrorCategory>,
    pub propagate: bool,
    pub terminal: bool,
    pub timestamp_ms: i64,
}

impl StepRecord {
    fn validate(&self) -> Result<(), Error> {
        if self.session_id.is_empty() {
            return Err(Error::Step("Steps require a session id".to_owned()));
        }
        if self.duration_ms < 0 {
            return Err(Error::Step(format!(
                "Negative duration: {}",
                self.duration_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Step(format!(
                "Confidence out of [0, 1]: {}",
                self.confidence
            )));
        }
        if self.outcome == StepOutcome::Failure && self.error_category.is_none() {
            return Err(Error::Step(
                "Failed steps require an error category".to_owned(),
            ));
        }
        Ok(())
    }
}

///
/// The canonical semantic identity of a step for cycle detection:
/// `"{decision}:{tool}:{outcome}:{actor}"`.
///
pub fn state_key(step: &StepRecord) -> String {
    format!(
        "{}:{}:{}:{}",
        step.decision,
        step.tool.as_deref().unwrap_or("no_tool"),
        step.outcome,
        step.actor
    )
}

///
/// A coarser key that ignores decision and actor: `"{tool}:{outcome}"`.
///
pub fn tool_state_key(step: &StepRecord) -> String {
    format!(
        "{}:{}",
        step.tool.as_deref().unwrap_or("no_tool"),
        step.outcome
    )
}

///
/// The circuit breaker's verdict on a proposed tool execution.
///
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerDecision {
    pub should_fire: bool,
    pub reason: String,
    pub proof_number: u64,
    pub status: ProofStatus,
}

impl Crs {
    ///
    /// Validates and appends a step to its session's history.
    ///
    pub fn record_step(&self, step: StepRecord) -> Result<(), Error> {
        step.validate()?;
        let mut steps = self.steps.lock();
        steps.entry(step.session_id.clone()).or_default().push(step);
        Ok(())
    }

    /// A defensive copy of the session's steps, in arrival order.
    pub fn session_steps(&self, session_id: &str) -> Vec<StepRecord> {
        self.steps
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn session_step_count(&self, session_id: &str) -> usize {
        self.steps.lock().get(session_id).map(Vec::len).unwrap_or(0)
    }

    /// Drops the session's step history and session-scoped clauses. Called at session end.
    pub fn clear_session(&self, session_id: &str) {
        self.steps.lock().remove(session_id);
        let mut state = self.state.write();
        Arc::make_mut(&mut state.clauses).clear_session(session_id);
    }

    ///
    /// How many times the session has executed the given tool. Only `ExecuteTool` decisions
    /// count; reflections and responses mentioning a tool do not.
    ///
    pub fn count_tool_executions(&self, session_id: &str, tool: &str) -> usize {
        self.steps
            .lock()
            .get(session_id)
            .map(|steps| {
                steps
                    .iter()
                    .filter(|s| {
                        s.decision == StepDecision::ExecuteTool && s.tool.as_deref() == Some(tool)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    ///
    /// Vetoes tool executions that proof-number search has abandoned: fires when any state the
    /// session reached with this tool is `Disproven` (or carries an infinite proof number), or,
    /// absent any proof data for those states, when the tool has already been executed
    /// `breaker_threshold` times.
    ///
    pub fn check_circuit_breaker(&self, session_id: &str, tool: &str) -> BreakerDecision {
        let candidate_keys: Vec<String> = {
            let steps = self.steps.lock();
            steps
                .get(session_id)
                .map(|steps| {
                    steps
                        .iter()
                        .filter(|s| s.tool.as_deref() == Some(tool))
                        .flat_map(|s| [state_key(s), tool_state_key(s)])
                        .map(|key| format!("session:{session_id}:state:{key}"))
                        .collect()
                })
                .unwrap_or_default()
        };

        let snapshot = self.snapshot();
        let mut saw_proof_data = false;
        for key in &candidate_keys {
            if let Some(entry) = snapshot.proof().get(key) {
                saw_proof_data = true;
                if entry.status == ProofStatus::Disproven || entry.proof == INFINITE_PROOF {
                    return BreakerDecision {
                        should_fire: true,
                        reason: format!("State {key} is disproven"),
                        proof_number: entry.proof,
                        status: entry.status,
                    };
                }
            }
        }

        if !saw_proof_data {
            let executions = self.count_tool_executions(session_id, tool);
            if executions >= self.options.breaker_threshold {
                return BreakerDecision {
                    should_fire: true,
                    reason: format!(
                        "No proof data, and tool {tool} already executed {executions} times"
                    ),
                    proof_number: 0,
                    status: ProofStatus::Unknown,
                };
            }
        }

        BreakerDecision {
            should_fire: false,
            reason: "No disproven state involves this tool".to_owned(),
            proof_number: 0,
            status: ProofStatus::Unknown,
        }
    }

    ///
    /// Propagates a disproof upward: breadth-first over the dependency graph (depth capped),
    /// incrementing the proof number of every transitive dependent. Returns how many nodes were
    /// affected.
    ///
    pub async fn propagate_disproof(&self, ctx: &Context, node_id: &str) -> Result<usize, Error> {
        ctx.check()?;
        let dependents = {
            let state = self.state.read();
            state
                .dependencies
                .dependents_within(node_id, self.options.disproof_depth_cap)
        };
        if dependents.is_empty() {
            return Ok(0);
        }

        let updates = dependents
            .iter()
            .map(|node| (node.clone(), ProofUpdate::Increment { delta: 1 }))
            .collect();
        self.apply(
            ctx,
            Delta::Proof(crate::delta::ProofDelta {
                source: crate::proof::SignalSource::Hard,
                timestamp_ms: crate::now_ms(),
                updates,
            }),
        )
        .await?;
        Ok(dependents.len())
    }

    ///
    /// Checks a proposed tool selection against the learned clauses: builds the hypothetical
    /// variable assignment from the session's step history plus the proposal, and reports the
    /// first violated clause, if any.
    ///
    pub fn check_decision_allowed(&self, session_id: &str, tool: &str) -> (bool, String) {
        let mut assignment: HashMap<String, bool> = HashMap::new();
        for step in self.session_steps(session_id) {
            if let Some(step_tool) = &step.tool {
                assignment.insert(format!("tool:{step_tool}"), true);
            }
            assignment.insert(format!("outcome:{}", step.outcome), true);
        }
        assignment.insert(format!("tool:{tool}"), true);

        let snapshot = self.snapshot();
        let violated = snapshot.clauses().violated_clauses(&assignment);
        match violated.first() {
            Some(clause_id) => {
                // Record the use, so the offending clause survives LRU pressure.
                let mut state = self.state.write();
                Arc::make_mut(&mut state.clauses).touch(clause_id, crate::now_ms());
                (
                    false,
                    format!("Clause {clause_id} forbids this combination"),
                )
            }
            None => (true, "No learned clause forbids this selection".to_owned()),
        }
    }

    ///
    /// Stores a learned clause. Requires a hard source; deduplicates by literal multiset; evicts
    /// the least recently used clause of the same scope at capacity.
    ///
    pub fn add_clause(&self, clause: Clause) -> Result<AddClauseOutcome, Error> {
        let mut state = self.state.write();
        let options = self.options.clause_store.clone();
        Arc::make_mut(&mut state.clauses).add(clause, &options)
    }

    ///
    /// Removes clauses past their scope TTL, returning the number removed.
    ///
    pub fn garbage_collect_clauses(&self) -> usize {
        let mut state = self.state.write();
        let options = self.options.clause_store.clone();
        Arc::make_mut(&mut state.clauses).garbage_collect(crate::now_ms(), &options)
    }
}

#[cfg(test)]
#[path = "steps_tests.rs"]
mod steps_tests;
