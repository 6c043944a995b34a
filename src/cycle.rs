// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::time::Instant;

use fnv::FnvHashMap as HashMap;
use graph::{CycleDetector, SccError, TransitionGraph};
use log::{debug, info};
use parking_lot::Mutex;

use crate::context::Context;
use crate::core::Crs;
use crate::delta::Delta;
use crate::error::Error;
use crate::proof::{ProofUpdate, SignalSource};
use crate::steps::{state_key, StepActor, StepDecision, StepOutcome, StepRecord};

///
/// What online detection found for one step, and what was done about it.
///
#[derive(Clone, Debug, Default)]
pub struct CycleDetectionResult {
    pub detected: bool,
    pub cycle: Vec<String>,
    pub cycle_length: usize,
    pub tail_length: usize,
    /// The (negative) step number of the injected breaker step.
    pub breaker_step_number: Option<i64>,
    /// Failures encountered while reacting to the cycle. Detection itself still succeeds.
    pub errors: Vec<String>,
}

///
/// The post-hoc SCC summary of one session's transition graph.
///
#[derive(Clone, Debug, PartialEq)]
pub struct SessionCycleAnalysis {
    pub session_id: String,
    pub total_sccs: usize,
    /// Components of size > 1: certain cycles.
    pub cyclic_sccs: usize,
    pub largest_scc_size: usize,
    /// When the analysis ran (unix ms).
    pub analysis_time_ms: i64,
    /// How long it took.
    pub analysis_duration_ms: i64,
}

///
/// Per-session online cycle detection over step state keys, and its engine integration: on
/// detection, every state in the cycle is disproven (hard source) and a system breaker step is
/// injected into the session history.
///
pub struct CycleTracker {
    detectors: Mutex<HashMap<String, CycleDetector>>,
    max_history: usize,
}

impl CycleTracker {
    pub fn new(max_history: usize) -> CycleTracker {
        CycleTracker {
            detectors: Mutex::new(HashMap::default()),
            max_history,
        }
    }

    ///
    /// Feeds one (already recorded) step into the session's detector. On detection: disproves
    /// every state in the cycle, injects a breaker step with a negative step number, and reports
    /// what happened. Reaction failures are collected into the result rather than dropped; the
    /// detection itself still succeeds.
    ///
    pub async fn check_cycle_on_step(
        &self,
        ctx: &Context,
        crs: &Crs,
        step: &StepRecord,
    ) -> Result<CycleDetectionResult, Error> {
        ctx.check()?;
        let state = state_key(step);
        let detected = {
            let mut detectors = self.detectors.lock();
            detectors
                .entry(step.session_id.clone())
                .or_insert_with(|| CycleDetector::new(self.max_history))
                .add_step(&state)
        };

        let Some(cycle) = detected else {
            return Ok(CycleDetectionResult::default());
        };
        ctx.check()?;

        info!(
            "Cycle of length {} detected in session {}: [{}]",
            cycle.cycle_length,
            step.session_id,
            cycle.states.join(" -> ")
        );

        let mut errors = Vec::new();
        let unique_states: BTreeSet<&String> = cycle.states.iter().collect();
        for cycle_state in unique_states {
            let node_id = format!("session:{}:state:{cycle_state}", step.session_id);
            let delta =
                Delta::proof_update(&node_id, ProofUpdate::MarkDisproven, SignalSource::Hard);
            if let Err(err) = crs.apply(ctx, delta).await {
                errors.push(format!("Failed to disprove {node_id}: {err}"));
            }
        }

        // Inject the breaker step. Negative numbers mark system-injected steps.
        let breaker_step_number = -(crs.session_step_count(&step.session_id) as i64 + 1);
        let breaker = StepRecord {
            session_id: step.session_id.clone(),
            step_number: breaker_step_number,
            actor: StepActor::System,
            decision: StepDecision::Terminate,
            tool: None,
            outcome: StepOutcome::Skipped,
            reasoning: format!("Circuit breaker: cycle detected [{}]", cycle.states.join(" -> ")),
            duration_ms: 0,
            confidence: 1.0,
            error_category: None,
            propagate: false,
            terminal: false,
            timestamp_ms: crate::now_ms(),
        };
        if let Err(err) = crs.record_step(breaker) {
            errors.push(format!("Failed to record breaker step: {err}"));
        }

        Ok(CycleDetectionResult {
            detected: true,
            cycle: cycle.states,
            cycle_length: cycle.cycle_length,
            tail_length: cycle.tail_length,
            breaker_step_number: Some(breaker_step_number),
            errors,
        })
    }

    /// Drops the session's detector state. Called at session end.
    pub fn clear_session(&self, session_id: &str) {
        self.detectors.lock().remove(session_id);
    }

    ///
    /// Post-hoc analysis: builds the session's state transition graph (nodes are state keys,
    /// edges are consecutive-but-distinct transitions) and summarizes its strongly connected
    /// components. Polls for cancellation while Tarjan runs.
    ///
    pub fn analyze_session_cycles(
        &self,
        ctx: &Context,
        crs: &Crs,
        session_id: &str,
    ) -> Result<SessionCycleAnalysis, Error> {
        ctx.check()?;
        let analysis_time_ms = crate::now_ms();
        let started = Instant::now();

        let steps = crs.session_steps(session_id);
        let mut graph = TransitionGraph::new();
        for step in &steps {
            graph.ensure_node(&state_key(step));
        }
        for window in steps.windows(2) {
            let from = state_key(&window[0]);
            let to = state_key(&window[1]);
            if from != to {
                graph.add_edge(&from, &to);
            }
        }

        let analysis = graph
            .strongly_connected_components(crs.options.scc_depth_cap, || ctx.is_cancelled())
            .map_err(|err| match err {
                SccError::Cancelled => Error::Cancelled,
                SccError::DepthLimitExceeded(limit) => Error::Io(format!(
                    "Session {session_id} SCC analysis exceeded depth limit {limit}"
                )),
            })?;

        debug!(
            "Session {session_id}: {} SCCs over {} states",
            analysis.components.len(),
            graph.node_count()
        );

        Ok(SessionCycleAnalysis {
            session_id: session_id.to_owned(),
            total_sccs: analysis.components.len(),
            cyclic_sccs: analysis.cyclic_components().len(),
            largest_scc_size: analysis.largest_component_size(),
            analysis_time_ms,
            analysis_duration_ms: started.elapsed().as_millis() as i64,
        })
    }
}

#[cfg(test)]
#[path = "cycle_tests.rs"]
mod cycle_tests;
