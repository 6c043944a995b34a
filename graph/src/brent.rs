// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

///
/// An online cycle detector over a stream of state keys, using Brent's algorithm: a stationary
/// tortoise pointer which periodically teleports to the hare, with the teleport interval doubling
/// each time.
///
/// Time per step is amortized O(1); memory is bounded by `max_history`.
///
#[derive(Clone, Debug)]
pub struct CycleDetector {
    power: u64,
    lambda: u64,
    tortoise: String,
    hare: String,
    state_seq: Vec<String>,
    max_history: usize,
    steps: u64,
    cycles_detected: u64,
}

///
/// A cycle found by the detector: the repeating slice of states, its length, and the number of
/// states preceding the first repetition.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DetectedCycle {
    pub states: Vec<String>,
    pub cycle_length: usize,
    pub tail_length: usize,
}

pub const DEFAULT_MAX_HISTORY: usize = 1000;

impl CycleDetector {
    pub fn new(max_history: usize) -> CycleDetector {
        CycleDetector {
            power: 1,
            lambda: 1,
            tortoise: String::new(),
            hare: String::new(),
            state_seq: Vec::new(),
            max_history: max_history.max(2),
            steps: 0,
            cycles_detected: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn cycles_detected(&self) -> u64 {
        self.cycles_detected
    }

    ///
    /// Feeds one state into the detector, returning the cycle that the state completes, if any.
    ///
    pub fn add_step(&mut self, state: &str) -> Option<DetectedCycle> {
        self.steps += 1;
        if self.state_seq.len() == self.max_history {
            // The sequence is full: slide it one to the left.
            self.state_seq.remove(0);
        }
        self.state_seq.push(state.to_owned());

        // The first step (and the first step after a detection) only initializes the pointers.
        if self.tortoise.is_empty() {
            self.tortoise = state.to_owned();
            self.hare = state.to_owned();
            return None;
        }

        self.hare = state.to_owned();
        if self.hare == self.tortoise && self.steps > 1 {
            let detected = self.extract_cycle();
            self.cycles_detected += 1;
            self.power = 1;
            self.lambda = 1;
            self.tortoise = String::new();
            self.hare = String::new();
            return Some(detected);
        }

        self.lambda += 1;
        if self.lambda == self.power {
            self.tortoise = self.hare.clone();
            self.power *= 2;
            self.lambda = 0;
        }

        None
    }

    ///
    /// Extracts the cycle that ends at the current sequence tail: walking back from the tail, the
    /// slice from the nearest prior occurrence of the tail state up to (but excluding) the tail
    /// is the cycle, and the index of that occurrence is the tail length.
    ///
    fn extract_cycle(&self) -> DetectedCycle {
        let end = self.state_seq.len() - 1;
        let target = &self.state_seq[end];
        let (states, tail_length) = match (0..end).rev().find(|&i| &self.state_seq[i] == target) {
            Some(i) => (self.state_seq[i..end].to_vec(), i),
            // The prior occurrence slid out of the bounded sequence: the repeated state alone is
            // the best reconstruction available.
            None => (vec![target.clone()], end),
        };

        DetectedCycle {
            cycle_length: states.len(),
            tail_length: tail_length,
            states: states,
        }
    }

    ///
    /// Clears all detector state, including the sequence. Used when a session ends.
    ///
    pub fn reset(&mut self) {
        self.power = 1;
        self.lambda = 1;
        self.tortoise = String::new();
        self.hare = String::new();
        self.state_seq.clear();
        self.steps = 0;
    }
}
