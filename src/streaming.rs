// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

// Count-min sketch dimensions. Four rows of 2048 counters keep the frequency overestimate small
// for the stream sizes a session produces, at 64KiB of memory.
const SKETCH_DEPTH: usize = 4;
const SKETCH_WIDTH: usize = 2048;

// HyperLogLog register count (2^10). The standard error at this size is about 3.25%.
const HLL_REGISTER_BITS: u32 = 10;
const HLL_REGISTERS: usize = 1 << HLL_REGISTER_BITS;

fn hash_with_seed(item: &str, seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    item.hash(&mut hasher);
    hasher.finish()
}

///
/// The streaming index: approximate per-item frequencies (count-min sketch) and approximate
/// distinct cardinality (HyperLogLog) over a stream of string items.
///
#[derive(Clone, Debug)]
pub struct StreamingIndex {
    counters: Vec<u64>,
    registers: Vec<u8>,
    total: u64,
}

impl Default for StreamingIndex {
    fn default() -> StreamingIndex {
        StreamingIndex {
            counters: vec![0; SKETCH_DEPTH * SKETCH_WIDTH],
            registers: vec![0; HLL_REGISTERS],
            total: 0,
        }
    }
}

impl StreamingIndex {
    pub fn new() -> StreamingIndex {
        StreamingIndex::default()
    }

    /// Observes `count` occurrences of the item. Returns true (the sketch always changes).
    pub(crate) fn observe(&mut self, item: &str, count: u64) -> bool {
        for row in 0..SKETCH_DEPTH {
            let column = (hash_with_seed(item, row as u64) % SKETCH_WIDTH as u64) as usize;
            let slot = &mut self.counters[row * SKETCH_WIDTH + column];
            *slot = slot.saturating_add(count);
        }

        let hash = hash_with_seed(item, u64::from(u32::MAX));
        let register = (hash >> (64 - HLL_REGISTER_BITS)) as usize;
        // Rank of the first set bit in the remaining bits, 1-based.
        let remaining = hash << HLL_REGISTER_BITS;
        let rank = (remaining.leading_zeros() + 1).min(64 - HLL_REGISTER_BITS + 1) as u8;
        if rank > self.registers[register] {
            self.registers[register] = rank;
        }

        self.total += count;
        true
    }

    ///
    /// The approximate number of times the item was observed. Never underestimates.
    ///
    pub fn estimated_count(&self, item: &str) -> u64 {
        (0..SKETCH_DEPTH)
            .map(|row| {
                let column = (hash_with_seed(item, row as u64) % SKETCH_WIDTH as u64) as usize;
                self.counters[row * SKETCH_WIDTH + column]
            })
            .min()
            .unwrap_or(0)
    }

    ///
    /// The approximate number of distinct items observed.
    ///
    pub fn estimated_distinct(&self) -> u64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2.0_f64.powi(-i32::from(r)))
            .sum();
        let raw = alpha * m * m / sum;

        // Small-range correction: fall back to linear counting while registers are mostly empty.
        let zeros = self.registers.iter().filter(|&&r| r == 0).count();
        if raw <= 2.5 * m && zeros > 0 {
            (m * (m / zeros as f64).ln()).round() as u64
        } else {
            raw.round() as u64
        }
    }

    /// The exact total number of observations (not distinct).
    pub fn total_items(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::StreamingIndex;

    #[test]
    fn counts_are_never_underestimates() {
        let mut index = StreamingIndex::new();
        index.observe("a", 5);
        index.observe("b", 2);
        index.observe("a", 1);

        assert!(index.estimated_count("a") >= 6);
        assert!(index.estimated_count("b") >= 2);
        assert_eq!(index.estimated_count("never-seen"), 0);
        assert_eq!(index.total_items(), 8);
    }

    #[test]
    fn distinct_estimate_is_close() {
        let mut index = StreamingIndex::new();
        for i in 0..1000 {
            index.observe(&format!("item-{i}"), 1);
        }
        let estimate = index.estimated_distinct();
        // Within 10% of the true cardinality, far looser than the expected 3.25% error.
        assert!((900..=1100).contains(&estimate), "estimate was {estimate}");
    }

    #[test]
    fn repeated_items_do_not_inflate_distinct() {
        let mut index = StreamingIndex::new();
        for _ in 0..100 {
            index.observe("same", 1);
        }
        assert!(index.estimated_distinct() <= 2);
        assert!(index.estimated_count("same") >= 100);
    }
}
