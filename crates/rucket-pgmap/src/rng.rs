// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Deterministic tie-breaking sequence for primary selection.
//!
//! Every process that recomputes primaries must arrive at the same answer
//! without talking to the others. The generator is therefore a plain
//! xorshift over a 32-bit word with a fixed starting value: reset it once
//! per pool, then draw for PGs in ascending PG number order.

/// Starting word after a reset.
pub const PRIMARY_RNG_SEED: i32 = 0x5f02_0e43;

/// Reseedable xorshift32 stream used to break ties between equally
/// eligible primary candidates.
///
/// Each pool-processing call owns its own instance. Sharing one between
/// concurrently processed pools interleaves the draws and breaks
/// reproducibility.
#[derive(Debug, Clone)]
pub struct PrimaryRng {
    seed: i32,
}

impl Default for PrimaryRng {
    fn default() -> Self {
        Self::new()
    }
}

impl PrimaryRng {
    /// Creates a generator in the reset state.
    #[must_use]
    pub fn new() -> Self {
        Self { seed: PRIMARY_RNG_SEED }
    }

    /// Returns the generator to its fixed starting word.
    pub fn reset(&mut self) {
        self.seed = PRIMARY_RNG_SEED;
    }

    /// Advances the stream and returns the next value.
    ///
    /// The shifts operate on the signed word (the right shift is
    /// arithmetic); the result is the word offset by 2^31 into the
    /// unsigned range.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        let mut s = self.seed;
        s ^= s << 13;
        s ^= s >> 17;
        s ^= s << 5;
        self.seed = s;
        (s as u32) ^ 0x8000_0000
    }

    /// Draws an index in `0..len`. `len` must be non-zero.
    pub fn pick(&mut self, len: usize) -> usize {
        debug_assert!(len > 0);
        (self.next() as usize) % len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sequence() {
        let mut rng = PrimaryRng::new();
        let values: Vec<u32> = (0..6).map(|_| rng.next()).collect();
        assert_eq!(values, vec![1_199_982_054, 1_751_829_787, 150_522_399, 651_737_730, 9_661_062, 3_585_593_479]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut rng = PrimaryRng::new();
        let first: Vec<u32> = (0..10).map(|_| rng.next()).collect();
        rng.reset();
        let second: Vec<u32> = (0..10).map(|_| rng.next()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_independent_instances_agree() {
        let mut a = PrimaryRng::new();
        let mut b = PrimaryRng::default();
        for _ in 0..1000 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn test_pick_in_range() {
        let mut rng = PrimaryRng::new();
        for len in 1..20 {
            assert!(rng.pick(len) < len);
        }
    }
}
