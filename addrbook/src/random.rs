//! Pluggable randomness for selection and timing decisions.
//!
//! Peer selection and feeler scheduling are probabilistic; routing them
//! through [`RandomSource`] lets tests drive the policies with seeded or
//! scripted sequences and assert exact decisions.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Source of randomness for the address book and the scheduler.
pub trait RandomSource: Send {
    /// Next raw 64-bit value.
    fn next_u64(&mut self) -> u64;

    /// Uniform value in `[0, 1)` with 53 bits of precision.
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform value in `[0, bound)`. `bound` must be non-zero.
    fn gen_range(&mut self, bound: u64) -> u64 {
        debug_assert!(bound > 0);
        self.next_u64() % bound
    }
}

/// Default randomness backed by [`rand::rngs::StdRng`].
#[derive(Debug)]
pub struct StdRandom(StdRng);

impl StdRandom {
    /// Source seeded from OS entropy.
    pub fn from_entropy() -> Self {
        StdRandom(StdRng::from_entropy())
    }

    /// Deterministic source for reproducible runs and tests.
    pub fn from_seed(seed: u64) -> Self {
        StdRandom(StdRng::seed_from_u64(seed))
    }
}

impl RandomSource for StdRandom {
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }
}
