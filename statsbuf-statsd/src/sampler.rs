use std::fmt;

use parking_lot::Mutex;
use rand::distr::StandardUniform;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

/// Decides whether an individual observation is recorded.
///
/// Sampling happens on the producer side before an event is created, so sampled-out
/// observations never reach the collector.
pub trait Sampler: Send + Sync + 'static {
    /// Draws a uniform value in `[0, 1)`.
    fn draw(&self) -> f64;

    /// Returns `true` if an observation at the given rate should be recorded.
    ///
    /// Rates of `1.0` and above always fire without drawing, rates of `0.0` and below never fire.
    fn should_fire(&self, rate: f64) -> bool {
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            self.draw() < rate
        }
    }
}

/// A sampler drawing from the thread-local random number generator.
///
/// Suited for contended use from many producer threads.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn draw(&self) -> f64 {
        rand::rng().sample(StandardUniform)
    }
}

/// A deterministic sampler seeded with a fixed value.
///
/// All draws go through a single generator behind a lock, which makes the sequence of decisions
/// reproducible for a single producer thread.
pub struct SeededSampler {
    rng: Mutex<Pcg32>,
}

impl SeededSampler {
    /// Creates a sampler from the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(Pcg32::seed_from_u64(seed)),
        }
    }
}

impl Sampler for SeededSampler {
    fn draw(&self) -> f64 {
        self.rng.lock().sample(StandardUniform)
    }
}

impl fmt::Debug for SeededSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededSampler").finish_non_exhaustive()
    }
}
