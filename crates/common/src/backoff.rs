use std::{
    cmp,
    time::Duration,
};

use rand::Rng;

/// Exponential backoff with full jitter, capped at `max`.
///
/// A non-zero `floor` bounds each delay from below so pollers never spin,
/// even when the jitter draws close to zero.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    floor: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            floor: Duration::ZERO,
            failures: 0,
        }
    }

    pub fn with_floor(mut self, floor: Duration) -> Self {
        self.floor = cmp::min(floor, self.max);
        self
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        let ceiling = 2u32
            .checked_pow(self.failures)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |backoff| cmp::min(backoff, self.max));
        self.failures = self.failures.saturating_add(1);
        cmp::max(ceiling.mul_f32(rng.random::<f32>()), self.floor)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
