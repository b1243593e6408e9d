//! Exponential backoff with jitter
//!
//! `BackoffPolicy` is the pure part: `delay(attempt)` is
//! `min(initial * multiplier^attempt, ceiling)` scaled by a uniform factor in
//! `[1 - jitter, 1 + jitter]`. `Backoff` is the per-channel state that walks
//! the attempt counter and resets on a successful connection.

use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER: f64 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
    pub multiplier: f64,
    /// Half-width of the jitter band, as a fraction of the base delay.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay for `attempt` (0-based), capped at the ceiling.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling.as_secs_f64();
        let raw = self.initial.as_secs_f64() * self.multiplier.powf(attempt as f64);
        if !raw.is_finite() || raw > ceiling {
            return self.ceiling;
        }
        Duration::from_secs_f64(raw.max(0.0))
    }

    /// Jittered delay for `attempt`. Deterministic for a seeded `rng`.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 0.99);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    /// Largest delay this policy can ever produce.
    pub fn max_delay(&self) -> Duration {
        self.ceiling.mul_f64(1.0 + self.jitter.clamp(0.0, 0.99))
    }
}

/// Retry state owned by whichever session or pool is retrying.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    rng: ChaCha8Rng,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Delay for the current attempt, then escalate.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt, &mut self.rng);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset on successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
