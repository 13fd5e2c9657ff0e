//! Exponential backoff with jitter for failed handler attempts.

use std::time::Duration;

use rand::Rng;

/// Retry limits and backoff shape for the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction (0.0 to 1.0) of the delay added or removed at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// `attempts` is the number of attempts already made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt without jitter: `base * 2^(attempt - 1)`,
    /// capped at `max_delay`. `attempt` is 1 for the first retry.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let multiplier = 2_u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay for `attempt`, drawn from `rng`, clamped to `[0, max_delay]`.
    pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.backoff(attempt);
        let factor = self.jitter.clamp(0.0, 1.0);
        let spread = delay.as_secs_f64() * factor;
        if spread <= 0.0 {
            return delay;
        }
        let offset = rng.gen_range(-spread..=spread);
        let jittered = (delay.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }

    /// Combines the attempt limit and the delay calculation.
    pub fn decide<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> RetryDecision {
        if self.should_retry(attempts) {
            RetryDecision::RetryAfter(self.next_delay(attempts, rng))
        } else {
            RetryDecision::GiveUp
        }
    }
}
