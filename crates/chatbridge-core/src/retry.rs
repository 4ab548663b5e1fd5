//! Exponential backoff with a ceiling and optional jitter.
//!
//! Shared by outbound redelivery (keyed on the task's attempt count) and by
//! the events stream reconnect loop (keyed on consecutive failures).

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Ceiling for any single delay.
    pub max: Duration,
    pub multiplier: f64,
    /// Spread each delay over `[d/2, d]`.
    pub jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay for the `attempt`-th failure (1-indexed).
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at `max`. Attempt 0 is
    /// treated like attempt 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max.as_secs_f64());
        if !capped.is_finite() || capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(capped)
    }

    /// Delay to wait before the next try after the `attempt`-th failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        rand::thread_rng().gen_range(base / 2..=base)
    }
}
