use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff with multiplicative jitter.
///
/// Attempt `k` sleeps `min(max, initial * mult^k)` scaled by a uniform
/// factor in `[1 - jitter, 1 + jitter]`. The attempt counter saturates, so
/// calling `next_delay` past `max_attempts` keeps yielding capped delays;
/// callers that want a hard stop check `exhausted()`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once `max_attempts` delays have been handed out.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// The un-jittered delay for attempt `k`.
    pub fn base_delay(&self, k: u32) -> Duration {
        let initial = self.config.initial.as_secs_f64();
        let raw = initial * self.config.multiplier.powi(k as i32);
        let capped = raw.min(self.config.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Produce the next jittered delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        jittered(base, self.config.jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Scale `base` by a uniform random factor in `[1 - jitter, 1 + jitter]`.
/// A jitter of zero returns `base` unchanged.
pub fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let jitter = jitter.min(1.0);
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
