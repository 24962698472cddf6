//! Session Reconnect Backoff
//!
//! Exponential backoff with jitter for re-establishing a dropped session
//! under its existing client identity.

use std::time::Duration;

use rand::Rng;

/// Backoff shape for session reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor per retry (values below 1.0 are treated as 1.0).
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Retries allowed after the first failure (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

/// Delay sequence for one reconnect episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    /// Fresh sequence starting at the initial delay.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let next = config.initial_delay;
        Self {
            config,
            next,
            attempts: 0,
        }
    }

    /// Delays handed out so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    fn jittered(&self, base: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if factor <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * factor;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::try_from_secs_f64((base.as_secs_f64() + offset).max(0.001)).unwrap_or(base)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        let current = self.next;
        let grown = current.as_secs_f64() * self.config.multiplier.max(1.0);
        self.next = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);
        Some(self.jittered(current.min(self.config.max_delay)))
    }
}

/// Every retry failed.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryExhausted<E: std::fmt::Display> {
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last: E,
}

/// Run `op` until it succeeds or `backoff` runs dry, calling `sleep` with
/// each delay between attempts.
///
/// # Errors
///
/// Returns [`RetryExhausted`] with the last error once no delays remain.
pub fn retry<T, E: std::fmt::Display>(
    mut backoff: Backoff,
    mut op: impl FnMut(u32) -> Result<T, E>,
    mut sleep: impl FnMut(Duration),
) -> Result<T, RetryExhausted<E>> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.next() {
                Some(delay) => {
                    tracing::debug!(attempt, delay_ms = delay.as_millis(), error = %err, "Retrying after backoff");
                    sleep(delay);
                    attempt += 1;
                }
                None => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
            },
        }
    }
}
