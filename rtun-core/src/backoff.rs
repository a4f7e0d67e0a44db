//! Exponential backoff for accept loops and reconnects.

use std::time::Duration;

/// Doubling delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// For listeners that keep failing to accept (e.g. out of file descriptors).
    pub fn accept() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1))
    }

    /// For a client re-dialing the server: 1s, 2s, 4s ... 60s.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// The delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(self.attempts.min(16)))
            .unwrap_or(self.max)
            .min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
