//! Reconnection backoff.
//!
//! The delay is derived from the attempt counter each time rather than
//! carried as mutable state: attempt `n` sleeps `initial * multiplier^n`,
//! capped at the maximum. `reset` therefore only has to zero the counter.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Backoff policy: 1 s doubling to a 60 s cap by default.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Backoff state for a reconnecting client: a policy plus the number of
/// attempts made since the last successful connection.
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// The delay the next [`wait`](Self::wait) will sleep for.
    pub fn next_delay(&self) -> Duration {
        let mut delay = self.config.initial_backoff;
        for _ in 0..self.attempt {
            if delay >= self.config.max_backoff {
                return self.config.max_backoff;
            }
            delay = delay.mul_f64(self.config.multiplier);
        }
        delay.min(self.config.max_backoff)
    }

    /// Count the attempt and sleep out its delay.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        self.attempt = self.attempt.saturating_add(1);

        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            "backing off before reconnect"
        );
        sleep(delay).await;
    }

    /// Restart the sequence after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
