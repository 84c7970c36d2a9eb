//! Exponential backoff for reconnection

use std::time::Duration;

use tether_core::config::BackoffConfig;

/// Exponential backoff with optional jitter
///
/// There is no reset: the delay keeps growing for the life of the process,
/// including across connections that succeeded.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Delay the next call to [`next_delay`](Self::next_delay) will return,
    /// before jitter
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Out-of-range products (overflow, NaN) saturate at the cap
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = next.min(self.max);

        if self.jitter > 0.0 {
            let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
            let jitter = Duration::try_from_secs_f64(jitter_amount).unwrap_or(Duration::ZERO);
            delay.saturating_add(jitter)
        } else {
            delay
        }
    }
}
