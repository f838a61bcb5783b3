//! Exponential backoff with jitter for reconnection attempts.

use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the delay between retries.
    pub max_delay: Duration,
    /// Factor the delay grows by per attempt. Must be > 1.
    pub multiplier: f64,
    /// Randomisation fraction in `[0, 1]`; 0.25 means +/- 25%.
    pub jitter: f64,
    /// Retry budget; 0 means unlimited.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
            max_retries: 0,
        }
    }
}

/// Tracks retry state and computes delays.
///
/// `delay(n) = min(initial * multiplier^(n-1), max) * (1 + U[-jitter, +jitter])`,
/// clamped to be non-negative.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Increments the attempt counter and returns the delay to sleep
    /// before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let mut delay = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(self.attempt as i32 - 1);

        let max = self.config.max_delay.as_secs_f64();
        if delay > max {
            delay = max;
        }

        if self.config.jitter > 0.0 {
            let jitter = (rand::random::<f64>() * 2.0 - 1.0) * delay * self.config.jitter;
            delay += jitter;
        }

        if delay < 0.0 {
            delay = 0.0;
        }

        Duration::from_secs_f64(delay)
    }

    /// Resets the attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The current attempt number; 0 before any retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the retry budget is exhausted. Always false with an
    /// unlimited budget.
    pub fn max_retries_reached(&self) -> bool {
        self.config.max_retries != 0 && self.attempt >= self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter,
            max_retries: 0,
        }
    }

    #[test]
    fn test_deterministic_sequence_without_jitter() {
        let mut backoff = Backoff::new(config(0.0));

        let expected = [100u64, 200, 400, 800, 1000, 1000];
        for &ms in &expected {
            assert_eq!(backoff.next_delay(), Duration::from_millis(ms));
        }
        assert_eq!(backoff.attempt(), expected.len() as u32);
    }

    #[test]
    fn test_jitter_bounds() {
        let jitter = 0.25;
        for _ in 0..200 {
            let mut backoff = Backoff::new(config(jitter));
            for n in 1u32..=6 {
                let base = (100.0 * 2f64.powi(n as i32 - 1)).min(1000.0);
                let delay = backoff.next_delay().as_secs_f64() * 1000.0;
                let lo = (base * (1.0 - jitter)).max(0.0);
                let hi = base * (1.0 + jitter);
                assert!(
                    delay >= lo - 1e-6 && delay <= hi + 1e-6,
                    "attempt {}: {}ms outside [{}ms, {}ms]",
                    n,
                    delay,
                    lo,
                    hi
                );
            }
        }
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_max_retries() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_retries: 3,
            jitter: 0.0,
            ..config(0.0)
        });

        assert!(!backoff.max_retries_reached());
        backoff.next_delay();
        assert!(!backoff.max_retries_reached());
        backoff.next_delay();
        assert!(!backoff.max_retries_reached());
        backoff.next_delay();
        assert!(backoff.max_retries_reached());
    }

    #[test]
    fn test_unlimited_retries() {
        let mut backoff = Backoff::new(config(0.0));
        for _ in 0..50 {
            backoff.next_delay();
        }
        assert!(!backoff.max_retries_reached());
    }

    #[test]
    fn test_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.multiplier, 2.0);
        assert_eq!(config.jitter, 0.25);
        assert_eq!(config.max_retries, 0);
    }
}
