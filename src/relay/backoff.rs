//! Exponential backoff for store reconnection

use std::time::Duration;

use rand::Rng;

use crate::config::RelayConfig;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay for the first attempt in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub cap_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            cap_delay_ms: 30_000,
            jitter_factor: 0.0,
        }
    }
}

impl From<&RelayConfig> for BackoffConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            cap_delay_ms: config.cap_delay_ms,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

/// Exponential backoff calculator with optional jitter.
///
/// Attempt `n` (1-based) waits `min(base * 2^(n-1), cap)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with default configuration
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Create a new exponential backoff with custom configuration
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for a given 1-based attempt, before jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.cap_delay_ms);
        Duration::from_millis(delay)
    }

    /// Advance to the next attempt and return its delay
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let capped = self.base_delay_for(self.attempt).as_millis() as f64;

        // Apply jitter only if jitter_factor > 0
        let final_delay = if self.config.jitter_factor > 0.0 {
            let jitter_range = capped * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            (capped + jitter)
                .min(self.config.cap_delay_ms as f64)
                .max(1.0) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(final_delay)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence_doubles_then_caps() {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
            base_delay_ms: 1_000,
            cap_delay_ms: 30_000,
            jitter_factor: 0.0,
        });

        let delays: Vec<u64> = (0..8)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
        assert_eq!(backoff.attempt(), 8);
    }

    #[test]
    fn test_large_attempts_do_not_overflow() {
        let backoff = ExponentialBackoff::new();
        assert_eq!(backoff.base_delay_for(200), Duration::from_millis(30_000));
        assert_eq!(backoff.base_delay_for(0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig {
            base_delay_ms: 1_000,
            cap_delay_ms: 30_000,
            jitter_factor: 0.5,
        });

        let first = backoff.next_delay().as_millis();
        assert!((500..=1_500).contains(&first));

        for _ in 0..10 {
            assert!(backoff.next_delay().as_millis() <= 30_000);
        }
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new();

        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }
}
