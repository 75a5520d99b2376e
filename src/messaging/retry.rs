//! # Retry Policy
//!
//! Exponential back-off with a cap and symmetric jitter. The delay before
//! retry `n` (1-based) is
//!
//! ```text
//! min(initial × multiplier^(n-1), max) × (1 + U(-random_factor, +random_factor))
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub random_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier.max(1.0),
            random_factor: config.random_factor.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Policy that republishes immediately
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            random_factor: 0.0,
        }
    }

    /// Capped exponential delay before retry `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_interval.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Delay before retry `attempt` with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self.base_delay(attempt);
        if self.random_factor <= 0.0 || base.is_zero() {
            return base;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-self.random_factor..=self.random_factor);
        base.mul_f64((1.0 + jitter).max(0.0))
    }

    /// Upper bound on any delay this policy can produce
    pub fn ceiling(&self) -> Duration {
        self.max_interval.mul_f64(1.0 + self.random_factor)
    }

    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            random_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(50), Duration::from_secs(1));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn test_from_config_clamps() {
        let policy = RetryPolicy::from(&RetryConfig {
            multiplier: 0.2,
            random_factor: 3.0,
            ..RetryConfig::default()
        });
        assert_eq!(policy.multiplier, 1.0);
        assert_eq!(policy.random_factor, 1.0);
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_bounds(
            attempt in 1u32..40,
            factor in 0.0f64..=1.0,
            initial_ms in 1u64..5_000,
            max_ms in 1u64..60_000,
        ) {
            let policy = RetryPolicy {
                max_retries: 10,
                initial_interval: Duration::from_millis(initial_ms),
                max_interval: Duration::from_millis(max_ms),
                multiplier: 2.0,
                random_factor: factor,
            };
            let base = policy.base_delay(attempt);
            let delay = policy.delay_for(attempt);

            prop_assert!(base <= policy.max_interval);
            prop_assert!(delay <= policy.ceiling() + Duration::from_millis(1));
            prop_assert!(delay.as_secs_f64() >= base.as_secs_f64() * (1.0 - factor) - 0.001);
        }
    }
}
