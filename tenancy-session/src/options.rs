// Session coordination options and configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tenancy_core::TenancyConfigSnapshot;

/// Exponential backoff for the membership fetch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each one after
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// `retry_count` is the 0-indexed count of the attempt that just failed.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// `base_delay * 2^retry_count`, saturating.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry_count))
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("Retry base delay must be greater than zero".to_string());
        }
        if self.max_retries > 16 {
            return Err(format!("Retry count {} is too large (max 16)", self.max_retries));
        }
        Ok(())
    }
}

/// Main session coordination configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionOptions {
    /// Membership fetch retry policy
    pub retry: RetryPolicy,
    /// Delay before refetching after auth recovers from an error
    #[serde(with = "humantime_serde")]
    pub recovery_debounce: Duration,
    /// How long an auth failure may persist before recovery is offered
    #[serde(with = "humantime_serde")]
    pub auth_grace_period: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            recovery_debounce: Duration::from_secs(1),
            auth_grace_period: Duration::from_secs(10),
        }
    }
}

impl SessionOptions {
    /// Read `retry.max_retries`, `retry.base_delay_ms`,
    /// `session.recovery_debounce_ms` and `session.auth_grace_period_ms`,
    /// keeping defaults for anything missing or unparsable.
    pub fn from_config(config: &TenancyConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            retry: RetryPolicy {
                max_retries: config
                    .get_u32("retry.max_retries")
                    .unwrap_or(defaults.retry.max_retries),
                base_delay: config
                    .get_duration_ms("retry.base_delay_ms")
                    .unwrap_or(defaults.retry.base_delay),
            },
            recovery_debounce: config
                .get_duration_ms("session.recovery_debounce_ms")
                .unwrap_or(defaults.recovery_debounce),
            auth_grace_period: config
                .get_duration_ms("session.auth_grace_period_ms")
                .unwrap_or(defaults.auth_grace_period),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_recovery_debounce(mut self, debounce: Duration) -> Self {
        self.recovery_debounce = debounce;
        self
    }

    pub fn with_auth_grace_period(mut self, grace: Duration) -> Self {
        self.auth_grace_period = grace;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        self.retry
            .validate()
            .map_err(|e| format!("Retry policy validation failed: {}", e))?;
        if self.auth_grace_period < self.recovery_debounce {
            return Err("Auth grace period must not be shorter than the recovery debounce".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenancy_core::TenancyConfig;

    #[test]
    fn default_schedule_is_two_four_eight() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.total_attempts(), 4);
    }

    #[test]
    fn delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(u64::MAX / 2),
        };
        assert_eq!(policy.delay_for(40), Duration::MAX);
    }

    #[test]
    fn from_config_overrides_and_falls_back() {
        let mut config = TenancyConfig::new();
        config.set("retry.base_delay_ms", "250");
        config.set("retry.max_retries", "oops");
        config.set("session.recovery_debounce_ms", "100");
        let options = SessionOptions::from_config(&config.snapshot());

        assert_eq!(options.retry.base_delay, Duration::from_millis(250));
        assert_eq!(options.retry.max_retries, 3);
        assert_eq!(options.recovery_debounce, Duration::from_millis(100));
        assert_eq!(options.auth_grace_period, Duration::from_secs(10));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_base_delay() {
        let options = SessionOptions::default().with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
        });
        assert!(options.validate().is_err());
    }

    #[test]
    fn options_deserialize_humantime_durations() {
        let options: SessionOptions = serde_json::from_str(
            r#"{"retry":{"max_retries":2,"base_delay":"500ms"},"recovery_debounce":"1s","auth_grace_period":"30s"}"#,
        )
        .unwrap();
        assert_eq!(options.retry.base_delay, Duration::from_millis(500));
        assert_eq!(options.auth_grace_period, Duration::from_secs(30));
    }
}
