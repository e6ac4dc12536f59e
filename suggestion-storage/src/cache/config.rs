//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use suggestion_core::{ConfigError, RetryConfig};

/// 31 days: the shared TTL of every suggestion bucket.
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(31 * 24 * 60 * 60);

/// Configuration for the suggestion cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied to every bucket key on each store.
    pub entry_ttl: Duration,
    /// Timeout for a single point operation.
    pub point_timeout: Duration,
    /// Default timeout for blocking waits.
    pub blocking_timeout: Duration,
    /// How often a blocking wait re-reads the cache.
    pub poll_interval: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: DEFAULT_ENTRY_TTL,
            point_timeout: Duration::from_millis(250),
            blocking_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            retry: RetryConfig::default(),
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `SUGGEST_CACHE_ENTRY_TTL_SECS` (default: 2678400, 31 days)
    /// - `SUGGEST_CACHE_POINT_TIMEOUT_MS` (default: 250)
    /// - `SUGGEST_CACHE_BLOCKING_TIMEOUT_MS` (default: 5000)
    /// - `SUGGEST_CACHE_POLL_INTERVAL_MS` (default: 50)
    /// - `SUGGEST_CACHE_MAX_RETRIES` (default: 3)
    /// - `SUGGEST_CACHE_INITIAL_BACKOFF_MS` (default: 20)
    /// - `SUGGEST_CACHE_MAX_BACKOFF_MS` (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let entry_ttl = std::env::var("SUGGEST_CACHE_ENTRY_TTL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.entry_ttl);

        let retry = RetryConfig {
            max_retries: std::env::var("SUGGEST_CACHE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry.max_retries),
            initial_backoff: env_millis(
                "SUGGEST_CACHE_INITIAL_BACKOFF_MS",
                defaults.retry.initial_backoff,
            ),
            max_backoff: env_millis("SUGGEST_CACHE_MAX_BACKOFF_MS", defaults.retry.max_backoff),
            backoff_multiplier: defaults.retry.backoff_multiplier,
        };

        Self {
            entry_ttl,
            point_timeout: env_millis("SUGGEST_CACHE_POINT_TIMEOUT_MS", defaults.point_timeout),
            blocking_timeout: env_millis(
                "SUGGEST_CACHE_BLOCKING_TIMEOUT_MS",
                defaults.blocking_timeout,
            ),
            poll_interval: env_millis("SUGGEST_CACHE_POLL_INTERVAL_MS", defaults.poll_interval),
            retry,
        }
    }

    /// Set the entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Set the point operation timeout.
    pub fn with_point_timeout(mut self, timeout: Duration) -> Self {
        self.point_timeout = timeout;
        self
    }

    /// Set the poll interval for blocking waits.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the configuration. All durations must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("entry_ttl", self.entry_ttl),
            ("point_timeout", self.point_timeout),
            ("blocking_timeout", self.blocking_timeout),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: format!("{:?}", value),
                    reason: format!("{} must be positive", field),
                });
            }
        }
        self.retry.validate("retry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ttl_is_31_days() {
        let config = CacheConfig::default();
        assert_eq!(config.entry_ttl, Duration::from_secs(2_678_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = CacheConfig::default().with_point_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "point_timeout"
        ));
    }

    #[test]
    fn test_builders() {
        let config = CacheConfig::new()
            .with_ttl(Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(config.entry_ttl, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }
}
