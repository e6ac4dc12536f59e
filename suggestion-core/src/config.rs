//! Configuration types

use crate::{ConfigError, SuggestResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = (self.backoff_multiplier as f64).powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        if self.backoff_multiplier <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.backoff_multiplier", prefix),
                value: self.backoff_multiplier.to_string(),
                reason: "backoff_multiplier must be positive".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_backoff", prefix),
                value: format!("{:?}", self.max_backoff),
                reason: "max_backoff must not be below initial_backoff".to_string(),
            });
        }
        Ok(())
    }
}

/// Broker policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Queue claim attempts before giving up with `CouldNotProcessSuggestion`.
    pub max_queued_suggestion_fetches: u32,
    /// In-memory repeat check against the snapshot.
    pub ignore_repeated_suggestions: bool,
    /// Durable repeat check against the repository.
    pub alternate_ignore_repeated_suggestions: bool,
    pub backlog_multiplier: usize,
    pub default_generation_size: usize,
    /// Fresh draws to try when the repeat check flags a candidate.
    pub max_repeat_redraws: u32,
    /// Random draws to try when replacing a colliding processed suggestion.
    pub max_replacement_draws: u32,
    /// Fail with `NoStrategy` when the low-discrepancy phase draws nothing.
    pub require_low_discrepancy_draw: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_queued_suggestion_fetches: 3,
            ignore_repeated_suggestions: true,
            alternate_ignore_repeated_suggestions: false,
            backlog_multiplier: 3,
            default_generation_size: 5,
            max_repeat_redraws: 3,
            max_replacement_draws: 10,
            require_low_discrepancy_draw: false,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl BrokerConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `SUGGEST_MAX_QUEUED_SUGGESTION_FETCHES` (default: 3)
    /// - `SUGGEST_IGNORE_REPEATED_SUGGESTIONS` (default: true)
    /// - `SUGGEST_ALTERNATE_IGNORE_REPEATED_SUGGESTIONS` (default: false)
    /// - `SUGGEST_BACKLOG_MULTIPLIER` (default: 3)
    /// - `SUGGEST_DEFAULT_GENERATION_SIZE` (default: 5)
    /// - `SUGGEST_MAX_REPEAT_REDRAWS` (default: 3)
    /// - `SUGGEST_MAX_REPLACEMENT_DRAWS` (default: 10)
    /// - `SUGGEST_REQUIRE_LOW_DISCREPANCY_DRAW` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_queued_suggestion_fetches: env_or(
                "SUGGEST_MAX_QUEUED_SUGGESTION_FETCHES",
                defaults.max_queued_suggestion_fetches,
            ),
            ignore_repeated_suggestions: env_flag(
                "SUGGEST_IGNORE_REPEATED_SUGGESTIONS",
                defaults.ignore_repeated_suggestions,
            ),
            alternate_ignore_repeated_suggestions: env_flag(
                "SUGGEST_ALTERNATE_IGNORE_REPEATED_SUGGESTIONS",
                defaults.alternate_ignore_repeated_suggestions,
            ),
            backlog_multiplier: env_or("SUGGEST_BACKLOG_MULTIPLIER", defaults.backlog_multiplier),
            default_generation_size: env_or(
                "SUGGEST_DEFAULT_GENERATION_SIZE",
                defaults.default_generation_size,
            ),
            max_repeat_redraws: env_or("SUGGEST_MAX_REPEAT_REDRAWS", defaults.max_repeat_redraws),
            max_replacement_draws: env_or(
                "SUGGEST_MAX_REPLACEMENT_DRAWS",
                defaults.max_replacement_draws,
            ),
            require_low_discrepancy_draw: env_flag(
                "SUGGEST_REQUIRE_LOW_DISCREPANCY_DRAW",
                defaults.require_low_discrepancy_draw,
            ),
        }
    }

    pub fn with_max_queued_suggestion_fetches(mut self, max: u32) -> Self {
        self.max_queued_suggestion_fetches = max;
        self
    }

    pub fn with_ignore_repeated_suggestions(mut self, enabled: bool) -> Self {
        self.ignore_repeated_suggestions = enabled;
        self
    }

    pub fn with_alternate_ignore_repeated_suggestions(mut self, enabled: bool) -> Self {
        self.alternate_ignore_repeated_suggestions = enabled;
        self
    }

    pub fn with_backlog_multiplier(mut self, multiplier: usize) -> Self {
        self.backlog_multiplier = multiplier;
        self
    }

    pub fn with_default_generation_size(mut self, size: usize) -> Self {
        self.default_generation_size = size;
        self
    }

    pub fn with_max_repeat_redraws(mut self, max: u32) -> Self {
        self.max_repeat_redraws = max;
        self
    }

    pub fn with_require_low_discrepancy_draw(mut self, required: bool) -> Self {
        self.require_low_discrepancy_draw = required;
        self
    }

    /// Number of most-recent entries a bucket keeps after a store of
    /// `batch_size` candidates.
    pub fn keep_count(&self, batch_size: usize) -> usize {
        batch_size.max(self.default_generation_size) * self.backlog_multiplier
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - max_queued_suggestion_fetches > 0
    /// - backlog_multiplier > 0
    /// - default_generation_size > 0
    /// - max_replacement_draws > 0
    pub fn validate(&self) -> SuggestResult<()> {
        if self.max_queued_suggestion_fetches == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_queued_suggestion_fetches".to_string(),
                value: self.max_queued_suggestion_fetches.to_string(),
                reason: "max_queued_suggestion_fetches must be greater than 0".to_string(),
            }
            .into());
        }

        if self.backlog_multiplier == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backlog_multiplier".to_string(),
                value: self.backlog_multiplier.to_string(),
                reason: "backlog_multiplier must be greater than 0".to_string(),
            }
            .into());
        }

        if self.default_generation_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_generation_size".to_string(),
                value: self.default_generation_size.to_string(),
                reason: "default_generation_size must be greater than 0".to_string(),
            }
            .into());
        }

        if self.max_replacement_draws == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_replacement_draws".to_string(),
                value: self.max_replacement_draws.to_string(),
                reason: "max_replacement_draws must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}
