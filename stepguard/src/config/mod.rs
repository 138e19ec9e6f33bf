//! Configuration for the resilience layer.
//!
//! Everything here is plain data supplied by the batch driver, usually
//! loaded from a JSON file at startup:
//!
//! ```json
//! {
//!   "rate_limiters": {
//!     "sec": {"strategy": "token_bucket", "max_tokens": 10, "refill_rate": 10, "refill_interval_ms": 1000},
//!     "openai": {"strategy": "sliding_window", "max_requests": 60, "window_ms": 60000}
//!   },
//!   "circuit_breakers": {"sec": {"failure_threshold": 3, "reset_timeout_ms": 30000}},
//!   "retry_policies": {"search": {"max_retries": 2}},
//!   "concurrency": {"default_limit": 3, "tiers": {"pro": 5}}
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::circuit::CircuitBreakerConfig;
use crate::errors::ConfigError;
use crate::ratelimit::RateLimiterConfig;
use crate::retry::RetryPolicy;

/// How many items a batch may process at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Limit when no tier matches.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Limit per subscription tier.
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, usize>,
}

fn default_limit() -> usize {
    3
}

fn default_tiers() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("free".to_string(), 3),
        ("pro".to_string(), 5),
        ("enterprise".to_string(), 8),
    ])
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            tiers: default_tiers(),
        }
    }
}

impl ConcurrencyConfig {
    /// Returns the limit for `tier`, falling back to `default_limit`.
    #[must_use]
    pub fn limit_for(&self, tier: Option<&str>) -> usize {
        tier.and_then(|t| self.tiers.get(t))
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }
}

/// Top-level resilience configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Limiter per dependency.
    #[serde(default)]
    pub rate_limiters: BTreeMap<String, RateLimiterConfig>,
    /// Breaker thresholds per dependency.
    #[serde(default)]
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,
    /// Retry policy per step class.
    #[serde(default)]
    pub retry_policies: BTreeMap<String, RetryPolicy>,
    /// Item concurrency.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Age after which a `processing` checkpoint is considered abandoned.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_processing_threshold_ms: u64,
    /// Timeout for steps that do not declare one.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
}

fn default_stale_threshold_ms() -> u64 {
    30 * 60 * 1000
}

fn default_step_timeout_ms() -> u64 {
    60_000
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            rate_limiters: BTreeMap::new(),
            circuit_breakers: BTreeMap::new(),
            retry_policies: BTreeMap::new(),
            concurrency: ConcurrencyConfig::default(),
            stale_processing_threshold_ms: default_stale_threshold_ms(),
            default_step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

impl ResilienceConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&contents)?;
        tracing::info!(
            path = %path.display(),
            rate_limiters = config.rate_limiters.len(),
            circuit_breakers = config.circuit_breakers.len(),
            "Loaded resilience config"
        );
        Ok(config)
    }

    /// Rejects values that would stall or disable the layer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limiter) in &self.rate_limiters {
            limiter
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("rate_limiters.{name}: {e}")))?;
        }
        for (name, breaker) in &self.circuit_breakers {
            if breaker.failure_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "circuit_breakers.{name}: failure_threshold must be at least 1"
                )));
            }
        }
        for (name, policy) in &self.retry_policies {
            if policy.backoff_multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "retry_policies.{name}: backoff_multiplier must be >= 1.0"
                )));
            }
            if policy.max_delay_ms < policy.base_delay_ms {
                return Err(ConfigError::Invalid(format!(
                    "retry_policies.{name}: max_delay_ms is below base_delay_ms"
                )));
            }
        }
        if self.concurrency.default_limit == 0 {
            return Err(ConfigError::Invalid(
                "concurrency.default_limit must be at least 1".to_string(),
            ));
        }
        if self.default_step_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_step_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves a retry policy: configured entry, then built-in preset, then default.
    #[must_use]
    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        self.retry_policies
            .get(name)
            .cloned()
            .or_else(|| RetryPolicy::preset(name))
            .unwrap_or_default()
    }

    /// Stale-processing threshold as a duration.
    #[must_use]
    pub fn stale_processing_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_processing_threshold_ms)
    }

    /// Default step timeout as a duration.
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}
