//! Retry policy configuration and delay computation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter perturbs a delay uniformly within `±JITTER_RATIO` of its value.
pub const JITTER_RATIO: f64 = 0.25;

/// Configuration for retry behavior.
///
/// `max_retries` counts retries, not attempts: a policy with
/// `max_retries = 3` invokes the operation at most four times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to perturb delays by ±25%.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Patient policy for free, slow government APIs (SEC, FEC, ...).
    #[must_use]
    pub fn government_api() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }

    /// Quick policy for dependencies that fail fast.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }

    /// Policy for LLM providers.
    #[must_use]
    pub fn llm() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 20_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }

    /// Many short retries with gentle growth.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    /// A single attempt with no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Looks up a built-in preset by name.
    #[must_use]
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "government_api" => Some(Self::government_api()),
            "quick" => Some(Self::quick()),
            "llm" => Some(Self::llm()),
            "aggressive" => Some(Self::aggressive()),
            "no_retry" => Some(Self::no_retry()),
            _ => None,
        }
    }

    /// Sets the maximum retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.use_jitter = enabled;
        self
    }

    /// Un-jittered, uncapped delay for an attempt (0-indexed), in milliseconds.
    #[must_use]
    pub fn raw_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent)
    }

    /// Delay to sleep before retrying after `attempt` failed.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = if self.use_jitter {
            rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO))
        } else {
            1.0
        };
        self.delay_with_factor(attempt, factor)
    }

    /// Delay for `attempt` with an explicit jitter factor applied before capping.
    #[must_use]
    pub fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let jittered = (self.raw_delay_ms(attempt) * factor).max(0.0);
        let capped = jittered.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }
}
