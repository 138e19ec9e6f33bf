//! Admission control for shared external dependencies.
//!
//! Two interchangeable strategies implement [`RateLimiter`]:
//! - [`TokenBucket`]: a refillable token balance, refilled lazily on access
//! - [`SlidingWindow`]: a bounded queue of recent request timestamps
//!
//! Each call's refill/debit (or cleanup/append) happens under one lock, so
//! concurrent callers sharing an instance cannot over-admit.

mod sliding_window;
mod token_bucket;

pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::RateLimitError;

/// Contract shared by all limiter strategies.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Returns the protected dependency's name.
    fn name(&self) -> &str;

    /// Takes `permits` if available right now.
    fn try_acquire(&self, permits: u32) -> bool;

    /// Waits until `permits` are available, takes them, and returns how long it waited.
    async fn acquire(&self, permits: u32) -> Result<Duration, RateLimitError>;

    /// Returns a snapshot of the limiter.
    fn stats(&self) -> RateLimiterStats;
}

/// Acquires `permits` from `limiter`, then runs `operation`.
pub async fn execute<L, T, E, F, Fut>(limiter: &L, permits: u32, operation: F) -> Result<T, E>
where
    L: RateLimiter + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<RateLimitError>,
{
    let waited = limiter.acquire(permits).await?;
    if !waited.is_zero() {
        tracing::debug!(
            dependency = limiter.name(),
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "Rate limited"
        );
    }
    operation().await
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    /// Protected dependency.
    pub name: String,
    /// `token_bucket` or `sliding_window`.
    pub strategy: String,
    /// Maximum permits available at once.
    pub capacity: u32,
    /// Permits available right now.
    pub available: u32,
    /// Permits granted over the limiter's lifetime.
    pub total_admitted: u64,
    /// Non-blocking requests refused.
    pub total_rejected: u64,
    /// Cumulative time callers spent waiting, in milliseconds.
    pub total_waited_ms: u64,
}

/// Limiter parameters for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RateLimiterConfig {
    /// Refillable token balance.
    TokenBucket {
        /// Bucket capacity.
        max_tokens: u32,
        /// Tokens added per interval.
        refill_rate: u32,
        /// Refill interval in milliseconds.
        refill_interval_ms: u64,
    },
    /// Trailing request count.
    SlidingWindow {
        /// Requests admitted per window.
        max_requests: u32,
        /// Window length in milliseconds.
        window_ms: u64,
    },
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::TokenBucket {
            max_tokens: 10,
            refill_rate: 1,
            refill_interval_ms: 1000,
        }
    }
}

impl RateLimiterConfig {
    /// Builds a limiter for `name`.
    #[must_use]
    pub fn build(&self, name: &str) -> Arc<dyn RateLimiter> {
        match *self {
            Self::TokenBucket {
                max_tokens,
                refill_rate,
                refill_interval_ms,
            } => Arc::new(TokenBucket::new(
                name,
                max_tokens,
                refill_rate,
                Duration::from_millis(refill_interval_ms),
            )),
            Self::SlidingWindow {
                max_requests,
                window_ms,
            } => Arc::new(SlidingWindow::new(name, max_requests, Duration::from_millis(window_ms))),
        }
    }

    /// Checks that the parameters can ever admit a request.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Self::TokenBucket {
                max_tokens,
                refill_rate,
                refill_interval_ms,
            } => {
                if max_tokens == 0 || refill_rate == 0 || refill_interval_ms == 0 {
                    return Err("token bucket parameters must be positive".to_string());
                }
            }
            Self::SlidingWindow {
                max_requests,
                window_ms,
            } => {
                if max_requests == 0 || window_ms == 0 {
                    return Err("sliding window parameters must be positive".to_string());
                }
            }
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
