//! Token bucket limiter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{millis, RateLimiter, RateLimiterStats};
use crate::errors::RateLimitError;

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
    total_admitted: u64,
    total_rejected: u64,
    total_waited_ms: u64,
}

/// Holds up to `max_tokens`, regaining `refill_rate` tokens per `refill_interval`.
///
/// Refill is computed from elapsed time on each access; there is no
/// background timer.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    max_tokens: u32,
    refill_rate: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(name: impl Into<String>, max_tokens: u32, refill_rate: u32, refill_interval: Duration) -> Self {
        Self {
            name: name.into(),
            max_tokens,
            refill_rate: refill_rate.max(1),
            refill_interval: refill_interval.max(Duration::from_millis(1)),
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: Instant::now(),
                total_admitted: 0,
                total_rejected: 0,
                total_waited_ms: 0,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if intervals == 0 {
            return;
        }

        let added = intervals.saturating_mul(u128::from(self.refill_rate));
        let tokens = (u128::from(state.tokens) + added).min(u128::from(self.max_tokens));
        state.tokens = u32::try_from(tokens).unwrap_or(self.max_tokens);

        if state.tokens >= self.max_tokens {
            state.last_refill = now;
        } else {
            let whole = u32::try_from(intervals).unwrap_or(u32::MAX);
            state.last_refill += self.refill_interval.saturating_mul(whole);
        }
    }

    /// Debits `permits` or returns the minimum wait for enough refills.
    fn take_or_wait(&self, permits: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= permits {
            state.tokens -= permits;
            state.total_admitted += u64::from(permits);
            return Ok(());
        }

        let deficit = permits - state.tokens;
        let intervals_needed = deficit.div_ceil(self.refill_rate);
        let next_full = self.refill_interval.saturating_mul(intervals_needed);
        let since_refill = now.saturating_duration_since(state.last_refill);
        Err(next_full.saturating_sub(since_refill).max(Duration::from_millis(1)))
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_acquire(&self, permits: u32) -> bool {
        if self.take_or_wait(permits).is_ok() {
            true
        } else {
            self.state.lock().total_rejected += 1;
            false
        }
    }

    async fn acquire(&self, permits: u32) -> Result<Duration, RateLimitError> {
        if permits > self.max_tokens {
            return Err(RateLimitError::ExceedsCapacity {
                requested: permits,
                capacity: self.max_tokens,
            });
        }

        let Err(mut wait) = self.take_or_wait(permits) else {
            return Ok(Duration::ZERO);
        };

        let start = Instant::now();
        loop {
            tracing::trace!(dependency = %self.name, wait_ms = millis(wait), "Waiting for tokens");
            tokio::time::sleep(wait).await;
            match self.take_or_wait(permits) {
                Ok(()) => {
                    let waited = start.elapsed();
                    self.state.lock().total_waited_ms += millis(waited);
                    return Ok(waited);
                }
                Err(next) => wait = next,
            }
        }
    }

    fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        RateLimiterStats {
            name: self.name.clone(),
            strategy: "token_bucket".to_string(),
            capacity: self.max_tokens,
            available: state.tokens,
            total_admitted: state.total_admitted,
            total_rejected: state.total_rejected,
            total_waited_ms: state.total_waited_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bucket() -> TokenBucket {
        TokenBucket::new("sec", 5, 1, Duration::from_millis(1000))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill_one() {
        let bucket = bucket();
        for _ in 0..5 {
            assert!(bucket.try_acquire(1));
        }
        assert!(!bucket.try_acquire(1));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(bucket.try_acquire(1));
        assert!(!bucket.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = bucket();
        assert!(bucket.try_acquire(2));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bucket.stats().available, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_interval_does_not_refill() {
        let bucket = bucket();
        assert!(bucket.try_acquire(5));
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!bucket.try_acquire(1));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(bucket.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = bucket();
        assert!(bucket.try_acquire(5));

        let waited = bucket.acquire(2).await.unwrap();
        assert_eq!(waited, Duration::from_millis(2000));
        assert_eq!(bucket.stats().available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_immediate_when_available() {
        let bucket = bucket();
        assert_eq!(bucket.acquire(3).await.unwrap(), Duration::ZERO);
        assert_eq!(bucket.stats().total_admitted, 3);
        assert_eq!(bucket.stats().total_waited_ms, 0);
    }

    #[tokio::test]
    async fn test_immediate_grant_reports_no_wait_on_real_clock() {
        let bucket = bucket();
        for _ in 0..5 {
            assert_eq!(bucket.acquire(1).await.unwrap(), Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_acquire_more_than_capacity_fails() {
        let bucket = bucket();
        assert_eq!(
            bucket.acquire(6).await,
            Err(RateLimitError::ExceedsCapacity {
                requested: 6,
                capacity: 5
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_acquire_never_over_admits() {
        let bucket = Arc::new(TokenBucket::new("search", 5, 1, Duration::from_secs(3600)));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move { bucket.try_acquire(1) })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(bucket.stats().total_rejected, 27);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_serializes_refills() {
        let bucket = Arc::new(TokenBucket::new("fec", 1, 1, Duration::from_millis(100)));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move { bucket.acquire(1).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // One token up front, then one per 100ms.
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(bucket.stats().total_admitted, 4);
    }
}
