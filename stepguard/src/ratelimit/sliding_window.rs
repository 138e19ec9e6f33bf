//! Sliding window limiter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::{millis, RateLimiter, RateLimiterStats};
use crate::errors::RateLimitError;

#[derive(Debug, Default)]
struct WindowState {
    admitted: VecDeque<Instant>,
    total_admitted: u64,
    total_rejected: u64,
    total_waited_ms: u64,
}

/// Admits at most `max_requests` within any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    name: String,
    max_requests: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new(name: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window,
            state: Mutex::new(WindowState::default()),
        }
    }

    fn evict(&self, state: &mut WindowState, now: Instant) {
        while let Some(&oldest) = state.admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                state.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn take_or_wait(&self, permits: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.evict(&mut state, now);

        let in_window = state.admitted.len();
        let limit = self.max_requests as usize;
        let wanted = permits as usize;
        if in_window + wanted <= limit {
            state.admitted.extend(std::iter::repeat(now).take(wanted));
            state.total_admitted += u64::from(permits);
            return Ok(());
        }

        // Wait until enough of the oldest entries have left the window.
        let must_expire = in_window + wanted - limit;
        let wait = state
            .admitted
            .get(must_expire - 1)
            .map_or(self.window, |&entry| (entry + self.window).saturating_duration_since(now));
        Err(wait.max(Duration::from_millis(1)))
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
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
        if permits > self.max_requests {
            return Err(RateLimitError::ExceedsCapacity {
                requested: permits,
                capacity: self.max_requests,
            });
        }

        let Err(mut wait) = self.take_or_wait(permits) else {
            return Ok(Duration::ZERO);
        };

        let start = Instant::now();
        loop {
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
        self.evict(&mut state, Instant::now());
        let used = u32::try_from(state.admitted.len()).unwrap_or(u32::MAX);
        RateLimiterStats {
            name: self.name.clone(),
            strategy: "sliding_window".to_string(),
            capacity: self.max_requests,
            available: self.max_requests.saturating_sub(used),
            total_admitted: state.total_admitted,
            total_rejected: state.total_rejected,
            total_waited_ms: state.total_waited_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_limits_and_expires() {
        let window = SlidingWindow::new("openai", 3, Duration::from_millis(1000));
        assert!(window.try_acquire(1));
        assert!(window.try_acquire(1));
        assert!(window.try_acquire(1));
        assert!(!window.try_acquire(1));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(window.try_acquire(1));
        assert_eq!(window.stats().total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_individually() {
        let window = SlidingWindow::new("openai", 2, Duration::from_millis(1000));
        assert!(window.try_acquire(1));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(window.try_acquire(1));
        assert!(!window.try_acquire(1));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(window.try_acquire(1));
        assert!(!window.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_oldest_to_expire() {
        let window = SlidingWindow::new("census", 2, Duration::from_millis(1000));
        assert!(window.try_acquire(1));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(window.try_acquire(1));

        let waited = window.acquire(1).await.unwrap();
        assert_eq!(waited, Duration::from_millis(700));
        assert_eq!(window.stats().available, 0);
    }

    #[tokio::test]
    async fn test_multi_permit_request() {
        let window = SlidingWindow::new("census", 5, Duration::from_secs(60));
        assert!(window.try_acquire(4));
        assert!(!window.try_acquire(2));
        assert!(window.try_acquire(1));
        assert_eq!(window.stats().available, 0);
        assert!(window.acquire(6).await.is_err());
    }

    #[tokio::test]
    async fn test_acquire_with_room_reports_no_wait() {
        let window = SlidingWindow::new("census", 3, Duration::from_secs(60));
        for _ in 0..3 {
            assert_eq!(window.acquire(1).await.unwrap(), Duration::ZERO);
        }
        assert_eq!(window.stats().total_waited_ms, 0);
    }
}
