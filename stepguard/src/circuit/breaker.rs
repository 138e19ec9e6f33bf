//! Circuit breaker state machine.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::CircuitOpenError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// One probe call is allowed to decide the next state.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Thresholds for a single breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Cooldown before a probe is admitted, in milliseconds.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config.
    #[must_use]
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms: u64::try_from(reset_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The cooldown as a duration.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Protected dependency.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub failure_count: u32,
    /// Configured threshold.
    pub failure_threshold: u32,
    /// Failures recorded over the breaker's lifetime.
    pub total_failures: u64,
    /// Successes recorded over the breaker's lifetime.
    pub total_successes: u64,
    /// Calls rejected without being invoked.
    pub total_rejections: u64,
    /// Remaining cooldown in milliseconds.
    pub time_until_close_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    generation: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
            generation: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
        }
    }

    fn remaining(&self, reset_timeout: Duration) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => reset_timeout.saturating_sub(opened_at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Moves an expired `Open` breaker to `HalfOpen`.
    fn refresh(&mut self, reset_timeout: Duration) {
        if self.state == CircuitState::Open && self.remaining(reset_timeout).is_zero() {
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
        }
    }
}

/// A failure-count gate for one external dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Returns the protected dependency's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state, promoting an expired `Open` to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout());
        inner.state
    }

    /// Returns true if a call made now would be rejected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout());
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => inner.probe_in_flight,
        }
    }

    /// Remaining cooldown before a probe will be admitted.
    #[must_use]
    pub fn time_until_close(&self) -> Duration {
        self.inner.lock().remaining(self.config.reset_timeout())
    }

    /// Runs `operation` through the breaker.
    ///
    /// Rejections are reported as `E::from(CircuitOpenError)` without invoking
    /// the operation. Any `Err` returned by the operation counts as a failure.
    /// In `HalfOpen` only the probe's outcome changes state; calls admitted
    /// before the breaker tripped just update the totals.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let mut permit = self.admit().map_err(E::from)?;
        let result = operation().await;
        self.settle(&permit, result.is_ok());
        permit.complete();
        result
    }

    fn admit(&self) -> Result<ProbePermit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout());

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                tracing::info!(dependency = %self.name, "Circuit half-open, admitting probe");
                true
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.total_rejections += 1;
                return Err(CircuitOpenError {
                    dependency: self.name.clone(),
                    retry_after: inner.remaining(self.config.reset_timeout()),
                });
            }
        };

        Ok(ProbePermit {
            breaker: self,
            probe,
            generation: inner.generation,
            completed: false,
        })
    }

    /// Applies the outcome of an admitted call.
    fn settle(&self, permit: &ProbePermit<'_>, succeeded: bool) {
        let mut inner = self.inner.lock();
        if succeeded {
            inner.total_successes += 1;
        } else {
            inner.total_failures += 1;
        }

        // Calls admitted under an earlier trip do not vote.
        if permit.generation != inner.generation {
            return;
        }

        match (inner.state, permit.probe, succeeded) {
            (CircuitState::Closed, false, true) => inner.failure_count = 0,
            (CircuitState::Closed, false, false) => self.count_closed_failure(&mut inner),
            (CircuitState::HalfOpen, true, true) => self.close(&mut inner),
            (CircuitState::HalfOpen, true, false) => self.trip(&mut inner),
            _ => {}
        }
    }

    /// Records a failure observed outside [`CircuitBreaker::execute`].
    ///
    /// Counts toward the threshold while `Closed`. In `HalfOpen` the probe
    /// alone decides the next state, so only the totals change.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        if inner.state == CircuitState::Closed {
            self.count_closed_failure(&mut inner);
        }
    }

    /// Records a success observed outside [`CircuitBreaker::execute`].
    ///
    /// Clears the consecutive-failure count while `Closed`.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        if inner.state == CircuitState::Closed {
            inner.failure_count = 0;
        }
    }

    /// Forces the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.generation += 1;
    }

    /// Returns a snapshot of counters and state.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        inner.refresh(self.config.reset_timeout());
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejections: inner.total_rejections,
            time_until_close_ms: u64::try_from(inner.remaining(self.config.reset_timeout()).as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    fn count_closed_failure(&self, inner: &mut BreakerInner) {
        inner.failure_count += 1;
        if inner.failure_count >= self.config.failure_threshold {
            self.trip(inner);
        }
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        tracing::info!(dependency = %self.name, "Circuit closed after successful probe");
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        inner.generation += 1;
        tracing::warn!(
            dependency = %self.name,
            failures = inner.failure_count,
            reset_timeout_ms = self.config.reset_timeout_ms,
            "Circuit opened"
        );
    }
}

/// Releases the half-open probe slot if the probe future is dropped early.
struct ProbePermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
    completed: bool,
}

impl ProbePermit<'_> {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.completed {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen && inner.generation == self.generation {
                inner.probe_in_flight = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StepError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("search", CircuitBreakerConfig::new(threshold, Duration::from_millis(reset_ms)))
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), StepError> {
        cb.execute(|| async { Err(StepError::Execution("HTTP 500".into())) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), StepError> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 1000);

        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let cb = breaker(3, 1000);
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), StepError> = cb
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StepError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().total_rejections, 1);
        // Rejections are not counted as failures.
        assert_eq!(cb.stats().total_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let cb = Arc::new(breaker(3, 1000));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<(), StepError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // Second call while the probe is in flight is rejected.
        assert!(matches!(succeed(&cb).await, Err(StepError::CircuitOpen(_))));
        assert!(cb.is_open());

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_during_half_open_does_not_reopen() {
        let cb = Arc::new(breaker(1, 1000));

        // Admitted while closed, finishes after the breaker has tripped.
        let (stale_tx, stale_rx) = tokio::sync::oneshot::channel::<()>();
        let stale = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = stale_rx.await;
                    Err::<(), StepError>(StepError::Execution("HTTP 500".into()))
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = probe_rx.await;
                    Ok::<(), StepError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        stale_tx.send(()).unwrap();
        assert!(stale.await.unwrap().is_err());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_open());

        probe_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().total_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_with_fresh_timer() {
        let cb = breaker(2, 1000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.time_until_close(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_close_counts_down() {
        let cb = breaker(1, 5000);
        assert_eq!(cb.time_until_close(), Duration::ZERO);

        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(cb.time_until_close(), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 1000);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert!(succeed(&cb).await.is_ok());
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 1);
    }

    #[tokio::test]
    async fn test_record_failure_outside_execute() {
        let cb = breaker(2, 1000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let cb = breaker(1, 100);
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        let pending = cb.execute(|| async {
            std::future::pending::<()>().await;
            Ok::<(), StepError>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.is_open());
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(serde_json::to_string(&CircuitState::Open).unwrap(), r#""OPEN""#);
    }
}
