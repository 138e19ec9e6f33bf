//! Retry loops.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::{Retryable, RetryPolicy};
use crate::cancellation::CancellationToken;
use crate::errors::CancelledError;

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The final result.
    pub result: Result<T, E>,
    /// Number of times the operation was invoked.
    pub attempts: u32,
    /// Wall-clock time including backoff sleeps.
    pub total_time: Duration,
    /// Message of every failed attempt, in order.
    pub retry_errors: Vec<String>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Returns true if the final attempt succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Discards the bookkeeping and returns the result.
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Executes `operation` with retries, using [`Retryable`] to classify errors.
///
/// The operation receives the 0-indexed attempt number.
pub async fn execute_with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    execute_with_retry_if(policy, |err: &E, _attempt| err.is_retryable(), operation).await
}

/// Executes `operation` with retries, using an explicit retryability predicate.
pub async fn execute_with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E, u32) -> bool,
    E: Display,
{
    retry_loop(policy, is_retryable, operation, |delay| async move {
        tokio::time::sleep(delay).await;
        Ok::<(), E>(())
    })
    .await
}

/// Like [`execute_with_retry`], but a cancelled token interrupts any pending
/// backoff sleep and prevents further attempts.
pub async fn execute_with_retry_cancellable<T, E, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display + From<CancelledError>,
{
    if token.is_cancelled() {
        return RetryOutcome {
            result: Err(E::from(cancelled(token))),
            attempts: 0,
            total_time: Duration::ZERO,
            retry_errors: Vec::new(),
        };
    }

    retry_loop(
        policy,
        |err: &E, _attempt| err.is_retryable(),
        operation,
        |delay| async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => Ok(()),
                () = token.cancelled() => Err(E::from(cancelled(token))),
            }
        },
    )
    .await
}

fn cancelled(token: &CancellationToken) -> CancelledError {
    CancelledError::new(token.reason().unwrap_or_else(|| "cancelled".to_string()))
}

async fn retry_loop<T, E, F, Fut, P, S, SFut>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
    mut sleep: S,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E, u32) -> bool,
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = Result<(), E>>,
    E: Display,
{
    let start = Instant::now();
    let mut retry_errors = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_time: start.elapsed(),
                    retry_errors,
                };
            }
            Err(err) => {
                retry_errors.push(err.to_string());

                if attempt >= policy.max_retries || !is_retryable(&err, attempt) {
                    tracing::debug!(
                        attempts = attempt + 1,
                        error = %err,
                        "Giving up after error"
                    );
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                        total_time: start.elapsed(),
                        retry_errors,
                    };
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after error"
                );

                if let Err(abort) = sleep(delay).await {
                    return RetryOutcome {
                        result: Err(abort),
                        attempts: attempt + 1,
                        total_time: start.elapsed(),
                        retry_errors,
                    };
                }
                attempt += 1;
            }
        }
    }
}
