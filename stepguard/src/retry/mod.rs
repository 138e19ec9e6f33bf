//! Retry execution with exponential backoff and jitter.
//!
//! The retry layer is stateless: a [`RetryPolicy`] is plain data and every
//! call to [`execute_with_retry`] owns its own attempt counter. Whether an
//! error is worth retrying is decided by the [`Retryable`] trait or by an
//! explicit predicate.

mod classify;
mod executor;
mod policy;

pub use classify::{classify_message, is_retryable_message, ErrorCategory, Retryable};
pub use executor::{
    execute_with_retry, execute_with_retry_cancellable, execute_with_retry_if, RetryOutcome,
};
pub use policy::{RetryPolicy, JITTER_RATIO};
