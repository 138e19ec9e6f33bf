//! Cooperative cancellation.
//!
//! A run-level [`CancellationToken`] is threaded through the step context and
//! the retry layer so an operator can abort an entire run, including any
//! backoff sleep that is currently pending.

mod token;

pub use token::CancellationToken;
