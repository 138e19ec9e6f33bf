//! Per-dependency circuit breaking.
//!
//! A [`CircuitBreaker`] guards one external integration for the lifetime of
//! the process, independent of any single item. Breakers are shared through
//! the [`crate::registry::ResilienceRegistry`].

mod breaker;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
