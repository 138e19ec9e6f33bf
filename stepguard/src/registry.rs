//! Process-wide breakers and limiters keyed by dependency name.
//!
//! A registry is built once at startup and shared (`Arc`) with every runner,
//! so all items calling the same dependency observe the same breaker state
//! and draw from the same limiter.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::config::ResilienceConfig;
use crate::ratelimit::{RateLimiter, RateLimiterConfig, RateLimiterStats};
use crate::retry::RetryPolicy;

/// Shared resilience primitives.
#[derive(Debug, Default)]
pub struct ResilienceRegistry {
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    limiters: DashMap<String, Arc<dyn RateLimiter>>,
}

impl ResilienceRegistry {
    /// Creates a registry with default parameters for every dependency.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry and eagerly builds every configured breaker and limiter.
    #[must_use]
    pub fn from_config(config: ResilienceConfig) -> Self {
        let registry = Self {
            config,
            ..Self::default()
        };
        for name in registry.config.circuit_breakers.keys() {
            let _ = registry.circuit_breaker(name);
        }
        for name in registry.config.rate_limiters.keys() {
            let _ = registry.rate_limiter(name);
        }
        tracing::debug!(
            breakers = registry.breakers.len(),
            limiters = registry.limiters.len(),
            "Resilience registry initialized"
        );
        registry
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Returns the breaker for `dependency`, creating it on first use.
    pub fn circuit_breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return existing.clone();
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let config = self
                    .config
                    .circuit_breakers
                    .get(dependency)
                    .cloned()
                    .unwrap_or_else(CircuitBreakerConfig::default);
                Arc::new(CircuitBreaker::new(dependency, config))
            })
            .clone()
    }

    /// Returns the limiter for `dependency`, creating it on first use.
    pub fn rate_limiter(&self, dependency: &str) -> Arc<dyn RateLimiter> {
        if let Some(existing) = self.limiters.get(dependency) {
            return existing.clone();
        }
        self.limiters
            .entry(dependency.to_string())
            .or_insert_with(|| {
                self.config
                    .rate_limiters
                    .get(dependency)
                    .cloned()
                    .unwrap_or_default()
                    .build(dependency)
            })
            .clone()
    }

    /// Returns the limiter for `dependency` only if one is configured or already exists.
    pub fn configured_rate_limiter(&self, dependency: &str) -> Option<Arc<dyn RateLimiter>> {
        if let Some(existing) = self.limiters.get(dependency) {
            return Some(existing.clone());
        }
        self.config
            .rate_limiters
            .contains_key(dependency)
            .then(|| self.rate_limiter(dependency))
    }

    /// Installs a limiter, replacing any existing one.
    pub fn register_rate_limiter(&self, dependency: &str, limiter: Arc<dyn RateLimiter>) {
        self.limiters.insert(dependency.to_string(), limiter);
    }

    /// Installs a limiter built from `config`.
    pub fn register_rate_limiter_config(&self, dependency: &str, config: &RateLimiterConfig) {
        self.register_rate_limiter(dependency, config.build(dependency));
    }

    /// Resolves a retry policy by step class.
    #[must_use]
    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        self.config.retry_policy(name)
    }

    /// Returns a snapshot of every breaker, by dependency name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Returns a snapshot of every limiter, by dependency name.
    #[must_use]
    pub fn rate_limiter_snapshot(&self) -> BTreeMap<String, RateLimiterStats> {
        self.limiters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Closes every breaker.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::ratelimit::SlidingWindow;
    use std::time::Duration;

    fn config() -> ResilienceConfig {
        ResilienceConfig::from_json_str(
            r#"{
                "circuit_breakers": {"sec": {"failure_threshold": 2, "reset_timeout_ms": 1000}},
                "rate_limiters": {"sec": {"strategy": "sliding_window", "max_requests": 2, "window_ms": 1000}}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_same_instance_per_dependency() {
        let registry = ResilienceRegistry::new();
        let a = registry.circuit_breaker("fec");
        let b = registry.circuit_breaker("fec");
        assert!(Arc::ptr_eq(&a, &b));

        let l1 = registry.rate_limiter("fec");
        let l2 = registry.rate_limiter("fec");
        assert!(Arc::ptr_eq(&l1, &l2));
    }

    #[test]
    fn test_configured_parameters_are_used() {
        let registry = ResilienceRegistry::from_config(config());
        assert_eq!(registry.circuit_breaker("sec").config().failure_threshold, 2);
        assert_eq!(registry.circuit_breaker("other").config().failure_threshold, 5);
        assert_eq!(registry.rate_limiter("sec").stats().strategy, "sliding_window");
        assert!(registry.configured_rate_limiter("sec").is_some());
        assert!(registry.configured_rate_limiter("other").is_none());
    }

    #[test]
    fn test_snapshot_reflects_shared_state() {
        let registry = ResilienceRegistry::from_config(config());
        let breaker = registry.circuit_breaker("sec");
        breaker.record_failure();
        breaker.record_failure();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["sec"].state, CircuitState::Open);

        registry.reset_all();
        assert_eq!(registry.circuit_breaker("sec").state(), CircuitState::Closed);
    }

    #[test]
    fn test_register_rate_limiter_replaces() {
        let registry = ResilienceRegistry::new();
        registry.register_rate_limiter("census", Arc::new(SlidingWindow::new("census", 1, Duration::from_secs(1))));
        assert_eq!(registry.rate_limiter("census").stats().capacity, 1);
        assert_eq!(registry.rate_limiter_snapshot().len(), 1);
    }
}
