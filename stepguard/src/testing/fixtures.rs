//! Test fixtures wiring executors and stores together.

use std::sync::Arc;

use crate::batch::BatchRunner;
use crate::checkpoint::CheckpointStore;
use crate::config::ResilienceConfig;
use crate::dlq::DeadLetterQueue;
use crate::events::CollectingEventSink;
use crate::orchestrator::{StepContext, StepExecutor};
use crate::registry::ResilienceRegistry;
use crate::retry::RetryPolicy;

/// In-memory stores, a shared registry and an event collector.
///
/// Executors built from the fixture do not retry unless told to.
#[derive(Debug, Clone)]
pub struct TestFixture {
    /// Shared breakers and limiters.
    pub registry: Arc<ResilienceRegistry>,
    /// Every event emitted by fixture executors.
    pub events: Arc<CollectingEventSink>,
    /// Checkpoints for all items.
    pub checkpoints: CheckpointStore,
    /// Dead letters for all items.
    pub dead_letters: DeadLetterQueue,
    /// Default retry policy for fixture executors.
    pub retry_policy: RetryPolicy,
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl TestFixture {
    /// Creates a fixture with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ResilienceConfig::default())
    }

    /// Creates a fixture whose registry is built from `config`.
    #[must_use]
    pub fn with_config(config: ResilienceConfig) -> Self {
        Self {
            registry: Arc::new(ResilienceRegistry::from_config(config)),
            events: Arc::new(CollectingEventSink::new()),
            checkpoints: CheckpointStore::in_memory(),
            dead_letters: DeadLetterQueue::in_memory(),
            retry_policy: RetryPolicy::no_retry(),
        }
    }

    /// Sets the default retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// An executor over the fixture's registry and event collector.
    #[must_use]
    pub fn executor(&self) -> StepExecutor {
        StepExecutor::new(self.registry.clone())
            .with_event_sink(self.events.clone())
            .with_default_retry_policy(self.retry_policy.clone())
    }

    /// A context for `item_id` backed by the fixture's checkpoints.
    #[must_use]
    pub fn context(&self, item_id: &str) -> StepContext {
        StepContext::new(item_id, "test-user", self.checkpoints.clone())
    }

    /// A batch runner over the fixture's executor and stores.
    #[must_use]
    pub fn runner(&self) -> BatchRunner {
        BatchRunner::new(self.executor(), self.checkpoints.clone(), self.dead_letters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PipelineStepDefinition;
    use crate::testing::CountingStep;

    #[tokio::test]
    async fn test_fixture_shares_stores() {
        let fixture = TestFixture::new();
        let ctx = fixture.context("p1");
        let def = PipelineStepDefinition::new("search", CountingStep::new());

        fixture.executor().execute_steps(&[def], &ctx).await.unwrap();

        assert!(fixture.checkpoints.has_completed("p1", "search").await);
        assert_eq!(fixture.events.len(), 2);
    }

    #[test]
    fn test_fixture_config_reaches_registry() {
        let config = ResilienceConfig::from_json_str(
            r#"{"circuit_breakers": {"sec": {"failure_threshold": 1, "reset_timeout_ms": 10}}}"#,
        )
        .unwrap();
        let fixture = TestFixture::with_config(config);
        assert_eq!(fixture.registry.circuit_breaker("sec").config().failure_threshold, 1);
    }
}
