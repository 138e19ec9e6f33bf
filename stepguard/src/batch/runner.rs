//! Runs step lists over many items and routes failures to the dead letter queue.

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{BatchItem, BatchReport, ItemOutcome, ItemReport};
use crate::cancellation::CancellationToken;
use crate::checkpoint::CheckpointStore;
use crate::dlq::{DeadLetterItem, DeadLetterQueue, NewDeadLetter};
use crate::errors::{DeadLetterError, PipelineError};
use crate::orchestrator::{validate_steps, PipelineStepDefinition, StepContext, StepExecutor};

/// What to do with existing checkpoints when a dead-lettered item is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Clear every checkpoint and start over.
    Restart,
    /// Keep completed checkpoints so finished steps are not repeated.
    Resume,
}

impl RetryMode {
    /// Stable string form, stored as the resolution note.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Resume => "resume",
        }
    }
}

/// Drives a [`StepExecutor`] over batches of items.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    executor: StepExecutor,
    checkpoints: CheckpointStore,
    dead_letters: DeadLetterQueue,
    cancel_token: Arc<CancellationToken>,
}

impl BatchRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(executor: StepExecutor, checkpoints: CheckpointStore, dead_letters: DeadLetterQueue) -> Self {
        Self {
            executor,
            checkpoints,
            dead_letters,
            cancel_token: Arc::new(CancellationToken::new()),
        }
    }

    /// Shares `token` with every item context.
    #[must_use]
    pub fn with_cancel_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel_token = token;
        self
    }

    /// The executor.
    #[must_use]
    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// The checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// The dead letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// The token shared by all runs.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Concurrency limit for a subscription tier.
    #[must_use]
    pub fn concurrency_for(&self, tier: Option<&str>) -> usize {
        self.executor.registry().config().concurrency.limit_for(tier)
    }

    fn context_for(&self, item: &BatchItem) -> StepContext {
        let mut ctx = StepContext::new(item.item_id.clone(), item.user_id.clone(), self.checkpoints.clone())
            .with_payload(item.payload.clone())
            .with_credentials(item.credentials.clone())
            .with_cancel_token(self.cancel_token.clone());
        if let Some(job_id) = &item.job_id {
            ctx = ctx.with_job_id(job_id.clone());
        }
        if let Some(tier) = &item.tier {
            ctx = ctx.with_tier(tier.clone());
        }
        ctx
    }

    /// Runs `steps` for one item.
    ///
    /// A failed required step sends the item to the dead letter queue along
    /// with its checkpoints. Only an invalid step list is returned as `Err`.
    pub async fn run_item(
        &self,
        item: &BatchItem,
        steps: &[PipelineStepDefinition],
    ) -> Result<ItemReport, PipelineError> {
        validate_steps(steps)?;
        let ctx = self.context_for(item);

        let outcome = match self.executor.execute_steps(steps, &ctx).await {
            Ok(summary) => ItemOutcome::Completed { summary },
            Err(PipelineError::Cancelled(reason)) => {
                tracing::info!(item_id = %item.item_id, reason = %reason, "Item cancelled, checkpoints kept");
                ItemOutcome::Cancelled { reason }
            }
            Err(err @ (PipelineError::Validation(_) | PipelineError::CycleDetected(_))) => return Err(err),
            Err(err) => self.dead_letter(item, &err).await,
        };

        Ok(ItemReport {
            item_id: item.item_id.clone(),
            outcome,
        })
    }

    async fn dead_letter(&self, item: &BatchItem, err: &PipelineError) -> ItemOutcome {
        let snapshot = self.checkpoints.get_all_checkpoints(&item.item_id).await;
        let mut entry = NewDeadLetter::new(
            item.item_id.clone(),
            item.user_id.clone(),
            err.failure_reason(),
            err.to_string(),
        )
        .with_prospect_data(item.payload.clone())
        .with_checkpoints(snapshot);
        if let Some(job_id) = &item.job_id {
            entry = entry.with_job_id(job_id.clone());
        }
        if let Some(step) = err.step() {
            entry = entry.with_step(step);
        }

        let dead_letter_id = self.dead_letters.add(entry).await.map(|dl| dl.id);
        tracing::warn!(
            item_id = %item.item_id,
            step = err.step(),
            dead_letter_id = ?dead_letter_id,
            "Item sent to dead letter queue"
        );
        ItemOutcome::DeadLettered {
            error: err.to_string(),
            step: err.step().map(str::to_string),
            dead_letter_id,
        }
    }

    /// Runs `steps` over `items`, at most `concurrency` at a time.
    pub async fn run_batch(
        &self,
        items: Vec<BatchItem>,
        steps: &[PipelineStepDefinition],
        concurrency: usize,
    ) -> Result<BatchReport, PipelineError> {
        validate_steps(steps)?;
        let start = Instant::now();
        let total = items.len();
        tracing::info!(items = total, concurrency, "Starting batch");

        let mut reports = stream::iter(items)
            .map(|item| async move { self.run_item(&item, steps).await })
            .buffer_unordered(concurrency.max(1));

        let mut report = BatchReport::default();
        while let Some(item_report) = reports.next().await {
            report.record(item_report?);
        }

        report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            items = total,
            completed = report.completed,
            dead_lettered = report.dead_lettered,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Batch finished"
        );
        Ok(report)
    }

    /// Runs a batch with the concurrency limit of `tier`.
    pub async fn run_batch_for_tier(
        &self,
        items: Vec<BatchItem>,
        steps: &[PipelineStepDefinition],
        tier: Option<&str>,
    ) -> Result<BatchReport, PipelineError> {
        self.run_batch(items, steps, self.concurrency_for(tier)).await
    }

    /// Items with a step stuck in `processing` longer than `threshold`.
    ///
    /// Uses the configured stale threshold when `threshold` is `None`.
    pub async fn find_stale_items(&self, threshold: Option<Duration>) -> Vec<String> {
        let threshold =
            threshold.unwrap_or_else(|| self.executor.registry().config().stale_processing_threshold());
        let items: BTreeSet<String> = self
            .checkpoints
            .get_stale_checkpoints(threshold)
            .await
            .into_iter()
            .map(|record| record.item_id)
            .collect();
        if !items.is_empty() {
            tracing::warn!(count = items.len(), "Found items with stale processing checkpoints");
        }
        items.into_iter().collect()
    }

    /// Marks a dead letter entry as retried and prepares its checkpoints.
    ///
    /// The caller re-submits the item afterwards.
    pub async fn retry_dead_letter(
        &self,
        id: Uuid,
        user_id: &str,
        mode: RetryMode,
    ) -> Result<DeadLetterItem, DeadLetterError> {
        let entry = self
            .dead_letters
            .mark_for_retry(id, user_id, Some(mode.as_str()))
            .await?;
        if mode == RetryMode::Restart {
            self.checkpoints.clear_checkpoints(&entry.item_id).await;
        }
        tracing::info!(item_id = %entry.item_id, mode = mode.as_str(), "Dead letter queued for retry");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMeta, CheckpointStatus};
    use crate::dlq::Resolution;
    use crate::registry::ResilienceRegistry;
    use crate::retry::RetryPolicy;
    use crate::testing::{CountingStep, ScriptedStep, SlowStep};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn runner() -> BatchRunner {
        let executor = StepExecutor::new(Arc::new(ResilienceRegistry::new()))
            .with_default_retry_policy(RetryPolicy::no_retry());
        BatchRunner::new(executor, CheckpointStore::in_memory(), DeadLetterQueue::in_memory())
    }

    fn steps(second: ScriptedStep) -> Vec<PipelineStepDefinition> {
        vec![
            PipelineStepDefinition::new("search", CountingStep::new()),
            PipelineStepDefinition::new("sec", second).depends_on(["search"]),
        ]
    }

    #[tokio::test]
    async fn test_run_item_completes() {
        let runner = runner();
        let item = BatchItem::new("p1", "u1");
        let report = runner
            .run_item(&item, &steps(ScriptedStep::succeeding(json!(1))))
            .await
            .unwrap();
        assert!(report.is_completed());
    }

    #[tokio::test]
    async fn test_required_failure_is_dead_lettered_with_checkpoints() {
        let runner = runner();
        let item = BatchItem::new("p1", "u1")
            .with_job_id("job-7")
            .with_payload(json!({"name": "Ada"}));

        let report = runner
            .run_item(&item, &steps(ScriptedStep::failing("invalid API key")))
            .await
            .unwrap();

        let ItemOutcome::DeadLettered { step, dead_letter_id, .. } = report.outcome else {
            panic!("expected dead letter, got {:?}", report.outcome);
        };
        assert_eq!(step.as_deref(), Some("sec"));

        let entry = runner.dead_letters().get(dead_letter_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(entry.job_id.as_deref(), Some("job-7"));
        assert_eq!(entry.prospect_data, json!({"name": "Ada"}));
        assert_eq!(entry.last_error.step.as_deref(), Some("sec"));
        assert_eq!(entry.last_completed_step(), Some("search"));
        assert_eq!(entry.checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_repeat_failure_bumps_existing_entry() {
        let runner = runner();
        let item = BatchItem::new("p1", "u1");
        let steps = steps(ScriptedStep::failing("invalid API key"));

        runner.run_item(&item, &steps).await.unwrap();
        runner.run_item(&item, &steps).await.unwrap();

        let entry = runner.dead_letters().pending_for_item("p1").await.unwrap().unwrap();
        assert_eq!(entry.failure_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_steps_rejected_before_running() {
        let runner = runner();
        let step = CountingStep::new();
        let steps = vec![PipelineStepDefinition::new("a", step.clone()).depends_on(["missing"])];

        let err = runner.run_item(&BatchItem::new("p1", "u1"), &steps).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(step.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_item_not_dead_lettered() {
        let runner = runner();
        runner.cancel_token().cancel("shutdown");

        let report = runner
            .run_item(&BatchItem::new("p1", "u1"), &steps(ScriptedStep::succeeding(json!(1))))
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            ItemOutcome::Cancelled {
                reason: "shutdown".into()
            }
        );
        assert!(runner.dead_letters().pending_for_item("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_batch_mixed_outcomes() {
        let runner = runner();
        let sec = ScriptedStep::new(vec![Ok(json!(1)), Err("parse error".into()), Ok(json!(3))]);
        let items = (1..=3).map(|i| BatchItem::new(format!("p{i}"), "u1")).collect();

        let report = runner.run_batch(items, &steps(sec), 1).await.unwrap();
        assert_eq!(report.items.len(), 3);
        assert_eq!((report.completed, report.dead_lettered), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batch_respects_concurrency() {
        let runner = runner();
        let steps = vec![PipelineStepDefinition::new("slow", SlowStep::with_delay_ms(100))];
        let items: Vec<_> = (0..6).map(|i| BatchItem::new(format!("p{i}"), "u1")).collect();

        let start = Instant::now();
        let report = runner.run_batch(items, &steps, 3).await.unwrap();
        assert!(report.is_success());
        // Six items, three at a time.
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn test_concurrency_for_tier() {
        let runner = runner();
        assert_eq!(runner.concurrency_for(Some("enterprise")), 8);
        assert_eq!(runner.concurrency_for(Some("unknown")), 3);
        assert_eq!(runner.concurrency_for(None), 3);
    }

    #[tokio::test]
    async fn test_find_stale_items() {
        let runner = runner();
        runner.checkpoints().mark_processing("p1", "search").await;
        runner.checkpoints().mark_processing("p1", "sec").await;
        runner
            .checkpoints()
            .save_result("p2", "search", json!(1), CheckpointMeta::default())
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(runner.find_stale_items(Some(Duration::ZERO)).await, vec!["p1".to_string()]);
        assert!(runner.find_stale_items(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_dead_letter_restart_clears_checkpoints() {
        let runner = runner();
        let item = BatchItem::new("p1", "u1");
        let report = runner
            .run_item(&item, &steps(ScriptedStep::failing("invalid API key")))
            .await
            .unwrap();
        let ItemOutcome::DeadLettered { dead_letter_id: Some(id), .. } = report.outcome else {
            panic!("expected dead letter");
        };

        let entry = runner.retry_dead_letter(id, "ops", RetryMode::Restart).await.unwrap();
        assert_eq!(entry.resolution, Resolution::Retried);
        assert_eq!(entry.resolution_notes.as_deref(), Some("restart"));
        assert!(runner.checkpoints().get_all_checkpoints("p1").await.is_empty());

        let again = runner.retry_dead_letter(id, "ops", RetryMode::Restart).await;
        assert!(matches!(again, Err(DeadLetterError::AlreadyResolved { .. })));
    }

    #[tokio::test]
    async fn test_retry_dead_letter_resume_keeps_completed_steps() {
        let runner = runner();
        let item = BatchItem::new("p1", "u1");
        let search = CountingStep::new();
        let failing = vec![
            PipelineStepDefinition::new("search", search.clone()),
            PipelineStepDefinition::new("sec", ScriptedStep::failing("invalid API key")).depends_on(["search"]),
        ];
        let report = runner.run_item(&item, &failing).await.unwrap();
        let ItemOutcome::DeadLettered { dead_letter_id: Some(id), .. } = report.outcome else {
            panic!("expected dead letter");
        };

        runner.retry_dead_letter(id, "ops", RetryMode::Resume).await.unwrap();
        let fixed = vec![
            PipelineStepDefinition::new("search", search.clone()),
            PipelineStepDefinition::new("sec", ScriptedStep::succeeding(json!("ok"))).depends_on(["search"]),
        ];
        let report = runner.run_item(&item, &fixed).await.unwrap();

        let ItemOutcome::Completed { summary } = report.outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.cached, 1);
        assert_eq!(search.calls(), 1);
        let record = runner.checkpoints().get("p1", "sec").await.unwrap();
        assert_eq!(record.status, CheckpointStatus::Completed);
    }
}
