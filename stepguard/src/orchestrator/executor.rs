//! Step execution with checkpoints, breakers, limiters, retries and timeouts.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use super::validation::{execution_order, validate_steps};
use super::{PipelineStepDefinition, StepContext, StepResult, StepStatus};
use crate::checkpoint::{CheckpointMeta, CheckpointStatus};
use crate::circuit::CircuitBreaker;
use crate::errors::{CircuitOpenError, PipelineError, StepError};
use crate::events::{EventSink, NoOpEventSink, StepEvent, StepEventKind};
use crate::observability::{item_span, step_span};
use crate::ratelimit::RateLimiter;
use crate::registry::ResilienceRegistry;
use crate::retry::{execute_with_retry_cancellable, RetryPolicy};

/// Skip reason recorded when a step's skip condition holds.
pub const SKIP_CONDITION_REASON: &str = "skip_condition";

/// Skip reason recorded for an optional step behind an open breaker.
pub const CIRCUIT_OPEN_REASON: &str = "circuit_breaker_open";

/// Skip reason for a step whose prerequisites did not complete.
#[must_use]
pub fn unmet_dependencies_reason(names: &[String]) -> String {
    format!("unmet_dependencies: {}", names.join(", "))
}

/// Per-call overrides for [`StepExecutor::execute_step`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Breaker guarding the call.
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    /// Limiter each attempt draws one permit from.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    /// Policy used instead of the step's own.
    pub retry_policy_override: Option<RetryPolicy>,
    /// Ignore a completed checkpoint and run anyway.
    pub force_execute: bool,
}

impl ExecuteOptions {
    /// No breaker, no limiter, no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Sets the limiter.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy_override = Some(policy);
        self
    }

    /// Sets whether completed checkpoints are ignored.
    #[must_use]
    pub fn with_force_execute(mut self, force: bool) -> Self {
        self.force_execute = force;
        self
    }
}

/// Outcome of a whole run for one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunSummary {
    /// Item that was processed.
    pub item_id: String,
    /// Results in the order they settled.
    pub results: Vec<(String, StepResult)>,
    /// Completed steps, including cached ones.
    pub completed: usize,
    /// Completed steps restored from checkpoints.
    pub cached: usize,
    /// Skipped steps.
    pub skipped: usize,
    /// Failed optional steps.
    pub failed: usize,
    /// Tokens consumed by steps executed in this run.
    pub total_tokens: u64,
    /// Wall-clock time of the run.
    pub duration_ms: u64,
}

impl PipelineRunSummary {
    fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, step: &str, result: &StepResult) {
        match result.status {
            StepStatus::Completed => {
                self.completed += 1;
                if result.cached {
                    self.cached += 1;
                } else {
                    self.total_tokens += result.tokens_used;
                }
            }
            StepStatus::Skipped => self.skipped += 1,
            StepStatus::Failed => self.failed += 1,
        }
        self.results.push((step.to_string(), result.clone()));
    }

    /// Returns the result of one step.
    #[must_use]
    pub fn result(&self, step: &str) -> Option<&StepResult> {
        self.results.iter().find(|(name, _)| name == step).map(|(_, r)| r)
    }

    /// Returns true if no optional step failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Runs steps for one item at a time.
///
/// Breakers and limiters come from the shared [`ResilienceRegistry`], keyed
/// by each step's declared dependency.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<ResilienceRegistry>,
    events: Arc<dyn EventSink>,
    default_timeout: Duration,
    default_retry_policy: RetryPolicy,
}

impl StepExecutor {
    /// Creates an executor over a shared registry.
    #[must_use]
    pub fn new(registry: Arc<ResilienceRegistry>) -> Self {
        let default_timeout = registry.config().default_step_timeout();
        Self {
            registry,
            events: Arc::new(NoOpEventSink),
            default_timeout,
            default_retry_policy: RetryPolicy::default(),
        }
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Timeout for steps that do not declare one.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Retry policy for steps that do not name one.
    #[must_use]
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    /// The shared registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    /// Builds options from a step's declared dependency.
    ///
    /// Every dependency gets a breaker; only configured dependencies get a limiter.
    #[must_use]
    pub fn options_for(&self, def: &PipelineStepDefinition) -> ExecuteOptions {
        match def.dependency() {
            Some(dependency) => ExecuteOptions {
                circuit_breaker: Some(self.registry.circuit_breaker(dependency)),
                rate_limiter: self.registry.configured_rate_limiter(dependency),
                ..ExecuteOptions::default()
            },
            None => ExecuteOptions::default(),
        }
    }

    fn resolve_policy(&self, def: &PipelineStepDefinition, options: &ExecuteOptions) -> RetryPolicy {
        options
            .retry_policy_override
            .clone()
            .or_else(|| def.retry_policy().map(|name| self.registry.retry_policy(name)))
            .unwrap_or_else(|| self.default_retry_policy.clone())
    }

    /// Executes one step for the context's item.
    ///
    /// Returns `Err` only when the run must stop: a required step failed or
    /// is blocked by an open breaker, or the run was cancelled. Optional
    /// failures come back as a failed [`StepResult`].
    pub async fn execute_step(
        &self,
        def: &PipelineStepDefinition,
        ctx: &StepContext,
        options: ExecuteOptions,
    ) -> Result<StepResult, PipelineError> {
        let span = step_span(ctx.item_id(), def.name());
        self.run_step(def, ctx, &options).instrument(span).await
    }

    async fn run_step(
        &self,
        def: &PipelineStepDefinition,
        ctx: &StepContext,
        options: &ExecuteOptions,
    ) -> Result<StepResult, PipelineError> {
        let item_id = ctx.item_id();
        let name = def.name();
        let store = ctx.checkpoints();

        if !options.force_execute {
            if let Some(record) = store.get(item_id, name).await {
                if record.status == CheckpointStatus::Completed {
                    tracing::debug!("Reusing checkpointed result");
                    self.emit(StepEvent::new(StepEventKind::Cached, item_id, name)).await;
                    return Ok(StepResult::cached(record.result_data.unwrap_or(Value::Null))
                        .with_tokens_used(record.tokens_used)
                        .with_duration_ms(record.duration_ms));
                }
            }
        }

        if ctx.cancel_token().is_cancelled() {
            return Err(cancelled(ctx));
        }

        if def.should_skip(ctx) {
            return Ok(self.skip(ctx, name, SKIP_CONDITION_REASON).await);
        }

        if let Some(breaker) = &options.circuit_breaker {
            if breaker.is_open() {
                let rejection = CircuitOpenError {
                    dependency: breaker.name().to_string(),
                    retry_after: breaker.time_until_close(),
                };
                return self.blocked(def, ctx, rejection).await;
            }
        }

        store.mark_processing(item_id, name).await;
        self.emit(StepEvent::new(StepEventKind::Started, item_id, name)).await;

        let policy = self.resolve_policy(def, options);
        let timeout = def.timeout().unwrap_or(self.default_timeout);
        let start = Instant::now();
        let outcome = execute_with_retry_cancellable(&policy, ctx.cancel_token(), |attempt| {
            self.attempt(def, ctx, options, timeout, attempt)
        })
        .await;
        let duration_ms = millis(start.elapsed());

        match outcome.result {
            Ok(result) => Ok(self
                .complete(def, ctx, result.with_duration_ms(duration_ms), outcome.attempts)
                .await),
            Err(err) => self.fail(def, ctx, err, outcome.attempts, duration_ms).await,
        }
    }

    async fn attempt(
        &self,
        def: &PipelineStepDefinition,
        ctx: &StepContext,
        options: &ExecuteOptions,
        timeout: Duration,
        attempt: u32,
    ) -> Result<StepResult, StepError> {
        if attempt > 0 {
            tracing::debug!(attempt, "Re-running step");
        }
        let limiter = options.rate_limiter.as_deref();
        match &options.circuit_breaker {
            Some(breaker) => breaker.execute(|| invoke(def, ctx, limiter, timeout)).await,
            None => invoke(def, ctx, limiter, timeout).await,
        }
    }

    async fn complete(
        &self,
        def: &PipelineStepDefinition,
        ctx: &StepContext,
        result: StepResult,
        attempts: u32,
    ) -> StepResult {
        let item_id = ctx.item_id();
        let name = def.name();

        if result.is_skipped() {
            let reason = result.reason.clone().unwrap_or_else(|| "step_skipped".to_string());
            ctx.checkpoints().mark_skipped(item_id, name, &reason).await;
            tracing::info!(reason = %reason, "Step skipped itself");
            self.emit(StepEvent::new(StepEventKind::Skipped, item_id, name).with_detail(reason))
                .await;
            return result;
        }

        let meta = CheckpointMeta {
            tokens_used: result.tokens_used,
            duration_ms: result.duration_ms,
        };
        ctx.checkpoints()
            .save_result(item_id, name, result.data.clone().unwrap_or(Value::Null), meta)
            .await;
        tracing::info!(
            attempts,
            duration_ms = result.duration_ms,
            tokens_used = result.tokens_used,
            "Step completed"
        );
        self.emit(
            StepEvent::new(StepEventKind::Completed, item_id, name)
                .with_attempts(attempts)
                .with_duration_ms(result.duration_ms),
        )
        .await;
        result
    }

    async fn fail(
        &self,
        def: &PipelineStepDefinition,
        ctx: &StepContext,
        err: StepError,
        attempts: u32,
        duration_ms: u64,
    ) -> Result<StepResult, PipelineError> {
        let item_id = ctx.item_id();
        let name = def.name();

        match err {
            StepError::CircuitOpen(rejection) => return self.blocked(def, ctx, rejection).await,
            StepError::Cancelled(cancel) => {
                ctx.checkpoints().mark_failed(item_id, name, &cancel.to_string()).await;
                self.emit(StepEvent::new(StepEventKind::Failed, item_id, name).with_detail(cancel.to_string()))
                    .await;
                return Err(PipelineError::Cancelled(cancel.reason));
            }
            _ => {}
        }

        let message = err.to_string();
        ctx.checkpoints().mark_failed(item_id, name, &message).await;
        self.emit(
            StepEvent::new(StepEventKind::Failed, item_id, name)
                .with_attempts(attempts)
                .with_duration_ms(duration_ms)
                .with_detail(message.clone()),
        )
        .await;

        if def.is_required() {
            tracing::error!(attempts, error = %message, "Required step failed");
            Err(PipelineError::RequiredStepFailed {
                step: name.to_string(),
                message,
                attempts,
            })
        } else {
            tracing::warn!(attempts, error = %message, "Optional step failed, continuing");
            Ok(StepResult::failed(message).with_duration_ms(duration_ms))
        }
    }

    async fn blocked(
        &self,
        def: &PipelineStepDefinition,
        ctx: &StepContext,
        rejection: CircuitOpenError,
    ) -> Result<StepResult, PipelineError> {
        if !def.is_required() {
            return Ok(self.skip(ctx, def.name(), CIRCUIT_OPEN_REASON).await);
        }

        let message = rejection.to_string();
        ctx.checkpoints().mark_failed(ctx.item_id(), def.name(), &message).await;
        tracing::warn!(dependency = %rejection.dependency, "Required step blocked by open circuit");
        self.emit(StepEvent::new(StepEventKind::Failed, ctx.item_id(), def.name()).with_detail(message))
            .await;
        Err(PipelineError::CircuitOpen {
            step: def.name().to_string(),
            source: rejection,
        })
    }

    async fn skip(&self, ctx: &StepContext, step: &str, reason: &str) -> StepResult {
        ctx.checkpoints().mark_skipped(ctx.item_id(), step, reason).await;
        tracing::info!(step, reason, "Step skipped");
        self.emit(StepEvent::new(StepEventKind::Skipped, ctx.item_id(), step).with_detail(reason))
            .await;
        StepResult::skipped(reason)
    }

    async fn emit(&self, event: StepEvent) {
        self.events.emit(&event).await;
    }

    /// Runs steps one at a time, each after its dependencies.
    ///
    /// A step whose dependencies did not complete is skipped. When a required
    /// step fails the run stops; steps that depend on it, directly or
    /// transitively, are recorded as skipped and the rest are left untouched.
    pub async fn execute_steps(
        &self,
        steps: &[PipelineStepDefinition],
        ctx: &StepContext,
    ) -> Result<PipelineRunSummary, PipelineError> {
        validate_steps(steps)?;
        let span = item_span(ctx.item_id(), ctx.job_id());
        self.run_sequential(steps, ctx).instrument(span).await
    }

    async fn run_sequential(
        &self,
        steps: &[PipelineStepDefinition],
        ctx: &StepContext,
    ) -> Result<PipelineRunSummary, PipelineError> {
        let start = Instant::now();
        let mut summary = PipelineRunSummary::new(ctx.item_id());
        let order = execution_order(steps);

        for (position, &index) in order.iter().enumerate() {
            let def = &steps[index];
            if ctx.cancel_token().is_cancelled() {
                return Err(cancelled(ctx));
            }

            let unmet = unmet_dependencies(def, ctx);
            let result = if unmet.is_empty() {
                match self.execute_step(def, ctx, self.options_for(def)).await {
                    Ok(result) => result,
                    Err(err) => {
                        ctx.record_result(def.name(), StepResult::failed(err.to_string()));
                        if err.step().is_some() {
                            self.skip_dependents(def.name(), &order[position + 1..], steps, ctx)
                                .await;
                        }
                        tracing::error!(step = def.name(), error = %err, "Pipeline halted");
                        return Err(err);
                    }
                }
            } else {
                self.skip(ctx, def.name(), &unmet_dependencies_reason(&unmet)).await
            };

            ctx.record_result(def.name(), result.clone());
            summary.record(def.name(), &result);
        }

        summary.duration_ms = millis(start.elapsed());
        tracing::info!(
            completed = summary.completed,
            cached = summary.cached,
            skipped = summary.skipped,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "Pipeline finished"
        );
        Ok(summary)
    }

    async fn skip_dependents(
        &self,
        failed: &str,
        remaining: &[usize],
        steps: &[PipelineStepDefinition],
        ctx: &StepContext,
    ) {
        let mut blocked: HashSet<&str> = HashSet::from([failed]);
        for &index in remaining {
            let def = &steps[index];
            if def.dependencies().iter().any(|dep| blocked.contains(dep.as_str())) {
                let unmet = unmet_dependencies(def, ctx);
                let result = self.skip(ctx, def.name(), &unmet_dependencies_reason(&unmet)).await;
                ctx.record_result(def.name(), result);
                blocked.insert(def.name());
            }
        }
    }

    /// Runs steps concurrently and merges results as they settle.
    ///
    /// Dependencies between the given steps are not enforced. If any required
    /// step fails, the first such error is returned once every step settled.
    pub async fn execute_steps_parallel(
        &self,
        steps: &[PipelineStepDefinition],
        ctx: &StepContext,
    ) -> Result<PipelineRunSummary, PipelineError> {
        validate_steps(steps)?;
        if steps.iter().any(|s| !s.dependencies().is_empty()) {
            tracing::warn!(item_id = ctx.item_id(), "Dependencies are not enforced for parallel steps");
        }

        let start = Instant::now();
        let mut summary = PipelineRunSummary::new(ctx.item_id());
        let mut first_error = None;

        let mut pending: FuturesUnordered<_> = steps
            .iter()
            .map(|def| async move { (def, self.execute_step(def, ctx, self.options_for(def)).await) })
            .collect();

        while let Some((def, outcome)) = pending.next().await {
            match outcome {
                Ok(result) => {
                    ctx.record_result(def.name(), result.clone());
                    summary.record(def.name(), &result);
                }
                Err(err) => {
                    ctx.record_result(def.name(), StepResult::failed(err.to_string()));
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            tracing::error!(item_id = ctx.item_id(), error = %err, "Parallel run failed");
            return Err(err);
        }
        summary.duration_ms = millis(start.elapsed());
        Ok(summary)
    }
}

async fn invoke(
    def: &PipelineStepDefinition,
    ctx: &StepContext,
    limiter: Option<&dyn RateLimiter>,
    timeout: Duration,
) -> Result<StepResult, StepError> {
    if let Some(limiter) = limiter {
        limiter.acquire(1).await?;
    }

    match tokio::time::timeout(timeout, def.step().execute(ctx)).await {
        Err(_) => Err(StepError::Timeout {
            step: def.name().to_string(),
            timeout_ms: millis(timeout),
        }),
        Ok(Err(e)) => Err(StepError::execution(&e)),
        Ok(Ok(result)) if result.is_failed() => Err(StepError::Execution(
            result
                .error
                .unwrap_or_else(|| format!("Step '{}' reported failure", def.name())),
        )),
        Ok(Ok(result)) => Ok(result),
    }
}

fn unmet_dependencies(def: &PipelineStepDefinition, ctx: &StepContext) -> Vec<String> {
    def.dependencies()
        .iter()
        .filter(|dep| !ctx.is_completed(dep))
        .cloned()
        .collect()
}

fn cancelled(ctx: &StepContext) -> PipelineError {
    PipelineError::Cancelled(ctx.cancel_token().reason().unwrap_or_else(|| "cancelled".to_string()))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
