//! Step trait, results and declarative step definitions.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use super::StepContext;

/// Final status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Produced a result.
    Completed,
    /// Failed terminally.
    Failed,
    /// Not executed.
    Skipped,
}

/// What a step returns, and what the executor reports for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Final status.
    pub status: StepStatus,
    /// Output, for completed steps.
    pub data: Option<Value>,
    /// Failure message, for failed steps.
    pub error: Option<String>,
    /// Why the step was skipped.
    pub reason: Option<String>,
    /// LLM tokens consumed.
    pub tokens_used: u64,
    /// Number of sources the step found.
    pub sources_found: u32,
    /// Execution time in milliseconds, including retries.
    pub duration_ms: u64,
    /// True if the result came from a checkpoint.
    pub cached: bool,
}

impl StepResult {
    fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            data: None,
            error: None,
            reason: None,
            tokens_used: 0,
            sources_found: 0,
            duration_ms: 0,
            cached: false,
        }
    }

    /// A completed result carrying `data`.
    #[must_use]
    pub fn completed(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::with_status(StepStatus::Completed)
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(StepStatus::Failed)
        }
    }

    /// A skipped result.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::with_status(StepStatus::Skipped)
        }
    }

    /// A completed result restored from a checkpoint.
    #[must_use]
    pub fn cached(data: Value) -> Self {
        Self {
            cached: true,
            ..Self::completed(data)
        }
    }

    /// Sets the token count.
    #[must_use]
    pub fn with_tokens_used(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Sets the source count.
    #[must_use]
    pub fn with_sources_found(mut self, sources: u32) -> Self {
        self.sources_found = sources;
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Returns true if completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Returns true if failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    /// Returns true if skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.status == StepStatus::Skipped
    }
}

/// One unit of pipeline work.
///
/// Returning `Err` or a [`StepStatus::Failed`] result counts as a failed
/// attempt and may be retried. Long-running implementations should watch
/// [`StepContext::cancel_token`]: a timed-out step is dropped at its next
/// await point, but tasks it spawned keep running.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Executes the step.
    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResult>;
}

/// Future returned by [`FnStep`] closures.
pub type StepFuture<'a> = BoxFuture<'a, anyhow::Result<StepResult>>;

/// A step backed by a closure.
///
/// ```rust,ignore
/// let step = FnStep::new(|ctx| Box::pin(async move {
///     anyhow::Ok(StepResult::completed(json!({"item": ctx.item_id()})))
/// }));
/// ```
pub struct FnStep<F>
where
    F: for<'a> Fn(&'a StepContext) -> StepFuture<'a> + Send + Sync,
{
    func: F,
}

impl<F> FnStep<F>
where
    F: for<'a> Fn(&'a StepContext) -> StepFuture<'a> + Send + Sync,
{
    /// Wraps a closure.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Debug for FnStep<F>
where
    F: for<'a> Fn(&'a StepContext) -> StepFuture<'a> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: for<'a> Fn(&'a StepContext) -> StepFuture<'a> + Send + Sync,
{
    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResult> {
        (self.func)(ctx).await
    }
}

/// Predicate deciding whether a step should be skipped for an item.
pub type SkipCondition = Arc<dyn Fn(&StepContext) -> bool + Send + Sync>;

/// Declarative description of a step in a run.
#[derive(Clone)]
pub struct PipelineStepDefinition {
    name: String,
    step: Arc<dyn Step>,
    required: bool,
    timeout: Option<Duration>,
    depends_on: Vec<String>,
    skippable: bool,
    skip_condition: Option<SkipCondition>,
    dependency: Option<String>,
    retry_policy: Option<String>,
}

impl PipelineStepDefinition {
    /// Creates a required step with no dependencies.
    pub fn new(name: impl Into<String>, step: impl Step + 'static) -> Self {
        Self::from_arc(name, Arc::new(step))
    }

    /// Creates a required step from a shared implementation.
    pub fn from_arc(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            step,
            required: true,
            timeout: None,
            depends_on: Vec::new(),
            skippable: false,
            skip_condition: None,
            dependency: None,
            retry_policy: None,
        }
    }

    /// Marks the step optional: its failure does not abort the run.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Sets whether a failure aborts the run.
    #[must_use]
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declares steps that must complete first.
    #[must_use]
    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(steps.into_iter().map(Into::into));
        self
    }

    /// Sets whether the skip condition is honored.
    #[must_use]
    pub fn with_skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    /// Installs a skip condition and marks the step skippable.
    #[must_use]
    pub fn with_skip_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&StepContext) -> bool + Send + Sync + 'static,
    {
        self.skip_condition = Some(Arc::new(condition));
        self.skippable = true;
        self
    }

    /// Names the external dependency whose breaker and limiter guard this step.
    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    /// Names the retry policy class for this step.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: impl Into<String>) -> Self {
        self.retry_policy = Some(policy.into());
        self
    }

    /// Step name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The implementation.
    #[must_use]
    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    /// True if a failure aborts the run.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Per-attempt timeout, if set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Names of prerequisite steps.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// True if the skip condition is honored.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        self.skippable
    }

    /// External dependency name.
    #[must_use]
    pub fn dependency(&self) -> Option<&str> {
        self.dependency.as_deref()
    }

    /// Retry policy class.
    #[must_use]
    pub fn retry_policy(&self) -> Option<&str> {
        self.retry_policy.as_deref()
    }

    /// Evaluates the skip condition. Always false unless skippable.
    #[must_use]
    pub fn should_skip(&self, ctx: &StepContext) -> bool {
        self.skippable && self.skip_condition.as_ref().is_some_and(|condition| condition(ctx))
    }
}

impl Debug for PipelineStepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStepDefinition")
            .field("name", &self.name)
            .field("step", &self.step)
            .field("required", &self.required)
            .field("timeout", &self.timeout)
            .field("depends_on", &self.depends_on)
            .field("skippable", &self.skippable)
            .field("has_skip_condition", &self.skip_condition.is_some())
            .field("dependency", &self.dependency)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}
