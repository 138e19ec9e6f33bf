//! Mock steps for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::{Step, StepContext, StepResult};

/// A step that completes with fixed data and counts its calls.
///
/// Clones share the counter.
#[derive(Debug, Clone)]
pub struct CountingStep {
    data: Value,
    calls: Arc<AtomicUsize>,
}

impl Default for CountingStep {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingStep {
    /// Completes with `{"ok": true}`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_data(json!({ "ok": true }))
    }

    /// Completes with `data`.
    #[must_use]
    pub fn with_data(data: Value) -> Self {
        Self {
            data,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of times the step ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for CountingStep {
    async fn execute(&self, _ctx: &StepContext) -> anyhow::Result<StepResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepResult::completed(self.data.clone()))
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Error(String),
    Result(StepResult),
}

impl Scripted {
    fn play(self) -> anyhow::Result<StepResult> {
        match self {
            Self::Error(message) => Err(anyhow::anyhow!(message)),
            Self::Result(result) => Ok(result),
        }
    }
}

/// A step that plays back a script of outcomes, one per call.
///
/// The last entry repeats once the script runs out. Clones share the script.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    last: Arc<Mutex<Option<Scripted>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedStep {
    fn from_script(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            last: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `Ok` completes with the value; `Err` fails with the message.
    #[must_use]
    pub fn new(outcomes: Vec<Result<Value, String>>) -> Self {
        Self::from_script(outcomes.into_iter().map(|outcome| match outcome {
            Ok(data) => Scripted::Result(StepResult::completed(data)),
            Err(message) => Scripted::Error(message),
        }))
    }

    /// Returns each result as-is.
    #[must_use]
    pub fn from_results(results: Vec<StepResult>) -> Self {
        Self::from_script(results.into_iter().map(Scripted::Result))
    }

    /// Always completes with `data`.
    #[must_use]
    pub fn succeeding(data: Value) -> Self {
        Self::new(vec![Ok(data)])
    }

    /// Always fails with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(vec![Err(message.into())])
    }

    /// Number of times the step ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<Scripted> {
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(entry) => {
                *last = Some(entry.clone());
                Some(entry)
            }
            None => last.clone(),
        }
    }
}

#[async_trait]
impl Step for ScriptedStep {
    async fn execute(&self, _ctx: &StepContext) -> anyhow::Result<StepResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next() {
            Some(entry) => entry.play(),
            None => Err(anyhow::anyhow!("script is empty")),
        }
    }
}

/// A step that sleeps before completing.
#[derive(Debug, Clone)]
pub struct SlowStep {
    delay: Duration,
}

impl SlowStep {
    /// Sleeps for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Sleeps for `ms` milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Step for SlowStep {
    async fn execute(&self, _ctx: &StepContext) -> anyhow::Result<StepResult> {
        tokio::time::sleep(self.delay).await;
        let slept_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
        Ok(StepResult::completed(json!({ "slept_ms": slept_ms })))
    }
}

/// A step that records which items it ran for and which results it could see.
#[derive(Debug, Clone, Default)]
pub struct RecordingStep {
    seen: Arc<Mutex<Vec<RecordedCall>>>,
}

/// One call observed by a [`RecordingStep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Item the step ran for.
    pub item_id: String,
    /// Names of earlier results visible in the context, sorted.
    pub visible_results: Vec<String>,
}

impl RecordingStep {
    /// Creates a recorder with no calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Step for RecordingStep {
    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<StepResult> {
        let mut visible_results: Vec<String> = ctx.previous_results().into_keys().collect();
        visible_results.sort();
        self.seen.lock().push(RecordedCall {
            item_id: ctx.item_id().to_string(),
            visible_results,
        });
        Ok(StepResult::completed(json!({ "item_id": ctx.item_id() })))
    }
}
