//! Step lifecycle events.
//!
//! The executor reports every step transition to an [`EventSink`]. Sinks
//! must never fail the run; emitting is fire-and-forget.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of step transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventKind {
    /// The step began executing.
    Started,
    /// The step produced a result.
    Completed,
    /// A checkpointed result was reused.
    Cached,
    /// The step was not executed.
    Skipped,
    /// The step failed after retries.
    Failed,
}

impl StepEventKind {
    /// Dotted event type, e.g. `step.completed`.
    #[must_use]
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Started => "step.started",
            Self::Completed => "step.completed",
            Self::Cached => "step.cached",
            Self::Skipped => "step.skipped",
            Self::Failed => "step.failed",
        }
    }
}

impl fmt::Display for StepEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// A single step transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Transition kind.
    pub kind: StepEventKind,
    /// Item being processed.
    pub item_id: String,
    /// Step name.
    pub step: String,
    /// Invocations made, for completed and failed steps.
    pub attempts: Option<u32>,
    /// Execution time, for completed and failed steps.
    pub duration_ms: Option<u64>,
    /// Skip reason or failure message.
    pub detail: Option<String>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

impl StepEvent {
    /// Creates an event with no optional fields.
    #[must_use]
    pub fn new(kind: StepEventKind, item_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            kind,
            item_id: item_id.into(),
            step: step.into(),
            attempts: None,
            duration_ms: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
