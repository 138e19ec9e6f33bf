//! Event sink trait and implementations.

use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

use super::{StepEvent, StepEventKind};

/// Receives step lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &StepEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &StepEvent) {}
}

/// Writes events to `tracing`.
///
/// Failures are always logged at WARN; other events use the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event: &StepEvent) {
        if event.kind == StepEventKind::Failed {
            warn!(
                event_type = event.kind.event_type(),
                item_id = %event.item_id,
                step = %event.step,
                attempts = ?event.attempts,
                detail = ?event.detail,
                "Step failed"
            );
            return;
        }

        if self.level == Level::DEBUG {
            debug!(
                event_type = event.kind.event_type(),
                item_id = %event.item_id,
                step = %event.step,
                duration_ms = ?event.duration_ms,
                detail = ?event.detail,
                "Event: {}", event.kind
            );
        } else {
            info!(
                event_type = event.kind.event_type(),
                item_id = %event.item_id,
                step = %event.step,
                duration_ms = ?event.duration_ms,
                detail = ?event.detail,
                "Event: {}", event.kind
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &StepEvent) {
        self.log_event(event);
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<StepEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StepEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: StepEventKind) -> Vec<StepEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the kinds emitted for one step, in order.
    #[must_use]
    pub fn kinds_for_step(&self, step: &str) -> Vec<StepEventKind> {
        self.events
            .read()
            .iter()
            .filter(|e| e.step == step)
            .map(|e| e.kind)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &StepEvent) {
        self.events.write().push(event.clone());
    }
}
