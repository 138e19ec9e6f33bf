//! # Stepguard
//!
//! Resilient, checkpointed step execution for batch enrichment pipelines.
//!
//! Each item (a person, a company, a record to enrich) runs through an ordered
//! list of steps that call external services. Stepguard provides:
//!
//! - **Checkpoints**: completed step results are stored per item, so a crashed
//!   or failed run resumes without repeating paid calls
//! - **Circuit breakers and rate limiters**: shared per dependency through a
//!   [`registry::ResilienceRegistry`]
//! - **Retries**: exponential backoff with jitter for transient failures
//! - **Dead letter queue**: items whose required steps fail are parked with
//!   their checkpoints for review and retry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stepguard::prelude::*;
//!
//! let registry = Arc::new(ResilienceRegistry::from_config(config));
//! let executor = StepExecutor::new(registry);
//! let runner = BatchRunner::new(executor, CheckpointStore::in_memory(), DeadLetterQueue::in_memory());
//!
//! let steps = vec![
//!     PipelineStepDefinition::new("search", SearchStep::new()).with_dependency("search_api"),
//!     PipelineStepDefinition::new("sec", SecStep::new())
//!         .optional()
//!         .depends_on(["search"])
//!         .with_dependency("sec"),
//! ];
//! let report = runner.run_batch_for_tier(items, &steps, Some("pro")).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cancellation;
pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod dlq;
pub mod errors;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchItem, BatchReport, BatchRunner, ItemOutcome, RetryMode};
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{CheckpointStatus, CheckpointStore, CheckpointTable};
    pub use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use crate::config::{ConcurrencyConfig, ResilienceConfig};
    pub use crate::dlq::{DeadLetterFilter, DeadLetterItem, DeadLetterQueue, DeadLetterTable, Resolution};
    pub use crate::errors::{PipelineError, StepError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::orchestrator::{
        ExecuteOptions, FnStep, PipelineRunSummary, PipelineStepDefinition, Step, StepContext, StepExecutor,
        StepResult, StepStatus,
    };
    pub use crate::ratelimit::{RateLimiter, RateLimiterConfig, SlidingWindow, TokenBucket};
    pub use crate::registry::ResilienceRegistry;
    pub use crate::retry::RetryPolicy;
}
