//! Checkpointed, resilient step execution for one item.
//!
//! A [`PipelineStepDefinition`] names a [`Step`], whether it is required,
//! its dependencies, timeout, skip condition and the external dependency
//! whose breaker and limiter guard it. [`StepExecutor`] runs definitions
//! against a [`StepContext`]:
//!
//! - completed checkpoints are reused instead of re-running the step;
//! - each attempt goes through retry, then breaker, then limiter, then timeout;
//! - optional failures are recorded and the run continues, required
//!   failures stop it.

mod context;
mod executor;
mod step;
mod validation;


pub use context::StepContext;
pub use executor::{
    unmet_dependencies_reason, ExecuteOptions, PipelineRunSummary, StepExecutor, CIRCUIT_OPEN_REASON,
    SKIP_CONDITION_REASON,
};
pub use step::{FnStep, PipelineStepDefinition, SkipCondition, Step, StepFuture, StepResult, StepStatus};
pub use validation::{execution_order, validate_steps};
