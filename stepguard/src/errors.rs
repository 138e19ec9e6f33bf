//! Error types for stepguard.
//!
//! The taxonomy separates what the retry layer may retry (transient step
//! failures), what it must never retry or count (an open circuit, a
//! cancellation), and what aborts an item's whole run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that abort an item's pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The step list failed validation.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The step list contains a dependency cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A required step is guarded by an open circuit breaker.
    #[error("Required step '{step}' blocked: {source}")]
    CircuitOpen {
        /// The step that could not run.
        step: String,
        /// The breaker rejection.
        #[source]
        source: CircuitOpenError,
    },

    /// A required step failed terminally.
    #[error("Required step '{step}' failed after {attempts} attempt(s): {message}")]
    RequiredStepFailed {
        /// The failing step.
        step: String,
        /// The last error message.
        message: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// The run was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),
}

impl PipelineError {
    /// Returns the step that caused the abort, if any.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { step, .. } | Self::RequiredStepFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Short reason used as the dead letter `failure_reason`.
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Validation(_) | Self::CycleDetected(_) => "invalid_pipeline".to_string(),
            Self::CircuitOpen { step, .. } => format!("circuit_breaker_open: {step}"),
            Self::RequiredStepFailed { step, message, .. } => {
                format!("required_step_failed: {step}: {message}")
            }
            Self::Cancelled(_) => "cancelled".to_string(),
        }
    }
}

/// Metadata about a validation error for better diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when a step list fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The steps involved in the error.
    pub steps: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the steps involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }
}

/// Error raised when a cycle is detected among step dependencies.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of steps forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "PIPELINE-CYCLE",
            format!("Step list contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Rejection raised by an open circuit breaker.
///
/// Never counted as a new failure and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker '{dependency}' is open; retry after {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    /// The protected dependency.
    pub dependency: String,
    /// Remaining cooldown.
    pub retry_after: Duration,
}

/// Cancellation observed while waiting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cancelled: {reason}")]
pub struct CancelledError {
    /// Why the operation was cancelled.
    pub reason: String,
}

impl CancelledError {
    /// Creates a new cancelled error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Rate limiter errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The request can never be satisfied by this limiter.
    #[error("Requested {requested} permits but limiter capacity is {capacity}")]
    ExceedsCapacity {
        /// Permits requested.
        requested: u32,
        /// Limiter capacity.
        capacity: u32,
    },
}

/// A single attempt's failure inside the step executor.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The dependency's breaker rejected the call.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The step did not finish within its timeout.
    #[error("Step '{step}' timeout after {timeout_ms}ms")]
    Timeout {
        /// The step name.
        step: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The run was cancelled.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    /// The rate limiter refused the request.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// The step itself failed.
    #[error("{0}")]
    Execution(String),
}

impl StepError {
    /// Wraps an error returned by a step implementation.
    #[must_use]
    pub fn execution(err: &anyhow::Error) -> Self {
        Self::Execution(format!("{err:#}"))
    }

    /// Returns true if this is a breaker rejection.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }
}

/// Errors returned by checkpoint and dead letter tables.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors from dead letter resolution operations.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    /// No entry with the given id.
    #[error("Dead letter entry '{0}' not found")]
    NotFound(String),

    /// The entry has already left `pending`.
    #[error("Dead letter entry '{id}' already resolved as {resolution}")]
    AlreadyResolved {
        /// The entry id.
        id: String,
        /// Its current resolution.
        resolution: String,
    },

    /// The backing table failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid configuration JSON.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = CycleDetectedError::new(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Cycle detected in pipeline: a -> b -> a");
        assert_eq!(err.error_info.code, "PIPELINE-CYCLE");
    }

    #[test]
    fn test_required_failure_reason() {
        let err = PipelineError::RequiredStepFailed {
            step: "sec_filings".into(),
            message: "HTTP 500".into(),
            attempts: 4,
        };
        assert_eq!(err.step(), Some("sec_filings"));
        assert_eq!(err.failure_reason(), "required_step_failed: sec_filings: HTTP 500");
        assert!(err.to_string().contains("4 attempt(s)"));
    }

    #[test]
    fn test_circuit_open_display() {
        let err = CircuitOpenError {
            dependency: "search".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Circuit breaker 'search' is open; retry after 1500ms");

        let step_err = StepError::from(err);
        assert!(step_err.is_circuit_open());
    }

    #[test]
    fn test_step_error_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("connection reset").context("fetching filings");
        let step_err = StepError::execution(&err);
        assert_eq!(step_err.to_string(), "fetching filings: connection reset");
    }

    #[test]
    fn test_validation_error_builder() {
        let err = PipelineValidationError::new("duplicate step")
            .with_steps(vec!["a".into()])
            .with_error_info(ErrorInfo::new("PIPELINE-DUPLICATE", "dup").with_fix_hint("rename"));
        assert_eq!(err.steps, vec!["a".to_string()]);
        assert_eq!(err.error_info.and_then(|i| i.fix_hint), Some("rename".to_string()));
    }
}
