//! Retryability classification.

use regex::Regex;
use std::sync::LazyLock;

use crate::errors::{RateLimitError, StepError};

fn pattern(source: &str) -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new(source).expect("static classification pattern is valid")
}

static STATUS_429: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b429\b|rate.?limit|too many requests|quota exceeded"));

static TIMEOUT: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\btime[d ]?\s?outs?\b|deadline exceeded|ETIMEDOUT"));

static CONNECTION: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)ECONNRESET|ECONNREFUSED|connection (reset|refused|closed|aborted)|socket hang up|network error|broken pipe",
    )
});

static SERVER: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b5\d\d\b|bad gateway|service unavailable|gateway time|internal server error")
});

/// Coarse category of a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 429 or provider quota messages.
    RateLimit,
    /// Request or step timeouts.
    Timeout,
    /// Connection resets, refusals, dropped sockets.
    Connection,
    /// 5xx and gateway errors.
    Server,
    /// Anything else; not retried.
    Other,
}

impl ErrorCategory {
    /// Returns true for transient categories.
    #[must_use]
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// Classifies an error message by its content.
#[must_use]
pub fn classify_message(message: &str) -> ErrorCategory {
    if STATUS_429.is_match(message) {
        ErrorCategory::RateLimit
    } else if TIMEOUT.is_match(message) {
        ErrorCategory::Timeout
    } else if CONNECTION.is_match(message) {
        ErrorCategory::Connection
    } else if SERVER.is_match(message) {
        ErrorCategory::Server
    } else {
        ErrorCategory::Other
    }
}

/// Default retryability: rate limit, timeout, connection and 5xx errors.
#[must_use]
pub fn is_retryable_message(message: &str) -> bool {
    classify_message(message).is_transient()
}

/// Errors that know whether retrying them can help.
pub trait Retryable {
    /// Returns true if a retry may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for StepError {
    fn is_retryable(&self) -> bool {
        match self {
            // An open breaker must surface as "try later", never as a transient failure.
            Self::CircuitOpen(_) | Self::Cancelled(_) => false,
            Self::RateLimit(RateLimitError::ExceedsCapacity { .. }) => false,
            Self::Timeout { .. } => true,
            Self::Execution(message) => is_retryable_message(message),
        }
    }
}

impl Retryable for anyhow::Error {
    fn is_retryable(&self) -> bool {
        is_retryable_message(&format!("{self:#}"))
    }
}

impl Retryable for String {
    fn is_retryable(&self) -> bool {
        is_retryable_message(self)
    }
}

impl Retryable for &str {
    fn is_retryable(&self) -> bool {
        is_retryable_message(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{CancelledError, CircuitOpenError};
    use std::time::Duration;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), ErrorCategory::RateLimit);
        assert_eq!(classify_message("Rate limit exceeded"), ErrorCategory::RateLimit);
    }

    #[test]
    fn test_classify_timeout_and_connection() {
        assert_eq!(classify_message("request timed out"), ErrorCategory::Timeout);
        assert_eq!(classify_message("Step 'x' timeout after 100ms"), ErrorCategory::Timeout);
        assert_eq!(classify_message("read ECONNRESET"), ErrorCategory::Connection);
        assert_eq!(classify_message("socket hang up"), ErrorCategory::Connection);
    }

    #[test]
    fn test_classify_server_errors() {
        assert_eq!(classify_message("upstream returned 503"), ErrorCategory::Server);
        assert_eq!(classify_message("502 Bad Gateway"), ErrorCategory::Server);
        assert_eq!(classify_message("Service Unavailable"), ErrorCategory::Server);
    }

    #[test]
    fn test_non_transient_messages() {
        assert!(!is_retryable_message("invalid API key"));
        assert!(!is_retryable_message("HTTP 404 not found"));
        assert!(!is_retryable_message("parse error at line 5000"));
    }

    #[test]
    fn test_timeout_matches_whole_words_only() {
        assert!(!is_retryable_message("runtime output did not match schema"));
        assert!(!is_retryable_message("invalid timeoutMs field"));
        assert_eq!(classify_message("3 timeouts in a row"), ErrorCategory::Timeout);
        assert_eq!(classify_message("connect time out"), ErrorCategory::Timeout);
    }

    #[test]
    fn test_step_error_retryability() {
        let open = StepError::CircuitOpen(CircuitOpenError {
            dependency: "search".into(),
            retry_after: Duration::from_secs(5),
        });
        assert!(!open.is_retryable());
        assert!(!StepError::Cancelled(CancelledError::new("stop")).is_retryable());
        assert!(StepError::Timeout { step: "a".into(), timeout_ms: 10 }.is_retryable());
        assert!(StepError::Execution("HTTP 500".into()).is_retryable());
        assert!(!StepError::Execution("validation failed".into()).is_retryable());
    }

    #[test]
    fn test_anyhow_retryability_uses_context_chain() {
        let err = anyhow::anyhow!("connection reset by peer").context("calling FEC API");
        assert!(err.is_retryable());
    }
}
