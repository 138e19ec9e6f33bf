use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Known but not started.
    Pending,
    /// A run is executing the step.
    Processing,
    /// Finished with a result.
    Completed,
    /// Terminally failed.
    Failed,
    /// Deliberately not executed.
    Skipped,
}

impl CheckpointStatus {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accounting attached to a completed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// LLM tokens consumed.
    pub tokens_used: u64,
    /// Wall-clock execution time.
    pub duration_ms: u64,
}

/// The persisted state of one step for one item.
///
/// `(item_id, step_name)` is the unique key. Writes replace every field
/// except `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Item the step ran for.
    pub item_id: String,
    /// Step name.
    pub step_name: String,
    /// Current status.
    pub status: CheckpointStatus,
    /// Step output, present only when completed.
    pub result_data: Option<Value>,
    /// LLM tokens consumed.
    pub tokens_used: u64,
    /// Execution time in milliseconds.
    pub duration_ms: u64,
    /// Failure message, present only when failed.
    pub error_message: Option<String>,
    /// Skip reason, present only when skipped.
    pub skip_reason: Option<String>,
    /// First write for this key.
    pub created_at: DateTime<Utc>,
    /// Latest write for this key.
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    fn new(item_id: &str, step_name: &str, status: CheckpointStatus) -> Self {
        let now = Utc::now();
        Self {
            item_id: item_id.to_string(),
            step_name: step_name.to_string(),
            status,
            result_data: None,
            tokens_used: 0,
            duration_ms: 0,
            error_message: None,
            skip_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A record for a step that is being executed.
    #[must_use]
    pub fn processing(item_id: &str, step_name: &str) -> Self {
        Self::new(item_id, step_name, CheckpointStatus::Processing)
    }

    /// A record for a finished step.
    #[must_use]
    pub fn completed(item_id: &str, step_name: &str, data: Value, meta: CheckpointMeta) -> Self {
        Self {
            result_data: Some(data),
            tokens_used: meta.tokens_used,
            duration_ms: meta.duration_ms,
            ..Self::new(item_id, step_name, CheckpointStatus::Completed)
        }
    }

    /// A record for a terminally failed step.
    #[must_use]
    pub fn failed(item_id: &str, step_name: &str, error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::new(item_id, step_name, CheckpointStatus::Failed)
        }
    }

    /// A record for a skipped step.
    #[must_use]
    pub fn skipped(item_id: &str, step_name: &str, reason: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(reason.into()),
            ..Self::new(item_id, step_name, CheckpointStatus::Skipped)
        }
    }

    /// Sets `updated_at`.
    #[must_use]
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Returns true if the step is `processing` and was last touched before `cutoff`.
    #[must_use]
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == CheckpointStatus::Processing && self.updated_at < cutoff
    }
}

/// Per-status checkpoint counts for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionStatus {
    /// Checkpoints in `pending`.
    pub pending: usize,
    /// Checkpoints in `processing`.
    pub processing: usize,
    /// Checkpoints in `completed`.
    pub completed: usize,
    /// Checkpoints in `failed`.
    pub failed: usize,
    /// Checkpoints in `skipped`.
    pub skipped: usize,
    /// All checkpoints.
    pub total: usize,
}

impl CompletionStatus {
    /// Tallies a set of records.
    #[must_use]
    pub fn from_records(records: &[CheckpointRecord]) -> Self {
        records.iter().fold(Self::default(), |mut status, record| {
            match record.status {
                CheckpointStatus::Pending => status.pending += 1,
                CheckpointStatus::Processing => status.processing += 1,
                CheckpointStatus::Completed => status.completed += 1,
                CheckpointStatus::Failed => status.failed += 1,
                CheckpointStatus::Skipped => status.skipped += 1,
            }
            status.total += 1;
            status
        })
    }
}
