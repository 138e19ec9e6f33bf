use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::checkpoint::CheckpointRecord;

/// Resolution state of a dead letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Awaiting review.
    Pending,
    /// Re-queued for processing.
    Retried,
    /// Abandoned.
    Skipped,
    /// Fixed by hand outside the pipeline.
    ManualFix,
}

impl Resolution {
    /// Returns the snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retried => "retried",
            Self::Skipped => "skipped",
            Self::ManualFix => "manual_fix",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The most recent failure of a dead-lettered item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    /// Error message.
    pub message: String,
    /// Step that failed, if known.
    pub step: Option<String>,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A quarantined item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    /// Entry id.
    pub id: Uuid,
    /// Item that failed.
    pub item_id: String,
    /// Batch job the item belonged to.
    pub job_id: Option<String>,
    /// Owner of the item.
    pub user_id: String,
    /// Summary of why the item was dead-lettered.
    pub failure_reason: String,
    /// Terminal failures recorded while pending.
    pub failure_count: u32,
    /// Latest failure.
    pub last_error: LastError,
    /// Original item payload, kept for reprocessing.
    pub prospect_data: Value,
    /// Checkpoint snapshot taken when the item was dead-lettered.
    pub checkpoints: Vec<CheckpointRecord>,
    /// Resolution state.
    pub resolution: Resolution,
    /// Who resolved the entry.
    pub resolved_by: Option<String>,
    /// When the entry was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Free-form reviewer notes.
    pub resolution_notes: Option<String>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterItem {
    /// Returns true while the entry awaits review.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }

    /// Name of the last completed step in the snapshot.
    #[must_use]
    pub fn last_completed_step(&self) -> Option<&str> {
        self.checkpoints
            .iter()
            .filter(|c| c.status == crate::checkpoint::CheckpointStatus::Completed)
            .max_by_key(|c| c.updated_at)
            .map(|c| c.step_name.as_str())
    }
}

/// Input to [`crate::dlq::DeadLetterQueue::add`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    /// Item that failed.
    pub item_id: String,
    /// Batch job.
    pub job_id: Option<String>,
    /// Owner.
    pub user_id: String,
    /// Summary reason.
    pub failure_reason: String,
    /// Latest error message.
    pub error_message: String,
    /// Step that failed.
    pub step: Option<String>,
    /// Original payload.
    pub prospect_data: Value,
    /// Checkpoint snapshot.
    pub checkpoints: Vec<CheckpointRecord>,
}

impl NewDeadLetter {
    /// Creates an entry with the required fields.
    #[must_use]
    pub fn new(
        item_id: impl Into<String>,
        user_id: impl Into<String>,
        failure_reason: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            job_id: None,
            user_id: user_id.into(),
            failure_reason: failure_reason.into(),
            error_message: error_message.into(),
            step: None,
            prospect_data: Value::Null,
            checkpoints: Vec::new(),
        }
    }

    /// Sets the job id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Sets the failed step.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Sets the original payload.
    #[must_use]
    pub fn with_prospect_data(mut self, data: Value) -> Self {
        self.prospect_data = data;
        self
    }

    /// Sets the checkpoint snapshot.
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: Vec<CheckpointRecord>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub(crate) fn into_item(self, now: DateTime<Utc>) -> DeadLetterItem {
        DeadLetterItem {
            id: Uuid::now_v7(),
            item_id: self.item_id,
            job_id: self.job_id,
            user_id: self.user_id,
            failure_reason: self.failure_reason,
            failure_count: 1,
            last_error: LastError {
                message: self.error_message,
                step: self.step,
                timestamp: now,
            },
            prospect_data: self.prospect_data,
            checkpoints: self.checkpoints,
            resolution: Resolution::Pending,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Selection criteria for listing entries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    /// Owner.
    pub user_id: Option<String>,
    /// Batch job.
    pub job_id: Option<String>,
    /// Resolution state.
    pub resolution: Option<Resolution>,
}

impl DeadLetterFilter {
    /// Matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one owner.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restricts to one job.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Restricts to one resolution state.
    #[must_use]
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Returns true if `item` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, item: &DeadLetterItem) -> bool {
        self.user_id.as_ref().map_or(true, |u| *u == item.user_id)
            && self.job_id.as_ref().map_or(true, |j| item.job_id.as_ref() == Some(j))
            && self.resolution.map_or(true, |r| r == item.resolution)
    }
}

/// One grouped failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReasonCount {
    /// Truncated reason prefix.
    pub reason: String,
    /// Entries sharing the prefix.
    pub count: usize,
}

/// Triage summary of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    /// Entries awaiting review.
    pub pending: usize,
    /// Entries re-queued.
    pub retried: usize,
    /// Entries abandoned.
    pub skipped: usize,
    /// Entries fixed by hand.
    pub manual_fix: usize,
    /// All entries.
    pub total: usize,
    /// Creation time of the oldest pending entry.
    pub oldest_pending: Option<DateTime<Utc>>,
    /// Most frequent failure reasons, most common first.
    pub top_failure_reasons: Vec<FailureReasonCount>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_dead_letter_into_item() {
        let now = Utc::now();
        let item = NewDeadLetter::new("p1", "u1", "required_step_failed: search", "HTTP 500")
            .with_job_id("job-9")
            .with_step("search")
            .with_prospect_data(json!({"name": "Ada"}))
            .into_item(now);

        assert!(item.is_pending());
        assert_eq!(item.failure_count, 1);
        assert_eq!(item.last_error.step.as_deref(), Some("search"));
        assert_eq!(item.created_at, now);
        assert_eq!(item.job_id.as_deref(), Some("job-9"));
    }

    #[test]
    fn test_filter_matches() {
        let item = NewDeadLetter::new("p1", "u1", "r", "e").with_job_id("j1").into_item(Utc::now());

        assert!(DeadLetterFilter::new().matches(&item));
        assert!(DeadLetterFilter::new().with_user_id("u1").with_job_id("j1").matches(&item));
        assert!(!DeadLetterFilter::new().with_user_id("u2").matches(&item));
        assert!(!DeadLetterFilter::new().with_resolution(Resolution::Retried).matches(&item));
    }

    #[test]
    fn test_resolution_serde() {
        assert_eq!(serde_json::to_string(&Resolution::ManualFix).unwrap(), "\"manual_fix\"");
        let parsed: Resolution = serde_json::from_str("\"retried\"").unwrap();
        assert_eq!(parsed, Resolution::Retried);
    }
}
