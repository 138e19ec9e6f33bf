//! Batch inputs and outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::orchestrator::PipelineRunSummary;

/// One unit of work handed to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Item identifier; checkpoints are keyed by it.
    pub item_id: String,
    /// Owner of the item.
    pub user_id: String,
    /// Enclosing job.
    #[serde(default)]
    pub job_id: Option<String>,
    /// Subscription tier.
    #[serde(default)]
    pub tier: Option<String>,
    /// Input data for the steps.
    #[serde(default)]
    pub payload: Value,
    /// Per-user credentials passed to steps.
    #[serde(default, skip_serializing)]
    pub credentials: BTreeMap<String, String>,
}

impl BatchItem {
    /// Creates an item with no payload.
    #[must_use]
    pub fn new(item_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            user_id: user_id.into(),
            job_id: None,
            tier: None,
            payload: Value::Null,
            credentials: BTreeMap::new(),
        }
    }

    /// Sets the job.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Sets the tier.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Adds a credential.
    #[must_use]
    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }
}

/// How a single item ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Every required step completed.
    Completed {
        /// Per-step results.
        summary: PipelineRunSummary,
    },
    /// A required step failed and the item went to the dead letter queue.
    DeadLettered {
        /// Error that stopped the run.
        error: String,
        /// Step that failed, if known.
        step: Option<String>,
        /// Dead letter entry, unless the queue write failed.
        dead_letter_id: Option<Uuid>,
    },
    /// The run was cancelled; checkpoints allow a later resume.
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

/// Outcome of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemReport {
    /// Item identifier.
    pub item_id: String,
    /// How it ended.
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl ItemReport {
    /// Returns true if the item completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Completed { .. })
    }
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Per-item outcomes in completion order.
    pub items: Vec<ItemReport>,
    /// Completed items.
    pub completed: usize,
    /// Dead-lettered items.
    pub dead_lettered: usize,
    /// Cancelled items.
    pub cancelled: usize,
    /// Tokens consumed across all items.
    pub total_tokens: u64,
    /// Wall-clock time of the batch.
    pub duration_ms: u64,
}

impl BatchReport {
    pub(crate) fn record(&mut self, report: ItemReport) {
        match &report.outcome {
            ItemOutcome::Completed { summary } => {
                self.completed += 1;
                self.total_tokens += summary.total_tokens;
            }
            ItemOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            ItemOutcome::Cancelled { .. } => self.cancelled += 1,
        }
        self.items.push(report);
    }

    /// Returns the report for one item.
    #[must_use]
    pub fn item(&self, item_id: &str) -> Option<&ItemReport> {
        self.items.iter().find(|r| r.item_id == item_id)
    }

    /// Returns true if every item completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.completed == self.items.len()
    }
}
