//! Test assertions for step results and checkpoints.

use crate::checkpoint::{CheckpointStatus, CheckpointStore};
use crate::orchestrator::{StepResult, StepStatus};

/// Asserts that the result completed.
pub fn assert_step_completed(result: &StepResult) {
    assert!(
        result.is_completed(),
        "Expected completed, got {:?} (error: {:?}, reason: {:?})",
        result.status,
        result.error,
        result.reason
    );
}

/// Asserts that the result failed.
pub fn assert_step_failed(result: &StepResult) {
    assert!(
        result.is_failed(),
        "Expected failure, got status: {:?}",
        result.status
    );
}

/// Asserts that the result was skipped for `reason`.
pub fn assert_step_skipped(result: &StepResult, reason: &str) {
    assert_eq!(
        (result.status, result.reason.as_deref()),
        (StepStatus::Skipped, Some(reason)),
        "Expected skip with reason '{reason}'"
    );
}

/// Asserts the stored checkpoint status of one step.
pub async fn assert_checkpoint_status(
    store: &CheckpointStore,
    item_id: &str,
    step: &str,
    expected: CheckpointStatus,
) {
    let actual = store.get(item_id, step).await.map(|record| record.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected checkpoint {item_id}/{step} to be {expected}, got {actual:?}"
    );
}
