use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{
    CheckpointMeta, CheckpointRecord, CheckpointStatus, CheckpointTable, CompletionStatus,
    InMemoryCheckpointTable,
};

/// Checkpoint operations used by the executor.
///
/// Storage failures never propagate: writes are logged and dropped, reads
/// degrade to "not completed" or empty. A lost checkpoint only costs a
/// re-execution on the next run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    table: Arc<dyn CheckpointTable>,
}

impl CheckpointStore {
    /// Creates a store over `table`.
    #[must_use]
    pub fn new(table: Arc<dyn CheckpointTable>) -> Self {
        Self { table }
    }

    /// Creates a store over a fresh in-memory table.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointTable::new()))
    }

    /// Returns the underlying table.
    #[must_use]
    pub fn table(&self) -> &Arc<dyn CheckpointTable> {
        &self.table
    }

    /// Fetches the record for a key.
    pub async fn get(&self, item_id: &str, step_name: &str) -> Option<CheckpointRecord> {
        match self.table.select(item_id, step_name).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(item_id, step = step_name, error = %e, "Failed to read checkpoint");
                None
            }
        }
    }

    /// Returns true if the step has a `completed` checkpoint.
    pub async fn has_completed(&self, item_id: &str, step_name: &str) -> bool {
        self.get(item_id, step_name)
            .await
            .is_some_and(|record| record.status == CheckpointStatus::Completed)
    }

    /// Returns the stored result of a completed step.
    pub async fn get_result(&self, item_id: &str, step_name: &str) -> Option<Value> {
        self.get(item_id, step_name)
            .await
            .filter(|record| record.status == CheckpointStatus::Completed)
            .and_then(|record| record.result_data)
    }

    /// Records a completed step.
    pub async fn save_result(&self, item_id: &str, step_name: &str, data: Value, meta: CheckpointMeta) {
        self.write(CheckpointRecord::completed(item_id, step_name, data, meta))
            .await;
    }

    /// Records a terminal failure.
    pub async fn mark_failed(&self, item_id: &str, step_name: &str, error: &str) {
        self.write(CheckpointRecord::failed(item_id, step_name, error)).await;
    }

    /// Records a deliberate skip.
    pub async fn mark_skipped(&self, item_id: &str, step_name: &str, reason: &str) {
        self.write(CheckpointRecord::skipped(item_id, step_name, reason)).await;
    }

    /// Records that the step is being executed.
    pub async fn mark_processing(&self, item_id: &str, step_name: &str) {
        self.write(CheckpointRecord::processing(item_id, step_name)).await;
    }

    /// Returns every checkpoint of an item, oldest first.
    pub async fn get_all_checkpoints(&self, item_id: &str) -> Vec<CheckpointRecord> {
        match self.table.select_by_item(item_id).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(item_id, error = %e, "Failed to read checkpoints");
                Vec::new()
            }
        }
    }

    /// Deletes every checkpoint of an item.
    pub async fn clear_checkpoints(&self, item_id: &str) {
        match self.table.delete_by_item(item_id).await {
            Ok(removed) => tracing::debug!(item_id, removed, "Cleared checkpoints"),
            Err(e) => tracing::error!(item_id, error = %e, "Failed to clear checkpoints"),
        }
    }

    /// Counts an item's checkpoints by status.
    pub async fn get_completion_status(&self, item_id: &str) -> CompletionStatus {
        CompletionStatus::from_records(&self.get_all_checkpoints(item_id).await)
    }

    /// Returns `processing` checkpoints untouched for longer than `threshold`.
    ///
    /// These usually belong to a crashed run.
    pub async fn get_stale_checkpoints(&self, threshold: Duration) -> Vec<CheckpointRecord> {
        match self.table.select_stale_processing(cutoff(threshold)).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stale checkpoints");
                Vec::new()
            }
        }
    }

    /// Returns the most recently completed step of an item.
    pub async fn get_last_completed_step(&self, item_id: &str) -> Option<String> {
        self.get_all_checkpoints(item_id)
            .await
            .into_iter()
            .filter(|record| record.status == CheckpointStatus::Completed)
            .max_by_key(|record| record.updated_at)
            .map(|record| record.step_name)
    }

    async fn write(&self, record: CheckpointRecord) {
        let item_id = record.item_id.clone();
        let step = record.step_name.clone();
        let status = record.status;
        if let Err(e) = self.table.upsert(record).await {
            tracing::error!(
                item_id = %item_id,
                step = %step,
                status = %status,
                error = %e,
                "Failed to write checkpoint"
            );
        }
    }
}

fn cutoff(threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
