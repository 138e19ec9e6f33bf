use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::CheckpointRecord;
use crate::errors::StoreError;

/// Storage backend for checkpoint records.
///
/// Implementations must make `upsert` atomic per `(item_id, step_name)` key
/// and keep the existing `created_at` when overwriting.
#[async_trait]
pub trait CheckpointTable: Send + Sync + std::fmt::Debug {
    /// Inserts or replaces the record for its key.
    async fn upsert(&self, record: CheckpointRecord) -> Result<(), StoreError>;

    /// Fetches one record.
    async fn select(&self, item_id: &str, step_name: &str) -> Result<Option<CheckpointRecord>, StoreError>;

    /// Fetches every record for an item, oldest first.
    async fn select_by_item(&self, item_id: &str) -> Result<Vec<CheckpointRecord>, StoreError>;

    /// Fetches `processing` records last updated before `cutoff`.
    async fn select_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<CheckpointRecord>, StoreError>;

    /// Deletes every record for an item and returns how many were removed.
    async fn delete_by_item(&self, item_id: &str) -> Result<usize, StoreError>;
}

/// Checkpoint table held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointTable {
    rows: DashMap<(String, String), CheckpointRecord>,
}

impl InMemoryCheckpointTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl CheckpointTable for InMemoryCheckpointTable {
    async fn upsert(&self, mut record: CheckpointRecord) -> Result<(), StoreError> {
        let key = (record.item_id.clone(), record.step_name.clone());
        match self.rows.entry(key) {
            Entry::Occupied(mut existing) => {
                record.created_at = existing.get().created_at;
                existing.insert(record);
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        Ok(())
    }

    async fn select(&self, item_id: &str, step_name: &str) -> Result<Option<CheckpointRecord>, StoreError> {
        let key = (item_id.to_string(), step_name.to_string());
        Ok(self.rows.get(&key).map(|row| row.value().clone()))
    }

    async fn select_by_item(&self, item_id: &str) -> Result<Vec<CheckpointRecord>, StoreError> {
        let mut records: Vec<_> = self
            .rows
            .iter()
            .filter(|row| row.key().0 == item_id)
            .map(|row| row.value().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.step_name.cmp(&b.step_name)));
        Ok(records)
    }

    async fn select_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<CheckpointRecord>, StoreError> {
        let mut records: Vec<_> = self
            .rows
            .iter()
            .filter(|row| row.value().is_stale(cutoff))
            .map(|row| row.value().clone())
            .collect();
        records.sort_by_key(|record| record.updated_at);
        Ok(records)
    }

    async fn delete_by_item(&self, item_id: &str) -> Result<usize, StoreError> {
        let before = self.rows.len();
        self.rows.retain(|key, _| key.0 != item_id);
        Ok(before.saturating_sub(self.rows.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMeta, CheckpointStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_replaces_but_keeps_created_at() {
        let table = InMemoryCheckpointTable::new();
        let first = CheckpointRecord::processing("p1", "search");
        let created_at = first.created_at;
        table.upsert(first).await.unwrap();

        let later = CheckpointRecord::completed("p1", "search", json!({"ok": true}), CheckpointMeta::default())
            .with_updated_at(created_at + chrono::Duration::seconds(5));
        table.upsert(later).await.unwrap();

        let stored = table.select("p1", "search").await.unwrap().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(stored.status, CheckpointStatus::Completed);
        assert_eq!(stored.created_at, created_at);
        assert!(stored.updated_at > stored.created_at);
    }

    #[tokio::test]
    async fn test_select_by_item_and_delete() {
        let table = InMemoryCheckpointTable::new();
        table.upsert(CheckpointRecord::processing("p1", "a")).await.unwrap();
        table.upsert(CheckpointRecord::processing("p1", "b")).await.unwrap();
        table.upsert(CheckpointRecord::processing("p2", "a")).await.unwrap();

        assert_eq!(table.select_by_item("p1").await.unwrap().len(), 2);
        assert_eq!(table.delete_by_item("p1").await.unwrap(), 2);
        assert!(table.select_by_item("p1").await.unwrap().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_select_stale_processing() {
        let table = InMemoryCheckpointTable::new();
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(30);
        table
            .upsert(CheckpointRecord::processing("p1", "a").with_updated_at(old))
            .await
            .unwrap();
        table.upsert(CheckpointRecord::processing("p2", "a")).await.unwrap();
        table
            .upsert(CheckpointRecord::failed("p3", "a", "x").with_updated_at(old))
            .await
            .unwrap();

        let stale = table
            .select_stale_processing(now - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].item_id, "p1");
    }
}
