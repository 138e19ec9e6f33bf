use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    DeadLetterFilter, DeadLetterItem, DeadLetterStats, DeadLetterTable, FailureReasonCount,
    InMemoryDeadLetterTable, NewDeadLetter, Resolution,
};
use crate::errors::DeadLetterError;

/// Number of failure reasons reported by [`DeadLetterQueue::get_stats`].
pub const TOP_REASONS: usize = 5;

/// Characters of a failure reason used for grouping.
pub const REASON_PREFIX_LEN: usize = 50;

/// Resolution workflow over a [`DeadLetterTable`].
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    table: Arc<dyn DeadLetterTable>,
}

impl DeadLetterQueue {
    /// Creates a queue over `table`.
    #[must_use]
    pub fn new(table: Arc<dyn DeadLetterTable>) -> Self {
        Self { table }
    }

    /// Creates a queue over a fresh in-memory table.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryDeadLetterTable::new()))
    }

    /// Records a terminal failure.
    ///
    /// If the item already has a pending entry, its failure count is bumped
    /// and the latest error, reason and snapshot replace the old ones.
    /// Storage failures are logged and yield `None`.
    pub async fn add(&self, entry: NewDeadLetter) -> Option<DeadLetterItem> {
        let item_id = entry.item_id.clone();
        match self.try_add(entry).await {
            Ok(item) => {
                tracing::warn!(
                    item_id = %item.item_id,
                    dlq_id = %item.id,
                    failure_count = item.failure_count,
                    reason = %item.failure_reason,
                    "Item dead-lettered"
                );
                Some(item)
            }
            Err(e) => {
                tracing::error!(item_id = %item_id, error = %e, "Failed to dead-letter item");
                None
            }
        }
    }

    async fn try_add(&self, entry: NewDeadLetter) -> Result<DeadLetterItem, DeadLetterError> {
        let now = Utc::now();
        if let Some(mut existing) = self.table.find_pending_by_item(&entry.item_id).await? {
            existing.failure_count += 1;
            existing.failure_reason = entry.failure_reason;
            existing.last_error.message = entry.error_message;
            existing.last_error.step = entry.step;
            existing.last_error.timestamp = now;
            existing.checkpoints = entry.checkpoints;
            existing.updated_at = now;
            if self.table.update(existing.clone()).await? {
                return Ok(existing);
            }
            return Err(DeadLetterError::NotFound(existing.id.to_string()));
        }

        let item = entry.into_item(now);
        self.table.insert(item.clone()).await?;
        Ok(item)
    }

    /// Marks a pending entry as re-queued.
    pub async fn mark_for_retry(
        &self,
        id: Uuid,
        user_id: &str,
        notes: Option<&str>,
    ) -> Result<DeadLetterItem, DeadLetterError> {
        self.resolve(id, Resolution::Retried, user_id, notes).await
    }

    /// Marks a pending entry as abandoned.
    pub async fn mark_as_skipped(
        &self,
        id: Uuid,
        user_id: &str,
        notes: Option<&str>,
    ) -> Result<DeadLetterItem, DeadLetterError> {
        self.resolve(id, Resolution::Skipped, user_id, notes).await
    }

    /// Marks a pending entry as fixed by hand.
    pub async fn mark_as_manual_fix(
        &self,
        id: Uuid,
        user_id: &str,
        notes: Option<&str>,
    ) -> Result<DeadLetterItem, DeadLetterError> {
        self.resolve(id, Resolution::ManualFix, user_id, notes).await
    }

    async fn resolve(
        &self,
        id: Uuid,
        resolution: Resolution,
        user_id: &str,
        notes: Option<&str>,
    ) -> Result<DeadLetterItem, DeadLetterError> {
        let mut item = self
            .table
            .get(id)
            .await?
            .ok_or_else(|| DeadLetterError::NotFound(id.to_string()))?;

        if !item.is_pending() {
            return Err(DeadLetterError::AlreadyResolved {
                id: id.to_string(),
                resolution: item.resolution.to_string(),
            });
        }

        let now = Utc::now();
        item.resolution = resolution;
        item.resolved_by = Some(user_id.to_string());
        item.resolved_at = Some(now);
        item.resolution_notes = notes.map(str::to_string);
        item.updated_at = now;

        if !self.table.update(item.clone()).await? {
            return Err(DeadLetterError::NotFound(id.to_string()));
        }
        tracing::info!(dlq_id = %id, resolution = %resolution, resolved_by = user_id, "Dead letter resolved");
        Ok(item)
    }

    /// Fetches one entry.
    pub async fn get(&self, id: Uuid) -> Result<Option<DeadLetterItem>, DeadLetterError> {
        Ok(self.table.get(id).await?)
    }

    /// Lists entries matching `filter`, newest first.
    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterItem>, DeadLetterError> {
        Ok(self.table.select(filter).await?)
    }

    /// Returns the pending entry for an item, if any.
    pub async fn pending_for_item(&self, item_id: &str) -> Result<Option<DeadLetterItem>, DeadLetterError> {
        Ok(self.table.find_pending_by_item(item_id).await?)
    }

    /// Aggregates counts for triage, optionally for one user.
    pub async fn get_stats(&self, user_id: Option<&str>) -> Result<DeadLetterStats, DeadLetterError> {
        let filter = DeadLetterFilter {
            user_id: user_id.map(str::to_string),
            ..DeadLetterFilter::default()
        };
        let items = self.table.select(&filter).await?;
        Ok(summarize(&items))
    }

    /// Deletes entries resolved more than `older_than_days` ago.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<usize, DeadLetterError> {
        let cutoff = TimeDelta::try_days(i64::from(older_than_days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.table.delete_resolved_before(cutoff).await?;
        tracing::info!(removed, older_than_days, "Dead letter cleanup finished");
        Ok(removed)
    }
}

fn summarize(items: &[DeadLetterItem]) -> DeadLetterStats {
    let mut stats = DeadLetterStats {
        total: items.len(),
        ..DeadLetterStats::default()
    };
    let mut oldest_pending: Option<DateTime<Utc>> = None;
    let mut reasons: HashMap<String, usize> = HashMap::new();

    for item in items {
        match item.resolution {
            Resolution::Pending => {
                stats.pending += 1;
                oldest_pending = Some(oldest_pending.map_or(item.created_at, |t| t.min(item.created_at)));
            }
            Resolution::Retried => stats.retried += 1,
            Resolution::Skipped => stats.skipped += 1,
            Resolution::ManualFix => stats.manual_fix += 1,
        }
        let prefix: String = item.failure_reason.chars().take(REASON_PREFIX_LEN).collect();
        *reasons.entry(prefix).or_default() += 1;
    }

    let mut ranked: Vec<_> = reasons
        .into_iter()
        .map(|(reason, count)| FailureReasonCount { reason, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
    ranked.truncate(TOP_REASONS);

    stats.oldest_pending = oldest_pending;
    stats.top_failure_reasons = ranked;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMeta, CheckpointRecord};
    use crate::errors::StoreError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn failure(item_id: &str, user_id: &str, reason: &str) -> NewDeadLetter {
        NewDeadLetter::new(item_id, user_id, reason, "HTTP 500").with_step("search")
    }

    #[derive(Debug)]
    struct BrokenTable;

    #[async_trait]
    impl DeadLetterTable for BrokenTable {
        async fn insert(&self, _item: DeadLetterItem) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn update(&self, _item: DeadLetterItem) -> Result<bool, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }
        async fn get(&self, _id: Uuid) -> Result<Option<DeadLetterItem>, StoreError> {
            Ok(None)
        }
        async fn find_pending_by_item(&self, _item_id: &str) -> Result<Option<DeadLetterItem>, StoreError> {
            Ok(None)
        }
        async fn select(&self, _filter: &DeadLetterFilter) -> Result<Vec<DeadLetterItem>, StoreError> {
            Ok(Vec::new())
        }
        async fn delete_resolved_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_repeat_failure_updates_pending_entry() {
        let dlq = DeadLetterQueue::in_memory();
        let first = dlq.add(failure("p1", "u1", "first")).await.unwrap();

        let snapshot = vec![CheckpointRecord::completed("p1", "fetch", json!(1), CheckpointMeta::default())];
        let second = dlq
            .add(failure("p1", "u1", "second").with_checkpoints(snapshot.clone()))
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.failure_count, 2);
        assert_eq!(second.failure_reason, "second");
        assert_eq!(second.checkpoints, snapshot);
        assert_eq!(dlq.list(&DeadLetterFilter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolution_is_terminal() {
        let dlq = DeadLetterQueue::in_memory();
        let item = dlq.add(failure("p1", "u1", "boom")).await.unwrap();

        let resolved = dlq.mark_as_manual_fix(item.id, "reviewer", Some("fixed CIK")).await.unwrap();
        assert_eq!(resolved.resolution, Resolution::ManualFix);
        assert_eq!(resolved.resolved_by.as_deref(), Some("reviewer"));
        assert_eq!(resolved.resolution_notes.as_deref(), Some("fixed CIK"));
        assert!(resolved.resolved_at.is_some());

        let again = dlq.mark_for_retry(item.id, "reviewer", None).await;
        assert!(matches!(again, Err(DeadLetterError::AlreadyResolved { .. })));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let dlq = DeadLetterQueue::in_memory();
        let result = dlq.mark_as_skipped(Uuid::now_v7(), "u1", None).await;
        assert!(matches!(result, Err(DeadLetterError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retried_item_failing_again_gets_new_entry() {
        let dlq = DeadLetterQueue::in_memory();
        let first = dlq.add(failure("p1", "u1", "boom")).await.unwrap();
        dlq.mark_for_retry(first.id, "u1", None).await.unwrap();
        assert!(dlq.pending_for_item("p1").await.unwrap().is_none());

        let second = dlq.add(failure("p1", "u1", "boom")).await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.failure_count, 1);
        assert_eq!(dlq.list(&DeadLetterFilter::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let dlq = DeadLetterQueue::in_memory();
        let long_reason = format!("required_step_failed: search: {}", "x".repeat(80));
        dlq.add(failure("p1", "u1", &long_reason)).await.unwrap();
        dlq.add(failure("p2", "u1", &format!("{long_reason} and more"))).await.unwrap();
        let resolved = dlq.add(failure("p3", "u1", "circuit_breaker_open: sec")).await.unwrap();
        dlq.add(failure("p4", "u2", "other")).await.unwrap();
        dlq.mark_as_skipped(resolved.id, "u1", None).await.unwrap();

        let stats = dlq.get_stats(Some("u1")).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.skipped, 1);
        assert!(stats.oldest_pending.is_some());
        assert_eq!(stats.top_failure_reasons[0].count, 2);
        assert_eq!(stats.top_failure_reasons[0].reason.chars().count(), REASON_PREFIX_LEN);

        assert_eq!(dlq.get_stats(None).await.unwrap().total, 4);
    }

    #[tokio::test]
    async fn test_stats_keeps_top_five() {
        let dlq = DeadLetterQueue::in_memory();
        for i in 0..8 {
            dlq.add(failure(&format!("p{i}"), "u1", &format!("reason {i}"))).await.unwrap();
        }
        let stats = dlq.get_stats(None).await.unwrap();
        assert_eq!(stats.top_failure_reasons.len(), TOP_REASONS);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_resolved() {
        let table = Arc::new(InMemoryDeadLetterTable::new());
        let dlq = DeadLetterQueue::new(table.clone());

        let mut old_resolved = failure("p1", "u1", "x").into_item(Utc::now() - chrono::Duration::days(40));
        old_resolved.resolution = Resolution::Skipped;
        old_resolved.resolved_at = Some(Utc::now() - chrono::Duration::days(35));
        table.insert(old_resolved).await.unwrap();
        table
            .insert(failure("p2", "u1", "x").into_item(Utc::now() - chrono::Duration::days(40)))
            .await
            .unwrap();
        let recent = dlq.add(failure("p3", "u1", "x")).await.unwrap();
        dlq.mark_as_skipped(recent.id, "u1", None).await.unwrap();

        assert_eq!(dlq.cleanup(30).await.unwrap(), 1);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_old_entry_resolved_recently() {
        let table = Arc::new(InMemoryDeadLetterTable::new());
        let dlq = DeadLetterQueue::new(table.clone());

        let mut item = failure("p1", "u1", "x").into_item(Utc::now() - chrono::Duration::days(90));
        item.resolution = Resolution::ManualFix;
        item.resolved_at = Some(Utc::now() - chrono::Duration::days(1));
        table.insert(item).await.unwrap();

        assert_eq!(dlq.cleanup(30).await.unwrap(), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(dlq.cleanup(0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_with_huge_retention_removes_nothing() {
        let dlq = DeadLetterQueue::in_memory();
        let entry = dlq.add(failure("p1", "u1", "x")).await.unwrap();
        dlq.mark_as_skipped(entry.id, "u1", None).await.unwrap();

        assert_eq!(dlq.cleanup(u32::MAX).await.unwrap(), 0);
        assert_eq!(dlq.list(&DeadLetterFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let dlq = DeadLetterQueue::new(Arc::new(BrokenTable));
        assert!(dlq.add(failure("p1", "u1", "x")).await.is_none());
    }
}
