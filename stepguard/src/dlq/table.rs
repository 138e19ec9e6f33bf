use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{DeadLetterFilter, DeadLetterItem, Resolution};
use crate::errors::StoreError;

/// Storage backend for dead letter entries.
#[async_trait]
pub trait DeadLetterTable: Send + Sync + std::fmt::Debug {
    /// Inserts a new entry.
    async fn insert(&self, item: DeadLetterItem) -> Result<(), StoreError>;

    /// Replaces an existing entry. Returns false if no entry has that id.
    async fn update(&self, item: DeadLetterItem) -> Result<bool, StoreError>;

    /// Fetches one entry.
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterItem>, StoreError>;

    /// Fetches the pending entry for an item, if any.
    async fn find_pending_by_item(&self, item_id: &str) -> Result<Option<DeadLetterItem>, StoreError>;

    /// Fetches entries matching `filter`, newest first.
    async fn select(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterItem>, StoreError>;

    /// Deletes entries resolved before `cutoff` and returns how many were removed.
    async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Dead letter table held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterTable {
    entries: Arc<Mutex<HashMap<Uuid, DeadLetterItem>>>,
}

impl InMemoryDeadLetterTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterTable for InMemoryDeadLetterTable {
    async fn insert(&self, item: DeadLetterItem) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&item.id) {
            return Err(StoreError::Backend(format!("duplicate dead letter id {}", item.id)));
        }
        entries.insert(item.id, item);
        Ok(())
    }

    async fn update(&self, item: DeadLetterItem) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&item.id) {
            Some(existing) => {
                *existing = item;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterItem>, StoreError> {
        Ok(self.entries.lock().get(&id).cloned())
    }

    async fn find_pending_by_item(&self, item_id: &str) -> Result<Option<DeadLetterItem>, StoreError> {
        Ok(self
            .entries
            .lock()
            .values()
            .find(|item| item.item_id == item_id && item.resolution == Resolution::Pending)
            .cloned())
    }

    async fn select(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterItem>, StoreError> {
        let mut items: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, item| {
            item.resolution == Resolution::Pending || item.resolved_at.unwrap_or(item.created_at) >= cutoff
        });
        Ok(before - entries.len())
    }
}
