//! In-process backend holding every version in memory.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::record::{NewRecord, Page, Pagination, RecordFilter, RecordUpdate, VersionedRecord};
use crate::traits::EntityStore;

/// All versions of one model.
#[derive(Default)]
struct Collection {
    /// Entity ids in first-creation order.
    order: Vec<String>,
    /// Version history per id, oldest first. Never empty once inserted.
    history: HashMap<String, Vec<VersionedRecord>>,
}

impl Collection {
    fn current(&self, id: &str) -> Option<&VersionedRecord> {
        self.history.get(id).and_then(|versions| versions.last())
    }

    fn key_taken(&self, key: &str, except_id: &str) -> bool {
        self.history.iter().any(|(id, versions)| {
            id != except_id
                && versions
                    .last()
                    .is_some_and(|r| !r.is_deleted() && r.unique_key.as_deref() == Some(key))
        })
    }

    /// Checks shared by save and delete; returns the record to build on.
    fn writable(
        &self,
        model: &str,
        id: &str,
        expected_version: i64,
    ) -> Result<&VersionedRecord, StorageError> {
        let current = self
            .current(id)
            .ok_or_else(|| StorageError::EntityNotFound {
                model: model.to_string(),
                id: id.to_string(),
            })?;
        if current.is_deleted() {
            return Err(StorageError::CannotUpdateDeleted {
                model: model.to_string(),
                id: id.to_string(),
                time_deleted: current.time_deleted,
            });
        }
        if current.version != expected_version {
            return Err(StorageError::OutdatedVersion {
                model: model.to_string(),
                id: id.to_string(),
                expected_version,
                current_version: current.version,
            });
        }
        Ok(current)
    }

    fn append(&mut self, record: VersionedRecord) -> VersionedRecord {
        if !self.history.contains_key(&record.id) {
            self.order.push(record.id.clone());
        }
        self.history
            .entry(record.id.clone())
            .or_default()
            .push(record.clone());
        record
    }
}

/// `EntityStore` kept in process memory behind a single write lock, so every
/// compare-and-swap is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn create(&self, record: NewRecord) -> Result<VersionedRecord, StorageError> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(record.model.clone()).or_default();

        if collection.history.contains_key(&record.id) {
            return Err(StorageError::UniqueConstraintViolation {
                model: record.model,
                key: record.id,
            });
        }
        if let Some(key) = &record.unique_key {
            if collection.key_taken(key, &record.id) {
                return Err(StorageError::UniqueConstraintViolation {
                    model: record.model,
                    key: key.clone(),
                });
            }
        }

        let now = crate::unix_now();
        Ok(collection.append(VersionedRecord {
            model: record.model,
            id: record.id,
            version: 1,
            time_created: now,
            time_updated: now,
            time_deleted: 0,
            initiator_id: record.initiator_id,
            unique_key: record.unique_key,
            data: record.data,
        }))
    }

    async fn save(&self, update: RecordUpdate) -> Result<VersionedRecord, StorageError> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(&update.model)
            .ok_or_else(|| StorageError::EntityNotFound {
                model: update.model.clone(),
                id: update.id.clone(),
            })?;

        let current = collection.writable(&update.model, &update.id, update.expected_version)?;
        let time_created = current.time_created;
        let version = current.version + 1;

        if let Some(key) = &update.unique_key {
            if collection.key_taken(key, &update.id) {
                return Err(StorageError::UniqueConstraintViolation {
                    model: update.model,
                    key: key.clone(),
                });
            }
        }

        Ok(collection.append(VersionedRecord {
            model: update.model,
            id: update.id,
            version,
            time_created,
            time_updated: crate::unix_now(),
            time_deleted: 0,
            initiator_id: update.initiator_id,
            unique_key: update.unique_key,
            data: update.data,
        }))
    }

    async fn delete(
        &self,
        model: &str,
        id: &str,
        expected_version: i64,
        initiator_id: Option<&str>,
    ) -> Result<VersionedRecord, StorageError> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(model)
            .ok_or_else(|| StorageError::EntityNotFound {
                model: model.to_string(),
                id: id.to_string(),
            })?;

        let current = collection.writable(model, id, expected_version)?;
        let now = crate::unix_now();
        let deleted = VersionedRecord {
            version: current.version + 1,
            time_updated: now,
            // A zero clock would read as "not deleted".
            time_deleted: now.max(1),
            initiator_id: initiator_id.map(str::to_string),
            ..current.clone()
        };
        Ok(collection.append(deleted))
    }

    async fn find(&self, model: &str, id: &str) -> Result<Option<VersionedRecord>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(model)
            .and_then(|c| c.current(id))
            .cloned())
    }

    async fn find_version(
        &self,
        model: &str,
        id: &str,
        version: i64,
    ) -> Result<Option<VersionedRecord>, StorageError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(model)
            .and_then(|c| c.history.get(id))
            .and_then(|versions| versions.iter().find(|r| r.version == version))
            .cloned())
    }

    async fn list(
        &self,
        model: &str,
        filter: Option<&RecordFilter>,
        pagination: Pagination,
    ) -> Result<Page<VersionedRecord>, StorageError> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(model) else {
            return Ok(pagination.apply(Vec::new()));
        };

        let live: Vec<VersionedRecord> = collection
            .order
            .iter()
            .filter_map(|id| collection.current(id))
            .filter(|r| !r.is_deleted())
            .filter(|r| filter.is_none_or(|f| f.matches(r)))
            .cloned()
            .collect();
        Ok(pagination.apply(live))
    }

    async fn list_versions(
        &self,
        model: &str,
        id: &str,
        pagination: Pagination,
    ) -> Result<Page<VersionedRecord>, StorageError> {
        let collections = self.collections.read().await;
        let versions: Vec<VersionedRecord> = collections
            .get(model)
            .and_then(|c| c.history.get(id))
            .map(|versions| versions.iter().rev().cloned().collect())
            .unwrap_or_default();
        Ok(pagination.apply(versions))
    }
}
