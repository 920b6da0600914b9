//! Typed access to versioned entities.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_storage::{
    EntityStore, NewRecord, Page, Pagination, RecordFilter, RecordUpdate, VersionedRecord,
};

use crate::error::DomainError;

/// A domain payload stored as the `data` of a versioned entity.
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Entity type name; also the storage collection name.
    const MODEL_NAME: &'static str;

    /// Value that must be unique among live entities of this model.
    fn unique_key(&self) -> Option<String> {
        None
    }
}

/// Fresh random entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One version of an entity together with its payload.
///
/// Serializes to the API envelope: `{id, model, version, time_created,
/// time_updated, time_deleted, initiator_id, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<M> {
    pub id: String,
    pub model: String,
    pub version: i64,
    pub time_created: i64,
    pub time_updated: i64,
    pub time_deleted: i64,
    pub initiator_id: Option<String>,
    pub data: M,
}

impl<M: Model> Versioned<M> {
    pub fn from_record(record: VersionedRecord) -> Result<Self, DomainError> {
        let data = serde_json::from_value(record.data).map_err(|e| DomainError::Corrupted {
            model: record.model.clone(),
            id: record.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id: record.id,
            model: record.model,
            version: record.version,
            time_created: record.time_created,
            time_updated: record.time_updated,
            time_deleted: record.time_deleted,
            initiator_id: record.initiator_id,
            data,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.time_deleted != 0
    }

    fn data_value(&self) -> Result<serde_json::Value, DomainError> {
        serde_json::to_value(&self.data).map_err(|e| DomainError::Corrupted {
            model: M::MODEL_NAME.to_string(),
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }
}

/// Typed view of one model's collection in an [`EntityStore`].
pub struct Repository<M> {
    store: Arc<dyn EntityStore>,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for Repository<M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> Repository<M> {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            _model: PhantomData,
        }
    }

    /// Persist version 1 under `id`.
    pub async fn create(
        &self,
        id: String,
        data: M,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<M>, DomainError> {
        let value = serde_json::to_value(&data).map_err(|e| DomainError::Corrupted {
            model: M::MODEL_NAME.to_string(),
            id: id.clone(),
            reason: e.to_string(),
        })?;
        let record = self
            .store
            .create(NewRecord {
                model: M::MODEL_NAME.to_string(),
                id,
                initiator_id: initiator_id.map(str::to_string),
                unique_key: data.unique_key(),
                data: value,
            })
            .await?;
        Versioned::from_record(record)
    }

    /// Persist `entity.data` as the next version, provided `entity.version`
    /// is still the stored one.
    pub async fn save(
        &self,
        entity: &Versioned<M>,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<M>, DomainError> {
        let record = self
            .store
            .save(RecordUpdate {
                model: M::MODEL_NAME.to_string(),
                id: entity.id.clone(),
                expected_version: entity.version,
                initiator_id: initiator_id.map(str::to_string),
                unique_key: entity.data.unique_key(),
                data: entity.data_value()?,
            })
            .await?;
        Versioned::from_record(record)
    }

    /// Soft-delete; fails if the entity is already deleted.
    pub async fn delete(
        &self,
        entity: &Versioned<M>,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<M>, DomainError> {
        let record = self
            .store
            .delete(M::MODEL_NAME, &entity.id, entity.version, initiator_id)
            .await?;
        Versioned::from_record(record)
    }

    /// Latest version, deleted or not.
    pub async fn find(&self, id: &str) -> Result<Option<Versioned<M>>, DomainError> {
        self.store
            .find(M::MODEL_NAME, id)
            .await?
            .map(Versioned::from_record)
            .transpose()
    }

    /// Latest version, or `NotFound`.
    pub async fn get(&self, id: &str) -> Result<Versioned<M>, DomainError> {
        self.find(id).await?.ok_or_else(|| DomainError::NotFound {
            model: M::MODEL_NAME.to_string(),
            id: id.to_string(),
        })
    }

    /// Latest version if the entity exists and is not deleted.
    pub async fn find_live(&self, id: &str) -> Result<Option<Versioned<M>>, DomainError> {
        Ok(self.find(id).await?.filter(|e| !e.is_deleted()))
    }

    pub async fn find_version(
        &self,
        id: &str,
        version: i64,
    ) -> Result<Option<Versioned<M>>, DomainError> {
        self.store
            .find_version(M::MODEL_NAME, id, version)
            .await?
            .map(Versioned::from_record)
            .transpose()
    }

    pub async fn list(&self, pagination: Pagination) -> Result<Page<Versioned<M>>, DomainError> {
        self.store
            .list(M::MODEL_NAME, None, pagination)
            .await?
            .try_map(Versioned::from_record)
    }

    pub async fn list_where(
        &self,
        filter: &RecordFilter,
        pagination: Pagination,
    ) -> Result<Page<Versioned<M>>, DomainError> {
        self.store
            .list(M::MODEL_NAME, Some(filter), pagination)
            .await?
            .try_map(Versioned::from_record)
    }

    pub async fn list_versions(
        &self,
        id: &str,
        pagination: Pagination,
    ) -> Result<Page<Versioned<M>>, DomainError> {
        self.store
            .list_versions(M::MODEL_NAME, id, pagination)
            .await?
            .try_map(Versioned::from_record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cluster;
    use strata_storage::MemoryStore;

    fn clusters() -> Repository<Cluster> {
        Repository::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn typed_round_trip_through_store() {
        let repo = clusters();
        let created = repo
            .create("c1".into(), Cluster::new("ceph"), Some("admin"))
            .await
            .unwrap();
        assert_eq!(created.model, "cluster");
        assert_eq!(created.version, 1);
        assert_eq!(created.data.name, "ceph");

        let mut renamed = created.clone();
        renamed.data.name = "ceph-prod".into();
        let saved = repo.save(&renamed, Some("admin")).await.unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(repo.get("c1").await.unwrap(), saved);
        assert_eq!(repo.find_version("c1", 1).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn lost_update_is_rejected() {
        let repo = clusters();
        let v1 = repo
            .create("c1".into(), Cluster::new("ceph"), None)
            .await
            .unwrap();

        let mut first = v1.clone();
        first.data.name = "first".into();
        repo.save(&first, Some("alice")).await.unwrap();

        let mut second = v1;
        second.data.name = "second".into();
        let err = repo.save(&second, Some("bob")).await.unwrap_err();
        assert_eq!(err.kind(), "OutdatedVersionError");
        assert_eq!(repo.get("c1").await.unwrap().data.name, "first");
    }

    #[tokio::test]
    async fn delete_then_mutate_is_rejected() {
        let repo = clusters();
        let v1 = repo
            .create("c1".into(), Cluster::new("ceph"), None)
            .await
            .unwrap();
        let deleted = repo.delete(&v1, None).await.unwrap();
        assert!(deleted.is_deleted());

        let err = repo.delete(&deleted, None).await.unwrap_err();
        assert_eq!(err.kind(), "CannotUpdateDeletedModel");
        let err = repo.save(&v1, None).await.unwrap_err();
        assert_eq!(err.kind(), "CannotUpdateDeletedModel");

        assert!(repo.find_live("c1").await.unwrap().is_none());
        assert_eq!(repo.list_versions("c1", Pagination::default()).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn unique_name_enforced() {
        let repo = clusters();
        repo.create("c1".into(), Cluster::new("ceph"), None)
            .await
            .unwrap();
        let err = repo
            .create("c2".into(), Cluster::new("ceph"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UniqueConstraintViolationError");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let err = clusters().get("nope").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}
