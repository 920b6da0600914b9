use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{NewRecord, Page, Pagination, RecordFilter, RecordUpdate, VersionedRecord};

/// The storage trait behind every versioned resource.
///
/// Records are grouped by `model` (the entity type name) and identified by
/// `id` inside that group. History is append-only: every successful write
/// produces a new record at `version + 1` and keeps all earlier ones.
///
/// ## OCC Conflict Detection
///
/// `save` and `delete` carry the version the caller last read. The write
/// succeeds only if that is still the latest stored version; otherwise the
/// method returns `Err(StorageError::OutdatedVersion { .. })`. The check and
/// the append must be a single atomic step per `(model, id)`.
///
/// ## Soft Deletion
///
/// `delete` appends a version with a non-zero `time_deleted`. From then on
/// both `save` and `delete` fail with `StorageError::CannotUpdateDeleted`,
/// regardless of the version presented.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Persist version 1 of a new entity.
    ///
    /// Returns `Err(StorageError::UniqueConstraintViolation)` if the id is
    /// already taken or a live entity holds the same `unique_key`.
    async fn create(&self, record: NewRecord) -> Result<VersionedRecord, StorageError>;

    /// Append a new version if `expected_version` is still current.
    async fn save(&self, update: RecordUpdate) -> Result<VersionedRecord, StorageError>;

    /// Append a soft-deleted version if `expected_version` is still current.
    async fn delete(
        &self,
        model: &str,
        id: &str,
        expected_version: i64,
        initiator_id: Option<&str>,
    ) -> Result<VersionedRecord, StorageError>;

    /// The latest record of an entity, deleted or not.
    async fn find(&self, model: &str, id: &str) -> Result<Option<VersionedRecord>, StorageError>;

    /// An exact historical snapshot.
    async fn find_version(
        &self,
        model: &str,
        id: &str,
        version: i64,
    ) -> Result<Option<VersionedRecord>, StorageError>;

    /// Live (not deleted) entities of a model in insertion order.
    async fn list(
        &self,
        model: &str,
        filter: Option<&RecordFilter>,
        pagination: Pagination,
    ) -> Result<Page<VersionedRecord>, StorageError>;

    /// Full history of one entity, newest version first.
    async fn list_versions(
        &self,
        model: &str,
        id: &str,
        pagination: Pagination,
    ) -> Result<Page<VersionedRecord>, StorageError>;
}
