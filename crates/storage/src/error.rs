/// All errors that can be returned by an `EntityStore` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another writer saved a newer
    /// version after the caller last read the entity.
    #[error(
        "outdated version of {model}/{id}: expected {expected_version}, current is {current_version}"
    )]
    OutdatedVersion {
        model: String,
        id: String,
        expected_version: i64,
        current_version: i64,
    },

    /// The current record of the entity is soft-deleted.
    #[error("cannot update deleted {model}/{id} (deleted at {time_deleted})")]
    CannotUpdateDeleted {
        model: String,
        id: String,
        time_deleted: i64,
    },

    /// Another live entity of the same model already holds this key
    /// (an id on creation, or a unique field such as a name).
    #[error("unique constraint violation on {model}: {key}")]
    UniqueConstraintViolation { model: String, key: String },

    /// No record with the given (model, id).
    #[error("entity not found: {model}/{id}")]
    EntityNotFound { model: String, id: String },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
