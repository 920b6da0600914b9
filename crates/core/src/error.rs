use strata_storage::StorageError;

use crate::topology::TopologyError;

/// Every failure the core can report.
///
/// Each variant maps to a stable kind tag (see [`DomainError::kind`]) that
/// the HTTP layer forwards to clients unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("cannot update deleted {model} {id}")]
    CannotUpdateDeletedModel { model: String, id: String },

    #[error(
        "{model} {id} was modified concurrently: expected version {expected_version}, current is {current_version}"
    )]
    OutdatedVersion {
        model: String,
        id: String,
        expected_version: i64,
        current_version: i64,
    },

    #[error("{model} '{key}' already exists")]
    UniqueConstraintViolation { model: String, key: String },

    #[error("{model} {id} not found")]
    NotFound { model: String, id: String },

    #[error("unknown cluster {0}")]
    UnknownCluster(String),

    #[error("unknown playbook {0}")]
    UnknownPlaybook(String),

    #[error("unknown servers: {}", .0.join(", "))]
    UnknownServers(Vec<String>),

    #[error("playbook {0} requires a non-empty server list")]
    ServerListIsRequiredForPlaybook(String),

    #[error("servers violate policy {policy}: {}", .servers.join(", "))]
    PolicyViolation { policy: String, servers: Vec<String> },

    #[error("playbook {playbook_id} declares no hint {hint}")]
    UnknownHint { playbook_id: String, hint: String },

    #[error("hint {hint} expects a {expected} value")]
    HintValue { hint: String, expected: String },

    #[error("field {0} cannot be changed after creation")]
    CannotUpdateImmutableField(String),

    #[error("cluster {0} still has servers")]
    CannotDeleteClusterWithServers(String),

    #[error("execution {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("unknown permission {resource}:{action}")]
    UnknownPermission { resource: String, action: String },

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("not authorized for {resource}:{action}")]
    AuthorizationDenied { resource: String, action: String },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Stored data no longer matches its model. An invariant violation.
    #[error("corrupted {model} {id}: {reason}")]
    Corrupted {
        model: String,
        id: String,
        reason: String,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl DomainError {
    /// Stable tag surfaced in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::CannotUpdateDeletedModel { .. } => "CannotUpdateDeletedModel",
            DomainError::OutdatedVersion { .. } => "OutdatedVersionError",
            DomainError::UniqueConstraintViolation { .. } => "UniqueConstraintViolationError",
            DomainError::NotFound { .. } => "NotFound",
            DomainError::UnknownCluster(_) => "UnknownClusterError",
            DomainError::UnknownPlaybook(_) => "UnknownPlaybookError",
            DomainError::UnknownServers(_) => "UnknownServersError",
            DomainError::ServerListIsRequiredForPlaybook(_) => {
                "ServerListIsRequiredForPlaybookError"
            }
            DomainError::PolicyViolation { .. } => "PolicyViolationError",
            DomainError::UnknownHint { .. } => "UnknownHintError",
            DomainError::HintValue { .. } => "HintValueError",
            DomainError::CannotUpdateImmutableField(_) => "CannotUpdateImmutableField",
            DomainError::CannotDeleteClusterWithServers(_) => "CannotDeleteClusterWithServers",
            DomainError::InvalidTransition { .. } => "InvalidTransitionError",
            DomainError::UnknownPermission { .. } => "UnknownPermissionError",
            DomainError::AuthenticationRequired => "AuthenticationRequired",
            DomainError::AuthorizationDenied { .. } => "AuthorizationDenied",
            DomainError::Topology(_) => "TopologyResolutionError",
            DomainError::Corrupted { .. } => "InternalServerError",
            DomainError::Backend(_) => "InternalServerError",
        }
    }

    /// True for failures that indicate a broken invariant rather than a bad
    /// request.
    pub fn is_internal(&self) -> bool {
        matches!(self, DomainError::Corrupted { .. } | DomainError::Backend(_))
    }
}

impl From<StorageError> for DomainError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::OutdatedVersion {
                model,
                id,
                expected_version,
                current_version,
            } => DomainError::OutdatedVersion {
                model,
                id,
                expected_version,
                current_version,
            },
            StorageError::CannotUpdateDeleted { model, id, .. } => {
                DomainError::CannotUpdateDeletedModel { model, id }
            }
            StorageError::UniqueConstraintViolation { model, key } => {
                DomainError::UniqueConstraintViolation { model, key }
            }
            StorageError::EntityNotFound { model, id } => DomainError::NotFound { model, id },
            StorageError::Backend(msg) => DomainError::Backend(msg),
        }
    }
}
