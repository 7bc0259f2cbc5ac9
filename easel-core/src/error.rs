//! Unified error taxonomy for the job lifecycle subsystem.
//!
//! Every fallible core operation returns `Result<T, CoreError>`.  The HTTP
//! layer maps [`ErrorKind`] to a status code and a uniform JSON body; the
//! core itself knows nothing about HTTP.

use thiserror::Error;

use crate::client::BackendError;
use crate::job::JobStatus;

/// Stable machine-readable error kinds shared between the core and the
/// HTTP surface.  The string form (`as_str`) is what goes over the wire
/// and into persisted job error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingRequiredField,
    InvalidFieldValue,
    Unauthorized,
    RateLimited,
    BackendNotFound,
    JobNotFound,
    CatalogEntryNotFound,
    InvalidTransition,
    StorageError,
    BackendTransport,
    BackendRejected,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingRequiredField => "missing_required_field",
            ErrorKind::InvalidFieldValue => "invalid_field_value",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BackendNotFound => "backend_not_found",
            ErrorKind::JobNotFound => "job_not_found",
            ErrorKind::CatalogEntryNotFound => "catalog_entry_not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::BackendTransport => "backend_transport",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors produced by the core components.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The caller referenced a job that does not exist.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// A queue operation's status precondition did not hold.  The store
    /// guarantees nothing was mutated.
    #[error("invalid transition: job {job_id} is {from}, cannot {action}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        action: &'static str,
    },

    /// The caller referenced an unregistered backend alias.
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// The caller referenced a catalog entry that does not exist.
    #[error("catalog entry not found: {0}")]
    CatalogEntryNotFound(String),

    /// A required submission field was absent.
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),

    /// A submission field was present but malformed.
    #[error("invalid field value: {0}")]
    InvalidFieldValue(String),

    /// Credential verification failed.
    #[error("unauthorized")]
    Unauthorized,

    /// Propagated from the SQLite store.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A filesystem operation failed (image writes, catalog scan, backups).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Propagated from the backend client.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The stable taxonomy kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::JobNotFound(_) => ErrorKind::JobNotFound,
            CoreError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            CoreError::BackendNotFound(_) => ErrorKind::BackendNotFound,
            CoreError::CatalogEntryNotFound(_) => ErrorKind::CatalogEntryNotFound,
            CoreError::MissingRequiredField(_) => ErrorKind::MissingRequiredField,
            CoreError::InvalidFieldValue(_) => ErrorKind::InvalidFieldValue,
            CoreError::Unauthorized => ErrorKind::Unauthorized,
            CoreError::Storage(_) => ErrorKind::StorageError,
            CoreError::Io(_) => ErrorKind::Internal,
            CoreError::Backend(e) => match e {
                BackendError::Transport(_) | BackendError::Busy(_) => ErrorKind::BackendTransport,
                BackendError::BadRequest(_) | BackendError::Remote(_) => {
                    ErrorKind::BackendRejected
                }
            },
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }
}
