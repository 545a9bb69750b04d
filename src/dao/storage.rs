use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or rejected the operation.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// Human-readable summary.
        message: String,
        /// Backend error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// A unique key (e.g. one player per session and user) already exists.
    #[error("duplicate key `{key}` in `{collection}`")]
    DuplicateKey {
        /// Collection holding the key.
        collection: &'static str,
        /// Conflicting key.
        key: String,
    },
    /// A change stream fell behind and dropped notifications.
    #[error("change stream lagged behind by {skipped} event(s)")]
    Lagged {
        /// Notifications lost.
        skipped: u64,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Whether the failure means the backend could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }
}
