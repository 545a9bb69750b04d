use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use thiserror::Error;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Server error code reported when a unique index rejects a write.
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Failures of the MongoDB backend, mapped to [`crate::dao::storage::StorageError`] at the trait boundary.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// The connection string could not be parsed.
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        /// Offending URI.
        uri: String,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// A required environment variable is unset.
    #[error("missing environment variable `{var}`")]
    MissingEnvVar {
        /// Variable name.
        var: &'static str,
    },
    /// The client could not be built from the parsed options.
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// No ping succeeded while connecting.
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        /// Pings tried.
        attempts: u32,
        /// Last driver error.
        #[source]
        source: MongoError,
    },
    /// A health check ping failed.
    #[error("MongoDB ping health check failed")]
    HealthPing {
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Index creation at startup failed.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        /// Indexed collection.
        collection: &'static str,
        /// Index name.
        index: &'static str,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// A unique index rejected the write.
    #[error("duplicate key `{key}` in collection `{collection}`")]
    DuplicateKey {
        /// Collection holding the key.
        collection: &'static str,
        /// Conflicting key.
        key: String,
    },
    /// A read or write failed.
    #[error("failed to {operation} in collection `{collection}`")]
    Query {
        /// What was attempted.
        operation: &'static str,
        /// Target collection.
        collection: &'static str,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Opening or polling a change stream failed.
    #[error("change stream on collection `{collection}` failed")]
    ChangeStream {
        /// Watched collection.
        collection: &'static str,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// A stored identifier is not a UUID.
    #[error("document `{id}` in collection `{collection}` holds an invalid identifier")]
    CorruptDocument {
        /// Collection of the document.
        collection: &'static str,
        /// Raw identifier.
        id: String,
        /// Parse error.
        #[source]
        source: uuid::Error,
    },
}

/// Whether `err` is a unique index violation.
pub fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE
    )
}
