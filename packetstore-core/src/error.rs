/*!
Error types for the packetstore core.
*/

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the packetstore core.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Coarse classification of a [`StoreError`], for callers that branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigurationMissing,
    Connectivity,
    QueryTimeout,
    Transaction,
    Database,
    Serialization,
    Write,
    Io,
    Json,
    Validation,
}

/// Errors that can occur in storage backends and the backup scheduler.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No resolvable address or path for the selected backend
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Connection retry schedule exhausted
    #[error("Backend unavailable: could not connect to {target} after {attempts} attempts")]
    Connectivity {
        target: String,
        attempts: usize,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation deadline exceeded
    #[error("Query timeout: {operation} exceeded {timeout:?}")]
    QueryTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Statement failure inside a write transaction; the transaction was rolled back
    #[cfg(feature = "relational")]
    #[error("Transaction failed and was rolled back: {source}")]
    Transaction {
        #[source]
        source: sqlx::Error,
    },

    /// Driver errors outside a write transaction
    #[cfg(feature = "relational")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Snapshot encoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Failure writing the backing document or a snapshot file
    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl StoreError {
    /// Create a new configuration-missing error
    pub fn configuration_missing<S: Into<String>>(msg: S) -> Self {
        Self::ConfigurationMissing(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new write error for `path`
    pub fn write<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// Wrap a driver error raised inside a write transaction
    #[cfg(feature = "relational")]
    pub fn transaction(source: sqlx::Error) -> Self {
        Self::Transaction { source }
    }

    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            StoreError::Connectivity { .. } => ErrorKind::Connectivity,
            StoreError::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            #[cfg(feature = "relational")]
            StoreError::Transaction { .. } => ErrorKind::Transaction,
            #[cfg(feature = "relational")]
            StoreError::Database(_) => ErrorKind::Database,
            StoreError::Serialization(_) => ErrorKind::Serialization,
            StoreError::Write { .. } => ErrorKind::Write,
            StoreError::Io(_) => ErrorKind::Io,
            StoreError::Json(_) => ErrorKind::Json,
            StoreError::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Whether the caller may reasonably retry the operation.
    ///
    /// Nothing in this crate retries on its own above connection establishment.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::QueryTimeout | ErrorKind::Connectivity
        )
    }
}
