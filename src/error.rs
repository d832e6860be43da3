//! Error types for the disk cache
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the disk cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem failure while reading or writing cache data
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Gzip encoding or decoding failed (malformed or truncated payload)
    #[error("Compression error: {0}")]
    Compression(std::io::Error),

    /// Index or structured value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shard index query or transaction failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Shard lock was not acquired in time
    #[error("Timed out after {0:?} waiting for shard lock")]
    Timeout(Duration),

    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),
}

impl CacheError {
    /// Returns true when the error is a missing file on disk.
    ///
    /// Payload files can disappear between an index lookup and the read
    /// when another handle evicts the entry; callers treat that as a miss.
    pub fn is_missing_file(&self) -> bool {
        matches!(self, CacheError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Turns a busy or locked database into `Timeout`.
    ///
    /// SQLite reports these once its busy handler has waited `timeout` for
    /// another connection to release the shard.
    pub fn or_timeout(self, timeout: Duration) -> Self {
        match &self {
            CacheError::Database(e)
                if matches!(
                    e.sqlite_error_code(),
                    Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                ) =>
            {
                CacheError::Timeout(timeout)
            }
            _ => self,
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for the disk cache.
pub type Result<T> = std::result::Result<T, CacheError>;
