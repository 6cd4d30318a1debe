//! Error types for rapidstore.

use thiserror::Error;

/// Common error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Invalid input: unreadable source path, bad status value, bad blob name.
    #[error("validation error: {0}")]
    Validation(String),

    /// Metadata backend read or write failure.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Filesystem failure while writing, copying, renaming or stating a blob.
    #[error("blob I/O error: {0}")]
    BlobIo(String),

    /// Metadata could not be reconciled with the blob after a write.
    #[error("inconsistency: {0}")]
    Inconsistency(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error outside the blob tree (config files, log files, database directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Persistence(e.to_string())
    }
}

impl StorageError {
    /// Whether this error means "the thing is not there" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = StorageError::Validation("invalid status value 7".to_string());
        assert_eq!(err.to_string(), "validation error: invalid status value 7");
    }

    #[test]
    fn test_persistence_error_display() {
        let err = StorageError::Persistence("disk full".to_string());
        assert_eq!(err.to_string(), "persistence error: disk full");
    }

    #[test]
    fn test_blob_io_error_display() {
        let err = StorageError::BlobIo("rename failed".to_string());
        assert_eq!(err.to_string(), "blob I/O error: rename failed");
    }

    #[test]
    fn test_not_found_error_display() {
        let err = StorageError::NotFound("file record 42".to_string());
        assert_eq!(err.to_string(), "file record 42 not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config.toml");
        let err: StorageError = io_err.into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.to_string().contains("config.toml"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::Persistence(_)));
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i64> {
            Ok(42)
        }

        fn sample_err() -> Result<i64> {
            Err(StorageError::Inconsistency("size mismatch".to_string()))
        }

        assert_eq!(sample_ok().unwrap(), 42);
        assert!(sample_err().is_err());
    }
}
