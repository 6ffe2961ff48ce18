//! Error types for the reliability layer

use std::time::Duration;

use thiserror::Error;

use crate::services::framework::ServiceError;

/// Main error type for the reliability layer
#[derive(Error, Debug)]
pub enum Error {
    /// A probe, gate admission or external call exceeded its bound
    #[error("Timeout: {operation} exceeded {after:?}")]
    Timeout {
        /// What timed out
        operation: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// The circuit breaker rejected the call without invoking it
    #[error("Circuit breaker '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen {
        /// Breaker key
        name: String,
        /// Time until the breaker will let a probe through
        retry_after: Duration,
    },

    /// The (identity, resource) pair is currently blocked
    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited {
        /// Remaining block time, rounded up to whole seconds
        retry_after_secs: u64,
    },

    /// Missing or invalid credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Connection to an external dependency failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Background service error
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

impl Error {
    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Whether this error was produced locally without touching the dependency
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. } | Error::RateLimited { .. })
    }
}

/// Storage errors raised by the database, object store and filesystem collaborators
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Relational database failure
    #[error("Database error: {0}")]
    Database(String),

    /// Object store failure
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Requested collection or object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Data read back does not match what was written
    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::timeout("database probe", Duration::from_secs(5));
        assert_eq!(err.to_string(), "Timeout: database probe exceeded 5s");

        let err = Error::RateLimited {
            retry_after_secs: 42,
        };
        assert_eq!(err.to_string(), "Rate limit exceeded, retry in 42s");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: Error = StorageError::ObjectStore("connection reset".to_string()).into();
        assert!(matches!(err, Error::Storage(StorageError::ObjectStore(_))));
        assert!(!err.is_rejection());

        let open = Error::CircuitOpen {
            name: "upload".to_string(),
            retry_after: Duration::from_secs(3),
        };
        assert!(open.is_rejection());
    }
}
