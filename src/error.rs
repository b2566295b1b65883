// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the backup core.
//!
//! Errors are categorized by the collaborator that produced them (primary
//! store, secondary store, metadata store) and carry the operation name to
//! help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `PrimaryStore` | Yes | Reading the source object failed |
//! | `SecondaryStore` | Yes | Writing/deleting a replicated blob failed |
//! | `MetadataStore` | Yes | Copy record read/write failed |
//! | `Timeout` | Yes | A single store call exceeded its deadline |
//! | `CircuitOpen` | Yes | Store circuit breaker is failing fast |
//! | `Database` | No | Local SQLite setup errors (needs operator attention) |
//! | `ObjectStore` | No | Object store could not be constructed |
//! | `Config` | No | Configuration invalid |
//! | `InvalidEvent` | No | Malformed lifecycle event |
//! | `LifecycleTimeout` | No | Lifecycle loop hit its wall-clock ceiling |
//! | `InvalidState` | No | Service state machine violation |
//! | `Shutdown` | No | Service is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The core never retries collaborator calls itself. Use
//! [`BackupError::is_retryable()`] in the invoking layer to decide whether
//! an event should be redelivered or a cleaner pass rescheduled. Every
//! operation in this crate is safe to re-invoke.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Error returned by a collaborator store (blob or metadata).
///
/// Kept deliberately small so that store implementations outside this
/// crate can produce it without depending on [`BackupError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<object_store::Error> for StoreError {
    fn from(e: object_store::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self(e.to_string())
    }
}

/// Errors that can occur while replicating or reclaiming copies.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Reading the source object from the primary store failed.
    #[error("Primary store error ({operation}): {message}")]
    PrimaryStore { operation: String, message: String },

    /// Writing or deleting a blob in the secondary store failed.
    #[error("Secondary store error ({operation}): {message}")]
    SecondaryStore { operation: String, message: String },

    /// A copy record operation failed.
    #[error("Metadata store error ({operation}): {message}")]
    MetadataStore { operation: String, message: String },

    /// A single store call did not complete within its timeout.
    #[error("Timed out after {timeout:?} ({operation})")]
    Timeout { operation: String, timeout: Duration },

    /// The circuit breaker in front of a store rejected the call.
    #[error("Circuit open ({circuit}), request rejected")]
    CircuitOpen { circuit: String },

    /// SQLite error while opening or migrating the metadata database.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Object store construction failure.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lifecycle event could not be decoded or is missing fields.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The lifecycle loop exceeded its wall-clock ceiling.
    ///
    /// Surfaced as an incomplete run; the invoking layer decides whether
    /// to trigger another drain.
    #[error("Lifecycle loop timed out after {elapsed:?} ({passes} passes, {reclaimed} reclaimed)")]
    LifecycleTimeout {
        passes: u32,
        reclaimed: usize,
        elapsed: Duration,
    },

    /// Service state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    pub fn primary(operation: impl Into<String>, source: StoreError) -> Self {
        Self::PrimaryStore {
            operation: operation.into(),
            message: source.0,
        }
    }

    pub fn secondary(operation: impl Into<String>, source: StoreError) -> Self {
        Self::SecondaryStore {
            operation: operation.into(),
            message: source.0,
        }
    }

    pub fn metadata(operation: impl Into<String>, source: StoreError) -> Self {
        Self::MetadataStore {
            operation: operation.into(),
            message: source.0,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PrimaryStore { .. } => true,
            Self::SecondaryStore { .. } => true,
            Self::MetadataStore { .. } => true,
            Self::Timeout { .. } => true,
            Self::CircuitOpen { .. } => true,
            Self::Database(_) => false,
            Self::ObjectStore(_) => false,
            Self::Config(_) => false,
            Self::InvalidEvent(_) => false,
            Self::LifecycleTimeout { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PrimaryStore { .. } => "primary_store",
            Self::SecondaryStore { .. } => "secondary_store",
            Self::MetadataStore { .. } => "metadata_store",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Database(_) => "database",
            Self::ObjectStore(_) => "object_store",
            Self::Config(_) => "config",
            Self::InvalidEvent(_) => "invalid_event",
            Self::LifecycleTimeout { .. } => "lifecycle_timeout",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retryable() {
        let err = BackupError::secondary("put", StoreError::new("connection reset"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("put"));
        assert!(err.to_string().contains("connection reset"));

        let err = BackupError::primary("get", StoreError::new("503"));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "primary_store");

        let err = BackupError::metadata("disown", StoreError::new("throttled"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Metadata store error"));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = BackupError::Timeout {
            operation: "secondary.put".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("secondary.put"));
    }

    #[test]
    fn test_circuit_open_is_retryable() {
        let err = BackupError::CircuitOpen {
            circuit: "secondary_deletes".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("secondary_deletes"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = BackupError::Config("retention window is empty".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_event() {
        let err = BackupError::InvalidEvent("missing object key".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "invalid_event");
    }

    #[test]
    fn test_lifecycle_timeout_formatting() {
        let err = BackupError::LifecycleTimeout {
            passes: 12,
            reclaimed: 1200,
            elapsed: Duration::from_secs(3600),
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("12 passes"));
        assert!(msg.contains("1200 reclaimed"));
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = BackupError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_store_error_from_sqlx() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(!err.0.is_empty());
    }
}
