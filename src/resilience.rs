// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: per-call deadlines for collaborator stores.
//!
//! Every call the replicator or cleaner makes to the primary, secondary or
//! metadata store goes through [`call_store`], which applies a short
//! deadline and tags failures with the store and operation. There is no
//! retry here: redelivery of events and rescheduling of cleaner passes
//! belong to the invoking layer.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> object_backup::Result<()> {
//! use object_backup::resilience::{call_store, Store};
//! use std::time::Duration;
//!
//! let value = call_store(Store::Secondary, "put", Duration::from_secs(30), async {
//!     Ok::<_, object_backup::StoreError>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::blob::StoreResult;
use crate::error::{BackupError, Result, StoreError};
use crate::metrics;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Collaborator a call is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Primary,
    Secondary,
    Metadata,
}

impl Store {
    pub fn name(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Metadata => "metadata",
        }
    }

    /// Wrap a store failure in the matching [`BackupError`] variant.
    pub fn error(self, operation: &str, source: StoreError) -> BackupError {
        match self {
            Self::Primary => BackupError::primary(operation, source),
            Self::Secondary => BackupError::secondary(operation, source),
            Self::Metadata => BackupError::metadata(operation, source),
        }
    }
}

/// Run one store call under a deadline.
///
/// Elapsed deadlines become [`BackupError::Timeout`] with the operation
/// named `"{store}.{operation}"`; store failures are wrapped via
/// [`Store::error`].
pub async fn call_store<T, F>(store: Store, operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(store.error(operation, e)),
        Err(_) => {
            let operation = format!("{}.{}", store.name(), operation);
            warn!(operation = %operation, timeout_ms = timeout.as_millis() as u64, "Store call timed out");
            metrics::record_store_timeout(&operation);
            Err(BackupError::Timeout { operation, timeout })
        }
    }
}
