// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metadata store: one [`CopyRecord`] per replicated copy.
//!
//! The store is an external collaborator; this module defines the
//! operations the core relies on and the invariants every implementation
//! must uphold:
//!
//! - `(object_id, copy_id)` is unique.
//! - The disown flag is monotonic. [`MetadataStore::put`] never clears an
//!   existing disown, and [`MetadataStore::disown`] only acts on owned rows.
//! - `query_disowned` walks the disown index `(disown_status, disown_timestamp)`
//!   oldest first, without scanning the primary key space.
//!
//! Two implementations ship with the crate:
//! - [`InMemoryMetadataStore`]: primary map plus an explicit ordered index.
//! - [`SqliteMetadataStore`]: durable, WAL-mode SQLite with a secondary index.

mod memory;
mod sqlite;

pub use memory::InMemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

use crate::blob::BoxFuture;
use crate::record::{CopyRecord, DisownOutcome};

/// Operations the core needs from the metadata store.
pub trait MetadataStore: Send + Sync + 'static {
    /// Insert or update a record.
    ///
    /// If a record already exists and is disowned, its disown flag and
    /// timestamp are preserved; only location/size/replicated_at change.
    fn put(&self, record: CopyRecord) -> BoxFuture<'_, ()>;

    /// Fetch a record by primary key.
    fn get(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, Option<CopyRecord>>;

    /// Delete a record. Returns `false` if it did not exist.
    fn delete(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, bool>;

    /// Mark a record disowned at `at` if it is currently owned.
    fn disown(&self, object_id: &str, copy_id: &str, at: i64) -> BoxFuture<'_, DisownOutcome>;

    /// All copies of an object, ordered by `copy_id`.
    fn copies_of(&self, object_id: &str) -> BoxFuture<'_, Vec<CopyRecord>>;

    /// Disowned records with `disown_timestamp < older_than`, oldest first,
    /// at most `limit` rows.
    fn query_disowned(&self, older_than: i64, limit: usize) -> BoxFuture<'_, Vec<CopyRecord>>;

    /// Release resources (flush, checkpoint). Default: nothing to do.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
