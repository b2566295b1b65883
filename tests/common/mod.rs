// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Store wrappers with switchable faults and call counters
//! - A fixture wiring replicator and cleaner over in-memory stores
//! - Tracing setup for `--nocapture` runs

#![allow(dead_code)]

use bytes::Bytes;
use object_backup::blob::{BlobStore, BoxFuture, DeleteOutcome, ObjectStoreBlobStore};
use object_backup::metadata::{InMemoryMetadataStore, MetadataStore};
use object_backup::record::{CopyRecord, DisownOutcome};
use object_backup::{BackupConfig, Cleaner, ManualClock, Replicator, StoreError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn injected<T: Send + 'static>(operation: &str) -> BoxFuture<'static, T> {
    let message = format!("injected {operation} failure");
    Box::pin(async move { Err(StoreError::new(message)) })
}

// =============================================================================
// Faulty Blob Store
// =============================================================================

/// In-memory blob store whose operations can be made to fail on demand.
pub struct FaultyBlobStore {
    inner: ObjectStoreBlobStore,
    pub fail_get: AtomicBool,
    pub fail_put: AtomicBool,
    pub fail_delete: AtomicBool,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl FaultyBlobStore {
    pub fn new() -> Self {
        Self {
            inner: ObjectStoreBlobStore::in_memory(),
            fail_get: AtomicBool::new(false),
            fail_put: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Bypass faults and counters (test setup).
    pub async fn seed(&self, location: &str, data: &'static [u8]) {
        self.inner.put(location, Bytes::from_static(data)).await.unwrap();
    }

    pub async fn contains(&self, location: &str) -> bool {
        self.inner.exists(location).await.unwrap()
    }
}

impl BlobStore for FaultyBlobStore {
    fn get(&self, location: &str) -> BoxFuture<'_, Option<Bytes>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return injected("get");
        }
        self.inner.get(location)
    }

    fn put(&self, location: &str, data: Bytes) -> BoxFuture<'_, ()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_put.load(Ordering::SeqCst) {
            return injected("put");
        }
        self.inner.put(location, data)
    }

    fn delete(&self, location: &str) -> BoxFuture<'_, DeleteOutcome> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return injected("delete");
        }
        self.inner.delete(location)
    }

    fn exists(&self, location: &str) -> BoxFuture<'_, bool> {
        self.inner.exists(location)
    }
}

// =============================================================================
// Faulty Metadata Store
// =============================================================================

/// In-memory metadata store with switchable faults.
#[derive(Default)]
pub struct FaultyMetadataStore {
    pub inner: InMemoryMetadataStore,
    pub fail_put: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_disown: AtomicBool,
    pub fail_query: AtomicBool,
}

impl FaultyMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flag: &AtomicBool, fail: bool) {
        flag.store(fail, Ordering::SeqCst);
    }
}

impl MetadataStore for FaultyMetadataStore {
    fn put(&self, record: CopyRecord) -> BoxFuture<'_, ()> {
        if self.fail_put.load(Ordering::SeqCst) {
            return injected("put");
        }
        self.inner.put(record)
    }

    fn get(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, Option<CopyRecord>> {
        self.inner.get(object_id, copy_id)
    }

    fn delete(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, bool> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return injected("delete");
        }
        self.inner.delete(object_id, copy_id)
    }

    fn disown(&self, object_id: &str, copy_id: &str, at: i64) -> BoxFuture<'_, DisownOutcome> {
        if self.fail_disown.load(Ordering::SeqCst) {
            return injected("disown");
        }
        self.inner.disown(object_id, copy_id, at)
    }

    fn copies_of(&self, object_id: &str) -> BoxFuture<'_, Vec<CopyRecord>> {
        self.inner.copies_of(object_id)
    }

    fn query_disowned(&self, older_than: i64, limit: usize) -> BoxFuture<'_, Vec<CopyRecord>> {
        if self.fail_query.load(Ordering::SeqCst) {
            return injected("query_disowned");
        }
        self.inner.query_disowned(older_than, limit)
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// Replicator and cleaner sharing faulty stores and a manual clock.
pub struct Fixture<M: MetadataStore> {
    pub primary: Arc<FaultyBlobStore>,
    pub secondary: Arc<FaultyBlobStore>,
    pub metadata: Arc<M>,
    pub clock: Arc<ManualClock>,
    pub replicator: Arc<Replicator<M>>,
    pub cleaner: Arc<Cleaner<M>>,
}

impl<M: MetadataStore> Fixture<M> {
    pub fn new(config: BackupConfig, metadata: Arc<M>, start: i64) -> Self {
        let primary = Arc::new(FaultyBlobStore::new());
        let secondary = Arc::new(FaultyBlobStore::new());
        let clock = Arc::new(ManualClock::new(start));

        let replicator = Replicator::new(
            primary.clone(),
            secondary.clone(),
            metadata.clone(),
            clock.clone(),
            &config,
        );
        let circuit = replicator.circuit().clone();
        let cleaner = Cleaner::new(secondary.clone(), metadata.clone(), clock.clone(), &config).with_circuit(circuit);

        Self {
            primary,
            secondary,
            metadata,
            clock,
            replicator: Arc::new(replicator),
            cleaner: Arc::new(cleaner),
        }
    }
}

/// Test config with the given retention window and page size.
pub fn config_with(retention: &str, page_size: usize) -> BackupConfig {
    let mut config = BackupConfig::for_testing();
    config.settings.cleaner.retention_window = retention.to_string();
    config.settings.cleaner.page_size = page_size;
    config
}
