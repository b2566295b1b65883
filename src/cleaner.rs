// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cleaner: reclaims disowned copies once their retention window has passed.
//!
//! # Algorithm
//!
//! 1. `cutoff = now - retention_window`
//! 2. Fetch up to `page_size` records with `disown_timestamp < cutoff`,
//!    oldest first, from the disown index.
//! 3. For each candidate: delete the blob, then (only on success) delete
//!    the record. A blob that is already gone counts as deleted.
//! 4. Report whether more work likely remains: the page was full and the
//!    pass made progress. Candidates another cleaner reclaimed first count
//!    as progress, since they too have left the index.
//!
//! The blob always goes first. A crash between the two steps leaves a
//! record whose blob is gone; the next pass hits the not-found path and
//! finishes the job.
//!
//! Per-record failures are counted and the pass moves on. A failure to
//! query the index at all is returned to the caller.

use crate::blob::{BlobStore, DeleteOutcome};
use crate::circuit_breaker::StoreCircuit;
use crate::clock::Clock;
use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::metadata::MetadataStore;
use crate::metrics;
use crate::record::CopyRecord;
use crate::resilience::{call_store, Store};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Result of a single cleaner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Copies whose blob and record were both deleted by this pass.
    pub reclaimed: usize,
    /// More eligible candidates probably exist.
    pub remaining: bool,
    /// Candidates left in place because a store call failed.
    pub failed: usize,
    /// Candidates returned by the index query.
    pub scanned: usize,
}

/// Where a single reclaim stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReclaimStage {
    Blob,
    Record,
}

impl ReclaimStage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Record => "record",
        }
    }
}

pub struct Cleaner<M: MetadataStore> {
    secondary: Arc<dyn BlobStore>,
    metadata: Arc<M>,
    clock: Arc<dyn Clock>,
    circuit: Arc<StoreCircuit>,
    retention_secs: i64,
    page_size: usize,
    store_timeout: Duration,
}

impl<M: MetadataStore> Cleaner<M> {
    pub fn new(
        secondary: Arc<dyn BlobStore>,
        metadata: Arc<M>,
        clock: Arc<dyn Clock>,
        config: &BackupConfig,
    ) -> Self {
        Self {
            secondary,
            metadata,
            clock,
            circuit: Arc::new(StoreCircuit::with_config(config.settings.circuit.to_circuit_config())),
            retention_secs: config.settings.cleaner.retention_secs(),
            page_size: config.settings.cleaner.page_size.max(1),
            store_timeout: config.store_timeout_duration(),
        }
    }

    #[must_use]
    pub fn with_circuit(mut self, circuit: Arc<StoreCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn retention_secs(&self) -> i64 {
        self.retention_secs
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Run one pass over the oldest eligible candidates.
    #[instrument(skip_all, fields(cutoff))]
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let start = Instant::now();
        let cutoff = self.clock.now().saturating_sub(self.retention_secs);
        tracing::Span::current().record("cutoff", cutoff);

        let candidates = call_store(
            Store::Metadata,
            "query_disowned",
            self.store_timeout,
            self.metadata.query_disowned(cutoff, self.page_size),
        )
        .await?;

        let mut report = CleanupReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        let mut reclaimed_elsewhere = 0;
        for record in &candidates {
            match self.reclaim(record).await {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => {
                    debug!(object_id = %record.object_id, copy_id = %record.copy_id, "Record already reclaimed elsewhere");
                    reclaimed_elsewhere += 1;
                }
                Err((stage, e)) => {
                    warn!(
                        object_id = %record.object_id,
                        copy_id = %record.copy_id,
                        stage = stage.as_str(),
                        error = %e,
                        "Failed to reclaim copy"
                    );
                    let label = if matches!(e, BackupError::CircuitOpen { .. }) {
                        "circuit"
                    } else {
                        stage.as_str()
                    };
                    metrics::record_reclaim_failure(label);
                    report.failed += 1;
                }
            }
        }

        report.remaining = report.scanned == self.page_size && report.reclaimed + reclaimed_elsewhere > 0;

        metrics::record_cleaner_pass(report.reclaimed, report.failed, start.elapsed());
        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                reclaimed = report.reclaimed,
                failed = report.failed,
                remaining = report.remaining,
                "Cleaner pass complete"
            );
        } else {
            debug!("Cleaner pass found nothing to reclaim");
        }
        Ok(report)
    }

    /// Delete blob then record. `Ok(false)` if the record had already gone.
    async fn reclaim(&self, record: &CopyRecord) -> std::result::Result<bool, (ReclaimStage, BackupError)> {
        let outcome = self
            .circuit
            .deletes
            .guard(call_store(
                Store::Secondary,
                "delete",
                self.store_timeout,
                self.secondary.delete(&record.location),
            ))
            .await
            .map_err(|e| (ReclaimStage::Blob, e))?;

        if outcome == DeleteOutcome::NotFound {
            debug!(location = %record.location, "Blob already gone");
        }

        call_store(
            Store::Metadata,
            "delete",
            self.store_timeout,
            self.metadata.delete(&record.object_id, &record.copy_id),
        )
        .await
        .map_err(|e| (ReclaimStage::Record, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BoxFuture, ObjectStoreBlobStore};
    use crate::circuit_breaker::CircuitConfig;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::metadata::InMemoryMetadataStore;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Blob store whose deletes fail for chosen locations.
    struct FlakyDeletes {
        inner: ObjectStoreBlobStore,
        failing: HashSet<String>,
        delete_calls: AtomicUsize,
    }

    impl FlakyDeletes {
        fn new(failing: &[&str]) -> Self {
            Self {
                inner: ObjectStoreBlobStore::in_memory(),
                failing: failing.iter().map(|s| s.to_string()).collect(),
                delete_calls: AtomicUsize::new(0),
            }
        }
    }

    impl BlobStore for FlakyDeletes {
        fn get(&self, location: &str) -> BoxFuture<'_, Option<Bytes>> {
            self.inner.get(location)
        }
        fn put(&self, location: &str, data: Bytes) -> BoxFuture<'_, ()> {
            self.inner.put(location, data)
        }
        fn delete(&self, location: &str) -> BoxFuture<'_, DeleteOutcome> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(location) {
                return Box::pin(async { Err(StoreError::new("delete refused")) });
            }
            self.inner.delete(location)
        }
        fn exists(&self, location: &str) -> BoxFuture<'_, bool> {
            self.inner.exists(location)
        }
    }

    struct Fixture {
        secondary: Arc<FlakyDeletes>,
        metadata: Arc<InMemoryMetadataStore>,
        clock: Arc<ManualClock>,
        cleaner: Cleaner<InMemoryMetadataStore>,
    }

    fn fixture(retention: &str, page_size: usize, failing: &[&str]) -> Fixture {
        let mut config = BackupConfig::for_testing();
        config.settings.cleaner.retention_window = retention.to_string();
        config.settings.cleaner.page_size = page_size;

        let secondary = Arc::new(FlakyDeletes::new(failing));
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let cleaner = Cleaner::new(secondary.clone(), metadata.clone(), clock.clone(), &config);
        Fixture {
            secondary,
            metadata,
            clock,
            cleaner,
        }
    }

    /// Write a blob and a record disowned at `at`.
    async fn disowned_copy(f: &Fixture, object_id: &str, copy_id: &str, at: i64) -> String {
        let location = CopyRecord::location_for(None, object_id, copy_id);
        f.secondary.put(&location, Bytes::from_static(b"data")).await.unwrap();
        f.metadata
            .put(CopyRecord::owned(object_id, copy_id, location.clone(), 0, 4))
            .await
            .unwrap();
        f.metadata.disown(object_id, copy_id, at).await.unwrap();
        location
    }

    #[tokio::test]
    async fn test_scenario_reclaims_after_retention() {
        let f = fixture("60s", 100, &[]);
        let location = disowned_copy(&f, "O1", "C1", 100).await;

        f.clock.set(120);
        let report = f.cleaner.run_once().await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert!(!report.remaining);
        assert!(f.metadata.get("O1", "C1").await.unwrap().is_some());

        f.clock.set(170);
        let report = f.cleaner.run_once().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert!(!report.remaining);
        assert!(f.metadata.get("O1", "C1").await.unwrap().is_none());
        assert!(!f.secondary.exists(&location).await.unwrap());
    }

    #[tokio::test]
    async fn test_retention_boundary() {
        let f = fixture("60s", 100, &[]);
        disowned_copy(&f, "o", "c", 1_000).await;

        f.clock.set(1_000 + 60 - 1);
        assert_eq!(f.cleaner.run_once().await.unwrap().reclaimed, 0);

        // Exactly at the window edge the copy is not yet older than the cutoff
        f.clock.set(1_000 + 60);
        assert_eq!(f.cleaner.run_once().await.unwrap().reclaimed, 0);

        f.clock.set(1_000 + 60 + 1);
        assert_eq!(f.cleaner.run_once().await.unwrap().reclaimed, 1);
    }

    #[tokio::test]
    async fn test_subsecond_retention_is_not_zero() {
        let f = fixture("500ms", 100, &[]);
        disowned_copy(&f, "o", "c", 100).await;

        f.clock.set(101);
        assert_eq!(f.cleaner.run_once().await.unwrap().reclaimed, 0);

        f.clock.set(102);
        assert_eq!(f.cleaner.run_once().await.unwrap().reclaimed, 1);
    }

    #[tokio::test]
    async fn test_owned_copies_are_never_reclaimed() {
        let f = fixture("0s", 100, &[]);
        f.metadata
            .put(CopyRecord::owned("live", "1", "live/1", 0, 4))
            .await
            .unwrap();

        f.clock.set(1_000_000);
        let report = f.cleaner.run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert!(f.metadata.get("live", "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_double_clean_reclaims_once() {
        let f = fixture("10s", 100, &[]);
        for i in 0..3 {
            disowned_copy(&f, "o", &i.to_string(), 5).await;
        }
        f.clock.set(100);

        let first = f.cleaner.run_once().await.unwrap();
        let second = f.cleaner.run_once().await.unwrap();

        assert_eq!(first.reclaimed, 3);
        assert_eq!(second, CleanupReport::default());
        assert!(f.metadata.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_blob_counts_as_reclaimed() {
        let f = fixture("10s", 100, &[]);
        f.metadata
            .put(CopyRecord::owned("o", "c", "o/c", 0, 4))
            .await
            .unwrap();
        f.metadata.disown("o", "c", 0).await.unwrap();

        f.clock.set(100);
        let report = f.cleaner.run_once().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.failed, 0);
        assert!(f.metadata.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_blob_delete_keeps_record() {
        let f = fixture("10s", 100, &["o/bad"]);
        disowned_copy(&f, "o", "bad", 1).await;
        disowned_copy(&f, "o", "good", 2).await;

        f.clock.set(100);
        let report = f.cleaner.run_once().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.failed, 1);
        // Record stays so a later pass can retry
        assert!(f.metadata.get("o", "bad").await.unwrap().is_some());
        assert!(f.metadata.get("o", "good").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_page_signals_remaining() {
        let f = fixture("10s", 2, &[]);
        for (i, at) in [30, 10, 20, 40, 50].iter().enumerate() {
            disowned_copy(&f, "o", &i.to_string(), *at).await;
        }
        f.clock.set(1_000);

        let report = f.cleaner.run_once().await.unwrap();
        assert_eq!(report.reclaimed, 2);
        assert!(report.remaining);
        // Oldest first: disowned at 10 and 20
        assert!(f.metadata.get("o", "1").await.unwrap().is_none());
        assert!(f.metadata.get("o", "2").await.unwrap().is_none());

        let report = f.cleaner.run_once().await.unwrap();
        assert!(report.remaining);
        let report = f.cleaner.run_once().await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert!(!report.remaining);
    }

    /// Metadata store where a rival cleaner removes each page right after
    /// it has been queried.
    struct RivalCleaner {
        inner: InMemoryMetadataStore,
    }

    impl MetadataStore for RivalCleaner {
        fn put(&self, record: CopyRecord) -> BoxFuture<'_, ()> {
            self.inner.put(record)
        }
        fn get(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, Option<CopyRecord>> {
            self.inner.get(object_id, copy_id)
        }
        fn delete(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, bool> {
            self.inner.delete(object_id, copy_id)
        }
        fn disown(&self, object_id: &str, copy_id: &str, at: i64) -> BoxFuture<'_, crate::record::DisownOutcome> {
            self.inner.disown(object_id, copy_id, at)
        }
        fn copies_of(&self, object_id: &str) -> BoxFuture<'_, Vec<CopyRecord>> {
            self.inner.copies_of(object_id)
        }
        fn query_disowned(&self, older_than: i64, limit: usize) -> BoxFuture<'_, Vec<CopyRecord>> {
            Box::pin(async move {
                let page = self.inner.query_disowned(older_than, limit).await?;
                for record in &page {
                    self.inner.delete(&record.object_id, &record.copy_id).await?;
                }
                Ok(page)
            })
        }
    }

    #[tokio::test]
    async fn test_page_taken_by_rival_still_signals_remaining() {
        let mut config = BackupConfig::for_testing();
        config.settings.cleaner.retention_window = "10s".to_string();
        config.settings.cleaner.page_size = 2;
        let metadata = Arc::new(RivalCleaner {
            inner: InMemoryMetadataStore::new(),
        });
        for i in 0..5 {
            let copy = i.to_string();
            metadata
                .put(CopyRecord::owned("o", copy.clone(), format!("o/{copy}"), 0, 1))
                .await
                .unwrap();
            metadata.disown("o", &copy, 1).await.unwrap();
        }
        let cleaner = Cleaner::new(
            Arc::new(ObjectStoreBlobStore::in_memory()),
            metadata.clone(),
            Arc::new(ManualClock::new(100)),
            &config,
        );

        let report = cleaner.run_once().await.unwrap();
        assert_eq!((report.scanned, report.reclaimed, report.failed), (2, 0, 0));
        assert!(report.remaining);

        let report = cleaner.run_once().await.unwrap();
        assert!(report.remaining);
        let report = cleaner.run_once().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert!(!report.remaining);
    }

    #[tokio::test]
    async fn test_full_page_of_failures_does_not_signal_remaining() {
        let f = fixture("10s", 2, &["o/a", "o/b"]);
        disowned_copy(&f, "o", "a", 1).await;
        disowned_copy(&f, "o", "b", 2).await;
        f.clock.set(100);

        let report = f.cleaner.run_once().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.failed, 2);
        assert!(!report.remaining);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_store_calls() {
        let failing: Vec<String> = (0..6).map(|i| format!("o/{i}")).collect();
        let failing_refs: Vec<&str> = failing.iter().map(String::as_str).collect();
        let f = fixture("10s", 100, &failing_refs);
        let circuit = Arc::new(StoreCircuit::with_config(CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        }));
        let cleaner = Cleaner::new(
            f.secondary.clone(),
            f.metadata.clone(),
            f.clock.clone(),
            &BackupConfig::for_testing(),
        )
        .with_circuit(circuit.clone());

        for i in 0..6 {
            disowned_copy(&f, "o", &i.to_string(), 1).await;
        }
        f.clock.set(100);

        let report = cleaner.run_once().await.unwrap();
        assert_eq!(report.failed, 6);
        assert!(f.secondary.delete_calls.load(Ordering::SeqCst) < 6);
        assert!(circuit.deletes.stats().rejected >= 1);
        assert_eq!(f.metadata.len().await, 6);
    }
}
