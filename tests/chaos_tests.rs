// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate store failures and verify graceful degradation.
//!
//! These tests verify that partial failures never lose track of a copy
//! that still exists, and that every failed step is safe to re-run.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{config_with, init_tracing, Fixture, FaultyMetadataStore};
use object_backup::metadata::{InMemoryMetadataStore, MetadataStore};
use object_backup::{BackupError, ObjectEvent};
use std::sync::Arc;

fn faulty_fixture(retention: &str, page_size: usize) -> Fixture<FaultyMetadataStore> {
    init_tracing();
    Fixture::new(config_with(retention, page_size), Arc::new(FaultyMetadataStore::new()), 0)
}

// =============================================================================
// Replication Failures
// =============================================================================

/// Primary read failure: nothing written, error is retryable.
#[tokio::test]
async fn primary_failure_writes_nothing() {
    let f = faulty_fixture("60s", 100);
    f.primary.seed("a", b"x").await;
    f.primary.set_fail_get(true);

    let err = f.replicator.on_object_created("a", "v1").await.unwrap_err();
    assert!(matches!(err, BackupError::PrimaryStore { .. }));
    assert!(err.is_retryable());
    assert_eq!(f.secondary.put_calls(), 0);
    assert!(f.metadata.inner.is_empty().await);
}

/// Metadata write fails after the blob landed: the orphan blob is
/// overwritten in place on retry and then tracked.
#[tokio::test]
async fn metadata_put_failure_is_repaired_by_redelivery() {
    let f = faulty_fixture("60s", 100);
    f.primary.seed("a", b"x").await;
    f.metadata.set(&f.metadata.fail_put, true);

    let err = f.replicator.on_object_created("a", "v1").await.unwrap_err();
    assert!(matches!(err, BackupError::MetadataStore { .. }));

    let location = f.replicator.location_for("a", "v1");
    assert!(f.secondary.contains(&location).await, "blob is written before the record");
    assert!(f.metadata.get("a", "v1").await.unwrap().is_none());

    f.metadata.set(&f.metadata.fail_put, false);
    f.replicator.on_object_created("a", "v1").await.unwrap();

    assert_eq!(f.secondary.put_calls(), 2);
    let record = f.metadata.get("a", "v1").await.unwrap().unwrap();
    assert_eq!(record.location, location);
}

/// Secondary write failures inside a batch are reported per event and the
/// rest of the batch still applies.
#[tokio::test]
async fn batch_continues_past_secondary_failure() {
    let f = faulty_fixture("60s", 100);
    f.primary.seed("a", b"x").await;
    f.primary.seed("b", b"y").await;

    f.secondary.set_fail_put(true);
    let report = f
        .replicator
        .handle_events(vec![ObjectEvent::created("a", "v1"), ObjectEvent::removed("b", "v9")])
        .await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, ObjectEvent::created("a", "v1"));
    assert!(report.has_retryable_failures());
    assert_eq!(report.noops, 1);

    f.secondary.set_fail_put(false);
    let report = f.replicator.handle_events(vec![ObjectEvent::created("a", "v1")]).await;
    assert!(report.is_success());
    assert!(f.metadata.get("a", "v1").await.unwrap().is_some());
}

/// Repeated secondary write failures open the circuit; later writes are
/// rejected without touching the store.
#[tokio::test]
async fn write_circuit_opens_under_sustained_failure() {
    let f = faulty_fixture("60s", 100);
    f.primary.seed("a", b"x").await;
    f.secondary.set_fail_put(true);

    let mut saw_circuit_open = false;
    for i in 0..50 {
        match f.replicator.on_object_created("a", &format!("v{i}")).await {
            Err(BackupError::CircuitOpen { circuit }) => {
                assert_eq!(circuit, "secondary_writes");
                saw_circuit_open = true;
                break;
            }
            Err(BackupError::SecondaryStore { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert!(saw_circuit_open);

    let calls = f.secondary.put_calls();
    let _ = f.replicator.on_object_created("a", "after").await;
    assert_eq!(f.secondary.put_calls(), calls);
    assert!(f.metadata.inner.is_empty().await);
}

/// Disown failure leaves the copy owned; redelivery disowns it.
#[tokio::test]
async fn disown_failure_is_retryable() {
    let f = faulty_fixture("60s", 100);
    f.primary.seed("a", b"x").await;
    f.replicator.on_object_created("a", "v1").await.unwrap();

    f.metadata.set(&f.metadata.fail_disown, true);
    assert!(f.replicator.on_object_removed("a", "v1").await.is_err());
    assert!(!f.metadata.get("a", "v1").await.unwrap().unwrap().is_disowned());

    f.metadata.set(&f.metadata.fail_disown, false);
    f.replicator.on_object_removed("a", "v1").await.unwrap();
    assert!(f.metadata.get("a", "v1").await.unwrap().unwrap().is_disowned());
}

// =============================================================================
// Reclamation Failures
// =============================================================================

/// Record delete fails after the blob is gone: the next pass finds the
/// record again, sees NotFound for the blob, and finishes the job.
#[tokio::test]
async fn record_delete_failure_is_finished_next_pass() {
    let f = faulty_fixture("10s", 100);
    f.primary.seed("a", b"x").await;
    f.replicator.on_object_created("a", "v1").await.unwrap();
    f.replicator.on_object_removed("a", "v1").await.unwrap();
    let location = f.replicator.location_for("a", "v1");

    f.clock.set(60);
    f.metadata.set(&f.metadata.fail_delete, true);
    let report = f.cleaner.run_once().await.unwrap();
    assert_eq!((report.reclaimed, report.failed), (0, 1));
    assert!(!f.secondary.contains(&location).await);
    assert!(f.metadata.get("a", "v1").await.unwrap().is_some());

    f.metadata.set(&f.metadata.fail_delete, false);
    let report = f.cleaner.run_once().await.unwrap();
    assert_eq!((report.reclaimed, report.failed), (1, 0));
    assert!(f.metadata.get("a", "v1").await.unwrap().is_none());
}

/// Blob delete failure keeps the record, so the copy is never lost track of.
#[tokio::test]
async fn blob_delete_failure_keeps_record() {
    let f = faulty_fixture("10s", 100);
    f.primary.seed("a", b"x").await;
    f.replicator.on_object_created("a", "v1").await.unwrap();
    f.replicator.on_object_removed("a", "v1").await.unwrap();

    f.clock.set(60);
    f.secondary.set_fail_delete(true);
    let report = f.cleaner.run_once().await.unwrap();
    assert_eq!((report.reclaimed, report.failed, report.remaining), (0, 1, false));
    assert!(f.metadata.get("a", "v1").await.unwrap().is_some());
}

/// A failed candidate query fails the whole pass.
#[tokio::test]
async fn query_failure_propagates() {
    let f = faulty_fixture("10s", 100);
    f.metadata.set(&f.metadata.fail_query, true);

    let err = f.cleaner.run_once().await.unwrap_err();
    assert!(matches!(err, BackupError::MetadataStore { .. }));
    assert_eq!(f.secondary.delete_calls(), 0);
}

/// Two cleaners racing over the same backlog reclaim each copy once.
#[tokio::test]
async fn concurrent_cleaners_do_not_double_count() {
    init_tracing();
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let f = Fixture::new(config_with("10s", 100), metadata.clone(), 0);
    f.primary.seed("a", b"x").await;
    for i in 0..20 {
        let version = format!("v{i}");
        f.replicator.on_object_created("a", &version).await.unwrap();
        f.replicator.on_object_removed("a", &version).await.unwrap();
    }
    f.clock.set(60);

    let (left, right) = tokio::join!(f.cleaner.run_once(), f.cleaner.run_once());
    let total = left.unwrap().reclaimed + right.unwrap().reclaimed;

    assert_eq!(total, 20);
    assert!(metadata.copies_of("a").await.unwrap().is_empty());
}
