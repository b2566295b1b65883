// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator: applies object lifecycle events to the secondary store and
//! the metadata store.
//!
//! # Created
//!
//! ```text
//! primary.get(object_id) ──► secondary.put(location) ──► metadata.put(record)
//!        │ absent                   │ fails
//!        ▼                          ▼
//!   SourceMissing (no-op)      error, no record written
//! ```
//!
//! The blob is always written before its record, so the metadata store
//! never claims a copy that does not exist. A metadata failure after the
//! blob write leaves an unindexed blob, which is acceptable.
//!
//! A copy that already has a record is never written again: the primary
//! only holds the latest version, and a replayed event for an older copy
//! must not overwrite that copy's blob with newer bytes. Without a record
//! (first delivery, or redelivery after a failed metadata write) the blob
//! goes to a location derived from `(object_id, copy_id)`, so the retry
//! overwrites the unindexed blob rather than leaving a second one.
//!
//! # Removed
//!
//! Removal only flags the record as disowned. Blobs are never deleted here;
//! the cleaner reclaims them once the retention window has passed.

use crate::blob::BlobStore;
use crate::circuit_breaker::StoreCircuit;
use crate::clock::Clock;
use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::event::{EventType, ObjectEvent};
use crate::metadata::MetadataStore;
use crate::metrics;
use crate::record::{CopyRecord, DisownOutcome};
use crate::resilience::{call_store, Store};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Result of handling a creation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Blob written and record upserted.
    Replicated { location: String, size: u64 },
    /// The copy already has a record. Nothing was read or written.
    AlreadyReplicated { location: String },
    /// The primary store no longer has the object. Nothing was written.
    SourceMissing,
}

/// Result of handling a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Created(CreateOutcome),
    Removed(DisownOutcome),
    /// Removal without a copy id; number of copies newly disowned.
    RemovedAll(usize),
}

impl EventOutcome {
    /// True when the event changed nothing (replay, race, or missing source).
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            Self::Created(CreateOutcome::SourceMissing | CreateOutcome::AlreadyReplicated { .. })
                | Self::Removed(DisownOutcome::AlreadyDisowned | DisownOutcome::Absent)
                | Self::RemovedAll(0)
        )
    }
}

/// Outcome of a delivered batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Events that changed state.
    pub applied: usize,
    /// Events that were valid but changed nothing.
    pub noops: usize,
    /// Events that failed, in delivery order.
    pub failures: Vec<(ObjectEvent, BackupError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.applied + self.noops + self.failures.len()
    }

    /// Whether any failure is worth redelivering.
    pub fn has_retryable_failures(&self) -> bool {
        self.failures.iter().any(|(_, e)| e.is_retryable())
    }
}

/// Copies objects from the primary to the secondary store and keeps the
/// metadata store in step.
pub struct Replicator<M: MetadataStore> {
    primary: Arc<dyn BlobStore>,
    secondary: Arc<dyn BlobStore>,
    metadata: Arc<M>,
    clock: Arc<dyn Clock>,
    circuit: Arc<StoreCircuit>,
    prefix: Option<String>,
    max_copies_per_object: Option<usize>,
    store_timeout: Duration,
}

impl<M: MetadataStore> Replicator<M> {
    pub fn new(
        primary: Arc<dyn BlobStore>,
        secondary: Arc<dyn BlobStore>,
        metadata: Arc<M>,
        clock: Arc<dyn Clock>,
        config: &BackupConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            metadata,
            clock,
            circuit: Arc::new(StoreCircuit::with_config(config.settings.circuit.to_circuit_config())),
            prefix: config.secondary.prefix.clone(),
            max_copies_per_object: config.settings.replicator.max_copies_per_object,
            store_timeout: config.store_timeout_duration(),
        }
    }

    /// Share a circuit with other components (the cleaner uses its delete half).
    #[must_use]
    pub fn with_circuit(mut self, circuit: Arc<StoreCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn circuit(&self) -> &Arc<StoreCircuit> {
        &self.circuit
    }

    pub fn metadata(&self) -> &Arc<M> {
        &self.metadata
    }

    /// Secondary-store location for a copy.
    pub fn location_for(&self, object_id: &str, copy_id: &str) -> String {
        CopyRecord::location_for(self.prefix.as_deref(), object_id, copy_id)
    }

    /// Replicate one object version.
    #[instrument(skip_all, fields(object_id = %object_id, copy_id = %copy_id))]
    pub async fn on_object_created(&self, object_id: &str, copy_id: &str) -> Result<CreateOutcome> {
        let start = Instant::now();

        if object_id.is_empty() || copy_id.is_empty() {
            return Err(BackupError::InvalidEvent(format!(
                "empty id in copy ('{object_id}', '{copy_id}')"
            )));
        }

        let existing = call_store(Store::Metadata, "get", self.store_timeout, self.metadata.get(object_id, copy_id)).await?;
        if let Some(record) = existing {
            debug!(location = %record.location, "Copy already replicated, skipping");
            return Ok(CreateOutcome::AlreadyReplicated {
                location: record.location,
            });
        }

        let data = call_store(Store::Primary, "get", self.store_timeout, self.primary.get(object_id)).await?;
        let Some(data) = data else {
            debug!("Source object no longer in primary store, skipping");
            metrics::record_source_missing();
            return Ok(CreateOutcome::SourceMissing);
        };

        let location = self.location_for(object_id, copy_id);
        let size = data.len() as u64;

        self.circuit
            .writes
            .guard(call_store(Store::Secondary, "put", self.store_timeout, self.secondary.put(&location, data)))
            .await?;

        let record = CopyRecord::owned(object_id, copy_id, location.clone(), self.clock.now(), size);
        call_store(Store::Metadata, "put", self.store_timeout, self.metadata.put(record)).await?;

        metrics::record_object_replicated(size, start.elapsed());
        debug!(location = %location, size, "Copy replicated");

        if let Some(limit) = self.max_copies_per_object {
            self.prune_copies(object_id, copy_id, limit).await?;
        }

        Ok(CreateOutcome::Replicated { location, size })
    }

    /// Flag one copy as disowned. Absent or already-disowned records are no-ops.
    #[instrument(skip_all, fields(object_id = %object_id, copy_id = %copy_id))]
    pub async fn on_object_removed(&self, object_id: &str, copy_id: &str) -> Result<DisownOutcome> {
        let now = self.clock.now();
        let outcome = call_store(
            Store::Metadata,
            "disown",
            self.store_timeout,
            self.metadata.disown(object_id, copy_id, now),
        )
        .await?;

        metrics::record_disown(outcome.as_str());
        match outcome {
            DisownOutcome::Disowned => debug!(disowned_at = now, "Copy disowned"),
            DisownOutcome::AlreadyDisowned => debug!("Copy already disowned"),
            DisownOutcome::Absent => debug!("No record to disown"),
        }
        Ok(outcome)
    }

    /// Disown every live copy of an object (removal without a version).
    #[instrument(skip_all, fields(object_id = %object_id))]
    pub async fn on_object_removed_all(&self, object_id: &str) -> Result<usize> {
        let copies = call_store(Store::Metadata, "copies_of", self.store_timeout, self.metadata.copies_of(object_id)).await?;

        let mut disowned = 0;
        for record in copies.iter().filter(|r| !r.is_disowned()) {
            if self.on_object_removed(object_id, &record.copy_id).await? == DisownOutcome::Disowned {
                disowned += 1;
            }
        }
        debug!(disowned, "Disowned all copies");
        Ok(disowned)
    }

    /// Validate and dispatch one event.
    pub async fn handle_event(&self, event: &ObjectEvent) -> Result<EventOutcome> {
        event.validate()?;

        match (event.event_type, event.copy_id.as_deref()) {
            (EventType::Created, Some(copy_id)) => {
                Ok(EventOutcome::Created(self.on_object_created(&event.object_id, copy_id).await?))
            }
            (EventType::Created, None) => Err(BackupError::InvalidEvent(format!(
                "CREATED event for '{}' has no copy id",
                event.object_id
            ))),
            (EventType::Removed, Some(copy_id)) => {
                Ok(EventOutcome::Removed(self.on_object_removed(&event.object_id, copy_id).await?))
            }
            (EventType::Removed, None) => Ok(EventOutcome::RemovedAll(self.on_object_removed_all(&event.object_id).await?)),
        }
    }

    /// Apply a delivered batch in order.
    ///
    /// A failing event does not stop the batch; failures are returned so
    /// the host can ask for redelivery.
    #[instrument(skip_all, fields(batch_size = events.len()))]
    pub async fn handle_events(&self, events: Vec<ObjectEvent>) -> BatchReport {
        let mut report = BatchReport::default();

        for event in events {
            let event_type = event.event_type.to_string();
            match self.handle_event(&event).await {
                Ok(outcome) if outcome.is_noop() => {
                    metrics::record_event(&event_type, "noop");
                    report.noops += 1;
                }
                Ok(_) => {
                    metrics::record_event(&event_type, "applied");
                    report.applied += 1;
                }
                Err(e) => {
                    warn!(
                        object_id = %event.object_id,
                        copy_id = ?event.copy_id,
                        error = %e,
                        "Event failed"
                    );
                    metrics::record_event(&event_type, "failed");
                    metrics::record_replication_failure(e.kind());
                    report.failures.push((event, e));
                }
            }
        }

        info!(
            applied = report.applied,
            noops = report.noops,
            failed = report.failures.len(),
            "Batch processed"
        );
        report
    }

    /// Disown the oldest live copies beyond `limit`, never the one just written.
    async fn prune_copies(&self, object_id: &str, keep_copy_id: &str, limit: usize) -> Result<()> {
        let copies = call_store(Store::Metadata, "copies_of", self.store_timeout, self.metadata.copies_of(object_id)).await?;

        let mut live: Vec<&CopyRecord> = copies.iter().filter(|r| !r.is_disowned()).collect();
        if live.len() <= limit {
            return Ok(());
        }
        live.sort_by(|a, b| (a.replicated_at, &a.copy_id).cmp(&(b.replicated_at, &b.copy_id)));

        let excess = live.len() - limit;
        let mut pruned = 0;
        for record in live.into_iter().filter(|r| r.copy_id != keep_copy_id).take(excess) {
            if self.on_object_removed(object_id, &record.copy_id).await? == DisownOutcome::Disowned {
                pruned += 1;
            }
        }

        if pruned > 0 {
            metrics::record_copies_pruned(pruned);
            debug!(pruned, limit, "Pruned old copies");
        }
        Ok(())
    }
}
