// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event consumer: applies lifecycle events delivered over a channel.
//!
//! Events are pulled in small batches (whatever is already queued, up to
//! [`MAX_BATCH`]) and applied in delivery order. On shutdown, events that
//! were already queued are applied before the task exits.
//!
//! Events that fail are sent back on the failed-event channel together with
//! their error. The consumer never waits on that channel: when it is full
//! the failure is logged and counted as dropped.

use super::types::{FailedEvent, ServiceStats};
use crate::event::ObjectEvent;
use crate::metadata::MetadataStore;
use crate::replicator::Replicator;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, Instrument};

/// Upper bound on events applied per batch.
pub(super) const MAX_BATCH: usize = 100;

pub(super) async fn run_event_consumer<M: MetadataStore>(
    replicator: Arc<Replicator<M>>,
    mut events_rx: mpsc::Receiver<ObjectEvent>,
    failed_tx: mpsc::Sender<FailedEvent>,
    stats: Arc<ServiceStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("event_consumer");

    async move {
        info!("Starting event consumer");

        loop {
            // Marks the value seen, so changed() only fires on a later signal
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    debug!("Shutdown signal received");
                    break;
                }

                received = events_rx.recv() => {
                    let Some(first) = received else {
                        info!("Event channel closed");
                        break;
                    };
                    let mut batch = vec![first];
                    while batch.len() < MAX_BATCH {
                        match events_rx.try_recv() {
                            Ok(event) => batch.push(event),
                            Err(_) => break,
                        }
                    }
                    apply_batch(&replicator, batch, &failed_tx, &stats).await;
                }
            }
        }

        let mut pending = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            pending.push(event);
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Applying queued events before shutdown");
            apply_batch(&replicator, pending, &failed_tx, &stats).await;
        }

        info!("Event consumer stopped");
    }
    .instrument(span)
    .await
}

async fn apply_batch<M: MetadataStore>(
    replicator: &Replicator<M>,
    batch: Vec<ObjectEvent>,
    failed_tx: &mpsc::Sender<FailedEvent>,
    stats: &ServiceStats,
) {
    let report = replicator.handle_events(batch).await;

    ServiceStats::add(&stats.events_applied, report.applied);
    ServiceStats::add(&stats.events_noop, report.noops);
    ServiceStats::add(&stats.events_failed, report.failures.len());

    for (event, error) in report.failures {
        match failed_tx.try_send(FailedEvent { event, error }) {
            Ok(()) => {}
            Err(TrySendError::Full(failed)) | Err(TrySendError::Closed(failed)) => {
                error!(
                    object_id = %failed.event.object_id,
                    copy_id = ?failed.event.copy_id,
                    error = %failed.error,
                    "Failed event could not be handed back, dropping it"
                );
                ServiceStats::add(&stats.failures_dropped, 1);
            }
        }
    }
}
