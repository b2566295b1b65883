// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduled cleaner: one pass per interval, plus a lifecycle-loop drain
//! when a pass reports that more work remains.

use super::types::ServiceStats;
use crate::cleaner::Cleaner;
use crate::error::BackupError;
use crate::lifecycle::{LifecycleLoop, LoopPayload};
use crate::metadata::MetadataStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

pub(super) async fn run_scheduled_cleaner<M: MetadataStore>(
    cleaner: Arc<Cleaner<M>>,
    lifecycle: Arc<LifecycleLoop<M>>,
    interval: Duration,
    stats: Arc<ServiceStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("scheduled_cleaner");

    async move {
        info!(interval_secs = interval.as_secs(), "Starting scheduled cleaner");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        timer.tick().await;

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    debug!("Shutdown signal received");
                    break;
                }

                _ = timer.tick() => {
                    let report = match cleaner.run_once().await {
                        Ok(report) => report,
                        Err(e) => {
                            warn!(error = %e, "Scheduled cleaner pass failed");
                            continue;
                        }
                    };
                    ServiceStats::add(&stats.cleaner_passes, 1);
                    ServiceStats::add(&stats.copies_reclaimed, report.reclaimed);
                    ServiceStats::add(&stats.reclaim_failures, report.failed);

                    if !report.remaining {
                        continue;
                    }

                    debug!("Backlog remains, draining with lifecycle loop");
                    let payload = LoopPayload { continue_flag: Some(true) };
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.changed() => {
                            info!("Shutdown during drain, remaining backlog left for next start");
                            break;
                        }

                        result = lifecycle.run_from(payload) => match result {
                            Ok(outcome) => {
                                ServiceStats::add(&stats.cleaner_passes, outcome.passes as usize);
                                ServiceStats::add(&stats.copies_reclaimed, outcome.reclaimed);
                                ServiceStats::add(&stats.reclaim_failures, outcome.failed);
                            }
                            Err(BackupError::LifecycleTimeout { passes, reclaimed, .. }) => {
                                ServiceStats::add(&stats.cleaner_passes, passes as usize);
                                ServiceStats::add(&stats.copies_reclaimed, reclaimed);
                            }
                            Err(e) => warn!(error = %e, "Drain failed"),
                        }
                    }
                }
            }
        }

        info!("Scheduled cleaner stopped");
    }
    .instrument(span)
    .await
}
