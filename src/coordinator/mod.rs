// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backup service coordinator.
//!
//! An in-process host that ties together:
//! - The [`Replicator`], fed by an event channel
//! - The [`Cleaner`], run on a fixed schedule
//! - The [`LifecycleLoop`], for on-demand backlog drains
//!
//! # Architecture
//!
//! 1. Events sent with [`BackupService::submit`] (or through
//!    [`BackupService::event_sender`]) are applied in order by one consumer task.
//!    Events that fail come back on [`BackupService::take_failed_events`]
//! 2. If enabled, a scheduled task runs a cleaner pass every interval and
//!    drains with the lifecycle loop when a pass reports more work
//! 3. Shutdown signals both tasks, applies queued events, and closes the
//!    metadata store
//!
//! Every unit of work is safe to re-run, so hosts that bring their own
//! delivery (queues, webhooks, cron) can call the replicator, cleaner and
//! loop directly instead.

mod events;
mod scheduled;
mod types;

pub use types::{FailedEvent, HealthCheck, ServiceState, ServiceStats, StatsSnapshot};

use crate::blob::{BlobStore, ObjectStoreBlobStore};
use crate::circuit_breaker::StoreCircuit;
use crate::cleaner::{CleanupReport, Cleaner};
use crate::clock::{Clock, SystemClock};
use crate::config::BackupConfig;
use crate::error::{BackupError, Result};
use crate::event::ObjectEvent;
use crate::lifecycle::{LifecycleLoop, LoopOutcome};
use crate::metadata::{MetadataStore, SqliteMetadataStore};
use crate::metrics;
use crate::replicator::Replicator;
use crate::resilience::{call_store, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel. `submit` waits when it is full.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Failed events buffered until the host reads them.
pub const FAILED_CHANNEL_CAPACITY: usize = 1024;

/// How long shutdown waits for each task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The backup service.
pub struct BackupService<M: MetadataStore = SqliteMetadataStore> {
    config: BackupConfig,

    /// Service state (broadcast to watchers)
    state_tx: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,

    metadata: Arc<M>,
    circuit: Arc<StoreCircuit>,
    replicator: Arc<Replicator<M>>,
    cleaner: Arc<Cleaner<M>>,
    lifecycle: Arc<LifecycleLoop<M>>,

    events_tx: mpsc::Sender<ObjectEvent>,
    /// Taken by the consumer task on start
    events_rx: Option<mpsc::Receiver<ObjectEvent>>,

    /// Moved into the consumer task on start
    failed_tx: Option<mpsc::Sender<FailedEvent>>,
    failed_rx: Option<mpsc::Receiver<FailedEvent>>,

    stats: Arc<ServiceStats>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    handles: Vec<JoinHandle<()>>,
}

impl BackupService<SqliteMetadataStore> {
    /// Build stores from configuration: DSNs for the blob stores and a
    /// SQLite database for copy records.
    pub async fn from_config(config: BackupConfig) -> Result<Self> {
        config.validate()?;

        let primary = Arc::new(ObjectStoreBlobStore::from_dsn(&config.primary.dsn)?);
        let secondary = Arc::new(ObjectStoreBlobStore::from_dsn(&config.secondary.dsn)?);
        let metadata = if config.metadata.is_in_memory() {
            SqliteMetadataStore::in_memory().await?
        } else {
            SqliteMetadataStore::open(&config.metadata.sqlite_path).await?
        };
        info!(
            primary = %config.primary.dsn,
            secondary = %config.secondary.dsn,
            metadata = %config.metadata.sqlite_path,
            "Stores initialized"
        );

        Ok(Self::with_stores(
            config,
            primary,
            secondary,
            Arc::new(metadata),
            Arc::new(SystemClock),
        ))
    }
}

impl<M: MetadataStore> BackupService<M> {
    /// Build around existing stores.
    ///
    /// The replicator and cleaner share one [`StoreCircuit`].
    pub fn with_stores(
        config: BackupConfig,
        primary: Arc<dyn BlobStore>,
        secondary: Arc<dyn BlobStore>,
        metadata: Arc<M>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (failed_tx, failed_rx) = mpsc::channel(FAILED_CHANNEL_CAPACITY);

        let circuit = Arc::new(StoreCircuit::with_config(config.settings.circuit.to_circuit_config()));
        let replicator = Arc::new(
            Replicator::new(primary, secondary.clone(), metadata.clone(), clock.clone(), &config)
                .with_circuit(circuit.clone()),
        );
        let cleaner = Arc::new(
            Cleaner::new(secondary, metadata.clone(), clock, &config).with_circuit(circuit.clone()),
        );
        let lifecycle = Arc::new(LifecycleLoop::new(cleaner.clone(), &config.settings.lifecycle));

        metrics::set_service_state("Created");

        Self {
            config,
            state_tx,
            state_rx,
            metadata,
            circuit,
            replicator,
            cleaner,
            lifecycle,
            events_tx,
            events_rx: Some(events_rx),
            failed_tx: Some(failed_tx),
            failed_rx: Some(failed_rx),
            stats: Arc::new(ServiceStats::default()),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServiceState::Running)
    }

    pub fn replicator(&self) -> &Arc<Replicator<M>> {
        &self.replicator
    }

    pub fn cleaner(&self) -> &Arc<Cleaner<M>> {
        &self.cleaner
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleLoop<M>> {
        &self.lifecycle
    }

    pub fn metadata(&self) -> &Arc<M> {
        &self.metadata
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Sender for hosts that feed events from their own tasks.
    pub fn event_sender(&self) -> mpsc::Sender<ObjectEvent> {
        self.events_tx.clone()
    }

    /// Receiver for events the consumer task failed to apply, in delivery
    /// order, each with its error.
    ///
    /// `submit` only reports whether an event was queued. Redelivering or
    /// dead-lettering what comes back here is up to the host. Up to
    /// [`FAILED_CHANNEL_CAPACITY`] failures are buffered until read; beyond
    /// that they are logged and counted in `failures_dropped`. The channel
    /// closes once the consumer stops. Returns `None` after the first call.
    pub fn take_failed_events(&mut self) -> Option<mpsc::Receiver<FailedEvent>> {
        self.failed_rx.take()
    }

    /// Queue an event for the consumer task.
    ///
    /// Events may be queued before [`start()`](Self::start); they are
    /// applied once the consumer runs.
    pub async fn submit(&self, event: ObjectEvent) -> Result<()> {
        if matches!(
            self.state(),
            ServiceState::ShuttingDown | ServiceState::Stopped | ServiceState::Failed
        ) {
            return Err(BackupError::Shutdown);
        }
        event.validate()?;
        self.events_tx.send(event).await.map_err(|_| BackupError::Shutdown)
    }

    /// Health snapshot. No store calls.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = state == ServiceState::Running;
        let secondary_writes_circuit_open = self.circuit.writes.is_open();
        let secondary_deletes_circuit_open = self.circuit.deletes.is_open();

        HealthCheck {
            state,
            ready,
            secondary_writes_circuit_open,
            secondary_deletes_circuit_open,
            queued_events: self.events_tx.max_capacity() - self.events_tx.capacity(),
            stats: self.stats.snapshot(),
            healthy: ready && !secondary_writes_circuit_open && !secondary_deletes_circuit_open,
        }
    }

    /// One cleaner pass, outside the schedule.
    pub async fn run_cleaner_once(&self) -> Result<CleanupReport> {
        let report = self.cleaner.run_once().await?;
        ServiceStats::add(&self.stats.cleaner_passes, 1);
        ServiceStats::add(&self.stats.copies_reclaimed, report.reclaimed);
        ServiceStats::add(&self.stats.reclaim_failures, report.failed);
        Ok(report)
    }

    /// Run one lifecycle loop to drain the disowned backlog.
    pub async fn drain(&self) -> Result<LoopOutcome> {
        match self.lifecycle.run().await {
            Ok(outcome) => {
                ServiceStats::add(&self.stats.cleaner_passes, outcome.passes as usize);
                ServiceStats::add(&self.stats.copies_reclaimed, outcome.reclaimed);
                ServiceStats::add(&self.stats.reclaim_failures, outcome.failed);
                Ok(outcome)
            }
            Err(e) => {
                if let BackupError::LifecycleTimeout { passes, reclaimed, .. } = &e {
                    ServiceStats::add(&self.stats.cleaner_passes, *passes as usize);
                    ServiceStats::add(&self.stats.copies_reclaimed, *reclaimed);
                }
                Err(e)
            }
        }
    }

    /// Start the service.
    ///
    /// 1. Checks the metadata store answers
    /// 2. Spawns the event consumer
    /// 3. Spawns the scheduled cleaner (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ServiceState::Created {
            return Err(BackupError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            secondary = %self.config.secondary.dsn,
            retention_secs = self.cleaner.retention_secs(),
            schedule_enabled = self.config.settings.schedule.enabled,
            "Starting backup service"
        );

        let probe = call_store(
            Store::Metadata,
            "probe",
            self.config.store_timeout_duration(),
            self.metadata.query_disowned(i64::MIN, 1),
        )
        .await;
        if let Err(e) = probe {
            error!(error = %e, "Metadata store unavailable");
            let _ = self.state_tx.send(ServiceState::Failed);
            metrics::set_service_state("Failed");
            return Err(e);
        }

        let (Some(events_rx), Some(failed_tx)) = (self.events_rx.take(), self.failed_tx.take()) else {
            return Err(BackupError::Internal("event channels already taken".to_string()));
        };
        self.handles.push(tokio::spawn(events::run_event_consumer(
            self.replicator.clone(),
            events_rx,
            failed_tx,
            self.stats.clone(),
            self.shutdown_rx.clone(),
        )));

        if self.config.settings.schedule.enabled {
            self.handles.push(tokio::spawn(scheduled::run_scheduled_cleaner(
                self.cleaner.clone(),
                self.lifecycle.clone(),
                self.config.settings.schedule.interval_duration(),
                self.stats.clone(),
                self.shutdown_rx.clone(),
            )));
        }

        let _ = self.state_tx.send(ServiceState::Running);
        metrics::set_service_state("Running");
        info!(tasks = self.handles.len(), "Backup service running");
        Ok(())
    }

    /// Shutdown the service gracefully.
    ///
    /// 1. Signal tasks to stop
    /// 2. Wait for them (queued events are applied first), with a timeout
    /// 3. Close the metadata store
    pub async fn shutdown(&mut self) {
        info!("Shutting down backup service");
        let _ = self.state_tx.send(ServiceState::ShuttingDown);
        metrics::set_service_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Err(e) = self.metadata.close().await {
            warn!(error = %e, "Failed to close metadata store");
        }

        let _ = self.state_tx.send(ServiceState::Stopped);
        metrics::set_service_state("Stopped");
        info!("Backup service stopped");
    }
}
