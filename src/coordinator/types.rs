// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service state types.
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Created ──────────────→ Running
//!    │                       │
//!    │ (store init fails)    │ shutdown()
//!    ↓                       ↓
//! Failed               ShuttingDown
//!                            │
//!                            ↓
//!                         Stopped
//! ```
//!
//! - **Created**: Built, no tasks spawned.
//! - **Running**: Event consumer and (optionally) the scheduled cleaner are live.
//! - **ShuttingDown**: Tasks signalled; queued events are being applied.
//! - **Stopped**: Tasks joined and the metadata store closed.
//! - **Failed**: Startup error. Check logs.

use crate::error::BackupError;
use crate::event::ObjectEvent;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of the backup service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    /// Call [`start()`](super::BackupService::start) to spawn tasks.
    Created,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "Created"),
            ServiceState::Running => write!(f, "Running"),
            ServiceState::ShuttingDown => write!(f, "ShuttingDown"),
            ServiceState::Stopped => write!(f, "Stopped"),
            ServiceState::Failed => write!(f, "Failed"),
        }
    }
}

/// Running totals kept by the service tasks.
#[derive(Debug, Default)]
pub struct ServiceStats {
    pub events_applied: AtomicU64,
    pub events_noop: AtomicU64,
    pub events_failed: AtomicU64,
    /// Failures that could not be handed back because the buffer was full.
    pub failures_dropped: AtomicU64,
    pub cleaner_passes: AtomicU64,
    pub copies_reclaimed: AtomicU64,
    pub reclaim_failures: AtomicU64,
}

impl ServiceStats {
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_noop: self.events_noop.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            failures_dropped: self.failures_dropped.load(Ordering::Relaxed),
            cleaner_passes: self.cleaner_passes.load(Ordering::Relaxed),
            copies_reclaimed: self.copies_reclaimed.load(Ordering::Relaxed),
            reclaim_failures: self.reclaim_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_applied: u64,
    pub events_noop: u64,
    pub events_failed: u64,
    pub failures_dropped: u64,
    pub cleaner_passes: u64,
    pub copies_reclaimed: u64,
    pub reclaim_failures: u64,
}

/// An event the consumer task could not apply.
///
/// Handed back through [`BackupService::take_failed_events`](super::BackupService::take_failed_events)
/// so the host can redeliver it or dead-letter it.
#[derive(Debug)]
pub struct FailedEvent {
    pub event: ObjectEvent,
    pub error: BackupError,
}

impl FailedEvent {
    /// Whether redelivering the event may succeed.
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Health snapshot for monitoring endpoints.
///
/// Built from cached state only; no store calls.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: ServiceState,
    /// Running and accepting events.
    pub ready: bool,
    pub secondary_writes_circuit_open: bool,
    pub secondary_deletes_circuit_open: bool,
    /// Events waiting in the channel.
    pub queued_events: usize,
    pub stats: StatsSnapshot,
    /// Ready and neither circuit is open.
    pub healthy: bool,
}
