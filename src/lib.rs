// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Object Backup
//!
//! Event-driven backup of objects from a primary blob store into a
//! secondary one, with per-copy metadata and time-delayed reclamation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             object-backup                                │
//! │                                                                          │
//! │  ObjectEvent ──► ┌────────────┐  get   ┌─────────┐                       │
//! │  (CREATED,       │ Replicator │◄───────│ Primary │                       │
//! │   REMOVED,       │            │  put   ┌───────────┐                     │
//! │   REMOVED_ALL)   │            │───────►│ Secondary │◄──┐ delete          │
//! │                  └────────────┘        └───────────┘   │                 │
//! │                        │ put / disown                  │                 │
//! │                        ▼                        ┌─────────────┐          │
//! │                  ┌───────────────┐   query ◄────│   Cleaner   │          │
//! │                  │ MetadataStore │──────────────│ (one pass)  │          │
//! │                  │ (SQLite)      │   delete     └─────────────┘          │
//! │                  └───────────────┘                     ▲                 │
//! │                                                ┌───────────────┐         │
//! │                                                │ LifecycleLoop │         │
//! │                                                └───────────────┘         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Copy lifecycle
//!
//! 1. **CREATED**: the object is read from the primary, written to the
//!    secondary, then recorded as owned. Blob first, record second.
//! 2. **REMOVED / REMOVED_ALL**: records are marked disowned with a
//!    timestamp. The blob stays.
//! 3. **Cleaner**: copies disowned longer than the retention window are
//!    deleted from the secondary, then their records are removed.
//!
//! Every step is idempotent, so redelivered events and re-run passes are safe.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use object_backup::{BackupConfig, BackupService, ObjectEvent};
//!
//! #[tokio::main]
//! async fn main() -> object_backup::Result<()> {
//!     let config = BackupConfig::from_file("backup.yaml")?;
//!     let mut service = BackupService::from_config(config).await?;
//!     service.start().await?;
//!
//!     service.submit(ObjectEvent::created("photos/cat.jpg", "v1")).await?;
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod circuit_breaker;
pub mod cleaner;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod metadata;
pub mod metrics;
pub mod record;
pub mod replicator;
pub mod resilience;

// Re-exports for convenience
pub use blob::{BlobStore, DeleteOutcome, ObjectStoreBlobStore};
pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitConfig, CircuitError, StoreCircuit};
pub use cleaner::{Cleaner, CleanupReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackupConfig, BackupSettings, CleanerConfig, LifecycleConfig, ReplicatorConfig, ScheduleConfig};
pub use coordinator::{BackupService, FailedEvent, HealthCheck, ServiceState, StatsSnapshot};
pub use error::{BackupError, Result, StoreError};
pub use event::{EventType, ObjectEvent};
pub use lifecycle::{LifecycleLoop, LoopOutcome, LoopPayload, LoopState};
pub use metadata::{InMemoryMetadataStore, MetadataStore, SqliteMetadataStore};
pub use record::{CopyRecord, DisownOutcome, DisownStatus};
pub use replicator::{BatchReport, CreateOutcome, EventOutcome, Replicator};
