// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breakers in front of the secondary store.
//!
//! When the backup destination starts failing, a cleaner pass would
//! otherwise issue one doomed delete per candidate, and every creation
//! event would wait out its own store timeout. A tripped breaker fails
//! those calls fast with [`BackupError::CircuitOpen`]; the work is picked
//! up again by redelivery or the next pass. Nothing is retried here.
//!
//! Tripping uses `recloser`: the breaker opens once the last
//! `failure_threshold` calls failed at a rate of 50% or more, stays open
//! for `reset_timeout`, then lets `success_threshold` probes through.
//!
//! ```rust,no_run
//! # async fn example() -> object_backup::Result<()> {
//! use object_backup::circuit_breaker::StoreCircuit;
//!
//! let circuit = StoreCircuit::new();
//! let deleted = circuit.deletes.guard(async { Ok(true) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::BackupError;
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failure from a call made through [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit open, call not attempted")]
    Rejected,

    #[error(transparent)]
    Inner(E),
}

/// Trip and recovery thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Size of the window of recent calls judged for tripping.
    pub failure_threshold: u32,
    /// Probe calls let through while half-open.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    #[must_use]
    pub fn with_failure_threshold(failure_threshold: u32) -> Self {
        Self {
            failure_threshold,
            ..Self::default()
        }
    }
}

/// Call counts for one breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl BreakerStats {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.rejected
    }
}

/// One named breaker.
pub struct CircuitBreaker {
    name: &'static str,
    recloser: AsyncRecloser,
    /// Set by a rejection, cleared by the next call that gets through.
    open: AtomicBool,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: &CircuitConfig) -> Self {
        // closed_len sizes a ring buffer, keep it bounded
        let window = config.failure_threshold.clamp(1, 10_000) as usize;
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(window)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.reset_timeout)
            .build();

        Self {
            name,
            recloser: AsyncRecloser::from(recloser),
            open: AtomicBool::new(false),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `f` unless the breaker is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let result = self.recloser.call(f()).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(RecloserError::Inner(_)) => "failure",
            Err(RecloserError::Rejected) => "rejected",
        };
        metrics::record_circuit_call(self.name, outcome);

        match result {
            Ok(value) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                if self.open.swap(false, Ordering::Relaxed) {
                    info!(circuit = self.name, "Circuit closed, store calls succeeding again");
                }
                Ok(value)
            }
            Err(RecloserError::Inner(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.open.store(false, Ordering::Relaxed);
                debug!(circuit = self.name, "Guarded call failed");
                Err(CircuitError::Inner(e))
            }
            Err(RecloserError::Rejected) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                if !self.open.swap(true, Ordering::Relaxed) {
                    warn!(circuit = self.name, "Circuit open, failing store calls fast");
                }
                Err(CircuitError::Rejected)
            }
        }
    }

    /// Run a backup operation through the breaker. A rejection becomes
    /// [`BackupError::CircuitOpen`].
    pub async fn guard<T, Fut>(&self, fut: Fut) -> Result<T, BackupError>
    where
        Fut: Future<Output = Result<T, BackupError>>,
    {
        self.call(|| fut).await.map_err(|e| match e {
            CircuitError::Rejected => BackupError::CircuitOpen {
                circuit: self.name.to_string(),
            },
            CircuitError::Inner(e) => e,
        })
    }

    /// Whether the most recent call was rejected.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Breakers for the secondary store, shared by the replicator and cleaner.
///
/// Writes and deletes trip independently so a burst of failed deletes
/// does not stop new backups from being taken.
pub struct StoreCircuit {
    pub writes: CircuitBreaker,
    pub deletes: CircuitBreaker,
}

impl Default for StoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreCircuit {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            writes: CircuitBreaker::new("secondary_writes", &config),
            deletes: CircuitBreaker::new("secondary_deletes", &config),
        }
    }

    pub fn any_open(&self) -> bool {
        self.writes.is_open() || self.deletes.is_open()
    }
}
