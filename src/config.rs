// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the backup service.
//!
//! Read once at process start and never mutated afterwards. Can be built
//! programmatically or deserialized from YAML/JSON, then overlaid with
//! `OBJECT_BACKUP_*` environment variables.
//!
//! # Quick Start
//!
//! ```rust
//! use object_backup::config::BackupConfig;
//!
//! let config = BackupConfig::for_testing();
//! assert_eq!(config.settings.cleaner.page_size, 100);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! BackupConfig
//! ├── primary: StoreConfig            # Source object store (DSN)
//! ├── secondary: SecondaryConfig      # Backup destination (DSN + key prefix)
//! ├── metadata: MetadataConfig        # SQLite copy-record database
//! ├── settings: BackupSettings
//! │   ├── replicator: ReplicatorConfig
//! │   ├── cleaner: CleanerConfig      # Retention window, page size
//! │   ├── lifecycle: LifecycleConfig  # Wait interval, overall timeout
//! │   ├── schedule: ScheduleConfig    # Periodic cleaner pass
//! │   └── circuit: CircuitSettings    # Secondary-store breaker
//! └── store_timeout: String           # Per-call deadline
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! primary:
//!   dsn: "s3://minio:9000/uploads"
//! secondary:
//!   dsn: "s3://minio:9000/backups"
//!   prefix: "replica"
//! metadata:
//!   sqlite_path: "/var/lib/backup/copies.db"
//! settings:
//!   cleaner:
//!     retention_window: "7d"
//!     page_size: 500
//!   lifecycle:
//!     wait_interval: "5s"
//!     timeout: "1h"
//! store_timeout: "30s"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "OBJECT_BACKUP_";

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `BackupService::from_config()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Where objects are first written.
    #[serde(default)]
    pub primary: StoreConfig,

    /// Where copies are replicated to.
    #[serde(default)]
    pub secondary: SecondaryConfig,

    /// Copy-record persistence.
    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub settings: BackupSettings,

    /// Deadline for a single store call (e.g. "30s").
    #[serde(default = "default_store_timeout")]
    pub store_timeout: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            primary: StoreConfig::default(),
            secondary: SecondaryConfig::default(),
            metadata: MetadataConfig::default(),
            settings: BackupSettings::default(),
            store_timeout: default_store_timeout(),
        }
    }
}

impl BackupConfig {
    /// In-memory stores everywhere, schedule disabled.
    pub fn for_testing() -> Self {
        Self {
            primary: StoreConfig::memory(),
            secondary: SecondaryConfig {
                dsn: "memory://".to_string(),
                prefix: None,
            },
            metadata: MetadataConfig::in_memory(),
            settings: BackupSettings {
                schedule: ScheduleConfig {
                    enabled: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            store_timeout: default_store_timeout(),
        }
    }

    /// Parse a YAML (or JSON) document.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml_ng::from_str(raw)
            .map_err(|e| BackupError::Config(format!("Invalid configuration: {}", e)))
    }

    /// Load from a YAML/JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    /// Defaults overlaid with `OBJECT_BACKUP_*` environment variables, validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a key lookup (normally the process environment).
    ///
    /// Keys are `OBJECT_BACKUP_` followed by the setting name, e.g.
    /// `OBJECT_BACKUP_RETENTION_WINDOW=7d`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("PRIMARY_DSN") {
            self.primary.dsn = v;
        }
        if let Some(v) = get("SECONDARY_DSN") {
            self.secondary.dsn = v;
        }
        if let Some(v) = get("SECONDARY_PREFIX") {
            self.secondary.prefix = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = get("METADATA_PATH") {
            self.metadata.sqlite_path = v;
        }
        if let Some(v) = get("RETENTION_WINDOW") {
            self.settings.cleaner.retention_window = v;
        }
        if let Some(v) = get("PAGE_SIZE") {
            self.settings.cleaner.page_size = parse_override("PAGE_SIZE", &v)?;
        }
        if let Some(v) = get("WAIT_INTERVAL") {
            self.settings.lifecycle.wait_interval = v;
        }
        if let Some(v) = get("LOOP_TIMEOUT") {
            self.settings.lifecycle.timeout = v;
        }
        if let Some(v) = get("MAX_COPIES_PER_OBJECT") {
            self.settings.replicator.max_copies_per_object = Some(parse_override("MAX_COPIES_PER_OBJECT", &v)?);
        }
        if let Some(v) = get("SCHEDULE_ENABLED") {
            self.settings.schedule.enabled = parse_override("SCHEDULE_ENABLED", &v)?;
        }
        if let Some(v) = get("SCHEDULE_INTERVAL") {
            self.settings.schedule.interval = v;
        }
        if let Some(v) = get("STORE_TIMEOUT") {
            self.store_timeout = v;
        }
        Ok(())
    }

    /// Check that every value parses and is in range.
    pub fn validate(&self) -> Result<()> {
        if self.primary.dsn.trim().is_empty() {
            return Err(BackupError::Config("primary.dsn is empty".to_string()));
        }
        if self.secondary.dsn.trim().is_empty() {
            return Err(BackupError::Config("secondary.dsn is empty".to_string()));
        }
        if self.metadata.sqlite_path.trim().is_empty() {
            return Err(BackupError::Config("metadata.sqlite_path is empty".to_string()));
        }

        check_duration("settings.cleaner.retention_window", &self.settings.cleaner.retention_window, true)?;
        check_duration("settings.lifecycle.wait_interval", &self.settings.lifecycle.wait_interval, true)?;
        check_duration("settings.lifecycle.timeout", &self.settings.lifecycle.timeout, false)?;
        check_duration("settings.schedule.interval", &self.settings.schedule.interval, false)?;
        check_duration("settings.circuit.reset_timeout", &self.settings.circuit.reset_timeout, false)?;
        check_duration("store_timeout", &self.store_timeout, false)?;

        if self.settings.cleaner.page_size == 0 {
            return Err(BackupError::Config("settings.cleaner.page_size must be at least 1".to_string()));
        }
        if self.settings.replicator.max_copies_per_object == Some(0) {
            return Err(BackupError::Config(
                "settings.replicator.max_copies_per_object must be at least 1".to_string(),
            ));
        }
        if self.settings.circuit.failure_threshold == 0 {
            return Err(BackupError::Config("settings.circuit.failure_threshold must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Parse the store_timeout string to a Duration.
    pub fn store_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.store_timeout).unwrap_or(Duration::from_secs(30))
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BackupError::Config(format!("{ENV_PREFIX}{name}={value}: {e}")))
}

fn check_duration(field: &str, value: &str, allow_zero: bool) -> Result<()> {
    let parsed = humantime::parse_duration(value)
        .map_err(|e| BackupError::Config(format!("{field}: invalid duration '{value}': {e}")))?;
    if !allow_zero && parsed.is_zero() {
        return Err(BackupError::Config(format!("{field} must be greater than zero")));
    }
    Ok(())
}

fn default_store_timeout() -> String {
    "30s".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stores
// ═══════════════════════════════════════════════════════════════════════════════

/// Object store addressed by DSN (`memory://`, `file:///path`, `s3://host/bucket`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub dsn: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            dsn: "memory://".to_string(),
        }
    }
}

/// Backup destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryConfig {
    pub dsn: String,

    /// Key prefix for replicated blobs: `{prefix}/{object_id}/{copy_id}`.
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            dsn: "memory://".to_string(),
            prefix: None,
        }
    }
}

/// Copy-record persistence.
///
/// `":memory:"` keeps the SQLite database in process (lost on exit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_sqlite_path() -> String {
    "backup_copies.db".to_string()
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl MetadataConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackupSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupSettings {
    #[serde(default)]
    pub replicator: ReplicatorConfig,
    #[serde(default)]
    pub cleaner: CleanerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub circuit: CircuitSettings,
}

/// Replicator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Keep at most this many live copies per object; older ones are
    /// pruned after each successful replication. `None` keeps every copy.
    #[serde(default)]
    pub max_copies_per_object: Option<usize>,
}

/// Cleaner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Minimum age of a disown before the copy may be reclaimed (e.g. "7d").
    #[serde(default = "default_retention_window")]
    pub retention_window: String,

    /// Maximum candidates fetched per pass.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_retention_window() -> String {
    "10s".to_string()
}

fn default_page_size() -> usize {
    100
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            retention_window: default_retention_window(),
            page_size: default_page_size(),
        }
    }
}

impl CleanerConfig {
    pub fn retention_window_duration(&self) -> Duration {
        humantime::parse_duration(&self.retention_window).unwrap_or(Duration::from_secs(10))
    }

    /// Retention window in whole epoch seconds, as compared against disown
    /// timestamps. Fractions round up so a copy is never kept for less than
    /// the configured window.
    pub fn retention_secs(&self) -> i64 {
        let window = self.retention_window_duration();
        let secs = window.as_secs().saturating_add(u64::from(window.subsec_nanos() > 0));
        i64::try_from(secs).unwrap_or(i64::MAX)
    }
}

/// Lifecycle loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Pause between cleaner passes.
    #[serde(default = "default_wait_interval")]
    pub wait_interval: String,

    /// Wall-clock ceiling for a whole drain.
    #[serde(default = "default_loop_timeout")]
    pub timeout: String,
}

fn default_wait_interval() -> String {
    "5s".to_string()
}

fn default_loop_timeout() -> String {
    "1h".to_string()
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            wait_interval: default_wait_interval(),
            timeout: default_loop_timeout(),
        }
    }
}

impl LifecycleConfig {
    pub fn wait_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.wait_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(3600))
    }
}

/// Periodic cleaner pass run by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_schedule_interval")]
    pub interval: String,
}

fn default_true() -> bool {
    true
}

fn default_schedule_interval() -> String {
    "60s".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_schedule_interval(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }
}

/// Circuit breaker settings for secondary-store calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Failures within the window before the circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,

    /// Successful probes needed to close again.
    #[serde(default = "default_circuit_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_circuit_reset_timeout")]
    pub reset_timeout: String,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_success_threshold() -> u32 {
    2
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_failure_threshold(),
            success_threshold: default_circuit_success_threshold(),
            reset_timeout: default_circuit_reset_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            reset_timeout: humantime::parse_duration(&self.reset_timeout)
                .unwrap_or(Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
