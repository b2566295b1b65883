// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed metadata store.
//!
//! # Schema
//!
//! ```text
//! copy_records
//! ├── (object_id, copy_id)      PRIMARY KEY
//! ├── disown_status  INTEGER    0 = owned, 1 = disowned
//! ├── disown_timestamp INTEGER  NULL while owned
//! ├── location / replicated_at / size
//! └── INDEX disown_index (disown_status, disown_timestamp)
//! ```
//!
//! The disown index lets the cleaner walk disowned rows oldest first
//! without touching owned rows.
//!
//! # Monotonic Disown
//!
//! Both the upsert and the disown update are single statements whose
//! conditions only ever move `disown_status` from 0 to 1, so concurrent
//! writers cannot revive a disowned copy or move its timestamp.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (max 5
//! attempts). This is local lock contention only; collaborator failures are
//! never retried here.

use super::MetadataStore;
use crate::blob::{BoxFuture, StoreResult};
use crate::error::{BackupError, Result, StoreError};
use crate::record::{CopyRecord, DisownOutcome, DisownStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SELECT_COLUMNS: &str =
    "object_id, copy_id, disown_status, disown_timestamp, location, replicated_at, size";

type RecordRow = (String, String, i64, Option<i64>, String, i64, i64);

fn record_from_row(row: RecordRow) -> StoreResult<CopyRecord> {
    let (object_id, copy_id, status, disown_timestamp, location, replicated_at, size) = row;
    let flag = u8::try_from(status).map_err(|_| StoreError(format!("invalid disown flag {status}")))?;
    Ok(CopyRecord {
        object_id,
        copy_id,
        disown_status: DisownStatus::try_from(flag).map_err(StoreError)?,
        disown_timestamp,
        location,
        replicated_at,
        size: u64::try_from(size).unwrap_or_default(),
    })
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::metadata_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Durable metadata store backed by SQLite.
pub struct SqliteMetadataStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening metadata store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| BackupError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, path_str).await
    }

    /// Private in-memory database (single connection, so every query sees
    /// the same data).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| BackupError::Config(format!("Invalid SQLite path: {}", e)))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, ":memory:".to_string()).await
    }

    async fn with_pool(pool: SqlitePool, path: String) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copy_records (
                object_id TEXT NOT NULL,
                copy_id TEXT NOT NULL,
                disown_status INTEGER NOT NULL DEFAULT 0,
                disown_timestamp INTEGER,
                location TEXT NOT NULL,
                replicated_at INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (object_id, copy_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS disown_index ON copy_records (disown_status, disown_timestamp)",
        )
        .execute(&pool)
        .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM copy_records")
            .fetch_one(&pool)
            .await?;
        if count > 0 {
            info!(count, "Loaded existing copy records");
        }

        Ok(Self { pool, path })
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of records (all states).
    pub async fn count(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM copy_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("metadata_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

impl MetadataStore for SqliteMetadataStore {
    fn put(&self, record: CopyRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            execute_with_retry("metadata_put", || async {
                sqlx::query(
                    r#"
                    INSERT INTO copy_records
                        (object_id, copy_id, disown_status, disown_timestamp, location, replicated_at, size)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(object_id, copy_id) DO UPDATE SET
                        location = excluded.location,
                        replicated_at = excluded.replicated_at,
                        size = excluded.size,
                        disown_timestamp = CASE
                            WHEN copy_records.disown_status = 1 THEN copy_records.disown_timestamp
                            ELSE excluded.disown_timestamp
                        END,
                        disown_status = MAX(copy_records.disown_status, excluded.disown_status)
                    "#,
                )
                .bind(&record.object_id)
                .bind(&record.copy_id)
                .bind(i64::from(record.disown_status.as_flag()))
                .bind(record.disown_timestamp)
                .bind(&record.location)
                .bind(record.replicated_at)
                .bind(record.size as i64)
                .execute(pool)
                .await
            })
            .await?;
            Ok(())
        })
    }

    fn get(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, Option<CopyRecord>> {
        let object_id = object_id.to_string();
        let copy_id = copy_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let sql = format!("SELECT {SELECT_COLUMNS} FROM copy_records WHERE object_id = ? AND copy_id = ?");
            let row: Option<RecordRow> = execute_with_retry("metadata_get", || async {
                sqlx::query_as(&sql)
                    .bind(&object_id)
                    .bind(&copy_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
            row.map(record_from_row).transpose()
        })
    }

    fn delete(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, bool> {
        let object_id = object_id.to_string();
        let copy_id = copy_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("metadata_delete", || async {
                sqlx::query("DELETE FROM copy_records WHERE object_id = ? AND copy_id = ?")
                    .bind(&object_id)
                    .bind(&copy_id)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn disown(&self, object_id: &str, copy_id: &str, at: i64) -> BoxFuture<'_, DisownOutcome> {
        let object_id = object_id.to_string();
        let copy_id = copy_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("metadata_disown", || async {
                sqlx::query(
                    r#"
                    UPDATE copy_records
                    SET disown_status = 1, disown_timestamp = ?
                    WHERE object_id = ? AND copy_id = ? AND disown_status = 0
                    "#,
                )
                .bind(at)
                .bind(&object_id)
                .bind(&copy_id)
                .execute(pool)
                .await
            })
            .await?;

            if result.rows_affected() > 0 {
                return Ok(DisownOutcome::Disowned);
            }

            let exists: Option<(i64,)> = execute_with_retry("metadata_disown_check", || async {
                sqlx::query_as("SELECT 1 FROM copy_records WHERE object_id = ? AND copy_id = ?")
                    .bind(&object_id)
                    .bind(&copy_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

            Ok(match exists {
                Some(_) => DisownOutcome::AlreadyDisowned,
                None => DisownOutcome::Absent,
            })
        })
    }

    fn copies_of(&self, object_id: &str) -> BoxFuture<'_, Vec<CopyRecord>> {
        let object_id = object_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let sql = format!("SELECT {SELECT_COLUMNS} FROM copy_records WHERE object_id = ? ORDER BY copy_id");
            let rows: Vec<RecordRow> = execute_with_retry("metadata_copies_of", || async {
                sqlx::query_as(&sql).bind(&object_id).fetch_all(pool).await
            })
            .await?;
            rows.into_iter().map(record_from_row).collect()
        })
    }

    fn query_disowned(&self, older_than: i64, limit: usize) -> BoxFuture<'_, Vec<CopyRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM copy_records INDEXED BY disown_index \
                 WHERE disown_status = 1 AND disown_timestamp < ? \
                 ORDER BY disown_timestamp ASC, object_id ASC, copy_id ASC LIMIT ?"
            );
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows: Vec<RecordRow> = execute_with_retry("metadata_query_disowned", || async {
                sqlx::query_as(&sql).bind(older_than).bind(limit).fetch_all(pool).await
            })
            .await?;
            rows.into_iter().map(record_from_row).collect()
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.path != ":memory:" {
                if let Err(e) = self.checkpoint().await {
                    warn!(error = %e, "Failed to checkpoint WAL on close");
                }
            }
            self.pool.close().await;
            info!("Metadata store closed");
            Ok(())
        })
    }
}
