// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch ledger: persisted per-batch progress records.
//!
//! The ledger is the single source of truth for "has this stage run". The
//! master writes one row per ctid; each slave mirrors the master rows it
//! works on under its own identifier.
//!
//! ```text
//! master_batches                       slave_batches
//! ┌──────┬───────┬──────┬──────┐       ┌──────┬───────┬───────┬──────┬──────┐
//! │ ctid │ start │ stop │ bits │       │ ctid │ slave │ start │ stop │ bits │
//! ├──────┼───────┼──────┼──────┤       ├──────┼───────┼───────┼──────┼──────┤
//! │  10  │  100  │ 150  │  7   │ ───►  │  10  │ s1    │  100  │ 150  │ 248  │
//! │  11  │  150  │ 175  │  3   │       └──────┴───────┴───────┴──────┴──────┘
//! └──────┴───────┴──────┴──────┘
//! ```
//!
//! # Stage Bits
//!
//! `mark_stage_complete` performs `sync_bits = sync_bits | bit` in a single
//! statement, so marking is idempotent and bits are never cleared. Nothing is
//! cached across calls: callers re-read before deciding whether prior work is
//! already done.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the master and a slave
//! process share a ledger file. Every statement retries with exponential
//! backoff per [`RetryConfig::ledger`].

use crate::batch::{BatchRecord, LedgerScope, VersionRange};
use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use crate::stage::{Role, Stage, SyncBits};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Boxed future returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Row shape shared by both ledger tables.
type BatchRow = (i64, i64, i64, i64, i64, Option<i64>);

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
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
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    retry: &RetryConfig,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempts);
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                crate::metrics::ledger_retries_total(operation_name);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn millis_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_record(row: BatchRow) -> BatchRecord {
    let (ctid, start_version, stop_version, sync_bits, start_time, stop_time) = row;
    BatchRecord {
        ctid,
        range: VersionRange::new(start_version, stop_version),
        sync_bits: SyncBits::from_raw(sync_bits),
        start_time: millis_to_time(start_time),
        stop_time: stop_time.map(millis_to_time),
    }
}

/// Persisted read/write access to batch progress records.
///
/// Implemented by [`SqliteLedger`]. Orchestrators only talk to the ledger
/// through this trait.
pub trait BatchLedger: Send + Sync {
    /// Most recent record (highest ctid) under the scope.
    fn latest_batch<'a>(&'a self, scope: &'a LedgerScope) -> LedgerFuture<'a, Option<BatchRecord>>;

    /// Record for one ctid under the scope.
    fn batch<'a>(&'a self, scope: &'a LedgerScope, ctid: i64) -> LedgerFuture<'a, Option<BatchRecord>>;

    /// The master record created just before `ctid`.
    fn previous_master_batch(&self, ctid: i64) -> LedgerFuture<'_, Option<BatchRecord>>;

    /// Master records newer than `after_ctid` whose bits contain `required`, oldest first.
    fn pending_batches(&self, after_ctid: i64, required: SyncBits)
        -> LedgerFuture<'_, Vec<BatchRecord>>;

    /// Slave records for `slave` that have not reached the slave terminal
    /// stage or have not been finalized, oldest first.
    fn incomplete_slave_batches<'a>(&'a self, slave: &'a str) -> LedgerFuture<'a, Vec<BatchRecord>>;

    /// Create a master record with no bits set. Returns its ctid.
    fn create_master_batch(&self, range: VersionRange) -> LedgerFuture<'_, i64>;

    /// Create the slave-scoped mirror of a master record, with no bits set.
    fn create_slave_batch<'a>(
        &'a self,
        slave: &'a str,
        master: &'a BatchRecord,
    ) -> LedgerFuture<'a, BatchRecord>;

    /// Move a master record's stop version (retry before capture).
    fn update_stop_version(&self, ctid: i64, stop_version: i64) -> LedgerFuture<'_, ()>;

    /// Set `stage`'s bit. Idempotent. Returns the bits after the update.
    fn mark_stage_complete<'a>(
        &'a self,
        scope: &'a LedgerScope,
        ctid: i64,
        stage: Stage,
    ) -> LedgerFuture<'a, SyncBits>;

    /// Set `stage`'s bit on every listed record in one transaction, so a
    /// group never ends up with the bit on only some of its records.
    fn mark_stage_complete_all<'a>(
        &'a self,
        scope: &'a LedgerScope,
        ctids: &'a [i64],
        stage: Stage,
    ) -> LedgerFuture<'a, ()>;

    /// Current bits for a record.
    fn stage_bits<'a>(&'a self, scope: &'a LedgerScope, ctid: i64) -> LedgerFuture<'a, SyncBits>;

    /// Record the stop time once the terminal stage is done.
    fn finalize_batch<'a>(&'a self, scope: &'a LedgerScope, ctid: i64) -> LedgerFuture<'a, ()>;
}

/// Batch ledger backed by SQLite.
pub struct SqliteLedger {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Busy retry schedule
    retry: RetryConfig,
    /// Path to database file
    path: String,
}

impl SqliteLedger {
    /// Open (or create) a ledger at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    pub async fn new(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening batch ledger");

        let journal_mode = if wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2) // one run at a time per process
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS master_batches (
                ctid INTEGER PRIMARY KEY AUTOINCREMENT,
                start_version INTEGER NOT NULL,
                stop_version INTEGER NOT NULL,
                sync_bits INTEGER NOT NULL DEFAULT 0,
                start_time INTEGER NOT NULL,
                stop_time INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS slave_batches (
                ctid INTEGER NOT NULL,
                slave_identifier TEXT NOT NULL,
                start_version INTEGER NOT NULL,
                stop_version INTEGER NOT NULL,
                sync_bits INTEGER NOT NULL DEFAULT 0,
                start_time INTEGER NOT NULL,
                stop_time INTEGER,
                PRIMARY KEY (ctid, slave_identifier)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            retry: RetryConfig::ledger(),
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Batch ledger closed");
    }

    async fn fetch_optional(
        &self,
        operation: &str,
        sql: &str,
        scope: &LedgerScope,
        ctid: Option<i64>,
    ) -> Result<Option<BatchRecord>> {
        let pool = &self.pool;
        let row: Option<BatchRow> = execute_with_retry(operation, &self.retry, || async {
            let mut query = sqlx::query_as::<_, BatchRow>(sql);
            if let LedgerScope::Slave(slave) = scope {
                query = query.bind(slave.as_str());
            }
            if let Some(ctid) = ctid {
                query = query.bind(ctid);
            }
            query.fetch_optional(pool).await
        })
        .await?;
        Ok(row.map(row_to_record))
    }

    async fn read_bits(&self, scope: &LedgerScope, ctid: i64) -> Result<SyncBits> {
        let pool = &self.pool;
        let bits: Option<(i64,)> = execute_with_retry("ledger_stage_bits", &self.retry, || async {
            match scope {
                LedgerScope::Master => {
                    sqlx::query_as("SELECT sync_bits FROM master_batches WHERE ctid = ?")
                        .bind(ctid)
                        .fetch_optional(pool)
                        .await
                }
                LedgerScope::Slave(slave) => {
                    sqlx::query_as(
                        "SELECT sync_bits FROM slave_batches WHERE slave_identifier = ? AND ctid = ?",
                    )
                    .bind(slave.as_str())
                    .bind(ctid)
                    .fetch_optional(pool)
                    .await
                }
            }
        })
        .await?;

        bits.map(|(raw,)| SyncBits::from_raw(raw)).ok_or_else(|| {
            ReplicationError::Internal(format!("No {} batch record for ctid {}", scope, ctid))
        })
    }
}

const SELECT_MASTER: &str =
    "SELECT ctid, start_version, stop_version, sync_bits, start_time, stop_time FROM master_batches";
const SELECT_SLAVE: &str =
    "SELECT ctid, start_version, stop_version, sync_bits, start_time, stop_time FROM slave_batches";

impl BatchLedger for SqliteLedger {
    fn latest_batch<'a>(&'a self, scope: &'a LedgerScope) -> LedgerFuture<'a, Option<BatchRecord>> {
        Box::pin(async move {
            let sql = match scope {
                LedgerScope::Master => format!("{} ORDER BY ctid DESC LIMIT 1", SELECT_MASTER),
                LedgerScope::Slave(_) => format!(
                    "{} WHERE slave_identifier = ? ORDER BY ctid DESC LIMIT 1",
                    SELECT_SLAVE
                ),
            };
            self.fetch_optional("ledger_latest_batch", &sql, scope, None)
                .await
        })
    }

    fn batch<'a>(&'a self, scope: &'a LedgerScope, ctid: i64) -> LedgerFuture<'a, Option<BatchRecord>> {
        Box::pin(async move {
            let sql = match scope {
                LedgerScope::Master => format!("{} WHERE ctid = ?", SELECT_MASTER),
                LedgerScope::Slave(_) => {
                    format!("{} WHERE slave_identifier = ? AND ctid = ?", SELECT_SLAVE)
                }
            };
            self.fetch_optional("ledger_batch", &sql, scope, Some(ctid))
                .await
        })
    }

    fn previous_master_batch(&self, ctid: i64) -> LedgerFuture<'_, Option<BatchRecord>> {
        Box::pin(async move {
            let sql = format!("{} WHERE ctid < ? ORDER BY ctid DESC LIMIT 1", SELECT_MASTER);
            self.fetch_optional("ledger_previous_batch", &sql, &LedgerScope::Master, Some(ctid))
                .await
        })
    }

    fn pending_batches(
        &self,
        after_ctid: i64,
        required: SyncBits,
    ) -> LedgerFuture<'_, Vec<BatchRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let sql = format!(
                "{} WHERE ctid > ? AND (sync_bits & ?) = ? ORDER BY ctid ASC",
                SELECT_MASTER
            );
            let rows: Vec<BatchRow> =
                execute_with_retry("ledger_pending_batches", &self.retry, || async {
                    sqlx::query_as(&sql)
                        .bind(after_ctid)
                        .bind(required.raw())
                        .bind(required.raw())
                        .fetch_all(pool)
                        .await
                })
                .await?;
            Ok(rows.into_iter().map(row_to_record).collect())
        })
    }

    fn incomplete_slave_batches<'a>(&'a self, slave: &'a str) -> LedgerFuture<'a, Vec<BatchRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let terminal = Role::Slave.terminal_stage().bit().raw();
            let sql = format!(
                "{} WHERE slave_identifier = ? AND ((sync_bits & ?) = 0 OR stop_time IS NULL) ORDER BY ctid ASC",
                SELECT_SLAVE
            );
            let rows: Vec<BatchRow> =
                execute_with_retry("ledger_incomplete_batches", &self.retry, || async {
                    sqlx::query_as(&sql)
                        .bind(slave)
                        .bind(terminal)
                        .fetch_all(pool)
                        .await
                })
                .await?;
            Ok(rows.into_iter().map(row_to_record).collect())
        })
    }

    fn create_master_batch(&self, range: VersionRange) -> LedgerFuture<'_, i64> {
        Box::pin(async move {
            let pool = &self.pool;
            let now = Utc::now().timestamp_millis();
            let result = execute_with_retry("ledger_create_master", &self.retry, || async {
                sqlx::query(
                    r#"
                    INSERT INTO master_batches (start_version, stop_version, sync_bits, start_time)
                    VALUES (?, ?, 0, ?)
                    "#,
                )
                .bind(range.start)
                .bind(range.stop)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            let ctid = result.last_insert_rowid();
            info!(ctid, start_version = range.start, stop_version = range.stop, "Created master batch");
            Ok(ctid)
        })
    }

    fn create_slave_batch<'a>(
        &'a self,
        slave: &'a str,
        master: &'a BatchRecord,
    ) -> LedgerFuture<'a, BatchRecord> {
        Box::pin(async move {
            let pool = &self.pool;
            let now = Utc::now().timestamp_millis();
            execute_with_retry("ledger_create_slave", &self.retry, || async {
                sqlx::query(
                    r#"
                    INSERT INTO slave_batches
                        (ctid, slave_identifier, start_version, stop_version, sync_bits, start_time)
                    VALUES (?, ?, ?, ?, 0, ?)
                    ON CONFLICT(ctid, slave_identifier) DO NOTHING
                    "#,
                )
                .bind(master.ctid)
                .bind(slave)
                .bind(master.range.start)
                .bind(master.range.stop)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            debug!(ctid = master.ctid, slave = %slave, "Created slave batch");
            let scope = LedgerScope::Slave(slave.to_string());
            self.batch(&scope, master.ctid).await?.ok_or_else(|| {
                ReplicationError::Internal(format!("Slave batch {} vanished after insert", master.ctid))
            })
        })
    }

    fn update_stop_version(&self, ctid: i64, stop_version: i64) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            execute_with_retry("ledger_update_stop_version", &self.retry, || async {
                sqlx::query("UPDATE master_batches SET stop_version = ? WHERE ctid = ?")
                    .bind(stop_version)
                    .bind(ctid)
                    .execute(pool)
                    .await
            })
            .await?;
            debug!(ctid, stop_version, "Updated stop version");
            Ok(())
        })
    }

    fn mark_stage_complete<'a>(
        &'a self,
        scope: &'a LedgerScope,
        ctid: i64,
        stage: Stage,
    ) -> LedgerFuture<'a, SyncBits> {
        Box::pin(async move {
            let pool = &self.pool;
            let bit = stage.bit().raw();
            let result = execute_with_retry("ledger_mark_stage", &self.retry, || async {
                match scope {
                    LedgerScope::Master => {
                        sqlx::query("UPDATE master_batches SET sync_bits = sync_bits | ? WHERE ctid = ?")
                            .bind(bit)
                            .bind(ctid)
                            .execute(pool)
                            .await
                    }
                    LedgerScope::Slave(slave) => {
                        sqlx::query(
                            "UPDATE slave_batches SET sync_bits = sync_bits | ? WHERE slave_identifier = ? AND ctid = ?",
                        )
                        .bind(bit)
                        .bind(slave.as_str())
                        .bind(ctid)
                        .execute(pool)
                        .await
                    }
                }
            })
            .await?;

            if result.rows_affected() == 0 {
                return Err(ReplicationError::Internal(format!(
                    "Cannot mark {} on missing {} batch {}",
                    stage, scope, ctid
                )));
            }

            let bits = self.read_bits(scope, ctid).await?;
            debug!(ctid, scope = %scope, stage = %stage, bits = bits.raw(), "Stage marked complete");
            Ok(bits)
        })
    }

    fn mark_stage_complete_all<'a>(
        &'a self,
        scope: &'a LedgerScope,
        ctids: &'a [i64],
        stage: Stage,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            let bit = stage.bit().raw();
            let missing = execute_with_retry("ledger_mark_stage_all", &self.retry, || async {
                let mut tx = pool.begin().await?;
                for &ctid in ctids {
                    let result = match scope {
                        LedgerScope::Master => {
                            sqlx::query("UPDATE master_batches SET sync_bits = sync_bits | ? WHERE ctid = ?")
                                .bind(bit)
                                .bind(ctid)
                                .execute(&mut *tx)
                                .await?
                        }
                        LedgerScope::Slave(slave) => {
                            sqlx::query(
                                "UPDATE slave_batches SET sync_bits = sync_bits | ? WHERE slave_identifier = ? AND ctid = ?",
                            )
                            .bind(bit)
                            .bind(slave.as_str())
                            .bind(ctid)
                            .execute(&mut *tx)
                            .await?
                        }
                    };
                    if result.rows_affected() == 0 {
                        tx.rollback().await?;
                        return Ok(Some(ctid));
                    }
                }
                tx.commit().await?;
                Ok::<_, sqlx::Error>(None)
            })
            .await?;

            if let Some(ctid) = missing {
                return Err(ReplicationError::Internal(format!(
                    "Cannot mark {} on missing {} batch {}",
                    stage, scope, ctid
                )));
            }
            debug!(ctids = ?ctids, scope = %scope, stage = %stage, "Stage marked complete on group");
            Ok(())
        })
    }

    fn stage_bits<'a>(&'a self, scope: &'a LedgerScope, ctid: i64) -> LedgerFuture<'a, SyncBits> {
        Box::pin(self.read_bits(scope, ctid))
    }

    fn finalize_batch<'a>(&'a self, scope: &'a LedgerScope, ctid: i64) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            let now = Utc::now().timestamp_millis();
            execute_with_retry("ledger_finalize", &self.retry, || async {
                match scope {
                    LedgerScope::Master => {
                        sqlx::query(
                            "UPDATE master_batches SET stop_time = ? WHERE ctid = ? AND stop_time IS NULL",
                        )
                        .bind(now)
                        .bind(ctid)
                        .execute(pool)
                        .await
                    }
                    LedgerScope::Slave(slave) => {
                        sqlx::query(
                            "UPDATE slave_batches SET stop_time = ? WHERE slave_identifier = ? AND ctid = ? AND stop_time IS NULL",
                        )
                        .bind(now)
                        .bind(slave.as_str())
                        .bind(ctid)
                        .execute(pool)
                        .await
                    }
                }
            })
            .await?;
            debug!(ctid, scope = %scope, "Batch finalized");
            Ok(())
        })
    }
}
