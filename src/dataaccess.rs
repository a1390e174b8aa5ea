// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database collaborator interface.
//!
//! Everything the orchestrators need from the master, relay and slave
//! databases goes through [`DataUtils`]: version queries, introspection,
//! change capture, schema change storage and the row-level primitives the
//! table copiers in [`crate::copy`] build on. Databases are addressed by
//! name; an implementation routes each name to the right connection.
//!
//! The embedding application provides a real implementation per database
//! engine. [`NoOpDataUtils`] logs every call and touches nothing, for dry
//! runs of the standalone binary.
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_replicator::dataaccess::DataUtils;
//!
//! async fn ceiling(data: &dyn DataUtils) -> i64 {
//!     data.current_version("CT_MASTER").await.unwrap_or(0)
//! }
//! ```

use crate::batch::VersionRange;
use crate::error::ReplicationError;
use crate::schema::{ColumnInfo, RawDdlEvent, SchemaChangeDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type for collaborator operations.
pub type DataResult<T> = std::result::Result<T, DataError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = DataResult<T>> + Send + 'a>>;

/// One row of table data, in column order.
pub type Row = Vec<serde_json::Value>;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// The object (usually a change table) does not exist.
    ///
    /// Routine for batches in which a table had no changes.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl DataError {
    pub fn failed(message: impl ToString) -> Self {
        Self::Failed(message.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Attach the failing operation name.
    pub fn during(self, operation: &str) -> ReplicationError {
        ReplicationError::data_access(operation, self)
    }
}

/// Database engine flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    SqlServer,
    MySql,
    Netezza,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::SqlServer => "sqlserver",
            EngineKind::MySql => "mysql",
            EngineKind::Netezza => "netezza",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture one table's changes for a version range into a change table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub db: String,
    pub schema_name: String,
    pub table: String,
    /// Destination change table, created by the capture.
    pub change_table: String,
    pub range: VersionRange,
    /// Column expressions to select from the base table.
    pub select_list: String,
    /// Join predicate between the change rows and the base table.
    pub primary_key_join: String,
}

/// Merge several per-batch change tables into one, latest change per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidateRequest {
    pub db: String,
    pub table: String,
    /// Source change tables, oldest batch first.
    pub sources: Vec<String>,
    /// Destination table, dropped and recreated.
    pub destination: String,
    pub primary_keys: Vec<String>,
}

/// Apply a change table's rows to the destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub db: String,
    pub schema_name: String,
    pub table: String,
    pub change_table: String,
    pub columns: Vec<String>,
    pub primary_keys: Vec<String>,
}

/// Append a change table's rows to a table's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub db: String,
    pub table: String,
    pub change_table: String,
    pub history_table: String,
}

/// Trait defining what we need from the databases.
///
/// Every method is idempotent from the caller's point of view: creating a
/// table drops any previous copy first, capture re-derives from the
/// requested range.
pub trait DataUtils: Send + Sync + 'static {
    /// Current change-tracking version of a database.
    fn current_version<'a>(&'a self, db: &'a str) -> BoxFuture<'a, i64>;

    /// Oldest version change tracking still holds for a table.
    fn min_valid_version<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, i64>;

    fn table_exists<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, bool>;

    /// Live columns of a table, in ordinal order.
    fn columns<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, Vec<ColumnInfo>>;

    /// Capture changes into `request.change_table`. Returns rows captured.
    fn capture_changes<'a>(&'a self, request: &'a CaptureRequest) -> BoxFuture<'a, u64>;

    /// DDL events recorded at or after `since`, oldest first. Payloads are
    /// handed over as JSON in the layout [`crate::schema::EventData`] reads.
    fn ddl_events_since<'a>(
        &'a self,
        db: &'a str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Vec<RawDdlEvent>>;

    /// Create an empty schema change table for a batch, replacing any previous one.
    fn create_schema_change_table<'a>(&'a self, db: &'a str, ctid: i64) -> BoxFuture<'a, ()>;

    fn write_schema_change<'a>(
        &'a self,
        db: &'a str,
        ctid: i64,
        change: &'a SchemaChangeDescriptor,
    ) -> BoxFuture<'a, ()>;

    /// Schema changes published for a batch. `NotFound` if none were published.
    fn read_schema_changes<'a>(
        &'a self,
        db: &'a str,
        ctid: i64,
    ) -> BoxFuture<'a, Vec<SchemaChangeDescriptor>>;

    /// Apply one schema change. Column types are already in the target engine's terms.
    fn apply_schema_change<'a>(
        &'a self,
        db: &'a str,
        change: &'a SchemaChangeDescriptor,
    ) -> BoxFuture<'a, ()>;

    /// Drop a table if it exists.
    fn drop_table<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, ()>;

    /// Create a table with the given columns.
    fn create_table<'a>(
        &'a self,
        db: &'a str,
        table: &'a str,
        columns: &'a [ColumnInfo],
    ) -> BoxFuture<'a, ()>;

    /// Read up to `limit` rows starting at `offset`, in a stable order.
    fn read_rows<'a>(
        &'a self,
        db: &'a str,
        table: &'a str,
        offset: u64,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Row>>;

    /// Bulk insert rows. Returns rows written.
    fn insert_rows<'a>(&'a self, db: &'a str, table: &'a str, rows: Vec<Row>) -> BoxFuture<'a, u64>;

    fn consolidate<'a>(&'a self, request: &'a ConsolidateRequest) -> BoxFuture<'a, u64>;

    fn apply_changes<'a>(&'a self, request: &'a ApplyRequest) -> BoxFuture<'a, u64>;

    fn append_history<'a>(&'a self, request: &'a HistoryRequest) -> BoxFuture<'a, u64>;
}

/// A no-op implementation for testing/standalone mode.
///
/// Logs operations but doesn't read or write anything. Reports an empty
/// world: version 0, no tables, no columns, no events.
#[derive(Clone, Default)]
pub struct NoOpDataUtils;

impl DataUtils for NoOpDataUtils {
    fn current_version<'a>(&'a self, db: &'a str) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            tracing::debug!(db = %db, "NoOp: current version (returning 0)");
            Ok(0)
        })
    }

    fn min_valid_version<'a>(&'a self, _db: &'a str, _table: &'a str) -> BoxFuture<'a, i64> {
        Box::pin(async { Ok(0) })
    }

    fn table_exists<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            tracing::trace!(db = %db, table = %table, "NoOp: table_exists (returning false)");
            Ok(false)
        })
    }

    fn columns<'a>(&'a self, _db: &'a str, _table: &'a str) -> BoxFuture<'a, Vec<ColumnInfo>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn capture_changes<'a>(&'a self, request: &'a CaptureRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            tracing::debug!(
                table = %request.table,
                change_table = %request.change_table,
                range = %request.range,
                "NoOp: would capture changes"
            );
            Ok(0)
        })
    }

    fn ddl_events_since<'a>(
        &'a self,
        _db: &'a str,
        _since: DateTime<Utc>,
    ) -> BoxFuture<'a, Vec<RawDdlEvent>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn create_schema_change_table<'a>(&'a self, db: &'a str, ctid: i64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(db = %db, ctid, "NoOp: would create schema change table");
            Ok(())
        })
    }

    fn write_schema_change<'a>(
        &'a self,
        _db: &'a str,
        ctid: i64,
        change: &'a SchemaChangeDescriptor,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(ctid, kind = %change.kind, table = %change.table_name, "NoOp: would write schema change");
            Ok(())
        })
    }

    fn read_schema_changes<'a>(
        &'a self,
        _db: &'a str,
        _ctid: i64,
    ) -> BoxFuture<'a, Vec<SchemaChangeDescriptor>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn apply_schema_change<'a>(
        &'a self,
        db: &'a str,
        change: &'a SchemaChangeDescriptor,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(db = %db, kind = %change.kind, column = %change.column_name, "NoOp: would apply schema change");
            Ok(())
        })
    }

    fn drop_table<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(db = %db, table = %table, "NoOp: would drop table");
            Ok(())
        })
    }

    fn create_table<'a>(
        &'a self,
        db: &'a str,
        table: &'a str,
        columns: &'a [ColumnInfo],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(db = %db, table = %table, columns = columns.len(), "NoOp: would create table");
            Ok(())
        })
    }

    fn read_rows<'a>(
        &'a self,
        _db: &'a str,
        _table: &'a str,
        _offset: u64,
        _limit: usize,
    ) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn insert_rows<'a>(&'a self, _db: &'a str, _table: &'a str, rows: Vec<Row>) -> BoxFuture<'a, u64> {
        Box::pin(async move { Ok(rows.len() as u64) })
    }

    fn consolidate<'a>(&'a self, request: &'a ConsolidateRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            tracing::debug!(
                table = %request.table,
                sources = request.sources.len(),
                destination = %request.destination,
                "NoOp: would consolidate"
            );
            Ok(0)
        })
    }

    fn apply_changes<'a>(&'a self, request: &'a ApplyRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            tracing::debug!(table = %request.table, change_table = %request.change_table, "NoOp: would apply changes");
            Ok(0)
        })
    }

    fn append_history<'a>(&'a self, request: &'a HistoryRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            tracing::debug!(history_table = %request.history_table, "NoOp: would append history");
            Ok(0)
        })
    }
}
