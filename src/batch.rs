//! Batch records: the unit of replication work.
//!
//! A batch covers the change-tracking version range
//! `[start_version, stop_version)` and is identified by a `ctid` assigned
//! by the ledger in creation order. The master owns one record per ctid;
//! every slave mirrors the master record under its own identity so that
//! each slave tracks its own stage bits.
//!
//! # Naming
//!
//! Per-batch artifacts in the master, relay and slave databases are named
//! from the ctid:
//!
//! ```text
//! tblCT{table}_{ctid}                      change table for one batch
//! tblCT{table}_{ctid}_consolidated         merged change table (newest ctid)
//! tblCTHistory_{table}                     history table
//! tblCTSchemaChange_{ctid}                 schema change descriptors
//! ```

use crate::stage::{Role, SyncBits};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which ledger table (and key) a record lives under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LedgerScope {
    /// The master-version table, keyed by ctid.
    Master,
    /// The slave-version table, keyed by (ctid, slave identifier).
    Slave(String),
}

impl LedgerScope {
    pub fn role(&self) -> Role {
        match self {
            LedgerScope::Master => Role::Master,
            LedgerScope::Slave(_) => Role::Slave,
        }
    }
}

impl fmt::Display for LedgerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerScope::Master => write!(f, "master"),
            LedgerScope::Slave(id) => write!(f, "slave:{}", id),
        }
    }
}

/// A half-open span of change-tracking versions: `start` inclusive,
/// `stop` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub start: i64,
    pub stop: i64,
}

impl VersionRange {
    /// Build a range, clamping `stop` so it never precedes `start`.
    pub fn new(start: i64, stop: i64) -> Self {
        Self {
            start,
            stop: stop.max(start),
        }
    }

    pub fn span(&self) -> i64 {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.span() == 0
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// One persisted batch record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    /// Batch identifier (change-tracking id).
    pub ctid: i64,
    /// Version range the batch covers.
    pub range: VersionRange,
    /// Completed stages.
    pub sync_bits: SyncBits,
    /// When the record was created.
    pub start_time: DateTime<Utc>,
    /// When the role's terminal stage finished. `None` until finalized.
    pub stop_time: Option<DateTime<Utc>>,
}

impl BatchRecord {
    pub fn is_terminal(&self, role: Role) -> bool {
        self.sync_bits.is_terminal(role)
    }
}

/// Name of the change table holding one table's changes for one batch.
pub fn change_table_name(table: &str, ctid: i64) -> String {
    format!("tblCT{}_{}", table, ctid)
}

/// Name of the merged change table for a consolidated group.
pub fn consolidated_table_name(table: &str, newest_ctid: i64) -> String {
    format!("tblCT{}_{}_consolidated", table, newest_ctid)
}

/// Name of the table that accumulates applied changes for a table.
pub fn history_table_name(table: &str) -> String {
    format!("tblCTHistory_{}", table)
}

/// Name of the relay table holding schema changes captured for a batch.
pub fn schema_change_table_name(ctid: i64) -> String {
    format!("tblCTSchemaChange_{}", ctid)
}
