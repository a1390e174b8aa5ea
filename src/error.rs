// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are categorized by how a run reacts to them. Table-scoped failures
//! only become errors here when the table is configured stop-on-error; for
//! every other table the orchestrator logs the failure and moves on.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Ledger` | No | Local SQLite ledger errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `DataAccess` | Yes | Collaborator call failed (query, copy, DDL) |
//! | `Table` | Yes | Stop-on-error table failed, run aborted |
//! | `VersionTooOld` | No | Batch start precedes the table's minimum valid version |
//! | `Timeout` | Yes | Collaborator call exceeded its timeout |
//! | `DdlParse` | No | Malformed DDL event payload |
//! | `NoCopyStrategy` | No | No copier registered for an engine pair |
//! | `StageOrder` | No | Strict stage ordering violated (ledger corruption) |
//! | `InvalidState` | No | Orchestrator invoked in the wrong role |
//! | `Internal` | No | Unexpected internal error |
//!
//! Because every completed stage bit is persisted, a failed run is always
//! safe to repeat. [`ReplicationError::is_retryable()`] tells the caller
//! whether repeating without operator action is likely to help.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during a replication run.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// SQLite error while reading or writing the batch ledger.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    ///
    /// Raised during startup before any state is written.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator call failed outside of any table's scope.
    ///
    /// Occurs e.g. when the version ceiling query fails.
    #[error("Data access error ({operation}): {message}")]
    DataAccess { operation: String, message: String },

    /// A table-scoped operation failed on a stop-on-error table.
    #[error("Table {table} failed during {operation}: {message}")]
    Table {
        table: String,
        operation: String,
        message: String,
    },

    /// Capture rejected: change tracking no longer holds the batch's range.
    #[error(
        "Table {table}: start version {start_version} precedes minimum valid version {min_valid_version}"
    )]
    VersionTooOld {
        table: String,
        start_version: i64,
        min_valid_version: i64,
    },

    /// A collaborator call did not finish within its timeout.
    #[error("Timed out after {timeout:?} during {operation}")]
    Timeout { operation: String, timeout: Duration },

    /// A captured DDL event could not be parsed.
    #[error("DDL event parse error: {0}")]
    DdlParse(String),

    /// No table copy strategy is registered for an engine pair.
    #[error("No copy strategy registered from {source_engine} to {destination_engine}")]
    NoCopyStrategy {
        source_engine: String,
        destination_engine: String,
    },

    /// A stage was about to run while an earlier stage was still unset.
    ///
    /// Only raised with `strict_stage_order` enabled.
    #[error("Stage {stage} cannot run before {missing} on batch {ctid}")]
    StageOrder {
        ctid: i64,
        stage: String,
        missing: String,
    },

    /// Operation attempted in the wrong state or role.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a data access error for a named operation.
    pub fn data_access(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::DataAccess {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a table-scoped error.
    pub fn table(
        table: impl Into<String>,
        operation: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Table {
            table: table.into(),
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DataAccess { .. } => true,
            Self::Table { .. } => true,
            Self::Timeout { .. } => true,
            Self::Ledger(_) => false,
            Self::Config(_) => false,
            Self::VersionTooOld { .. } => false, // needs a reinit of the table
            Self::DdlParse(_) => false,
            Self::NoCopyStrategy { .. } => false,
            Self::StageOrder { .. } => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_data_access() {
        let err = ReplicationError::data_access("current_version", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("current_version"));
    }

    #[test]
    fn test_is_retryable_table() {
        let err = ReplicationError::table("orders", "download", "copy failed");
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("download"));
    }

    #[test]
    fn test_is_retryable_timeout() {
        let err = ReplicationError::Timeout {
            operation: "copy_table".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("copy_table"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("no tables configured".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_version_too_old() {
        let err = ReplicationError::VersionTooOld {
            table: "orders".to_string(),
            start_version: 10,
            min_valid_version: 50,
        };
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("50"));
    }

    #[test]
    fn test_not_retryable_stage_order() {
        let err = ReplicationError::StageOrder {
            ctid: 7,
            stage: "ApplyChanges".to_string(),
            missing: "DownloadChanges".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("batch 7"));
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "slave".to_string(),
            actual: "master".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("slave"));
        assert!(err.to_string().contains("master"));
    }

    #[test]
    fn test_no_copy_strategy_formatting() {
        let err = ReplicationError::NoCopyStrategy {
            source_engine: "mysql".to_string(),
            destination_engine: "netezza".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mysql"));
        assert!(msg.contains("netezza"));
        assert!(!err.is_retryable());
    }
}
