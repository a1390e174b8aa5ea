//! # Relay Replicator
//!
//! Batch orchestration for change-tracking replication from one master
//! database to any number of slaves through a shared relay database.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  capture   ┌────────────┐  download   ┌────────────┐
//! │  master_db │──────────► │  relay_db  │ ──────────► │  slave_db  │
//! │ (CT source)│  upload    │ tblCT*_n   │  consolidate│ base tables│
//! └────────────┘            │ schema chg │  apply      └────────────┘
//!       ▲                   └────────────┘                   ▲
//!       │                                                    │
//!  MasterOrchestrator ◄──── BatchLedger (SQLite) ────► SlaveOrchestrator
//!       │                  ctid / range / sync_bits          │
//!       └──────────── DataUtils + TableCopier ───────────────┘
//! ```
//!
//! ## Batches and Stages
//!
//! Work is tracked as numbered batches (ctids), each covering a range of
//! change-tracking versions. Every stage a batch passes through sets one bit
//! in the batch's `sync_bits`; a set bit is never run again, so any failed
//! run can simply be repeated.
//!
//! 1. **Master**: PublishSchemaChanges, CaptureChanges, UploadChanges
//! 2. **Slave**: DownloadChanges, ApplySchemaChanges, ConsolidateBatches,
//!    ApplyChanges, SyncHistoryTables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_replicator::{Replicator, ReplicatorConfig, SqliteLedger};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> relay_replicator::Result<()> {
//!     let config = ReplicatorConfig::from_file("replicator.json")?;
//!     let ledger = SqliteLedger::new(&config.ledger.sqlite_path, config.ledger.wal_mode).await?;
//!
//!     let replicator = Replicator::new(config, Arc::new(ledger));
//!     let summary = replicator.run().await?;
//!     println!("processed {:?}", summary.ctids);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod consolidation;
pub mod coordinator;
pub mod copy;
pub mod dataaccess;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod planner;
pub mod resilience;
pub mod schema;
pub mod stage;
pub mod table;

// Re-exports for convenience
pub use batch::{BatchRecord, LedgerScope, VersionRange};
pub use config::{MasterConfig, ReplicatorConfig, SlaveConfig, TableConfig};
pub use consolidation::{ChangeSet, ConsolidationEngine};
pub use coordinator::{MasterOrchestrator, Replicator, RunSummary, SlaveOrchestrator};
pub use copy::{CopierRegistry, TableCopier};
pub use dataaccess::{DataError, DataUtils, EngineKind, NoOpDataUtils};
pub use error::{ReplicationError, Result};
pub use ledger::{BatchLedger, SqliteLedger};
pub use planner::{MasterPlanner, SlavePlan, SlavePlanner};
pub use stage::{Role, Stage, SyncBits};
