// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stage tracking over the per-batch sync bitmask.
//!
//! Every batch record carries a `sync_bits` integer. Each of the eight
//! pipeline stages owns one bit; a set bit means the stage finished for that
//! batch and must never run again.
//!
//! ```text
//! bit   stage                    role
//! ───   ─────────────────────    ──────
//!   1   PublishSchemaChanges     master
//!   2   CaptureChanges           master
//!   4   UploadChanges            master  (terminal)
//!   8   DownloadChanges          slave   (per batch)
//!  16   ApplySchemaChanges       slave   (per batch)
//!  32   ConsolidateBatches       slave   (shared)
//!  64   ApplyChanges             slave   (shared)
//! 128   SyncHistoryTables        slave   (shared, terminal)
//! ```
//!
//! The tracker only answers "skip if already done". It does not require
//! stage N-1 before stage N; [`SyncBits::first_missing_before`] exists for
//! callers that opt into strict ordering. Bits outside the known set are
//! retained and ignored so older binaries can read ledgers written by newer
//! ones.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Completed-stage bitmask persisted with every batch record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncBits: i64 {
        const PUBLISH_SCHEMA_CHANGES = 1;
        const CAPTURE_CHANGES = 1 << 1;
        const UPLOAD_CHANGES = 1 << 2;
        const DOWNLOAD_CHANGES = 1 << 3;
        const APPLY_SCHEMA_CHANGES = 1 << 4;
        const CONSOLIDATE_BATCHES = 1 << 5;
        const APPLY_CHANGES = 1 << 6;
        const SYNC_HISTORY_TABLES = 1 << 7;
    }
}

/// Which side of the relay a process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    /// Stages this role executes, in pipeline order.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Role::Master => &[
                Stage::PublishSchemaChanges,
                Stage::CaptureChanges,
                Stage::UploadChanges,
            ],
            Role::Slave => &[
                Stage::DownloadChanges,
                Stage::ApplySchemaChanges,
                Stage::ConsolidateBatches,
                Stage::ApplyChanges,
                Stage::SyncHistoryTables,
            ],
        }
    }

    /// The stage whose bit marks a batch as finished for this role.
    pub fn terminal_stage(&self) -> Stage {
        match self {
            Role::Master => Stage::UploadChanges,
            Role::Slave => Stage::SyncHistoryTables,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named step of the replication pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    PublishSchemaChanges,
    CaptureChanges,
    UploadChanges,
    DownloadChanges,
    ApplySchemaChanges,
    ConsolidateBatches,
    ApplyChanges,
    SyncHistoryTables,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 8] = [
        Stage::PublishSchemaChanges,
        Stage::CaptureChanges,
        Stage::UploadChanges,
        Stage::DownloadChanges,
        Stage::ApplySchemaChanges,
        Stage::ConsolidateBatches,
        Stage::ApplyChanges,
        Stage::SyncHistoryTables,
    ];

    /// The single bit this stage owns.
    pub fn bit(&self) -> SyncBits {
        match self {
            Stage::PublishSchemaChanges => SyncBits::PUBLISH_SCHEMA_CHANGES,
            Stage::CaptureChanges => SyncBits::CAPTURE_CHANGES,
            Stage::UploadChanges => SyncBits::UPLOAD_CHANGES,
            Stage::DownloadChanges => SyncBits::DOWNLOAD_CHANGES,
            Stage::ApplySchemaChanges => SyncBits::APPLY_SCHEMA_CHANGES,
            Stage::ConsolidateBatches => SyncBits::CONSOLIDATE_BATCHES,
            Stage::ApplyChanges => SyncBits::APPLY_CHANGES,
            Stage::SyncHistoryTables => SyncBits::SYNC_HISTORY_TABLES,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Stage::PublishSchemaChanges | Stage::CaptureChanges | Stage::UploadChanges => {
                Role::Master
            }
            _ => Role::Slave,
        }
    }

    /// Per-batch slave stages run once for every record in a consolidated
    /// group; the rest run once over the merged change-set.
    pub fn is_per_batch(&self) -> bool {
        matches!(self, Stage::DownloadChanges | Stage::ApplySchemaChanges)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PublishSchemaChanges => "PublishSchemaChanges",
            Stage::CaptureChanges => "CaptureChanges",
            Stage::UploadChanges => "UploadChanges",
            Stage::DownloadChanges => "DownloadChanges",
            Stage::ApplySchemaChanges => "ApplySchemaChanges",
            Stage::ConsolidateBatches => "ConsolidateBatches",
            Stage::ApplyChanges => "ApplyChanges",
            Stage::SyncHistoryTables => "SyncHistoryTables",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncBits {
    /// Wrap a raw persisted value, keeping unknown bits.
    pub fn from_raw(raw: i64) -> Self {
        Self::from_bits_retain(raw)
    }

    /// Raw value for persistence.
    pub fn raw(&self) -> i64 {
        self.bits()
    }

    /// True if the stage's bit is set.
    pub fn has_completed(&self, stage: Stage) -> bool {
        self.contains(stage.bit())
    }

    /// Bits after `stage` completes. Setting an already-set bit is a no-op.
    #[must_use]
    pub fn mark_completed(&self, stage: Stage) -> Self {
        self.union(stage.bit())
    }

    /// True once the role's final stage bit is present.
    pub fn is_terminal(&self, role: Role) -> bool {
        self.has_completed(role.terminal_stage())
    }

    /// First earlier stage of the same role that is not yet complete.
    pub fn first_missing_before(&self, stage: Stage) -> Option<Stage> {
        stage
            .role()
            .stages()
            .iter()
            .take_while(|s| **s != stage)
            .find(|s| !self.has_completed(**s))
            .copied()
    }

    /// Names of the known stages that are set, for logging.
    pub fn stage_names(&self) -> Vec<&'static str> {
        Stage::ALL
            .iter()
            .filter(|s| self.has_completed(**s))
            .map(|s| s.as_str())
            .collect()
    }
}
