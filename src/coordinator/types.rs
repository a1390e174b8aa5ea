//! Run summary types.
//!
//! Every orchestrator run returns a [`RunSummary`] describing what it did:
//! which batches it touched, which stages ran or were skipped because their
//! bit was already set, and which tables were skipped after a non-fatal
//! failure.

use crate::stage::{Role, Stage};
use tracing::{info, warn};

/// A table whose work was skipped for one stage of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTable {
    pub ctid: i64,
    pub table: String,
    pub stage: Stage,
    pub reason: String,
}

/// What one orchestrator run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub role: Role,
    /// Planner path (`new`, `retry`, `resume_upload`, `single`,
    /// `consolidated`, `no_work`).
    pub path: &'static str,
    /// Batches in the unit of work, oldest first.
    pub ctids: Vec<i64>,
    /// `(ctid, stage)` pairs that ran and were marked complete. Shared slave
    /// stages are listed once, under the newest ctid.
    pub stages_run: Vec<(i64, Stage)>,
    /// `(ctid, stage)` pairs skipped because the bit was already set.
    pub stages_skipped: Vec<(i64, Stage)>,
    pub tables_skipped: Vec<SkippedTable>,
    pub rows_captured: u64,
    pub schema_changes: usize,
}

impl RunSummary {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            path: "no_work",
            ctids: Vec::new(),
            stages_run: Vec::new(),
            stages_skipped: Vec::new(),
            tables_skipped: Vec::new(),
            rows_captured: 0,
            schema_changes: 0,
        }
    }

    pub fn is_no_work(&self) -> bool {
        self.ctids.is_empty()
    }

    pub fn ran(&self, ctid: i64, stage: Stage) -> bool {
        self.stages_run.contains(&(ctid, stage))
    }

    pub fn skipped(&self, ctid: i64, stage: Stage) -> bool {
        self.stages_skipped.contains(&(ctid, stage))
    }

    pub(crate) fn record_run(&mut self, ctid: i64, stage: Stage) {
        self.stages_run.push((ctid, stage));
    }

    pub(crate) fn record_skip(&mut self, ctid: i64, stage: Stage) {
        self.stages_skipped.push((ctid, stage));
    }

    pub(crate) fn skip_table(&mut self, ctid: i64, table: &str, stage: Stage, reason: String) {
        self.tables_skipped.push(SkippedTable {
            ctid,
            table: table.to_string(),
            stage,
            reason,
        });
    }

    /// Log the run as structured fields.
    pub fn log(&self) {
        info!(
            role = %self.role,
            path = self.path,
            ctids = ?self.ctids,
            stages_run = self.stages_run.len(),
            stages_skipped = self.stages_skipped.len(),
            tables_skipped = self.tables_skipped.len(),
            rows_captured = self.rows_captured,
            schema_changes = self.schema_changes,
            "Run complete"
        );
        for skipped in &self.tables_skipped {
            warn!(
                ctid = skipped.ctid,
                table = %skipped.table,
                stage = %skipped.stage,
                reason = %skipped.reason,
                "Table skipped this run"
            );
        }
    }
}
