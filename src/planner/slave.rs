//! Slave batch planning.
//!
//! Each slave keeps its own mirror of the master records it works on. One
//! slave run picks its work like this:
//!
//! 1. Latest slave record not terminal or not finalized: the last run
//!    failed. Resume every such slave record (one record resumes alone,
//!    several resume as the consolidated group they were planned as).
//! 2. Otherwise look for master batches past the last completed ctid that
//!    have finished `UploadChanges`. None means no work.
//! 3. Fewer pending batches than `consolidation_threshold` (or the
//!    threshold is 0): mirror only the oldest one.
//! 4. Otherwise mirror all of them and consolidate.

use crate::batch::{BatchRecord, LedgerScope};
use crate::config::SlaveConfig;
use crate::error::Result;
use crate::ledger::BatchLedger;
use crate::metrics;
use crate::stage::{Role, SyncBits};
use tracing::{debug, info};

/// Work for one slave run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlavePlan {
    NoWork,
    /// One batch through every slave stage.
    Single(BatchRecord),
    /// Several batches merged into one unit of work, oldest first.
    Consolidated(Vec<BatchRecord>),
}

impl SlavePlan {
    fn from_records(mut records: Vec<BatchRecord>) -> Self {
        match records.len() {
            0 => SlavePlan::NoWork,
            1 => SlavePlan::Single(records.remove(0)),
            _ => SlavePlan::Consolidated(records),
        }
    }

    /// Slave records in the plan, oldest first.
    pub fn batches(&self) -> &[BatchRecord] {
        match self {
            SlavePlan::NoWork => &[],
            SlavePlan::Single(batch) => std::slice::from_ref(batch),
            SlavePlan::Consolidated(batches) => batches,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            SlavePlan::NoWork => "no_work",
            SlavePlan::Single(_) => "single",
            SlavePlan::Consolidated(_) => "consolidated",
        }
    }
}

/// True once the backlog is large enough to consolidate. A threshold of 0
/// disables consolidation.
pub fn should_consolidate(pending: usize, threshold: usize) -> bool {
    threshold > 0 && pending >= threshold
}

pub struct SlavePlanner<'a> {
    ledger: &'a dyn BatchLedger,
    config: &'a SlaveConfig,
}

impl<'a> SlavePlanner<'a> {
    pub fn new(ledger: &'a dyn BatchLedger, config: &'a SlaveConfig) -> Self {
        Self { ledger, config }
    }

    pub async fn plan(&self) -> Result<SlavePlan> {
        let slave = self.config.slave_identifier.as_str();
        let scope = LedgerScope::Slave(slave.to_string());
        let latest = self.ledger.latest_batch(&scope).await?;

        let plan = match latest {
            Some(latest) if !latest.is_terminal(Role::Slave) || latest.stop_time.is_none() => {
                let mut incomplete = self.ledger.incomplete_slave_batches(slave).await?;
                if incomplete.is_empty() {
                    incomplete.push(latest);
                }
                info!(
                    slave = %slave,
                    ctids = ?incomplete.iter().map(|b| b.ctid).collect::<Vec<_>>(),
                    "Resuming incomplete slave batches"
                );
                SlavePlan::from_records(incomplete)
            }
            latest => {
                let last_completed = latest.map(|b| b.ctid).unwrap_or(0);
                self.plan_pending(slave, last_completed).await?
            }
        };

        metrics::record_batch_planned(Role::Slave, plan.path());
        Ok(plan)
    }

    async fn plan_pending(&self, slave: &str, last_completed: i64) -> Result<SlavePlan> {
        let pending = self
            .ledger
            .pending_batches(last_completed, SyncBits::UPLOAD_CHANGES)
            .await?;

        if pending.is_empty() {
            debug!(slave = %slave, last_completed, "No pending master batches");
            return Ok(SlavePlan::NoWork);
        }

        let consolidate = should_consolidate(pending.len(), self.config.consolidation_threshold);
        info!(
            slave = %slave,
            pending = pending.len(),
            threshold = self.config.consolidation_threshold,
            consolidate,
            "Pending master batches found"
        );

        let selected: &[BatchRecord] = if consolidate { &pending } else { &pending[..1] };
        let mut mirrored = Vec::with_capacity(selected.len());
        for master in selected {
            mirrored.push(self.ledger.create_slave_batch(slave, master).await?);
        }

        Ok(if consolidate {
            SlavePlan::Consolidated(mirrored)
        } else {
            SlavePlan::from_records(mirrored)
        })
    }
}
