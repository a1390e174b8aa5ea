//! Slave stage execution over one or more batches.
//!
//! A slave unit of work is a list of mirrored batch records, oldest first.
//! A single batch is simply a group of one. Stages fall into two kinds:
//!
//! - per batch (`DownloadChanges`, `ApplySchemaChanges`): run stage-major,
//!   every record through one stage before the next stage starts, each gated
//!   by that record's own bit
//! - shared (`ConsolidateBatches`, `ApplyChanges`, `SyncHistoryTables`):
//!   run once over the merged change-set, gated by the newest record's bit,
//!   and marked on every record in one ledger transaction when they finish
//!
//! ```text
//!   relay                       slave
//!   tblCTorders_41  ─download─► tblCTorders_41 ─┐
//!   tblCTorders_42  ─download─► tblCTorders_42 ─┼─consolidate─► tblCTorders_43_consolidated ─apply─► orders
//!   tblCTorders_43  ─download─► tblCTorders_43 ─┘                                            └history─► tblCTHistory_orders
//! ```
//!
//! After the terminal stage every record is finalized and the slave's copies
//! of the change tables are dropped.

use crate::batch::{change_table_name, consolidated_table_name, history_table_name, BatchRecord, LedgerScope};
use crate::config::{find_table, ReplicatorConfig, SlaveConfig, TableConfig};
use crate::coordinator::policy::{check_stage_order, required, table_failure, timed};
use crate::coordinator::RunSummary;
use crate::copy::{CopierRegistry, CopyRequest, TableCopier};
use crate::dataaccess::{ApplyRequest, ConsolidateRequest, DataUtils, HistoryRequest};
use crate::error::Result;
use crate::ledger::BatchLedger;
use crate::metrics;
use crate::schema::SchemaChangeDescriptor;
use crate::stage::{Role, Stage};
use crate::table::{enrich, EnrichedTable};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Change tables for one configured table across a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChanges {
    pub table: String,
    /// Per-batch change tables present on the slave, oldest first.
    pub sources: Vec<String>,
    /// Table the shared stages read from: the consolidated table for a
    /// group, the sole change table for a single batch.
    pub merged: String,
}

/// Change tables for every configured table across a unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub tables: Vec<TableChanges>,
}

impl ChangeSet {
    pub fn get(&self, table: &str) -> Option<&TableChanges> {
        self.tables.iter().find(|t| t.table.eq_ignore_ascii_case(table))
    }
}

/// Name of the table the shared stages read for `table`.
pub fn merged_table_name(table: &str, batches: &[BatchRecord]) -> Option<String> {
    match batches {
        [] => None,
        [only] => Some(change_table_name(table, only.ctid)),
        [.., newest] => Some(consolidated_table_name(table, newest.ctid)),
    }
}

/// Runs slave stages for one unit of work.
pub struct ConsolidationEngine<'a> {
    ledger: &'a dyn BatchLedger,
    data: &'a dyn DataUtils,
    config: &'a ReplicatorConfig,
    slave: &'a SlaveConfig,
    copier: &'a dyn TableCopier,
    scope: LedgerScope,
}

impl<'a> ConsolidationEngine<'a> {
    /// Fails if the config has no slave section or no copy strategy exists
    /// for relay to slave.
    pub fn new(
        ledger: &'a dyn BatchLedger,
        data: &'a dyn DataUtils,
        copiers: &'a CopierRegistry,
        config: &'a ReplicatorConfig,
    ) -> Result<Self> {
        let slave = config.slave_config()?;
        let copier = copiers.get(slave.relay_engine, slave.slave_engine)?;
        Ok(Self {
            ledger,
            data,
            config,
            slave,
            copier,
            scope: LedgerScope::Slave(slave.slave_identifier.clone()),
        })
    }

    fn query_timeout(&self) -> Duration {
        self.config.timeouts.query_timeout()
    }

    fn copy_timeout(&self) -> Duration {
        self.config.timeouts.data_copy_timeout()
    }

    /// Drive `batches` through every slave stage they have not completed.
    pub async fn run(&self, batches: &[BatchRecord], summary: &mut RunSummary) -> Result<()> {
        let mut batches = batches.to_vec();
        batches.sort_by_key(|b| b.ctid);
        let newest_ctid = match batches.last() {
            Some(newest) => newest.ctid,
            None => return Ok(()),
        };

        info!(
            slave = %self.slave.slave_identifier,
            ctids = ?batches.iter().map(|b| b.ctid).collect::<Vec<_>>(),
            "Running slave stages"
        );

        for stage in [Stage::DownloadChanges, Stage::ApplySchemaChanges] {
            for batch in batches.iter_mut() {
                if batch.sync_bits.has_completed(stage) {
                    self.skip(batch.ctid, stage, summary);
                    continue;
                }
                check_stage_order(self.config.strict_stage_order, batch.sync_bits, batch.ctid, stage)?;

                match stage {
                    Stage::DownloadChanges => self.download(batch, summary).await?,
                    _ => self.apply_schema_changes(batch, summary).await?,
                }

                batch.sync_bits = self
                    .ledger
                    .mark_stage_complete(&self.scope, batch.ctid, stage)
                    .await?;
                self.completed(batch.ctid, stage, summary);
            }
        }

        let ctids: Vec<i64> = batches.iter().map(|b| b.ctid).collect();
        let mut enriched: Option<Vec<EnrichedTable>> = None;
        for stage in [Stage::ConsolidateBatches, Stage::ApplyChanges, Stage::SyncHistoryTables] {
            let bits = self.ledger.stage_bits(&self.scope, newest_ctid).await?;
            if bits.has_completed(stage) {
                self.skip(newest_ctid, stage, summary);
                continue;
            }
            check_stage_order(self.config.strict_stage_order, bits, newest_ctid, stage)?;

            if enriched.is_none() {
                enriched = Some(self.enrich_slave_tables(newest_ctid, stage, summary).await?);
            }
            let tables = enriched.as_deref().unwrap_or_default();
            let change_set = self.change_set(&batches, tables, newest_ctid, stage, summary).await?;

            match stage {
                Stage::ConsolidateBatches => {
                    self.consolidate(&batches, tables, &change_set, summary).await?
                }
                Stage::ApplyChanges => self.apply_changes(newest_ctid, tables, &change_set, summary).await?,
                _ => self.sync_history(newest_ctid, tables, &change_set, summary).await?,
            }

            self.ledger
                .mark_stage_complete_all(&self.scope, &ctids, stage)
                .await?;
            self.completed(newest_ctid, stage, summary);
        }

        for batch in &batches {
            self.ledger.finalize_batch(&self.scope, batch.ctid).await?;
        }
        self.cleanup(&batches).await;
        Ok(())
    }

    fn skip(&self, ctid: i64, stage: Stage, summary: &mut RunSummary) {
        debug!(ctid, stage = %stage, "Stage already complete, skipping");
        metrics::record_stage_skipped(Role::Slave, stage);
        summary.record_skip(ctid, stage);
    }

    fn completed(&self, ctid: i64, stage: Stage, summary: &mut RunSummary) {
        info!(ctid, stage = %stage, "Stage complete");
        metrics::record_stage_completed(Role::Slave, stage);
        summary.record_run(ctid, stage);
    }

    #[instrument(skip_all, fields(ctid = batch.ctid))]
    async fn download(&self, batch: &BatchRecord, summary: &mut RunSummary) -> Result<()> {
        for table in &self.config.tables {
            let change_table = change_table_name(&table.name, batch.ctid);
            let exists = match timed(
                "table_exists",
                self.query_timeout(),
                self.data.table_exists(&self.slave.relay_db, &change_table),
            )
            .await?
            {
                Ok(exists) => exists,
                Err(e) => {
                    table_failure(table, batch.ctid, Stage::DownloadChanges, e.during("table_exists"), summary)?;
                    continue;
                }
            };
            if !exists {
                debug!(ctid = batch.ctid, table = %table.name, "No changes to download");
                continue;
            }

            let request = CopyRequest::same_name(&self.slave.relay_db, &change_table, &self.slave.slave_db);
            match timed(
                "copy_table",
                self.copy_timeout(),
                self.copier.copy_table(self.data, &request),
            )
            .await?
            {
                Ok(rows) => debug!(ctid = batch.ctid, table = %table.name, rows, "Changes downloaded"),
                Err(e) if e.is_not_found() => {
                    debug!(ctid = batch.ctid, table = %table.name, "Change table vanished, nothing to download")
                }
                Err(e) => {
                    table_failure(table, batch.ctid, Stage::DownloadChanges, e.during("copy_table"), summary)?
                }
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(ctid = batch.ctid))]
    async fn apply_schema_changes(&self, batch: &BatchRecord, summary: &mut RunSummary) -> Result<()> {
        let changes = match timed(
            "read_schema_changes",
            self.query_timeout(),
            self.data.read_schema_changes(&self.slave.relay_db, batch.ctid),
        )
        .await?
        {
            Ok(changes) => changes,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.during("read_schema_changes")),
        };

        for change in changes {
            let table = match find_table(&self.config.tables, &change.table_name) {
                Some(table) => table,
                None => {
                    debug!(ctid = batch.ctid, table = %change.table_name, "Schema change for unconfigured table ignored");
                    continue;
                }
            };

            let mapped = SchemaChangeDescriptor {
                column_type: change.column_type.as_ref().map(|t| self.copier.map_type(t)),
                ..change
            };
            match timed(
                "apply_schema_change",
                self.query_timeout(),
                self.data.apply_schema_change(&self.slave.slave_db, &mapped),
            )
            .await?
            {
                Ok(()) => info!(
                    ctid = batch.ctid,
                    table = %mapped.table_name,
                    column = %mapped.column_name,
                    kind = mapped.kind.as_str(),
                    "Schema change applied"
                ),
                Err(e) => table_failure(
                    table,
                    batch.ctid,
                    Stage::ApplySchemaChanges,
                    e.during("apply_schema_change"),
                    summary,
                )?,
            }
        }
        Ok(())
    }

    /// Read live columns on the slave, after schema changes have landed.
    async fn enrich_slave_tables(
        &self,
        ctid: i64,
        stage: Stage,
        summary: &mut RunSummary,
    ) -> Result<Vec<EnrichedTable>> {
        let mut tables = Vec::with_capacity(self.config.tables.len());
        for result in enrich(self.data, &self.slave.slave_db, &self.config.tables, self.query_timeout()).await? {
            match result {
                Ok(table) => tables.push(table),
                Err((table, e)) => table_failure(&table, ctid, stage, e, summary)?,
            }
        }
        Ok(tables)
    }

    /// Work out which change tables exist on the slave for this unit of work.
    async fn change_set(
        &self,
        batches: &[BatchRecord],
        tables: &[EnrichedTable],
        ctid: i64,
        stage: Stage,
        summary: &mut RunSummary,
    ) -> Result<ChangeSet> {
        let mut change_set = ChangeSet::default();
        for table in tables {
            let Some(merged) = merged_table_name(table.name(), batches) else {
                continue;
            };
            let mut sources = Vec::new();
            for batch in batches {
                let change_table = change_table_name(table.name(), batch.ctid);
                match timed(
                    "table_exists",
                    self.query_timeout(),
                    self.data.table_exists(&self.slave.slave_db, &change_table),
                )
                .await?
                {
                    Ok(true) => sources.push(change_table),
                    Ok(false) => {}
                    Err(e) => {
                        table_failure(&table.config, ctid, stage, e.during("table_exists"), summary)?;
                    }
                }
            }
            change_set.tables.push(TableChanges {
                table: table.name().to_string(),
                sources,
                merged,
            });
        }
        Ok(change_set)
    }

    #[instrument(skip_all, fields(batches = batches.len()))]
    async fn consolidate(
        &self,
        batches: &[BatchRecord],
        tables: &[EnrichedTable],
        change_set: &ChangeSet,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let Some(newest) = batches.last() else {
            return Ok(());
        };
        if batches.len() < 2 {
            debug!(ctid = newest.ctid, "Single batch, nothing to consolidate");
            return Ok(());
        }

        for table in tables {
            let Some(changes) = change_set.get(table.name()) else {
                continue;
            };
            if changes.sources.is_empty() {
                debug!(table = %table.name(), "No changes in group, nothing to consolidate");
                continue;
            }

            let request = ConsolidateRequest {
                db: self.slave.slave_db.clone(),
                table: table.name().to_string(),
                sources: changes.sources.clone(),
                destination: changes.merged.clone(),
                primary_keys: table.primary_keys(),
            };
            match timed("consolidate", self.copy_timeout(), self.data.consolidate(&request)).await? {
                Ok(rows) => info!(
                    table = %table.name(),
                    batches = changes.sources.len(),
                    rows,
                    destination = %changes.merged,
                    "Change tables consolidated"
                ),
                Err(e) => table_failure(
                    &table.config,
                    newest.ctid,
                    Stage::ConsolidateBatches,
                    e.during("consolidate"),
                    summary,
                )?,
            }
        }
        Ok(())
    }

    /// True when the merged table exists on the slave. Failures go through
    /// the table policy and read as absent.
    async fn merged_exists(
        &self,
        table: &TableConfig,
        merged: &str,
        ctid: i64,
        stage: Stage,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        match timed(
            "table_exists",
            self.query_timeout(),
            self.data.table_exists(&self.slave.slave_db, merged),
        )
        .await?
        {
            Ok(exists) => Ok(exists),
            Err(e) => {
                table_failure(table, ctid, stage, e.during("table_exists"), summary)?;
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, tables, change_set, summary))]
    async fn apply_changes(
        &self,
        ctid: i64,
        tables: &[EnrichedTable],
        change_set: &ChangeSet,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for table in tables {
            let Some(changes) = change_set.get(table.name()) else {
                continue;
            };
            if !self
                .merged_exists(&table.config, &changes.merged, ctid, Stage::ApplyChanges, summary)
                .await?
            {
                debug!(ctid, table = %table.name(), "No changes to apply");
                continue;
            }

            let request = ApplyRequest {
                db: self.slave.slave_db.clone(),
                schema_name: table.config.schema_name.clone(),
                table: table.name().to_string(),
                change_table: changes.merged.clone(),
                columns: table.column_names(),
                primary_keys: table.primary_keys(),
            };
            match timed("apply_changes", self.copy_timeout(), self.data.apply_changes(&request)).await? {
                Ok(rows) => info!(ctid, table = %table.name(), rows, "Changes applied"),
                Err(e) => table_failure(&table.config, ctid, Stage::ApplyChanges, e.during("apply_changes"), summary)?,
            }
        }
        Ok(())
    }

    #[instrument(skip(self, tables, change_set, summary))]
    async fn sync_history(
        &self,
        ctid: i64,
        tables: &[EnrichedTable],
        change_set: &ChangeSet,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for table in tables.iter().filter(|t| t.config.record_history) {
            let Some(changes) = change_set.get(table.name()) else {
                continue;
            };
            if !self
                .merged_exists(&table.config, &changes.merged, ctid, Stage::SyncHistoryTables, summary)
                .await?
            {
                continue;
            }

            let request = HistoryRequest {
                db: self.slave.slave_db.clone(),
                table: table.name().to_string(),
                change_table: changes.merged.clone(),
                history_table: history_table_name(table.name()),
            };
            match timed("append_history", self.copy_timeout(), self.data.append_history(&request)).await? {
                Ok(rows) => debug!(ctid, table = %table.name(), rows, "History appended"),
                Err(e) => table_failure(
                    &table.config,
                    ctid,
                    Stage::SyncHistoryTables,
                    e.during("append_history"),
                    summary,
                )?,
            }
        }
        Ok(())
    }

    /// Drop the slave's change tables for a finished unit of work. Failures
    /// only warn; the records are already final.
    async fn cleanup(&self, batches: &[BatchRecord]) {
        for table in &self.config.tables {
            let mut doomed: Vec<String> = batches
                .iter()
                .map(|b| change_table_name(&table.name, b.ctid))
                .collect();
            if batches.len() > 1 {
                if let Some(merged) = merged_table_name(&table.name, batches) {
                    doomed.push(merged);
                }
            }

            for name in doomed {
                let dropped = required(
                    "drop_table",
                    self.query_timeout(),
                    self.data.drop_table(&self.slave.slave_db, &name),
                )
                .await;
                if let Err(e) = dropped {
                    warn!(table = %name, error = %e, "Failed to drop slave change table");
                }
            }
        }
    }
}
