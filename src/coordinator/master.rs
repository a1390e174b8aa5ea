//! Master agent run.
//!
//! ```text
//! plan ─► PublishSchemaChanges ─► CaptureChanges ─► UploadChanges ─► finalize
//!           master DDL log          master_db          master_db
//!           └► relay schema table    └► tblCT{t}_{ctid}  └► relay_db
//! ```
//!
//! Each stage is skipped when its bit is already set on the planned batch.
//! A batch resumed after capture runs the upload alone. Uploaded change
//! tables are dropped from the master; the relay keeps its copies because
//! slaves read them at their own pace, so pruning the relay is left to
//! whoever owns its retention.

use super::policy::{check_stage_order, required, table_failure, timed};
use super::types::RunSummary;
use crate::batch::{change_table_name, BatchRecord, LedgerScope};
use crate::config::{MasterConfig, ReplicatorConfig};
use crate::copy::{CopierRegistry, CopyRequest, TableCopier};
use crate::dataaccess::{CaptureRequest, DataUtils};
use crate::error::{ReplicationError, Result};
use crate::ledger::BatchLedger;
use crate::metrics;
use crate::planner::{MasterPlan, MasterPlanner};
use crate::schema::classify;
use crate::stage::{Role, Stage};
use crate::table::{enrich, EnrichedTable};
use chrono::NaiveTime;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub struct MasterOrchestrator<'a> {
    ledger: &'a dyn BatchLedger,
    data: &'a dyn DataUtils,
    config: &'a ReplicatorConfig,
    master: &'a MasterConfig,
    copier: &'a dyn TableCopier,
}

impl<'a> MasterOrchestrator<'a> {
    pub fn new(
        ledger: &'a dyn BatchLedger,
        data: &'a dyn DataUtils,
        copiers: &'a CopierRegistry,
        config: &'a ReplicatorConfig,
    ) -> Result<Self> {
        if config.role != Role::Master {
            return Err(ReplicationError::InvalidState {
                expected: Role::Master.to_string(),
                actual: config.role.to_string(),
            });
        }
        let master = config.master_config()?;
        let copier = copiers.get(master.master_engine, master.relay_engine)?;
        Ok(Self {
            ledger,
            data,
            config,
            master,
            copier,
        })
    }

    fn query_timeout(&self) -> Duration {
        self.config.timeouts.query_timeout()
    }

    fn copy_timeout(&self) -> Duration {
        self.config.timeouts.data_copy_timeout()
    }

    /// Plan one batch and run it through every master stage not yet done.
    /// `now` is the local wall-clock time used for the ignore window.
    pub async fn run(&self, now: NaiveTime) -> Result<RunSummary> {
        let mut summary = RunSummary::new(Role::Master);

        let plan = MasterPlanner::new(self.ledger, self.master)?
            .plan(self.data, self.query_timeout(), now)
            .await?;
        summary.path = plan.path.as_str();
        summary.ctids.push(plan.batch.ctid);

        let ctid = plan.batch.ctid;
        let mut bits = plan.batch.sync_bits;

        // A resumed batch only has its upload left.
        let pending = |stage: Stage| {
            !bits.has_completed(stage) && !(plan.skip_capture() && stage != Stage::UploadChanges)
        };
        let needs_tables = pending(Stage::PublishSchemaChanges) || pending(Stage::CaptureChanges);
        let tables = if needs_tables {
            let first_pending = if pending(Stage::PublishSchemaChanges) {
                Stage::PublishSchemaChanges
            } else {
                Stage::CaptureChanges
            };
            self.enrich_master_tables(ctid, first_pending, &mut summary).await?
        } else {
            Vec::new()
        };

        for stage in Role::Master.stages() {
            let stage = *stage;
            let done = bits.has_completed(stage)
                || (plan.skip_capture() && stage != Stage::UploadChanges);
            if done {
                debug!(ctid, stage = %stage, "Stage already complete, skipping");
                metrics::record_stage_skipped(Role::Master, stage);
                summary.record_skip(ctid, stage);
                continue;
            }
            check_stage_order(self.config.strict_stage_order, bits, ctid, stage)?;

            match stage {
                Stage::PublishSchemaChanges => self.publish(&plan, &tables, &mut summary).await?,
                Stage::CaptureChanges => self.capture(&plan.batch, &tables, &mut summary).await?,
                _ => self.upload(ctid, &mut summary).await?,
            }

            bits = self
                .ledger
                .mark_stage_complete(&LedgerScope::Master, ctid, stage)
                .await?;
            info!(ctid, stage = %stage, "Stage complete");
            metrics::record_stage_completed(Role::Master, stage);
            summary.record_run(ctid, stage);
        }

        self.ledger.finalize_batch(&LedgerScope::Master, ctid).await?;
        Ok(summary)
    }

    async fn enrich_master_tables(
        &self,
        ctid: i64,
        stage: Stage,
        summary: &mut RunSummary,
    ) -> Result<Vec<EnrichedTable>> {
        let mut tables = Vec::with_capacity(self.config.tables.len());
        for result in enrich(self.data, &self.master.master_db, &self.config.tables, self.query_timeout()).await? {
            match result {
                Ok(table) => tables.push(table),
                Err((table, e)) => table_failure(&table, ctid, stage, e, summary)?,
            }
        }
        Ok(tables)
    }

    /// Classify DDL since the previous batch started and publish the
    /// surviving column changes to the relay.
    #[instrument(skip_all, fields(ctid = plan.batch.ctid))]
    async fn publish(
        &self,
        plan: &MasterPlan,
        tables: &[EnrichedTable],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let ctid = plan.batch.ctid;
        let since = self
            .ledger
            .previous_master_batch(ctid)
            .await?
            .map(|previous| previous.start_time)
            .unwrap_or(plan.batch.start_time);

        let events = required(
            "ddl_events_since",
            self.query_timeout(),
            self.data.ddl_events_since(&self.master.master_db, since),
        )
        .await?;
        required(
            "create_schema_change_table",
            self.query_timeout(),
            self.data.create_schema_change_table(&self.master.relay_db, ctid),
        )
        .await?;

        let lookup = |table: &str, column: &str| {
            tables
                .iter()
                .find(|t| t.config.matches(table))
                .and_then(|t| t.column_type(column))
        };

        let mut published = 0usize;
        for event in &events {
            let changes = match classify(event, &self.config.tables, &lookup) {
                Ok(changes) => changes,
                Err(e) => {
                    warn!(ctid, event_id = event.event_id, error = %e, "Discarding malformed DDL event");
                    metrics::record_ddl_event_discarded("malformed");
                    continue;
                }
            };
            for change in &changes {
                required(
                    "write_schema_change",
                    self.query_timeout(),
                    self.data.write_schema_change(&self.master.relay_db, ctid, change),
                )
                .await?;
                info!(
                    ctid,
                    table = %change.table_name,
                    column = %change.column_name,
                    kind = change.kind.as_str(),
                    "Schema change published"
                );
            }
            published += changes.len();
        }

        debug!(ctid, since = %since, events = events.len(), published, "DDL events classified");
        metrics::record_schema_changes(published);
        summary.schema_changes += published;
        Ok(())
    }

    #[instrument(skip_all, fields(ctid = batch.ctid, range = %batch.range))]
    async fn capture(
        &self,
        batch: &BatchRecord,
        tables: &[EnrichedTable],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let ctid = batch.ctid;
        for table in tables {
            let min_valid = match timed(
                "min_valid_version",
                self.query_timeout(),
                self.data.min_valid_version(&self.master.master_db, table.name()),
            )
            .await?
            {
                Ok(version) => version,
                Err(e) => {
                    table_failure(&table.config, ctid, Stage::CaptureChanges, e.during("min_valid_version"), summary)?;
                    continue;
                }
            };
            if min_valid > batch.range.start {
                let too_old = ReplicationError::VersionTooOld {
                    table: table.name().to_string(),
                    start_version: batch.range.start,
                    min_valid_version: min_valid,
                };
                table_failure(&table.config, ctid, Stage::CaptureChanges, too_old, summary)?;
                continue;
            }

            let change_table = change_table_name(table.name(), ctid);
            let request = CaptureRequest {
                db: self.master.master_db.clone(),
                schema_name: table.config.schema_name.clone(),
                table: table.name().to_string(),
                change_table: change_table.clone(),
                range: batch.range,
                select_list: table.capture_select_list(),
                primary_key_join: table.primary_key_join(),
            };
            let rows = match timed("capture_changes", self.copy_timeout(), self.data.capture_changes(&request)).await? {
                Ok(rows) => rows,
                Err(e) => {
                    table_failure(&table.config, ctid, Stage::CaptureChanges, e.during("capture_changes"), summary)?;
                    continue;
                }
            };

            metrics::record_rows_captured(table.name(), rows);
            summary.rows_captured += rows;
            if rows == 0 {
                debug!(ctid, table = %table.name(), range = %batch.range, "No changes, dropping change table");
                if let Err(e) = required(
                    "drop_table",
                    self.query_timeout(),
                    self.data.drop_table(&self.master.master_db, &change_table),
                )
                .await
                {
                    warn!(ctid, table = %change_table, error = %e, "Failed to drop empty change table");
                }
            } else {
                info!(ctid, table = %table.name(), range = %batch.range, rows, "Changes captured");
            }
        }
        Ok(())
    }

    /// Copy every change table that exists for this batch to the relay.
    #[instrument(skip(self, summary))]
    async fn upload(&self, ctid: i64, summary: &mut RunSummary) -> Result<()> {
        for table in &self.config.tables {
            let change_table = change_table_name(&table.name, ctid);
            let exists = match timed(
                "table_exists",
                self.query_timeout(),
                self.data.table_exists(&self.master.master_db, &change_table),
            )
            .await?
            {
                Ok(exists) => exists,
                Err(e) => {
                    table_failure(table, ctid, Stage::UploadChanges, e.during("table_exists"), summary)?;
                    continue;
                }
            };
            if !exists {
                debug!(ctid, table = %table.name, "No changes to upload");
                continue;
            }

            let request = CopyRequest::same_name(&self.master.master_db, &change_table, &self.master.relay_db);
            match timed("copy_table", self.copy_timeout(), self.copier.copy_table(self.data, &request)).await? {
                Ok(rows) => {
                    info!(ctid, table = %table.name, rows, "Changes uploaded");
                    self.drop_uploaded(ctid, &change_table).await;
                }
                Err(e) if e.is_not_found() => debug!(ctid, table = %table.name, "Change table vanished, nothing to upload"),
                Err(e) => table_failure(table, ctid, Stage::UploadChanges, e.during("copy_table"), summary)?,
            }
        }
        Ok(())
    }

    /// The relay copy is authoritative once uploaded; the master's copy goes.
    async fn drop_uploaded(&self, ctid: i64, change_table: &str) {
        let dropped = required(
            "drop_table",
            self.query_timeout(),
            self.data.drop_table(&self.master.master_db, change_table),
        )
        .await;
        if let Err(e) = dropped {
            warn!(ctid, table = %change_table, error = %e, "Failed to drop uploaded change table");
        }
    }
}
