//! Master batch planning.
//!
//! Exactly one batch is advanced per master run. Which one depends on the
//! latest master record:
//!
//! ```text
//! latest record bits            plan
//! ──────────────────────────    ─────────────────────────────────────────
//! none (first run)              New [initial_version | ceiling, ceiling)
//! UploadChanges set             New [previous.stop, ceiling)
//! CaptureChanges only           ResumeUpload, same range, no recapture
//! neither                       Retry, same ctid, stop moved to ceiling
//! ```
//!
//! New and retried ranges are resized (see [`super::resize`]) before they
//! are persisted. A resumed batch keeps the range it was captured with.

use super::resize::{resize, IgnoreWindow};
use crate::batch::{BatchRecord, LedgerScope, VersionRange};
use crate::config::MasterConfig;
use crate::dataaccess::DataUtils;
use crate::error::{ReplicationError, Result};
use crate::ledger::BatchLedger;
use crate::metrics;
use crate::resilience::with_timeout;
use crate::stage::{Role, Stage};
use chrono::NaiveTime;
use std::fmt;
use std::time::Duration;
use tracing::info;

/// How the planned batch relates to the ledger's previous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterPlanPath {
    /// A fresh record was created.
    New,
    /// The previous attempt failed before capture finished; same ctid, new stop.
    Retry,
    /// Capture finished but upload did not; only upload is left.
    ResumeUpload,
}

impl MasterPlanPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterPlanPath::New => "new",
            MasterPlanPath::Retry => "retry",
            MasterPlanPath::ResumeUpload => "resume_upload",
        }
    }
}

impl fmt::Display for MasterPlanPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The batch one master run works on.
#[derive(Debug, Clone)]
pub struct MasterPlan {
    pub batch: BatchRecord,
    pub path: MasterPlanPath,
}

impl MasterPlan {
    /// True when changes are already captured and must not be captured again.
    pub fn skip_capture(&self) -> bool {
        self.path == MasterPlanPath::ResumeUpload
    }
}

pub struct MasterPlanner<'a> {
    ledger: &'a dyn BatchLedger,
    config: &'a MasterConfig,
    window: Option<IgnoreWindow>,
}

impl<'a> MasterPlanner<'a> {
    pub fn new(ledger: &'a dyn BatchLedger, config: &'a MasterConfig) -> Result<Self> {
        Ok(Self {
            ledger,
            config,
            window: config.ignore_window()?,
        })
    }

    /// Query the version ceiling and plan the next batch.
    ///
    /// A failing ceiling query is fatal for the run.
    pub async fn plan(
        &self,
        data: &dyn DataUtils,
        query_timeout: Duration,
        now: NaiveTime,
    ) -> Result<MasterPlan> {
        let db = self.config.master_db.as_str();
        let ceiling = with_timeout("current_version", query_timeout, async {
            data.current_version(db)
                .await
                .map_err(|e| e.during("current_version"))
        })
        .await?;
        self.plan_with_ceiling(ceiling, now).await
    }

    /// Plan the next batch against a known version ceiling.
    pub async fn plan_with_ceiling(&self, ceiling: i64, now: NaiveTime) -> Result<MasterPlan> {
        let latest = self.ledger.latest_batch(&LedgerScope::Master).await?;

        let plan = match latest {
            None => {
                let start = self.config.initial_version.unwrap_or(ceiling);
                self.create(VersionRange::new(start, ceiling), now).await?
            }
            Some(previous) if previous.sync_bits.has_completed(Stage::UploadChanges) => {
                self.create(VersionRange::new(previous.range.stop, ceiling), now)
                    .await?
            }
            Some(previous) if previous.sync_bits.has_completed(Stage::CaptureChanges) => {
                MasterPlan {
                    batch: previous,
                    path: MasterPlanPath::ResumeUpload,
                }
            }
            Some(mut previous) => {
                let range = self.resized(VersionRange::new(previous.range.start, ceiling), now);
                self.ledger.update_stop_version(previous.ctid, range.stop).await?;
                previous.range = range;
                MasterPlan {
                    batch: previous,
                    path: MasterPlanPath::Retry,
                }
            }
        };

        info!(
            ctid = plan.batch.ctid,
            path = %plan.path,
            start_version = plan.batch.range.start,
            stop_version = plan.batch.range.stop,
            ceiling,
            "Master batch planned"
        );
        metrics::record_batch_planned(Role::Master, plan.path.as_str());
        metrics::record_batch_version_span(plan.batch.range.span());
        Ok(plan)
    }

    async fn create(&self, candidate: VersionRange, now: NaiveTime) -> Result<MasterPlan> {
        let range = self.resized(candidate, now);
        let ctid = self.ledger.create_master_batch(range).await?;
        let batch = self
            .ledger
            .batch(&LedgerScope::Master, ctid)
            .await?
            .ok_or_else(|| ReplicationError::Internal(format!("Master batch {} not found after create", ctid)))?;
        Ok(MasterPlan {
            batch,
            path: MasterPlanPath::New,
        })
    }

    fn resized(&self, candidate: VersionRange, now: NaiveTime) -> VersionRange {
        resize(
            candidate,
            self.config.max_batch_size,
            self.window.as_ref(),
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SqliteLedger;
    use tempfile::tempdir;

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    async fn complete(ledger: &SqliteLedger, ctid: i64, stages: &[Stage]) {
        for stage in stages {
            ledger
                .mark_stage_complete(&LedgerScope::Master, ctid, *stage)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_first_batch_starts_at_ceiling() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let config = MasterConfig::for_testing();
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        let plan = planner.plan_with_ceiling(500, noon()).await.unwrap();
        assert_eq!(plan.path, MasterPlanPath::New);
        assert_eq!(plan.batch.range, VersionRange::new(500, 500));
        assert!(!plan.skip_capture());
    }

    #[tokio::test]
    async fn test_first_batch_uses_initial_version() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let mut config = MasterConfig::for_testing();
        config.initial_version = Some(100);
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        let plan = planner.plan_with_ceiling(150, noon()).await.unwrap();
        assert_eq!(plan.batch.range, VersionRange::new(100, 150));
    }

    #[tokio::test]
    async fn test_new_batch_after_upload() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let config = MasterConfig::for_testing();
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        let first = planner.plan_with_ceiling(150, noon()).await.unwrap();
        complete(&ledger, first.batch.ctid, &[Stage::CaptureChanges, Stage::UploadChanges]).await;

        let second = planner.plan_with_ceiling(175, noon()).await.unwrap();
        assert_eq!(second.path, MasterPlanPath::New);
        assert!(second.batch.ctid > first.batch.ctid);
        assert_eq!(second.batch.range, VersionRange::new(150, 175));
        assert!(second.batch.sync_bits.is_empty());
    }

    #[tokio::test]
    async fn test_resume_upload_keeps_range() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let config = MasterConfig::for_testing();
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        let first = planner.plan_with_ceiling(150, noon()).await.unwrap();
        complete(&ledger, first.batch.ctid, &[Stage::CaptureChanges]).await;

        let resumed = planner.plan_with_ceiling(400, noon()).await.unwrap();
        assert_eq!(resumed.path, MasterPlanPath::ResumeUpload);
        assert!(resumed.skip_capture());
        assert_eq!(resumed.batch.ctid, first.batch.ctid);
        assert_eq!(resumed.batch.range, first.batch.range);
    }

    #[tokio::test]
    async fn test_retry_moves_stop_to_ceiling() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let mut config = MasterConfig::for_testing();
        config.initial_version = Some(100);
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        let first = planner.plan_with_ceiling(150, noon()).await.unwrap();
        let retry = planner.plan_with_ceiling(180, noon()).await.unwrap();

        assert_eq!(retry.path, MasterPlanPath::Retry);
        assert_eq!(retry.batch.ctid, first.batch.ctid);
        assert_eq!(retry.batch.range, VersionRange::new(100, 180));

        let stored = ledger
            .batch(&LedgerScope::Master, first.batch.ctid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.range.stop, 180);
    }

    #[tokio::test]
    async fn test_retry_is_resized() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let mut config = MasterConfig::for_testing();
        config.initial_version = Some(0);
        config.max_batch_size = 100;
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        let first = planner.plan_with_ceiling(50, noon()).await.unwrap();
        assert_eq!(first.batch.range, VersionRange::new(0, 50));

        let retry = planner.plan_with_ceiling(1_000, noon()).await.unwrap();
        assert_eq!(retry.batch.range, VersionRange::new(0, 100));
    }

    #[tokio::test]
    async fn test_new_batch_clamped_outside_window_only() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let mut config = MasterConfig::for_testing();
        config.initial_version = Some(0);
        config.max_batch_size = 100;
        config.ignore_window_start = Some("23:45".into());
        config.ignore_window_end = Some("01:30".into());
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        let peak = planner.plan_with_ceiling(1_000, noon()).await.unwrap();
        assert_eq!(peak.batch.range, VersionRange::new(0, 100));
        complete(&ledger, peak.batch.ctid, &[Stage::CaptureChanges, Stage::UploadChanges]).await;

        let night = NaiveTime::from_hms_opt(0, 30, 0).unwrap();
        let catch_up = planner.plan_with_ceiling(1_000, night).await.unwrap();
        assert_eq!(catch_up.batch.range, VersionRange::new(100, 1_000));
    }

    #[tokio::test]
    async fn test_plan_queries_ceiling() {
        let dir = tempdir().unwrap();
        let ledger = SqliteLedger::new(dir.path().join("m.db"), true).await.unwrap();
        let config = MasterConfig::for_testing();
        let planner = MasterPlanner::new(&ledger, &config).unwrap();

        // The no-op layer reports version 0.
        let plan = planner
            .plan(&crate::dataaccess::NoOpDataUtils, Duration::from_secs(1), noon())
            .await
            .unwrap();
        assert_eq!(plan.batch.range, VersionRange::new(0, 0));
    }
}
