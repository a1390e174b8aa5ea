//! Shared stage helpers: collaborator calls under a timeout, the per-table
//! stop-on-error policy, and the optional strict stage ordering check.

use super::types::RunSummary;
use crate::config::TableConfig;
use crate::dataaccess::{BoxFuture, DataResult};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::with_timeout;
use crate::stage::{Stage, SyncBits};
use std::time::Duration;
use tracing::{error, warn};

/// Await a collaborator call under a timeout.
///
/// The outer `Result` fails only on timeout; the inner one carries the
/// collaborator's own outcome so the caller can decide how fatal it is.
pub(crate) async fn timed<T>(
    operation: &str,
    timeout: Duration,
    call: BoxFuture<'_, T>,
) -> Result<DataResult<T>> {
    with_timeout(operation, timeout, async { Ok(call.await) }).await
}

/// Await a collaborator call whose failure is fatal for the run.
pub(crate) async fn required<T>(
    operation: &str,
    timeout: Duration,
    call: BoxFuture<'_, T>,
) -> Result<T> {
    timed(operation, timeout, call)
        .await?
        .map_err(|e| e.during(operation))
}

/// Apply a table's stop-on-error policy to a failed table-scoped operation.
///
/// Returns `Err` when the run must abort; otherwise logs, counts and records
/// the skip so the stage can still be marked complete.
pub(crate) fn table_failure(
    table: &TableConfig,
    ctid: i64,
    stage: Stage,
    failure: ReplicationError,
    summary: &mut RunSummary,
) -> Result<()> {
    if matches!(failure, ReplicationError::Timeout { .. }) {
        return Err(failure);
    }

    if table.stop_on_error {
        error!(
            ctid,
            table = %table.name,
            stage = %stage,
            error = %failure,
            "Table failed and is stop-on-error, aborting run"
        );
        return Err(match failure {
            e @ (ReplicationError::Table { .. } | ReplicationError::VersionTooOld { .. }) => e,
            other => ReplicationError::table(&table.name, stage.as_str(), other),
        });
    }

    warn!(
        ctid,
        table = %table.name,
        stage = %stage,
        error = %failure,
        "Table failed, skipping it for this batch"
    );
    metrics::record_table_skipped(&table.name, stage);
    summary.skip_table(ctid, &table.name, stage, failure.to_string());
    Ok(())
}

/// With strict ordering enabled, refuse to run `stage` while an earlier
/// stage of the same role is unset.
pub(crate) fn check_stage_order(
    strict: bool,
    bits: SyncBits,
    ctid: i64,
    stage: Stage,
) -> Result<()> {
    if !strict {
        return Ok(());
    }
    match bits.first_missing_before(stage) {
        Some(missing) => Err(ReplicationError::StageOrder {
            ctid,
            stage: stage.to_string(),
            missing: missing.to_string(),
        }),
        None => Ok(()),
    }
}
