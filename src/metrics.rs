//! Metrics for observability.
//!
//! Emits through the `metrics` facade; the embedding process decides whether
//! and where to export. Covers:
//! - Stage execution and skips
//! - Batch planning decisions and version spans
//! - Per-table capture volume and skipped tables
//! - Schema change classification
//! - Run outcomes and durations
//! - Ledger contention
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Histograms track distributions (duration, span)
//!
//! # Usage
//!
//! ```rust,no_run
//! use relay_replicator::metrics;
//! use relay_replicator::stage::{Role, Stage};
//!
//! metrics::record_stage_completed(Role::Master, Stage::CaptureChanges);
//! metrics::record_rows_captured("orders", 1200);
//! ```

use crate::stage::{Role, Stage};
use metrics::{counter, histogram};
use std::time::Duration;

/// Record a stage that ran to completion and had its bit persisted.
pub fn record_stage_completed(role: Role, stage: Stage) {
    counter!(
        "relay_stage_completed_total",
        "role" => role.as_str(),
        "stage" => stage.as_str()
    )
    .increment(1);
}

/// Record a stage skipped because its bit was already set.
pub fn record_stage_skipped(role: Role, stage: Stage) {
    counter!(
        "relay_stage_skipped_total",
        "role" => role.as_str(),
        "stage" => stage.as_str()
    )
    .increment(1);
}

/// Record a planner decision (`new`, `retry`, `resume_upload`, `single`,
/// `consolidated`, `no_work`).
pub fn record_batch_planned(role: Role, path: &str) {
    counter!(
        "relay_batch_planned_total",
        "role" => role.as_str(),
        "path" => path.to_string()
    )
    .increment(1);
}

/// Record the version span of a planned master batch.
pub fn record_batch_version_span(span: i64) {
    histogram!("relay_batch_version_span").record(span.max(0) as f64);
}

/// Record rows captured into a change table.
pub fn record_rows_captured(table: &str, rows: u64) {
    counter!("relay_rows_captured_total", "table" => table.to_string()).increment(rows);
}

/// Record a table whose work was skipped after a non-fatal failure.
pub fn record_table_skipped(table: &str, stage: Stage) {
    counter!(
        "relay_table_skipped_total",
        "table" => table.to_string(),
        "stage" => stage.as_str()
    )
    .increment(1);
}

/// Record schema change descriptors published or applied.
pub fn record_schema_changes(count: usize) {
    if count > 0 {
        counter!("relay_schema_changes_total").increment(count as u64);
    }
}

/// Record a DDL event that produced no descriptor (`unconfigured`,
/// `filtered`, `malformed`, `unsupported`).
pub fn record_ddl_event_discarded(reason: &str) {
    counter!("relay_ddl_events_discarded_total", "reason" => reason.to_string()).increment(1);
}

/// Record how long one orchestrator run took.
pub fn record_run_duration(role: Role, duration: Duration) {
    histogram!("relay_run_duration_seconds", "role" => role.as_str())
        .record(duration.as_secs_f64());
}

/// Record the outcome of one orchestrator run.
pub fn record_run_outcome(role: Role, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_run_total", "role" => role.as_str(), "status" => status).increment(1);
}

/// Record ledger SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn ledger_retries_total(operation: &str) {
    counter!("relay_ledger_retries_total", "operation" => operation.to_string()).increment(1);
}
