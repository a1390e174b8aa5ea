//! Mock DataUtils for testing.
//!
//! Keeps every database as an in-memory map of tables so copies, captures
//! and consolidations actually move rows between "databases". Records every
//! call for assertions. Failures can be configured per operation and target
//! (table or change table name), and an operation can be made to hang to
//! exercise timeouts.

use chrono::{DateTime, Utc};
use relay_replicator::dataaccess::{
    ApplyRequest, BoxFuture, CaptureRequest, ConsolidateRequest, DataError, DataResult, DataUtils,
    HistoryRequest, Row,
};
use relay_replicator::schema::{ColumnInfo, ColumnType, RawDdlEvent, SchemaChangeDescriptor};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

/// A recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    pub db: String,
    /// Table, change table or ctid the call was about.
    pub target: String,
}

#[derive(Debug, Clone, Default)]
struct MockTable {
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
}

#[derive(Default)]
struct MockState {
    versions: HashMap<String, i64>,
    min_valid: HashMap<String, i64>,
    capture_rows: HashMap<String, u64>,
    tables: HashMap<(String, String), MockTable>,
    ddl_events: Vec<RawDdlEvent>,
    schema_changes: HashMap<(String, i64), Vec<SchemaChangeDescriptor>>,
    failures: HashSet<(String, String)>,
    hangs: HashSet<String>,

    calls: Vec<Call>,
    ddl_since: Vec<DateTime<Utc>>,
    captures: Vec<CaptureRequest>,
    consolidations: Vec<ConsolidateRequest>,
    applies: Vec<ApplyRequest>,
    histories: Vec<HistoryRequest>,
    applied_schema: Vec<SchemaChangeDescriptor>,
}

impl MockState {
    fn record(&mut self, operation: &'static str, db: &str, target: &str) {
        self.calls.push(Call {
            operation,
            db: db.to_string(),
            target: target.to_string(),
        });
    }

    fn check(&self, operation: &str, target: &str) -> DataResult<()> {
        if self.failures.contains(&(operation.to_string(), target.to_string())) {
            return Err(DataError::failed(format!("injected {} failure on {}", operation, target)));
        }
        Ok(())
    }

    fn key(db: &str, table: &str) -> (String, String) {
        (db.to_string(), table.to_string())
    }
}

/// Mock implementation of DataUtils backed by in-memory tables.
///
/// # Example
/// ```rust,ignore
/// let mock = MockDataUtils::new();
/// mock.add_table("CT_MASTER", "orders", orders_columns()).await;
/// mock.set_version("CT_MASTER", 150).await;
/// mock.set_capture_rows("orders", 3).await;
///
/// // Use in tests...
///
/// assert_eq!(mock.row_count("CT_RELAY", "tblCTorders_1").await, Some(3));
/// ```
#[derive(Default)]
pub struct MockDataUtils {
    state: RwLock<MockState>,
}

impl MockDataUtils {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Setup
    // =========================================================================

    pub async fn set_version(&self, db: &str, version: i64) {
        self.state.write().await.versions.insert(db.to_string(), version);
    }

    pub async fn set_min_valid(&self, table: &str, version: i64) {
        self.state.write().await.min_valid.insert(table.to_string(), version);
    }

    /// Rows the next capture of `table` produces.
    pub async fn set_capture_rows(&self, table: &str, rows: u64) {
        self.state.write().await.capture_rows.insert(table.to_string(), rows);
    }

    pub async fn add_table(&self, db: &str, table: &str, columns: Vec<ColumnInfo>) {
        self.state.write().await.tables.insert(
            MockState::key(db, table),
            MockTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    pub async fn push_ddl_event(&self, event_id: i64, payload: &str) {
        self.state.write().await.ddl_events.push(RawDdlEvent {
            event_id,
            event_time: Utc::now(),
            payload: payload.to_string(),
        });
    }

    /// Make `operation` fail whenever it targets `target`.
    pub async fn fail(&self, operation: &str, target: &str) {
        self.state
            .write()
            .await
            .failures
            .insert((operation.to_string(), target.to_string()));
    }

    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }

    /// Make every call of `operation` sleep far past any test timeout.
    pub async fn hang(&self, operation: &str) {
        self.state.write().await.hangs.insert(operation.to_string());
    }

    pub async fn clear_hangs(&self) {
        self.state.write().await.hangs.clear();
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    pub async fn calls(&self) -> Vec<Call> {
        self.state.read().await.calls.clone()
    }

    pub async fn calls_of(&self, operation: &str) -> Vec<Call> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    pub async fn has_table(&self, db: &str, table: &str) -> bool {
        self.state.read().await.tables.contains_key(&MockState::key(db, table))
    }

    pub async fn row_count(&self, db: &str, table: &str) -> Option<usize> {
        self.state
            .read()
            .await
            .tables
            .get(&MockState::key(db, table))
            .map(|t| t.rows.len())
    }

    pub async fn column_types(&self, db: &str, table: &str) -> Vec<ColumnType> {
        self.state
            .read()
            .await
            .tables
            .get(&MockState::key(db, table))
            .map(|t| t.columns.iter().map(|c| c.column_type.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn ddl_since(&self) -> Vec<DateTime<Utc>> {
        self.state.read().await.ddl_since.clone()
    }

    pub async fn captures(&self) -> Vec<CaptureRequest> {
        self.state.read().await.captures.clone()
    }

    pub async fn consolidations(&self) -> Vec<ConsolidateRequest> {
        self.state.read().await.consolidations.clone()
    }

    pub async fn applies(&self) -> Vec<ApplyRequest> {
        self.state.read().await.applies.clone()
    }

    pub async fn histories(&self) -> Vec<HistoryRequest> {
        self.state.read().await.histories.clone()
    }

    pub async fn schema_changes(&self, db: &str, ctid: i64) -> Option<Vec<SchemaChangeDescriptor>> {
        self.state
            .read()
            .await
            .schema_changes
            .get(&(db.to_string(), ctid))
            .cloned()
    }

    pub async fn applied_schema_changes(&self) -> Vec<SchemaChangeDescriptor> {
        self.state.read().await.applied_schema.clone()
    }

    async fn maybe_hang(&self, operation: &str) {
        let hangs = self.state.read().await.hangs.contains(operation);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

impl DataUtils for MockDataUtils {
    fn current_version<'a>(&'a self, db: &'a str) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            self.maybe_hang("current_version").await;
            let mut state = self.state.write().await;
            state.record("current_version", db, db);
            state.check("current_version", db)?;
            Ok(state.versions.get(db).copied().unwrap_or(0))
        })
    }

    fn min_valid_version<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, i64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("min_valid_version", db, table);
            state.check("min_valid_version", table)?;
            Ok(state.min_valid.get(table).copied().unwrap_or(0))
        })
    }

    fn table_exists<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("table_exists", db, table);
            state.check("table_exists", table)?;
            Ok(state.tables.contains_key(&MockState::key(db, table)))
        })
    }

    fn columns<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, Vec<ColumnInfo>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("columns", db, table);
            state.check("columns", table)?;
            Ok(state
                .tables
                .get(&MockState::key(db, table))
                .map(|t| t.columns.clone())
                .unwrap_or_default())
        })
    }

    fn capture_changes<'a>(&'a self, request: &'a CaptureRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.maybe_hang("capture_changes").await;
            let mut state = self.state.write().await;
            state.record("capture_changes", &request.db, &request.table);
            state.captures.push(request.clone());
            state.check("capture_changes", &request.table)?;

            let columns = state
                .tables
                .get(&MockState::key(&request.db, &request.table))
                .map(|t| t.columns.clone())
                .ok_or_else(|| DataError::NotFound(request.table.clone()))?;
            let count = state.capture_rows.get(&request.table).copied().unwrap_or(0);
            let rows = (0..count)
                .map(|i| vec![serde_json::json!(i as i64 + request.range.start)])
                .collect();
            state.tables.insert(
                MockState::key(&request.db, &request.change_table),
                MockTable { columns, rows },
            );
            Ok(count)
        })
    }

    fn ddl_events_since<'a>(
        &'a self,
        db: &'a str,
        since: DateTime<Utc>,
    ) -> BoxFuture<'a, Vec<RawDdlEvent>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("ddl_events_since", db, &since.to_rfc3339());
            state.ddl_since.push(since);
            state.check("ddl_events_since", db)?;
            Ok(state.ddl_events.clone())
        })
    }

    fn create_schema_change_table<'a>(&'a self, db: &'a str, ctid: i64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("create_schema_change_table", db, &ctid.to_string());
            state.schema_changes.insert((db.to_string(), ctid), Vec::new());
            Ok(())
        })
    }

    fn write_schema_change<'a>(
        &'a self,
        db: &'a str,
        ctid: i64,
        change: &'a SchemaChangeDescriptor,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("write_schema_change", db, &change.table_name);
            state
                .schema_changes
                .entry((db.to_string(), ctid))
                .or_default()
                .push(change.clone());
            Ok(())
        })
    }

    fn read_schema_changes<'a>(
        &'a self,
        db: &'a str,
        ctid: i64,
    ) -> BoxFuture<'a, Vec<SchemaChangeDescriptor>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("read_schema_changes", db, &ctid.to_string());
            state
                .schema_changes
                .get(&(db.to_string(), ctid))
                .cloned()
                .ok_or_else(|| DataError::NotFound(format!("schema changes for {}", ctid)))
        })
    }

    fn apply_schema_change<'a>(
        &'a self,
        db: &'a str,
        change: &'a SchemaChangeDescriptor,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("apply_schema_change", db, &change.table_name);
            state.check("apply_schema_change", &change.table_name)?;
            state.applied_schema.push(change.clone());
            Ok(())
        })
    }

    fn drop_table<'a>(&'a self, db: &'a str, table: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("drop_table", db, table);
            state.check("drop_table", table)?;
            state.tables.remove(&MockState::key(db, table));
            Ok(())
        })
    }

    fn create_table<'a>(
        &'a self,
        db: &'a str,
        table: &'a str,
        columns: &'a [ColumnInfo],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("create_table", db, table);
            state.check("create_table", table)?;
            state.tables.insert(
                MockState::key(db, table),
                MockTable {
                    columns: columns.to_vec(),
                    rows: Vec::new(),
                },
            );
            Ok(())
        })
    }

    fn read_rows<'a>(
        &'a self,
        db: &'a str,
        table: &'a str,
        offset: u64,
        limit: usize,
    ) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("read_rows", db, table);
            state.check("read_rows", table)?;
            let source = state
                .tables
                .get(&MockState::key(db, table))
                .ok_or_else(|| DataError::NotFound(table.to_string()))?;
            Ok(source
                .rows
                .iter()
                .skip(offset as usize)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn insert_rows<'a>(&'a self, db: &'a str, table: &'a str, rows: Vec<Row>) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("insert_rows", db, table);
            state.check("insert_rows", table)?;
            let destination = state
                .tables
                .get_mut(&MockState::key(db, table))
                .ok_or_else(|| DataError::NotFound(table.to_string()))?;
            let inserted = rows.len() as u64;
            destination.rows.extend(rows);
            Ok(inserted)
        })
    }

    fn consolidate<'a>(&'a self, request: &'a ConsolidateRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("consolidate", &request.db, &request.table);
            state.consolidations.push(request.clone());
            state.check("consolidate", &request.table)?;

            let mut merged = MockTable::default();
            for source in &request.sources {
                if let Some(table) = state.tables.get(&MockState::key(&request.db, source)) {
                    if merged.columns.is_empty() {
                        merged.columns = table.columns.clone();
                    }
                    merged.rows.extend(table.rows.iter().cloned());
                }
            }
            let count = merged.rows.len() as u64;
            state
                .tables
                .insert(MockState::key(&request.db, &request.destination), merged);
            Ok(count)
        })
    }

    fn apply_changes<'a>(&'a self, request: &'a ApplyRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.maybe_hang("apply_changes").await;
            let mut state = self.state.write().await;
            state.record("apply_changes", &request.db, &request.table);
            state.applies.push(request.clone());
            state.check("apply_changes", &request.table)?;
            Ok(state
                .tables
                .get(&MockState::key(&request.db, &request.change_table))
                .map(|t| t.rows.len() as u64)
                .unwrap_or(0))
        })
    }

    fn append_history<'a>(&'a self, request: &'a HistoryRequest) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.record("append_history", &request.db, &request.table);
            state.histories.push(request.clone());
            state.check("append_history", &request.table)?;
            Ok(state
                .tables
                .get(&MockState::key(&request.db, &request.change_table))
                .map(|t| t.rows.len() as u64)
                .unwrap_or(0))
        })
    }
}
