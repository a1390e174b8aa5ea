//! Configuration for the replicator.
//!
//! One [`ReplicatorConfig`] is built at startup (usually via
//! [`ReplicatorConfig::from_file`]) and passed by reference into the
//! orchestrators and planners. Nothing reads configuration from global state.
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── role: master | slave
//! ├── master: MasterConfig           # required when role = master
//! │   ├── master_db / relay_db
//! │   ├── max_batch_size             # max version span, 0 = unlimited
//! │   └── ignore_window_start/end    # "HH:MM", batches not capped inside
//! ├── slave: SlaveConfig             # required when role = slave
//! │   ├── slave_identifier
//! │   └── consolidation_threshold    # 0 = never consolidate
//! ├── tables: Vec<TableConfig>
//! ├── timeouts: TimeoutConfig
//! ├── ledger: LedgerConfig           # SQLite batch ledger
//! └── strict_stage_order: bool
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "role": "slave",
//!   "slave": {
//!     "slave_identifier": "reporting-1",
//!     "slave_db": "CT_REPORTING",
//!     "slave_engine": "mysql",
//!     "relay_db": "CT_RELAY",
//!     "consolidation_threshold": 5
//!   },
//!   "tables": [
//!     { "name": "orders", "stop_on_error": true, "column_list": ["id", "total"] }
//!   ],
//!   "timeouts": { "query_timeout": "30s", "data_copy_timeout": "10m" },
//!   "ledger": { "sqlite_path": "/var/lib/relay/ledger.db" }
//! }
//! ```

use crate::dataaccess::EngineKind;
use crate::error::{ReplicationError, Result};
use crate::planner::resize::IgnoreWindow;
use crate::stage::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for one replicator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Which agent this process runs as.
    pub role: Role,

    /// Master settings. Required when `role` is `master`.
    #[serde(default)]
    pub master: Option<MasterConfig>,

    /// Slave settings. Required when `role` is `slave`.
    #[serde(default)]
    pub slave: Option<SlaveConfig>,

    /// Tables to replicate.
    pub tables: Vec<TableConfig>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Refuse to run a stage while an earlier stage of the same role is unset.
    #[serde(default = "default_false")]
    pub strict_stage_order: bool,
}

impl ReplicatorConfig {
    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON config document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ReplicatorConfig = serde_json::from_str(raw)
            .map_err(|e| ReplicationError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole config for problems that would only surface mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(ReplicationError::Config("No tables configured".into()));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !seen.insert(table.name.to_lowercase()) {
                return Err(ReplicationError::Config(format!(
                    "Table {} is configured more than once",
                    table.name
                )));
            }
        }

        match self.role {
            Role::Master => {
                let master = self.master_config()?;
                master.ignore_window()?;
                if master.max_batch_size < 0 {
                    return Err(ReplicationError::Config(
                        "max_batch_size must not be negative".into(),
                    ));
                }
            }
            Role::Slave => {
                let slave = self.slave_config()?;
                if slave.slave_identifier.trim().is_empty() {
                    return Err(ReplicationError::Config(
                        "slave_identifier must not be empty".into(),
                    ));
                }
            }
        }

        self.timeouts.validate()?;
        Ok(())
    }

    /// Master section, or a config error if absent.
    pub fn master_config(&self) -> Result<&MasterConfig> {
        self.master
            .as_ref()
            .ok_or_else(|| ReplicationError::Config("role is master but no master section".into()))
    }

    /// Slave section, or a config error if absent.
    pub fn slave_config(&self) -> Result<&SlaveConfig> {
        self.slave
            .as_ref()
            .ok_or_else(|| ReplicationError::Config("role is slave but no slave section".into()))
    }

    /// Look up a configured table by name, case-insensitively.
    pub fn find_table(&self, name: &str) -> Option<&TableConfig> {
        find_table(&self.tables, name)
    }

    /// Emit the effective configuration as structured log fields.
    pub fn log_summary(&self) {
        info!(
            role = %self.role,
            tables = self.tables.len(),
            ledger = %self.ledger.sqlite_path,
            query_timeout = %self.timeouts.query_timeout,
            data_copy_timeout = %self.timeouts.data_copy_timeout,
            strict_stage_order = self.strict_stage_order,
            "Replicator configuration"
        );
        if let Some(master) = &self.master {
            info!(
                master_db = %master.master_db,
                master_engine = %master.master_engine,
                relay_db = %master.relay_db,
                relay_engine = %master.relay_engine,
                max_batch_size = master.max_batch_size,
                ignore_window_start = master.ignore_window_start.as_deref().unwrap_or("-"),
                ignore_window_end = master.ignore_window_end.as_deref().unwrap_or("-"),
                "Master settings"
            );
        }
        if let Some(slave) = &self.slave {
            info!(
                slave_identifier = %slave.slave_identifier,
                slave_db = %slave.slave_db,
                slave_engine = %slave.slave_engine,
                relay_db = %slave.relay_db,
                relay_engine = %slave.relay_engine,
                consolidation_threshold = slave.consolidation_threshold,
                "Slave settings"
            );
        }
        for table in &self.tables {
            debug!(
                table = %table.name,
                schema = %table.schema_name,
                stop_on_error = table.stop_on_error,
                column_list = ?table.column_list,
                modifiers = table.column_modifiers.len(),
                record_history = table.record_history,
                "Table settings"
            );
        }
    }

    /// Minimal master config for tests.
    pub fn for_testing_master(tables: Vec<TableConfig>) -> Self {
        Self {
            role: Role::Master,
            master: Some(MasterConfig::for_testing()),
            slave: None,
            tables,
            timeouts: TimeoutConfig::default(),
            ledger: LedgerConfig::default(),
            strict_stage_order: false,
        }
    }

    /// Minimal slave config for tests.
    pub fn for_testing_slave(slave_identifier: &str, tables: Vec<TableConfig>) -> Self {
        Self {
            role: Role::Slave,
            master: None,
            slave: Some(SlaveConfig::for_testing(slave_identifier)),
            tables,
            timeouts: TimeoutConfig::default(),
            ledger: LedgerConfig::default(),
            strict_stage_order: false,
        }
    }
}

/// Look up a table by name, case-insensitively.
pub fn find_table<'a>(tables: &'a [TableConfig], name: &str) -> Option<&'a TableConfig> {
    tables.iter().find(|t| t.matches(name))
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// MasterConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the master agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Source database with change tracking enabled.
    pub master_db: String,

    #[serde(default)]
    pub master_engine: EngineKind,

    /// Relay database that receives the published change tables.
    pub relay_db: String,

    #[serde(default)]
    pub relay_engine: EngineKind,

    /// Maximum version span per batch outside the ignore window. 0 disables resizing.
    #[serde(default)]
    pub max_batch_size: i64,

    /// Start of the daily window in which batches are not capped ("HH:MM").
    #[serde(default)]
    pub ignore_window_start: Option<String>,

    /// End of the daily window ("HH:MM"). May be earlier than the start to wrap midnight.
    #[serde(default)]
    pub ignore_window_end: Option<String>,

    /// Start version of the very first batch. Defaults to the current version.
    #[serde(default)]
    pub initial_version: Option<i64>,
}

impl MasterConfig {
    /// Parsed ignore window, if one is configured.
    pub fn ignore_window(&self) -> Result<Option<IgnoreWindow>> {
        match (&self.ignore_window_start, &self.ignore_window_end) {
            (None, None) => Ok(None),
            (Some(start), Some(end)) => IgnoreWindow::parse(start, end).map(Some),
            _ => Err(ReplicationError::Config(
                "ignore_window_start and ignore_window_end must be set together".into(),
            )),
        }
    }

    pub fn for_testing() -> Self {
        Self {
            master_db: "CT_MASTER".to_string(),
            master_engine: EngineKind::SqlServer,
            relay_db: "CT_RELAY".to_string(),
            relay_engine: EngineKind::SqlServer,
            max_batch_size: 0,
            ignore_window_start: None,
            ignore_window_end: None,
            initial_version: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SlaveConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for one slave agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Identity under which this slave's batch records are kept.
    pub slave_identifier: String,

    /// Destination database.
    pub slave_db: String,

    #[serde(default)]
    pub slave_engine: EngineKind,

    /// Relay database holding the published change tables.
    pub relay_db: String,

    #[serde(default)]
    pub relay_engine: EngineKind,

    /// Pending batch count at which batches are consolidated. 0 disables consolidation.
    #[serde(default)]
    pub consolidation_threshold: usize,
}

impl SlaveConfig {
    pub fn for_testing(slave_identifier: &str) -> Self {
        Self {
            slave_identifier: slave_identifier.to_string(),
            slave_db: "CT_SLAVE".to_string(),
            slave_engine: EngineKind::SqlServer,
            relay_db: "CT_RELAY".to_string(),
            relay_engine: EngineKind::SqlServer,
            consolidation_threshold: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TableConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-table replication policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name (matched case-insensitively).
    pub name: String,

    #[serde(default = "default_schema_name")]
    pub schema_name: String,

    /// Abort the whole run when an operation on this table fails.
    #[serde(default = "default_false")]
    pub stop_on_error: bool,

    /// Columns to replicate. `None` replicates every column.
    #[serde(default)]
    pub column_list: Option<Vec<String>>,

    #[serde(default)]
    pub column_modifiers: Vec<ColumnModifier>,

    /// Keep a history table of every applied change.
    #[serde(default = "default_false")]
    pub record_history: bool,
}

fn default_schema_name() -> String {
    "dbo".to_string()
}

impl TableConfig {
    /// True if `name` refers to this table (case-insensitive).
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// True if the column is replicated under this table's allow-list.
    pub fn includes_column(&self, column: &str) -> bool {
        match &self.column_list {
            None => true,
            Some(list) => list.iter().any(|c| c.eq_ignore_ascii_case(column)),
        }
    }

    /// Modifier for a column, if configured.
    pub fn modifier_for(&self, column: &str) -> Option<&ColumnModifier> {
        self.column_modifiers
            .iter()
            .find(|m| m.column_name.eq_ignore_ascii_case(column))
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ReplicationError::Config("Table name must not be empty".into()));
        }
        if let Some(list) = &self.column_list {
            if list.is_empty() {
                return Err(ReplicationError::Config(format!(
                    "Table {} has an empty column_list",
                    self.name
                )));
            }
        }
        for modifier in &self.column_modifiers {
            if modifier.length == 0 {
                return Err(ReplicationError::Config(format!(
                    "Modifier on {}.{} has zero length",
                    self.name, modifier.column_name
                )));
            }
        }
        Ok(())
    }

    /// A table with default policy for tests.
    pub fn for_testing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            schema_name: default_schema_name(),
            stop_on_error: false,
            column_list: None,
            column_modifiers: Vec::new(),
            record_history: false,
        }
    }
}

/// How a column's value is altered when captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierKind {
    /// Truncate the value to `length` characters.
    ShortenField,
}

/// Per-column capture modifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnModifier {
    pub column_name: String,
    #[serde(rename = "type")]
    pub kind: ModifierKind,
    pub length: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TimeoutConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Timeouts for collaborator calls, as humantime strings ("30s", "10m").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Ledger-independent queries: versions, existence checks, DDL.
    #[serde(default = "default_query_timeout")]
    pub query_timeout: String,

    /// Capture, table copy, consolidate and apply.
    #[serde(default = "default_data_copy_timeout")]
    pub data_copy_timeout: String,
}

fn default_query_timeout() -> String {
    "30s".to_string()
}

fn default_data_copy_timeout() -> String {
    "10m".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            query_timeout: default_query_timeout(),
            data_copy_timeout: default_data_copy_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn query_timeout(&self) -> Duration {
        humantime::parse_duration(&self.query_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn data_copy_timeout(&self) -> Duration {
        humantime::parse_duration(&self.data_copy_timeout).unwrap_or(Duration::from_secs(600))
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("query_timeout", &self.query_timeout),
            ("data_copy_timeout", &self.data_copy_timeout),
        ] {
            let parsed = humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("Invalid {} '{}': {}", name, value, e))
            })?;
            if parsed.is_zero() {
                return Err(ReplicationError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LedgerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Batch ledger persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to the SQLite database holding the batch ledger.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended when master and
    /// slave processes share the file).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "relay_ledger.db".to_string(),
            wal_mode: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const SLAVE_JSON: &str = r#"{
        "role": "slave",
        "slave": {
            "slave_identifier": "reporting-1",
            "slave_db": "CT_REPORTING",
            "slave_engine": "mysql",
            "relay_db": "CT_RELAY",
            "consolidation_threshold": 5
        },
        "tables": [
            { "name": "orders", "stop_on_error": true, "column_list": ["id", "Total"] },
            { "name": "customers",
              "column_modifiers": [ { "column_name": "notes", "type": "ShortenField", "length": 100 } ] }
        ]
    }"#;

    #[test]
    fn test_parse_slave_config() {
        let config = ReplicatorConfig::from_json(SLAVE_JSON).unwrap();
        assert_eq!(config.role, Role::Slave);

        let slave = config.slave_config().unwrap();
        assert_eq!(slave.slave_identifier, "reporting-1");
        assert_eq!(slave.slave_engine, EngineKind::MySql);
        assert_eq!(slave.relay_engine, EngineKind::SqlServer);
        assert_eq!(slave.consolidation_threshold, 5);

        assert_eq!(config.tables.len(), 2);
        assert!(config.tables[0].stop_on_error);
        assert!(!config.tables[1].stop_on_error);
        assert_eq!(config.tables[1].schema_name, "dbo");
        assert_eq!(config.tables[1].column_modifiers[0].length, 100);
        assert_eq!(config.ledger.sqlite_path, "relay_ledger.db");
        assert!(!config.strict_stage_order);
    }

    #[test]
    fn test_find_table_is_case_insensitive() {
        let config = ReplicatorConfig::from_json(SLAVE_JSON).unwrap();
        assert_eq!(config.find_table("ORDERS").unwrap().name, "orders");
        assert!(config.find_table("invoices").is_none());
    }

    #[test]
    fn test_column_allow_list() {
        let config = ReplicatorConfig::from_json(SLAVE_JSON).unwrap();
        let orders = config.find_table("orders").unwrap();
        assert!(orders.includes_column("ID"));
        assert!(orders.includes_column("total"));
        assert!(!orders.includes_column("status"));

        let customers = config.find_table("customers").unwrap();
        assert!(customers.includes_column("anything"));
        assert!(customers.modifier_for("NOTES").is_some());
        assert!(customers.modifier_for("name").is_none());
    }

    #[test]
    fn test_missing_role_section_rejected() {
        let raw = r#"{ "role": "master", "tables": [ { "name": "t" } ] }"#;
        let err = ReplicatorConfig::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("master section"));
    }

    #[test]
    fn test_no_tables_rejected() {
        let config = ReplicatorConfig::for_testing_master(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_tables_rejected() {
        let config = ReplicatorConfig::for_testing_master(vec![
            TableConfig::for_testing("orders"),
            TableConfig::for_testing("Orders"),
        ]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_half_configured_window_rejected() {
        let mut config = ReplicatorConfig::for_testing_master(vec![TableConfig::for_testing("t")]);
        config.master.as_mut().unwrap().ignore_window_start = Some("23:45".into());
        assert!(config.validate().is_err());

        config.master.as_mut().unwrap().ignore_window_end = Some("01:30".into());
        assert!(config.validate().is_ok());
        assert!(config.master_config().unwrap().ignore_window().unwrap().is_some());
    }

    #[test]
    fn test_bad_window_time_rejected() {
        let mut config = ReplicatorConfig::for_testing_master(vec![TableConfig::for_testing("t")]);
        let master = config.master.as_mut().unwrap();
        master.ignore_window_start = Some("25:00".into());
        master.ignore_window_end = Some("01:00".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_slave_identifier_rejected() {
        let config = ReplicatorConfig::for_testing_slave("  ", vec![TableConfig::for_testing("t")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_length_modifier_rejected() {
        let mut table = TableConfig::for_testing("t");
        table.column_modifiers.push(ColumnModifier {
            column_name: "c".into(),
            kind: ModifierKind::ShortenField,
            length: 0,
        });
        let config = ReplicatorConfig::for_testing_master(vec![table]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.query_timeout(), Duration::from_secs(30));
        assert_eq!(timeouts.data_copy_timeout(), Duration::from_secs(600));

        let custom = TimeoutConfig {
            query_timeout: "500ms".into(),
            data_copy_timeout: "2min".into(),
        };
        assert_eq!(custom.query_timeout(), Duration::from_millis(500));
        assert_eq!(custom.data_copy_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let mut config = ReplicatorConfig::for_testing_master(vec![TableConfig::for_testing("t")]);
        config.timeouts.query_timeout = "soon".into();
        assert!(config.validate().is_err());

        config.timeouts.query_timeout = "0s".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicatorConfig::for_testing_master(vec![TableConfig::for_testing("orders")]);
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = ReplicatorConfig::from_json(&json).unwrap();
        assert_eq!(parsed.role, Role::Master);
        assert_eq!(parsed.master_config().unwrap().relay_db, "CT_RELAY");
        assert_eq!(parsed.tables[0].name, "orders");
    }

    #[test]
    fn test_from_file_missing() {
        let err = ReplicatorConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
    }
}
