//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory recording DataUtils
//! - A ledger in a temporary directory
//! - Master/slave config and table fixtures

#![allow(dead_code)]

pub mod mock_data;

pub use mock_data::*;

use relay_replicator::config::{ReplicatorConfig, TableConfig};
use relay_replicator::schema::{ColumnInfo, ColumnType};
use relay_replicator::{Replicator, SqliteLedger};
use std::sync::Arc;
use tempfile::TempDir;

pub const MASTER_DB: &str = "CT_MASTER";
pub const RELAY_DB: &str = "CT_RELAY";
pub const SLAVE_DB: &str = "CT_SLAVE";

pub fn orders_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("id", true, ColumnType::new("int")),
        ColumnInfo::new("customer", false, ColumnType::with_length("nvarchar", 100)),
        ColumnInfo::new("total", false, ColumnType::with_precision("decimal", 10, 2)),
    ]
}

pub fn customers_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo::new("id", true, ColumnType::new("int")),
        ColumnInfo::new("name", false, ColumnType::with_length("varchar", 50)),
        ColumnInfo::new("notes", false, ColumnType::with_length("nvarchar", -1)),
    ]
}

/// An `ALTER TABLE ... ADD <column>` DDL payload.
pub fn add_column_payload(table: &str, column: &str) -> String {
    format!(
        r#"{{"EventType":"ALTER_TABLE","SchemaName":"dbo","ObjectName":"{}","ObjectType":"TABLE",
            "AlterTableActionList":{{"Create":{{"Columns":["{}"]}}}}}}"#,
        table, column
    )
}

/// A ledger and a mock data layer shared by master and slave runs.
pub struct Harness {
    _dir: TempDir,
    pub ledger: Arc<SqliteLedger>,
    pub data: Arc<MockDataUtils>,
}

impl Harness {
    /// Fresh ledger; `orders` and `customers` exist on master and slave.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = SqliteLedger::new(dir.path().join("ledger.db"), true)
            .await
            .expect("ledger");
        let data = MockDataUtils::new();
        for db in [MASTER_DB, SLAVE_DB] {
            data.add_table(db, "orders", orders_columns()).await;
            data.add_table(db, "customers", customers_columns()).await;
        }
        Self {
            _dir: dir,
            ledger: Arc::new(ledger),
            data: Arc::new(data),
        }
    }

    pub fn tables() -> Vec<TableConfig> {
        vec![
            TableConfig::for_testing("orders"),
            TableConfig::for_testing("customers"),
        ]
    }

    pub fn master_config(&self) -> ReplicatorConfig {
        let mut config = ReplicatorConfig::for_testing_master(Self::tables());
        if let Some(master) = config.master.as_mut() {
            master.initial_version = Some(100);
        }
        config
    }

    pub fn slave_config(&self, slave: &str, threshold: usize) -> ReplicatorConfig {
        let mut config = ReplicatorConfig::for_testing_slave(slave, Self::tables());
        if let Some(settings) = config.slave.as_mut() {
            settings.consolidation_threshold = threshold;
        }
        config
    }

    pub fn replicator(&self, config: ReplicatorConfig) -> Replicator<MockDataUtils> {
        Replicator::with_data_utils(config, self.ledger.clone(), self.data.clone())
    }

    /// Run one master cycle and return the ctid it worked on.
    pub async fn master_cycle(&self, ceiling: i64) -> i64 {
        self.data.set_version(MASTER_DB, ceiling).await;
        let summary = self
            .replicator(self.master_config())
            .run()
            .await
            .expect("master run");
        summary.ctids[0]
    }
}
