//! Table copy strategies.
//!
//! Moving a change table from one database to another (master to relay,
//! relay to slave) depends on the engine on each side. Each supported
//! engine pair has a [`TableCopier`] that owns its column type mapping; all
//! of them share the same copy procedure:
//!
//! 1. read the source table's columns
//! 2. map each column type into the destination engine's terms
//! 3. drop and recreate the destination table
//! 4. page rows across
//!
//! Copiers are looked up by `(source, destination)` in a [`CopierRegistry`].
//!
//! | Source | Destination | Copier |
//! |--------|-------------|--------|
//! | sqlserver | sqlserver | [`SqlServerCopier`] (identity) |
//! | sqlserver | mysql | [`SqlServerToMySqlCopier`] |
//! | sqlserver | netezza | [`SqlServerToNetezzaCopier`] |

use crate::dataaccess::{BoxFuture, DataError, DataUtils, EngineKind};
use crate::error::{ReplicationError, Result};
use crate::schema::{ColumnInfo, ColumnType};
use std::collections::HashMap;
use tracing::debug;

/// Rows moved per read/insert round trip.
pub const COPY_PAGE_SIZE: usize = 5_000;

/// One table copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source_db: String,
    pub table: String,
    pub destination_db: String,
    pub destination_table: String,
}

impl CopyRequest {
    /// Copy a table under the same name.
    pub fn same_name(source_db: &str, table: &str, destination_db: &str) -> Self {
        Self {
            source_db: source_db.to_string(),
            table: table.to_string(),
            destination_db: destination_db.to_string(),
            destination_table: table.to_string(),
        }
    }
}

/// Copy strategy for one engine pair.
pub trait TableCopier: Send + Sync {
    fn source_engine(&self) -> EngineKind;

    fn destination_engine(&self) -> EngineKind;

    /// Translate a source column type into the destination engine's type.
    fn map_type(&self, source: &ColumnType) -> ColumnType;

    /// Drop and recreate the destination table with mapped column types.
    ///
    /// Fails with `NotFound` if the source table has no columns.
    fn copy_table_definition<'a>(
        &'a self,
        data: &'a dyn DataUtils,
        request: &'a CopyRequest,
    ) -> BoxFuture<'a, Vec<ColumnInfo>> {
        Box::pin(async move {
            let columns = data.columns(&request.source_db, &request.table).await?;
            if columns.is_empty() {
                return Err(DataError::NotFound(format!(
                    "{}.{}",
                    request.source_db, request.table
                )));
            }

            let mapped: Vec<ColumnInfo> = columns
                .iter()
                .map(|c| ColumnInfo {
                    column_type: self.map_type(&c.column_type),
                    ..c.clone()
                })
                .collect();

            data.drop_table(&request.destination_db, &request.destination_table)
                .await?;
            data.create_table(&request.destination_db, &request.destination_table, &mapped)
                .await?;
            Ok(mapped)
        })
    }

    /// Recreate the destination table and copy every row. Returns rows copied.
    fn copy_table<'a>(
        &'a self,
        data: &'a dyn DataUtils,
        request: &'a CopyRequest,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            self.copy_table_definition(data, request).await?;

            let mut offset = 0u64;
            let mut copied = 0u64;
            loop {
                let rows = data
                    .read_rows(&request.source_db, &request.table, offset, COPY_PAGE_SIZE)
                    .await?;
                let fetched = rows.len();
                if fetched == 0 {
                    break;
                }
                copied += data
                    .insert_rows(&request.destination_db, &request.destination_table, rows)
                    .await?;
                offset += fetched as u64;
                if fetched < COPY_PAGE_SIZE {
                    break;
                }
            }

            debug!(
                source = %request.source_db,
                destination = %request.destination_db,
                table = %request.table,
                rows = copied,
                "Table copied"
            );
            Ok(copied)
        })
    }
}

fn lookup(map: &[(&str, &'static str)], base_type: &str) -> Option<&'static str> {
    map.iter()
        .find(|(from, _)| from.eq_ignore_ascii_case(base_type))
        .map(|(_, to)| *to)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQL Server → SQL Server
// ═══════════════════════════════════════════════════════════════════════════════

/// Same-engine copy; types pass through unchanged.
pub struct SqlServerCopier;

impl TableCopier for SqlServerCopier {
    fn source_engine(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    fn destination_engine(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    fn map_type(&self, source: &ColumnType) -> ColumnType {
        source.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQL Server → MySQL
// ═══════════════════════════════════════════════════════════════════════════════

const SQLSERVER_TO_MYSQL: &[(&str, &str)] = &[
    ("bit", "tinyint"),
    ("tinyint", "tinyint"),
    ("smallint", "smallint"),
    ("int", "int"),
    ("bigint", "bigint"),
    ("real", "float"),
    ("float", "double"),
    ("decimal", "decimal"),
    ("numeric", "decimal"),
    ("date", "date"),
    ("time", "time"),
    ("datetime", "datetime"),
    ("datetime2", "datetime"),
    ("smalldatetime", "datetime"),
    ("datetimeoffset", "datetime"),
    ("char", "char"),
    ("nchar", "char"),
    ("varchar", "varchar"),
    ("nvarchar", "varchar"),
    ("text", "longtext"),
    ("ntext", "longtext"),
    ("xml", "longtext"),
    ("binary", "binary"),
    ("varbinary", "varbinary"),
    ("image", "longblob"),
];

/// SQL Server to MySQL.
pub struct SqlServerToMySqlCopier;

impl TableCopier for SqlServerToMySqlCopier {
    fn source_engine(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    fn destination_engine(&self) -> EngineKind {
        EngineKind::MySql
    }

    fn map_type(&self, source: &ColumnType) -> ColumnType {
        let base_type = source.base_type.to_ascii_lowercase();
        match base_type.as_str() {
            "money" => ColumnType::with_precision("decimal", 19, 4),
            "smallmoney" => ColumnType::with_precision("decimal", 10, 4),
            "uniqueidentifier" => ColumnType::with_length("char", 36),
            "rowversion" | "timestamp" => ColumnType::with_length("binary", 8),
            "varchar" | "nvarchar" if source.max_length == Some(-1) => ColumnType::new("longtext"),
            "varbinary" if source.max_length == Some(-1) => ColumnType::new("longblob"),
            "datetime2" | "datetimeoffset" | "time" => {
                // MySQL caps fractional seconds at 6 digits.
                let mut mapped = ColumnType::new(lookup(SQLSERVER_TO_MYSQL, &source.base_type).unwrap_or("datetime"));
                mapped.precision = source.scale.map(|s| s.min(6));
                mapped
            }
            base => match lookup(SQLSERVER_TO_MYSQL, base) {
                Some(target) if target.starts_with("long") => ColumnType::new(target),
                Some(target) => source.renamed(target),
                None => ColumnType::new("longtext"),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQL Server → Netezza
// ═══════════════════════════════════════════════════════════════════════════════

const SQLSERVER_TO_NETEZZA: &[(&str, &str)] = &[
    ("bit", "boolean"),
    ("tinyint", "byteint"),
    ("smallint", "smallint"),
    ("int", "integer"),
    ("bigint", "bigint"),
    ("real", "real"),
    ("float", "double precision"),
    ("decimal", "numeric"),
    ("numeric", "numeric"),
    ("date", "date"),
    ("time", "time"),
    ("datetime", "timestamp"),
    ("datetime2", "timestamp"),
    ("smalldatetime", "timestamp"),
    ("datetimeoffset", "timestamp"),
    ("char", "char"),
    ("nchar", "nchar"),
    ("varchar", "varchar"),
    ("nvarchar", "nvarchar"),
    ("binary", "binary"),
    ("varbinary", "varbinary"),
];

/// Longest VARCHAR Netezza accepts.
const NETEZZA_MAX_VARCHAR: i32 = 64_000;
/// Longest NVARCHAR Netezza accepts.
const NETEZZA_MAX_NVARCHAR: i32 = 16_000;

/// SQL Server to Netezza.
pub struct SqlServerToNetezzaCopier;

impl TableCopier for SqlServerToNetezzaCopier {
    fn source_engine(&self) -> EngineKind {
        EngineKind::SqlServer
    }

    fn destination_engine(&self) -> EngineKind {
        EngineKind::Netezza
    }

    fn map_type(&self, source: &ColumnType) -> ColumnType {
        let base_type = source.base_type.to_ascii_lowercase();
        match base_type.as_str() {
            "money" => ColumnType::with_precision("numeric", 19, 4),
            "smallmoney" => ColumnType::with_precision("numeric", 10, 4),
            "uniqueidentifier" => ColumnType::with_length("char", 36),
            "rowversion" | "timestamp" => ColumnType::with_length("binary", 8),
            "text" | "xml" => ColumnType::with_length("varchar", NETEZZA_MAX_VARCHAR),
            "ntext" => ColumnType::with_length("nvarchar", NETEZZA_MAX_NVARCHAR),
            "image" => ColumnType::with_length("varbinary", NETEZZA_MAX_VARCHAR),
            "varchar" | "varbinary" => {
                let length = clamp_length(source.max_length, NETEZZA_MAX_VARCHAR);
                ColumnType::with_length(&base_type, length)
            }
            "nvarchar" => {
                let length = clamp_length(source.max_length, NETEZZA_MAX_NVARCHAR);
                ColumnType::with_length("nvarchar", length)
            }
            "datetime2" | "datetimeoffset" | "datetime" | "smalldatetime" => ColumnType::new("timestamp"),
            base => match lookup(SQLSERVER_TO_NETEZZA, base) {
                Some(target) => source.renamed(target),
                None => ColumnType::with_length("nvarchar", NETEZZA_MAX_NVARCHAR),
            },
        }
    }
}

fn clamp_length(length: Option<i32>, max: i32) -> i32 {
    match length {
        Some(len) if len > 0 => len.min(max),
        _ => max,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Copiers keyed by `(source, destination)` engine.
#[derive(Default)]
pub struct CopierRegistry {
    copiers: HashMap<(EngineKind, EngineKind), Box<dyn TableCopier>>,
}

impl CopierRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in copier.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SqlServerCopier));
        registry.register(Box::new(SqlServerToMySqlCopier));
        registry.register(Box::new(SqlServerToNetezzaCopier));
        registry
    }

    /// Add or replace the copier for its engine pair.
    pub fn register(&mut self, copier: Box<dyn TableCopier>) {
        let key = (copier.source_engine(), copier.destination_engine());
        self.copiers.insert(key, copier);
    }

    pub fn get(&self, source: EngineKind, destination: EngineKind) -> Result<&dyn TableCopier> {
        self.copiers
            .get(&(source, destination))
            .map(|c| c.as_ref())
            .ok_or_else(|| ReplicationError::NoCopyStrategy {
                source_engine: source.to_string(),
                destination_engine: destination.to_string(),
            })
    }
}
