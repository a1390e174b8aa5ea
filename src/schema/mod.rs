//! Schema change model.
//!
//! The master captures DDL events from the source database, classifies them
//! into [`SchemaChangeDescriptor`]s and publishes them to the relay in a
//! per-batch table. Each slave reads them back and applies them before it
//! applies the batch's data.
//!
//! ```text
//! RawDdlEvent ──► classifier::classify ──► Vec<SchemaChangeDescriptor>
//!   (payload)        (config filter)          (tblCTSchemaChange_{ctid})
//! ```

pub mod classifier;
pub mod event;

pub use classifier::classify;
pub use event::EventData;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine-agnostic column type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnType {
    /// Base type name, lowercase (`varchar`, `decimal`, `int`).
    pub base_type: String,
    /// Character or byte length. `-1` means unbounded (`max`).
    #[serde(default)]
    pub max_length: Option<i32>,
    #[serde(default)]
    pub precision: Option<u8>,
    #[serde(default)]
    pub scale: Option<u8>,
}

impl ColumnType {
    pub fn new(base_type: &str) -> Self {
        Self {
            base_type: base_type.to_lowercase(),
            max_length: None,
            precision: None,
            scale: None,
        }
    }

    pub fn with_length(base_type: &str, max_length: i32) -> Self {
        Self {
            max_length: Some(max_length),
            ..Self::new(base_type)
        }
    }

    pub fn with_precision(base_type: &str, precision: u8, scale: u8) -> Self {
        Self {
            precision: Some(precision),
            scale: Some(scale),
            ..Self::new(base_type)
        }
    }

    /// Same length/precision/scale under a different base type name.
    pub fn renamed(&self, base_type: &str) -> Self {
        Self {
            base_type: base_type.to_lowercase(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ColumnType {
    /// Renders a column definition type, e.g. `varchar(50)`, `nvarchar(max)`,
    /// `decimal(10,2)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.max_length, self.precision, self.scale) {
            (Some(-1), _, _) => write!(f, "{}(max)", self.base_type),
            (Some(len), _, _) => write!(f, "{}({})", self.base_type, len),
            (None, Some(p), Some(s)) => write!(f, "{}({},{})", self.base_type, p, s),
            (None, Some(p), None) => write!(f, "{}({})", self.base_type, p),
            _ => f.write_str(&self.base_type),
        }
    }
}

/// A live column as reported by table introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub is_primary_key: bool,
    pub column_type: ColumnType,
}

impl ColumnInfo {
    pub fn new(name: &str, is_primary_key: bool, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            is_primary_key,
            column_type,
        }
    }
}

/// What a schema change does to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaChangeKind {
    Add,
    Drop,
    Modify,
    Rename,
}

impl SchemaChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeKind::Add => "Add",
            SchemaChangeKind::Drop => "Drop",
            SchemaChangeKind::Modify => "Modify",
            SchemaChangeKind::Rename => "Rename",
        }
    }
}

impl fmt::Display for SchemaChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized column-level DDL change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChangeDescriptor {
    /// Id of the DDL event this came from.
    pub event_id: i64,
    pub kind: SchemaChangeKind,
    pub schema_name: String,
    pub table_name: String,
    /// Affected column. For renames, the new name.
    pub column_name: String,
    /// Column name before a rename.
    #[serde(default)]
    pub previous_column_name: Option<String>,
    /// Type of the column after Add/Modify.
    #[serde(default)]
    pub column_type: Option<ColumnType>,
}

/// A DDL event as captured from the source database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDdlEvent {
    pub event_id: i64,
    pub event_time: DateTime<Utc>,
    /// Structured event body, see [`EventData`].
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_display() {
        assert_eq!(ColumnType::new("INT").to_string(), "int");
        assert_eq!(ColumnType::with_length("varchar", 50).to_string(), "varchar(50)");
        assert_eq!(ColumnType::with_length("nvarchar", -1).to_string(), "nvarchar(max)");
        assert_eq!(
            ColumnType::with_precision("decimal", 10, 2).to_string(),
            "decimal(10,2)"
        );
    }

    #[test]
    fn test_renamed_keeps_dimensions() {
        let original = ColumnType::with_length("nvarchar", 200);
        let mapped = original.renamed("VARCHAR");
        assert_eq!(mapped.base_type, "varchar");
        assert_eq!(mapped.max_length, Some(200));
    }

    #[test]
    fn test_descriptor_json_shape() {
        let descriptor = SchemaChangeDescriptor {
            event_id: 4,
            kind: SchemaChangeKind::Rename,
            schema_name: "dbo".into(),
            table_name: "orders".into(),
            column_name: "total_amount".into(),
            previous_column_name: Some("total".into()),
            column_type: None,
        };
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["kind"], "Rename");
        assert_eq!(json["previous_column_name"], "total");
    }
}
