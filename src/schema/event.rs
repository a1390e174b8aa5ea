//! DDL event payload format.
//!
//! Payloads follow the field layout of a database-level DDL trigger's event
//! data, serialized as JSON. The engine captures that event data as XML;
//! a [`DataUtils`](crate::dataaccess::DataUtils) implementation converts it
//! to JSON before returning it from `ddl_events_since`. Anything else is
//! rejected as malformed.
//!
//! ```json
//! {
//!   "EventType": "ALTER_TABLE",
//!   "SchemaName": "dbo",
//!   "ObjectName": "orders",
//!   "ObjectType": "TABLE",
//!   "AlterTableActionList": { "Create": { "Columns": ["discount"] } }
//! }
//! ```
//!
//! Column renames arrive as `RENAME` events whose object is the column and
//! whose target is the owning table:
//!
//! ```json
//! {
//!   "EventType": "RENAME",
//!   "SchemaName": "dbo",
//!   "ObjectName": "total",
//!   "ObjectType": "COLUMN",
//!   "NewObjectName": "total_amount",
//!   "TargetObjectName": "orders",
//!   "TargetObjectType": "TABLE"
//! }
//! ```

use crate::error::{ReplicationError, Result};
use serde::Deserialize;

pub const EVENT_ALTER_TABLE: &str = "ALTER_TABLE";
pub const EVENT_RENAME: &str = "RENAME";

/// Top-level DDL event body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventData {
    pub event_type: String,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub new_object_name: Option<String>,
    #[serde(default)]
    pub target_object_name: Option<String>,
    #[serde(default)]
    pub target_object_type: Option<String>,
    #[serde(default)]
    pub alter_table_action_list: Option<AlterTableActionList>,
}

/// Actions of an `ALTER_TABLE` event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AlterTableActionList {
    #[serde(default)]
    pub create: Option<ActionTargets>,
    #[serde(default)]
    pub alter: Option<ActionTargets>,
    #[serde(default)]
    pub drop: Option<ActionTargets>,
}

/// Objects touched by one action.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionTargets {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl EventData {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| ReplicationError::DdlParse(e.to_string()))
    }

    pub fn is_alter_table(&self) -> bool {
        self.event_type.eq_ignore_ascii_case(EVENT_ALTER_TABLE)
    }

    pub fn is_rename(&self) -> bool {
        self.event_type.eq_ignore_ascii_case(EVENT_RENAME)
    }

    /// True when a rename's object is a column of the target table.
    pub fn renames_column(&self) -> bool {
        let column_object = self
            .object_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("COLUMN"));
        column_object
            && self.target_object_name.is_some()
            && self.object_name.is_some()
            && self.new_object_name.is_some()
    }

    /// The table the event is about.
    ///
    /// Column renames name the table as the target object; everything else
    /// names it as the object itself.
    pub fn target_table(&self) -> Option<&str> {
        if self.is_rename() && self.target_object_name.is_some() {
            self.target_object_name.as_deref()
        } else {
            self.object_name.as_deref()
        }
    }
}
