//! DDL event classification.
//!
//! Turns one captured DDL event into the column-level changes worth
//! replicating. Only configured tables and allow-listed columns survive;
//! table renames, constraint changes and any other DDL yield nothing.
//!
//! | Event | Action list | Result |
//! |-------|-------------|--------|
//! | `ALTER_TABLE` | `Create.Columns` | one `Add` per column |
//! | `ALTER_TABLE` | `Alter.Columns` | one `Modify` per column |
//! | `ALTER_TABLE` | `Drop.Columns` | one `Drop` per column |
//! | `ALTER_TABLE` | constraints only | none |
//! | `RENAME` | column object | one `Rename` |
//! | `RENAME` | table object | none |
//! | anything else | | none |
//!
//! Classification is a pure function. Live column types come from a lookup
//! closure so callers can prefetch them however they like.

use super::event::{ActionTargets, EventData};
use super::{ColumnType, RawDdlEvent, SchemaChangeDescriptor, SchemaChangeKind};
use crate::config::{find_table, TableConfig};
use crate::error::Result;
use tracing::debug;

/// Classify one DDL event against the configured tables.
///
/// `column_type` is called as `(table, column)` for Add/Modify changes and
/// should return the column's current type. A column with no live type is
/// skipped; it has usually been dropped again since the event.
///
/// Returns `Err(DdlParse)` only for a malformed payload. Callers treat that
/// as a discarded event, not a failed stage.
pub fn classify<F>(
    event: &RawDdlEvent,
    tables: &[TableConfig],
    column_type: F,
) -> Result<Vec<SchemaChangeDescriptor>>
where
    F: Fn(&str, &str) -> Option<ColumnType>,
{
    let data = EventData::parse(&event.payload)?;

    let Some(target) = data.target_table() else {
        debug!(event_id = event.event_id, "DDL event names no table");
        return Ok(Vec::new());
    };
    let Some(table) = find_table(tables, target) else {
        debug!(event_id = event.event_id, table = %target, "DDL event for unconfigured table");
        return Ok(Vec::new());
    };

    let schema_name = data
        .schema_name
        .clone()
        .unwrap_or_else(|| table.schema_name.clone());
    let builder = DescriptorBuilder {
        event_id: event.event_id,
        schema_name,
        table,
    };

    if data.is_rename() {
        return Ok(builder.rename(&data).into_iter().collect());
    }
    if !data.is_alter_table() {
        return Ok(Vec::new());
    }
    let Some(actions) = &data.alter_table_action_list else {
        return Ok(Vec::new());
    };

    let mut changes = Vec::new();
    let groups = [
        (SchemaChangeKind::Add, &actions.create),
        (SchemaChangeKind::Modify, &actions.alter),
        (SchemaChangeKind::Drop, &actions.drop),
    ];
    for (kind, targets) in groups {
        if let Some(ActionTargets { columns, .. }) = targets {
            for column in columns {
                if let Some(change) = builder.column_change(kind, column, &column_type) {
                    changes.push(change);
                }
            }
        }
    }
    Ok(changes)
}

struct DescriptorBuilder<'a> {
    event_id: i64,
    schema_name: String,
    table: &'a TableConfig,
}

impl DescriptorBuilder<'_> {
    fn column_change<F>(
        &self,
        kind: SchemaChangeKind,
        column: &str,
        column_type: &F,
    ) -> Option<SchemaChangeDescriptor>
    where
        F: Fn(&str, &str) -> Option<ColumnType>,
    {
        if !self.table.includes_column(column) {
            debug!(
                event_id = self.event_id,
                table = %self.table.name,
                column = %column,
                "Column not in allow-list, change dropped"
            );
            return None;
        }

        let live_type = match kind {
            SchemaChangeKind::Drop => None,
            _ => {
                let found = column_type(&self.table.name, column);
                if found.is_none() {
                    debug!(
                        event_id = self.event_id,
                        table = %self.table.name,
                        column = %column,
                        "Column no longer present, change dropped"
                    );
                    return None;
                }
                found
            }
        };

        Some(SchemaChangeDescriptor {
            event_id: self.event_id,
            kind,
            schema_name: self.schema_name.clone(),
            table_name: self.table.name.clone(),
            column_name: column.to_string(),
            previous_column_name: None,
            column_type: live_type,
        })
    }

    fn rename(&self, data: &EventData) -> Option<SchemaChangeDescriptor> {
        if !data.renames_column() {
            // Table renames are never replicated.
            return None;
        }
        let old = data.object_name.as_deref()?;
        let new = data.new_object_name.as_deref()?;
        if !self.table.includes_column(old) && !self.table.includes_column(new) {
            return None;
        }
        Some(SchemaChangeDescriptor {
            event_id: self.event_id,
            kind: SchemaChangeKind::Rename,
            schema_name: self.schema_name.clone(),
            table_name: self.table.name.clone(),
            column_name: new.to_string(),
            previous_column_name: Some(old.to_string()),
            column_type: None,
        })
    }
}
