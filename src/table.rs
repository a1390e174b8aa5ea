//! Runtime table enrichment.
//!
//! A [`TableConfig`] only names a table and its policy. Before a stage can
//! build data-movement requests it needs the live column set and primary
//! key, which [`enrich`] reads once per run. The result is never mutated
//! afterwards.

use crate::config::{ModifierKind, TableConfig};
use crate::dataaccess::DataUtils;
use crate::error::{ReplicationError, Result};
use crate::resilience::with_timeout;
use crate::schema::{ColumnInfo, ColumnType};
use std::time::Duration;
use tracing::{debug, warn};

/// A configured table joined with its live schema.
#[derive(Debug, Clone)]
pub struct EnrichedTable {
    pub config: TableConfig,
    /// Replicated columns in ordinal order. Primary key columns are always
    /// included, whatever the allow-list says.
    pub columns: Vec<ColumnInfo>,
}

impl EnrichedTable {
    /// Join a config with live columns, applying the allow-list.
    pub fn new(config: TableConfig, live: Vec<ColumnInfo>) -> Result<Self> {
        if !live.iter().any(|c| c.is_primary_key) {
            return Err(ReplicationError::table(
                &config.name,
                "enrich",
                "table has no primary key",
            ));
        }

        if let Some(list) = &config.column_list {
            for wanted in list {
                if !live.iter().any(|c| c.name.eq_ignore_ascii_case(wanted)) {
                    warn!(table = %config.name, column = %wanted, "Allow-listed column does not exist");
                }
            }
        }

        let columns = live
            .into_iter()
            .filter(|c| c.is_primary_key || config.includes_column(&c.name))
            .collect();

        Ok(Self { config, columns })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn primary_keys(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Live type of a replicated column (case-insensitive).
    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
            .map(|c| c.column_type.clone())
    }

    /// `[a], [b], [c]`
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("[{}]", c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Select list for change capture.
    ///
    /// Key columns come from the change rows (`CT`) so deletes keep their
    /// key; everything else comes from the base table (`P`). Modified
    /// columns are rendered through their modifier expression.
    pub fn capture_select_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| {
                if c.is_primary_key {
                    return format!("CT.[{}]", c.name);
                }
                match self.config.modifier_for(&c.name) {
                    Some(m) => match m.kind {
                        ModifierKind::ShortenField => format!(
                            "LEFT(CAST(P.[{0}] AS NVARCHAR(MAX)), {1}) AS [{0}]",
                            c.name, m.length
                        ),
                    },
                    None => format!("P.[{}]", c.name),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `CT.[k1] = P.[k1] AND CT.[k2] = P.[k2]`
    pub fn primary_key_join(&self) -> String {
        self.primary_keys()
            .iter()
            .map(|k| format!("CT.[{0}] = P.[{0}]", k))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

/// Outcome of enriching one configured table.
pub type EnrichResult = std::result::Result<EnrichedTable, (TableConfig, ReplicationError)>;

/// Read live columns for every configured table in `db`.
///
/// Failures are returned per table so the caller can apply the table's
/// stop-on-error policy. Timeouts abort the whole call.
pub async fn enrich(
    data: &dyn DataUtils,
    db: &str,
    tables: &[TableConfig],
    timeout: Duration,
) -> Result<Vec<EnrichResult>> {
    let mut enriched = Vec::with_capacity(tables.len());
    for table in tables {
        let live = with_timeout("columns", timeout, async {
            data.columns(db, &table.name)
                .await
                .map_err(|e| ReplicationError::table(&table.name, "columns", e))
        })
        .await;

        let result = match live {
            Ok(live) => EnrichedTable::new(table.clone(), live),
            Err(e @ ReplicationError::Timeout { .. }) => return Err(e),
            Err(e) => Err(e),
        };

        match result {
            Ok(t) => {
                debug!(db = %db, table = %t.name(), columns = t.columns.len(), "Table enriched");
                enriched.push(Ok(t));
            }
            Err(e) => enriched.push(Err((table.clone(), e))),
        }
    }
    Ok(enriched)
}
