//! Fuzz target for DDL event classification.
//!
//! Arbitrary payloads must yield either a list of changes or an error,
//! never a panic, and every change must name a configured table.

#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use relay_replicator::config::TableConfig;
use relay_replicator::schema::{classify, ColumnType, RawDdlEvent};

fuzz_target!(|payload: &str| {
    let event = RawDdlEvent {
        event_id: 1,
        event_time: Utc::now(),
        payload: payload.to_string(),
    };
    let tables = vec![TableConfig::for_testing("orders")];

    if let Ok(changes) = classify(&event, &tables, |_, _| Some(ColumnType::new("int"))) {
        for change in changes {
            assert!(change.table_name.eq_ignore_ascii_case("orders"));
        }
    }
});
