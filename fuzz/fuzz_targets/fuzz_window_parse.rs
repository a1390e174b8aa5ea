//! Fuzz target for ignore-window parsing.

#![no_main]

use chrono::NaiveTime;
use libfuzzer_sys::fuzz_target;
use relay_replicator::planner::IgnoreWindow;

fuzz_target!(|data: (&str, &str, u32)| {
    let (start, end, secs) = data;
    if let Ok(window) = IgnoreWindow::parse(start, end) {
        if let Some(now) = NaiveTime::from_num_seconds_from_midnight_opt(secs % 86_400, 0) {
            let _ = window.contains(now);
        }
    }
});
