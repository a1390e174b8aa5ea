//! Batch resizing.
//!
//! During peak hours a master batch is capped at `max_batch_size` versions
//! so each batch stays quick to move. Inside the daily ignore window the cap
//! is lifted and a batch runs to the full version ceiling, letting slaves
//! catch up while traffic is low.
//!
//! The window may wrap midnight:
//!
//! ```text
//! start < end   (02:00 → 05:00)    inside:  start < now <= end
//! start > end   (23:45 → 01:30)    inside:  now > start  or  now <= end
//! ```

use crate::batch::VersionRange;
use crate::error::{ReplicationError, Result};
use chrono::NaiveTime;
use std::fmt;

/// Daily time-of-day window in which batches are not capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoreWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl IgnoreWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse a window from two `"HH:MM"` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?))
    }

    /// True if `now` falls inside the window.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start > self.end {
            now > self.start || now <= self.end
        } else {
            self.start < now && now <= self.end
        }
    }
}

impl fmt::Display for IgnoreWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Parse `"HH:MM"` (24-hour).
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| ReplicationError::Config(format!("Invalid time of day '{}': {}", value, e)))
}

/// Cap a candidate range at `max_span` versions unless resizing is disabled
/// (`max_span <= 0`), the range already fits, or `now` is inside the window.
pub fn resize(
    range: VersionRange,
    max_span: i64,
    window: Option<&IgnoreWindow>,
    now: NaiveTime,
) -> VersionRange {
    if max_span <= 0 || range.span() <= max_span {
        return range;
    }
    if window.is_some_and(|w| w.contains(now)) {
        return range;
    }
    VersionRange::new(range.start, range.start + max_span)
}
