//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use chrono::NaiveTime;
use proptest::prelude::*;
use relay_replicator::batch::VersionRange;
use relay_replicator::config::TableConfig;
use relay_replicator::planner::{resize, should_consolidate, IgnoreWindow};
use relay_replicator::schema::{classify, RawDdlEvent};
use relay_replicator::{Role, Stage, SyncBits};

fn any_stage() -> impl Strategy<Value = Stage> {
    prop::sample::select(Stage::ALL.to_vec())
}

fn any_time() -> impl Strategy<Value = NaiveTime> {
    (0u32..24, 0u32..60, 0u32..60)
        .prop_map(|(h, m, s)| NaiveTime::from_hms_opt(h, m, s).unwrap())
}

fn any_window() -> impl Strategy<Value = Option<IgnoreWindow>> {
    prop::option::of((any_time(), any_time()).prop_map(|(s, e)| IgnoreWindow::new(s, e)))
}

// =============================================================================
// Stage Bits Properties
// =============================================================================

proptest! {
    /// Marking a stage twice is the same as marking it once.
    #[test]
    fn mark_completed_idempotent(raw in any::<i64>(), stage in any_stage()) {
        let bits = SyncBits::from_raw(raw);
        let once = bits.mark_completed(stage);
        prop_assert_eq!(once.mark_completed(stage), once);
        prop_assert!(once.has_completed(stage));
    }

    /// Marking never clears a bit, known or unknown.
    #[test]
    fn mark_completed_monotonic(raw in any::<i64>(), stage in any_stage()) {
        let bits = SyncBits::from_raw(raw);
        let marked = bits.mark_completed(stage);
        prop_assert_eq!(marked.raw() & raw, raw);
    }

    /// Order of completion does not matter.
    #[test]
    fn mark_completed_commutes(a in any_stage(), b in any_stage()) {
        let ab = SyncBits::empty().mark_completed(a).mark_completed(b);
        let ba = SyncBits::empty().mark_completed(b).mark_completed(a);
        prop_assert_eq!(ab, ba);
    }

    /// Terminal for a role exactly when its last stage bit is set.
    #[test]
    fn terminal_tracks_last_stage(raw in any::<i64>()) {
        let bits = SyncBits::from_raw(raw);
        for role in [Role::Master, Role::Slave] {
            prop_assert_eq!(bits.is_terminal(role), bits.has_completed(role.terminal_stage()));
        }
    }

    /// With every earlier stage of the role set there is nothing missing.
    #[test]
    fn no_gap_when_prefix_complete(stage in any_stage()) {
        let mut bits = SyncBits::empty();
        for earlier in stage.role().stages().iter().take_while(|s| **s != stage) {
            bits = bits.mark_completed(*earlier);
        }
        prop_assert_eq!(bits.first_missing_before(stage), None);
    }
}

// =============================================================================
// Resize Properties
// =============================================================================

proptest! {
    /// A range within the span is never changed, whatever the window.
    #[test]
    fn resize_identity_within_span(
        start in 0i64..1_000_000,
        span in 0i64..10_000,
        extra in 0i64..10_000,
        window in any_window(),
        now in any_time(),
    ) {
        let range = VersionRange::new(start, start + span);
        let max_span = span + extra;
        prop_assert_eq!(resize(range, max_span, window.as_ref(), now), range);
    }

    /// A zero span disables resizing.
    #[test]
    fn resize_disabled_at_zero(start in 0i64..1_000_000, span in 0i64..1_000_000, now in any_time()) {
        let range = VersionRange::new(start, start + span);
        prop_assert_eq!(resize(range, 0, None, now), range);
    }

    /// Resizing keeps the start and never grows the range.
    #[test]
    fn resize_only_shrinks(
        start in 0i64..1_000_000,
        span in 0i64..1_000_000,
        max_span in 1i64..100_000,
        window in any_window(),
        now in any_time(),
    ) {
        let range = VersionRange::new(start, start + span);
        let resized = resize(range, max_span, window.as_ref(), now);
        prop_assert_eq!(resized.start, range.start);
        prop_assert!(resized.stop <= range.stop);
        prop_assert!(resized.stop >= resized.start);

        let inside = window.as_ref().map(|w| w.contains(now)).unwrap_or(false);
        if inside {
            prop_assert_eq!(resized, range);
        } else {
            prop_assert!(resized.span() <= max_span);
        }
    }

    /// A window wrapping midnight contains exactly the times a
    /// non-wrapping window over the rest of the day does not.
    #[test]
    fn wrapping_window_complements_daytime(start in any_time(), end in any_time(), now in any_time()) {
        prop_assume!(start > end);
        let night = IgnoreWindow::new(start, end);
        let day = IgnoreWindow::new(end, start);
        prop_assert_ne!(night.contains(now), day.contains(now));
    }

    /// A version range never inverts.
    #[test]
    fn version_range_never_inverts(start in any::<i32>(), stop in any::<i32>()) {
        let range = VersionRange::new(start as i64, stop as i64);
        prop_assert!(range.stop >= range.start);
        prop_assert!(range.span() >= 0);
    }
}

// =============================================================================
// Planner and Classifier Properties
// =============================================================================

proptest! {
    /// Once a backlog consolidates, a larger backlog does too.
    #[test]
    fn consolidation_monotonic(pending in 0usize..1_000, more in 0usize..1_000, threshold in 0usize..100) {
        if should_consolidate(pending, threshold) {
            prop_assert!(should_consolidate(pending + more, threshold));
        }
        prop_assert!(!should_consolidate(pending, 0));
    }

    /// Arbitrary payloads never panic the classifier.
    #[test]
    fn classify_never_panics(payload in ".{0,256}") {
        let event = RawDdlEvent {
            event_id: 1,
            event_time: chrono::Utc::now(),
            payload,
        };
        let tables = vec![TableConfig::for_testing("orders")];
        let _ = classify(&event, &tables, |_, _| None);
    }

    /// Events for tables that are not configured never produce changes.
    #[test]
    fn classify_ignores_unconfigured(table in "[a-z]{1,12}", column in "[a-z]{1,12}") {
        prop_assume!(table != "orders");
        let payload = format!(
            r#"{{"EventType":"ALTER_TABLE","SchemaName":"dbo","ObjectName":"{}","AlterTableActionList":{{"Drop":{{"Columns":["{}"]}}}}}}"#,
            table, column
        );
        let event = RawDdlEvent {
            event_id: 1,
            event_time: chrono::Utc::now(),
            payload,
        };
        let tables = vec![TableConfig::for_testing("orders")];
        let changes = classify(&event, &tables, |_, _| None).unwrap();
        prop_assert!(changes.is_empty());
    }
}
