//! Per-user features for uploaded event files, where only the three required columns are
//! guaranteed to exist.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::info;

use crate::calendar::{CalendarProvider, RAMADAN};
use crate::engagement::window_start;
use crate::events::{local_date, Event};
use crate::features::{FeatureGroupTable, FeatureSet};
use crate::upload::UploadedEvents;

pub const AUTO_GROUP: &str = "auto";
/// Recency value used when a user never performed the activity.
pub const NEVER_DAYS: i64 = 999;

pub const AUTO_FEATURE_COLUMNS: [&str; 16] = [
    "total_events",
    "days_since_last_activity",
    "events_last_7d",
    "events_last_30d",
    "days_since_signup",
    "avg_session_duration",
    "unique_event_types",
    "prayer_count",
    "days_since_last_prayer",
    "quran_count",
    "days_since_last_quran",
    "donation_count",
    "total_donation_amount",
    "days_since_last_donation",
    "activity_variance",
    "ramadan_activity",
];

/// One row per user with at least one event at or before `as_of`, in first-seen order.
pub fn auto_features(
    uploaded: &UploadedEvents,
    as_of: DateTime<Utc>,
    calendar: &dyn CalendarProvider,
    tz: Tz,
) -> FeatureGroupTable {
    let mut order: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for event in uploaded.events.iter().filter(|e| e.event_timestamp <= as_of) {
        if seen.insert(event.user_id.as_str()) {
            order.push(event.user_id.as_str());
        }
    }

    let ramadan = calendar.window_asof(RAMADAN, local_date(as_of, tz));
    let mut table = FeatureGroupTable::new(AUTO_GROUP, None);
    for user_id in &order {
        let mut events: Vec<&Event> = uploaded
            .events
            .iter()
            .filter(|e| e.user_id == *user_id && e.event_timestamp <= as_of)
            .collect();
        events.sort_by_key(|e| e.event_timestamp);

        let mut row = user_row(&events, uploaded, as_of);
        let ramadan_activity = ramadan.as_ref().map_or(0, |window| {
            events
                .iter()
                .filter(|e| window.contains(local_date(e.event_timestamp, tz)))
                .count()
        });
        row.push("ramadan_activity", ramadan_activity);
        table.push(*user_id, row);
    }

    info!(
        component = "auto_features",
        event = "auto_features.computed",
        users = table.rows.len(),
        events = uploaded.events.len(),
        as_of = %as_of
    );
    table
}

fn user_row(events: &[&Event], uploaded: &UploadedEvents, as_of: DateTime<Utc>) -> FeatureSet {
    let days_since = |ts: DateTime<Utc>| (as_of - ts).num_days();
    let last_matching = |needles: &[&str]| -> (usize, i64) {
        let matching: Vec<&&Event> = events
            .iter()
            .filter(|e| {
                let lowered = e.event_type.to_ascii_lowercase();
                needles.iter().any(|needle| lowered.contains(needle))
            })
            .collect();
        let recency = matching
            .last()
            .map_or(NEVER_DAYS, |e| days_since(e.event_timestamp));
        (matching.len(), recency)
    };

    // Callers pass at least one event per user.
    let first = events.first().map_or(as_of, |e| e.event_timestamp);
    let last = events.last().map_or(as_of, |e| e.event_timestamp);
    let (week_ago, month_ago) = (window_start(as_of, 7), window_start(as_of, 30));

    let avg_session_minutes = if uploaded.has_session_duration {
        let durations: Vec<f64> = events
            .iter()
            .filter_map(|e| e.session_duration_seconds)
            .collect();
        if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64 / 60.0
        }
    } else {
        0.0
    };

    let unique_types = events
        .iter()
        .map(|e| e.event_type.as_str())
        .collect::<HashSet<_>>()
        .len();
    let (prayer_count, days_since_prayer) = last_matching(&["prayer", "salah"]);
    let (quran_count, days_since_quran) = last_matching(&["quran"]);

    let (donation_count, donation_total, days_since_donation) = if uploaded.has_donation_amount {
        let donations: Vec<&&Event> = events.iter().filter(|e| e.donation_amount.is_some()).collect();
        let total: f64 = donations.iter().filter_map(|e| e.donation_amount).sum();
        let recency = donations
            .last()
            .map_or(NEVER_DAYS, |e| days_since(e.event_timestamp));
        (donations.len(), total, recency)
    } else {
        (0, 0.0, NEVER_DAYS)
    };

    FeatureSet::new()
        .with("total_events", events.len())
        .with("days_since_last_activity", days_since(last))
        .with(
            "events_last_7d",
            events.iter().filter(|e| e.event_timestamp >= week_ago).count(),
        )
        .with(
            "events_last_30d",
            events.iter().filter(|e| e.event_timestamp >= month_ago).count(),
        )
        .with("days_since_signup", days_since(first))
        .with("avg_session_duration", avg_session_minutes)
        .with("unique_event_types", unique_types)
        .with("prayer_count", prayer_count)
        .with("days_since_last_prayer", days_since_prayer)
        .with("quran_count", quran_count)
        .with("days_since_last_quran", days_since_quran)
        .with("donation_count", donation_count)
        .with("total_donation_amount", donation_total)
        .with("days_since_last_donation", days_since_donation)
        .with("activity_variance", gap_std_dev_days(events))
}

/// Sample standard deviation of the gaps between consecutive events, in days.
fn gap_std_dev_days(events: &[&Event]) -> f64 {
    let gaps: Vec<f64> = events
        .windows(2)
        .map(|pair| {
            (pair[1].event_timestamp - pair[0].event_timestamp).num_milliseconds() as f64
                / 86_400_000.0
        })
        .collect();
    if gaps.len() < 2 {
        return 0.0;
    }
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    let variance =
        gaps.iter().map(|gap| (gap - mean).powi(2)).sum::<f64>() / (gaps.len() - 1) as f64;
    variance.sqrt()
}
