//! Session engagement features: recency, frequency, duration, streaks.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::events::{local_date, Event};
use crate::features::FeatureSet;

pub const ENGAGEMENT_GROUP: &str = "engagement";

/// Recency reported for users who never opened a session.
pub const NO_SESSION_RECENCY_DAYS: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngagementFeatures {
    pub days_since_last_session: i64,
    pub session_frequency_7d: u32,
    pub session_frequency_30d: u32,
    /// Minutes.
    pub avg_session_duration: f64,
    pub total_sessions: u32,
    pub streak_current: u32,
    pub streak_longest: u32,
    pub sessions_per_week: f64,
    pub weekend_activity_ratio: f64,
}

impl Default for EngagementFeatures {
    fn default() -> Self {
        Self {
            days_since_last_session: NO_SESSION_RECENCY_DAYS,
            session_frequency_7d: 0,
            session_frequency_30d: 0,
            avg_session_duration: 0.0,
            total_sessions: 0,
            streak_current: 0,
            streak_longest: 0,
            sessions_per_week: 0.0,
            weekend_activity_ratio: 0.0,
        }
    }
}

impl EngagementFeatures {
    pub fn to_feature_set(&self) -> FeatureSet {
        FeatureSet::new()
            .with("days_since_last_session", self.days_since_last_session)
            .with("session_frequency_7d", self.session_frequency_7d)
            .with("session_frequency_30d", self.session_frequency_30d)
            .with("avg_session_duration", self.avg_session_duration)
            .with("total_sessions", self.total_sessions)
            .with("streak_current", self.streak_current)
            .with("streak_longest", self.streak_longest)
            .with("sessions_per_week", self.sessions_per_week)
            .with("weekend_activity_ratio", self.weekend_activity_ratio)
    }
}

/// Start of a trailing `days` window; saturates at the earliest representable instant.
pub(crate) fn window_start(as_of: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    as_of
        .checked_sub_signed(Duration::days(days))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `events` must already be cut at `as_of` (see `EventStore::events_asof`).
pub fn engagement_features(events: &[Event], as_of: DateTime<Utc>, tz: Tz) -> EngagementFeatures {
    debug_assert!(events.iter().all(|event| event.event_timestamp <= as_of));

    let sessions: Vec<&Event> = events.iter().filter(|event| event.is_session()).collect();
    let Some(last_session) = sessions.iter().map(|event| event.event_timestamp).max() else {
        return EngagementFeatures::default();
    };

    let week_ago = window_start(as_of, 7);
    let month_ago = window_start(as_of, 30);
    let session_frequency_7d = sessions
        .iter()
        .filter(|event| event.event_timestamp >= week_ago)
        .count() as u32;
    let session_frequency_30d = sessions
        .iter()
        .filter(|event| event.event_timestamp >= month_ago)
        .count() as u32;

    let mut daily_seconds: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for event in events {
        *daily_seconds
            .entry(local_date(event.event_timestamp, tz))
            .or_insert(0.0) += event.duration_or_zero();
    }
    let avg_session_duration = if daily_seconds.is_empty() {
        0.0
    } else {
        daily_seconds.values().sum::<f64>() / daily_seconds.len() as f64 / 60.0
    };

    let session_dates: BTreeSet<NaiveDate> = sessions
        .iter()
        .map(|event| local_date(event.event_timestamp, tz))
        .collect();
    let (streak_current, streak_longest) = streaks(&session_dates, local_date(as_of, tz));

    let total_sessions = sessions.len() as u32;
    let sessions_per_week = events
        .iter()
        .map(|event| event.event_timestamp)
        .min()
        .map(|first_event| {
            let days_active = (as_of - first_event).num_days() + 1;
            let weeks_active = (days_active as f64 / 7.0).max(1.0);
            total_sessions as f64 / weeks_active
        })
        .unwrap_or(0.0);

    let weekend_sessions = sessions
        .iter()
        .filter(|event| {
            matches!(
                event.event_timestamp.with_timezone(&tz).weekday(),
                Weekday::Sat | Weekday::Sun
            )
        })
        .count();

    EngagementFeatures {
        days_since_last_session: (as_of - last_session).num_days(),
        session_frequency_7d,
        session_frequency_30d,
        avg_session_duration,
        total_sessions,
        streak_current,
        streak_longest,
        sessions_per_week,
        weekend_activity_ratio: weekend_sessions as f64 / sessions.len() as f64,
    }
}

/// Returns `(current, longest)`. The current streak counts back from `as_of_date` itself and
/// is 0 when there was no activity on that day.
pub fn streaks(active_dates: &BTreeSet<NaiveDate>, as_of_date: NaiveDate) -> (u32, u32) {
    let mut longest = 0_u32;
    let mut run = 0_u32;
    let mut previous: Option<NaiveDate> = None;
    for date in active_dates {
        run = match previous {
            Some(prev) if prev.succ_opt() == Some(*date) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(*date);
    }

    let mut current = 0_u32;
    let mut cursor = Some(as_of_date);
    while let Some(date) = cursor {
        if !active_dates.contains(&date) {
            break;
        }
        current += 1;
        cursor = date.pred_opt();
    }

    (current, longest)
}
