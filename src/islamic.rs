//! Islamic-calendar features: Ramadan, the last ten nights, Jummah, prayer times, Eid, Muharram.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::calendar::{
    CalendarProvider, CalendarWindow, EID_AL_FITR, LAST_TEN_NIGHTS, MUHARRAM, RAMADAN,
};
use crate::events::{local_date, Event, UserProfile};
use crate::features::FeatureSet;

pub const ISLAMIC_GROUP: &str = "islamic";

/// Reported when a user was active during Ramadan and never outside it.
pub const RAMADAN_ONLY_RATIO: f64 = 10.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IslamicFeatures {
    pub ramadan_engagement_ratio: f64,
    pub is_ramadan_convert: bool,
    /// Negative while the latest Ramadan is still running.
    pub days_since_ramadan: i64,
    pub last_10_nights_sessions: u32,
    pub jummah_participation_rate: f64,
    pub prayer_time_interaction_rate: f64,
    pub eid_participation: bool,
    pub muharram_participation: bool,
}

impl IslamicFeatures {
    pub fn to_feature_set(&self) -> FeatureSet {
        FeatureSet::new()
            .with("ramadan_engagement_ratio", self.ramadan_engagement_ratio)
            .with("is_ramadan_convert", self.is_ramadan_convert)
            .with("days_since_ramadan", self.days_since_ramadan)
            .with("last_10_nights_sessions", self.last_10_nights_sessions)
            .with("jummah_participation_rate", self.jummah_participation_rate)
            .with("prayer_time_interaction_rate", self.prayer_time_interaction_rate)
            .with("eid_participation", self.eid_participation)
            .with("muharram_participation", self.muharram_participation)
    }
}

/// Profile- and calendar-derived fields are filled even when the user has no sessions.
pub fn islamic_features(
    events: &[Event],
    profile: Option<&UserProfile>,
    as_of: DateTime<Utc>,
    calendar: &dyn CalendarProvider,
    tz: Tz,
) -> IslamicFeatures {
    let as_of_date = local_date(as_of, tz);
    let ramadan = calendar.window_asof(RAMADAN, as_of_date);

    let mut features = IslamicFeatures {
        is_ramadan_convert: profile.is_some_and(|profile| {
            calendar
                .occurrences(RAMADAN)
                .iter()
                .any(|window| window.start <= as_of_date && window.contains(profile.signup_date))
        }),
        days_since_ramadan: ramadan
            .as_ref()
            .map(|window| (as_of_date - window.end).num_days())
            .unwrap_or(0),
        ..IslamicFeatures::default()
    };

    let sessions: Vec<&Event> = events.iter().filter(|event| event.is_session()).collect();
    let (Some(first_session), Some(last_session)) = (
        sessions.iter().map(|event| event.event_timestamp).min(),
        sessions.iter().map(|event| event.event_timestamp).max(),
    ) else {
        return features;
    };
    let session_date = |event: &&Event| local_date(event.event_timestamp, tz);

    features.ramadan_engagement_ratio = ramadan_engagement_ratio(
        &sessions,
        ramadan.as_ref(),
        (last_session - first_session).num_days() + 1,
        tz,
    );

    if let Some(window) = calendar.window_asof(LAST_TEN_NIGHTS, as_of_date) {
        features.last_10_nights_sessions = sessions
            .iter()
            .filter(|event| window.contains(session_date(*event)))
            .count() as u32;
    }

    let days_active = (as_of - first_session).num_days() + 1;
    let whole_weeks = days_active / 7;
    if whole_weeks > 0 {
        let fridays: BTreeSet<NaiveDate> = sessions
            .iter()
            .map(session_date)
            .filter(|date| date.weekday() == Weekday::Fri)
            .collect();
        features.jummah_participation_rate = (fridays.len() as f64 / whole_weeks as f64).min(1.0);
    }

    let prayer_days: BTreeSet<NaiveDate> = events
        .iter()
        .filter(|event| {
            let local = event.event_timestamp.with_timezone(&tz);
            calendar.is_prayer_time(local.hour() as f64 + local.minute() as f64 / 60.0)
        })
        .map(|event| local_date(event.event_timestamp, tz))
        .collect();
    features.prayer_time_interaction_rate = prayer_days.len() as f64 / days_active.max(1) as f64;

    let participated = |name: &str| {
        calendar
            .window_asof(name, as_of_date)
            .is_some_and(|window| sessions.iter().any(|event| window.contains(session_date(event))))
    };
    features.eid_participation = participated(EID_AL_FITR);
    features.muharram_participation = participated(MUHARRAM);

    features
}

/// Sessions per day inside Ramadan over sessions per day outside it, where the outside span is
/// the user's session span minus the Ramadan length.
fn ramadan_engagement_ratio(
    sessions: &[&Event],
    ramadan: Option<&CalendarWindow>,
    session_span_days: i64,
    tz: Tz,
) -> f64 {
    let Some(ramadan) = ramadan else {
        return 0.0;
    };

    let inside = sessions
        .iter()
        .filter(|event| ramadan.contains(local_date(event.event_timestamp, tz)))
        .count();
    let outside = sessions.len() - inside;

    if outside == 0 {
        return if inside > 0 { RAMADAN_ONLY_RATIO } else { 0.0 };
    }

    let ramadan_days = ramadan.len_days();
    let ramadan_rate = inside as f64 / ramadan_days as f64;
    let outside_days = session_span_days - ramadan_days.min(session_span_days);
    if outside_days > 0 {
        ramadan_rate / (outside as f64 / outside_days as f64)
    } else {
        ramadan_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::StaticCalendar;
    use crate::events::SubscriptionType;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn profile(signup: NaiveDate) -> UserProfile {
        UserProfile {
            user_id: "u".to_string(),
            signup_date: signup,
            subscription_type: SubscriptionType::Free,
            location: "Karachi".to_string(),
            last_active: None,
            is_churned: None,
        }
    }

    #[test]
    fn no_sessions_still_reports_profile_and_calendar_fields() {
        let calendar = StaticCalendar::default();
        let signup = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let as_of = at(2024, 11, 10, 0, 0);

        let features = islamic_features(&[], Some(&profile(signup)), as_of, &calendar, Tz::UTC);
        assert!(features.is_ramadan_convert);
        assert_eq!(features.days_since_ramadan, 215);
        assert_eq!(features.ramadan_engagement_ratio, 0.0);
        assert!(!features.eid_participation);
    }

    #[test]
    fn ramadan_only_activity_uses_sentinel() {
        let calendar = StaticCalendar::default();
        let events = vec![
            Event::new("u", at(2024, 3, 15, 21, 0), "app_open"),
            Event::new("u", at(2024, 4, 2, 3, 0), "app_open"),
        ];
        let features = islamic_features(&events, None, at(2024, 5, 1, 0, 0), &calendar, Tz::UTC);
        assert_eq!(features.ramadan_engagement_ratio, RAMADAN_ONLY_RATIO);
        assert_eq!(features.last_10_nights_sessions, 1);
    }

    #[test]
    fn window_flags_and_rates() {
        let calendar = StaticCalendar::default();
        // 2024-04-12 and 2024-07-12 are Fridays.
        let events = vec![
            Event::new("u", at(2024, 4, 1, 12, 0), "app_open"),
            Event::new("u", at(2024, 4, 12, 12, 15), "app_open"),
            Event::new("u", at(2024, 5, 20, 9, 0), "quran_read"),
            Event::new("u", at(2024, 7, 12, 3, 0), "app_open"),
        ];
        let as_of = at(2024, 7, 14, 0, 0);
        let features = islamic_features(&events, None, as_of, &calendar, Tz::UTC);

        assert!(features.eid_participation);
        assert!(features.muharram_participation);
        assert_eq!(features.days_since_ramadan, 96);
        assert!(features.ramadan_engagement_ratio > 0.0);

        let days_active = (as_of - at(2024, 4, 1, 12, 0)).num_days() + 1;
        let expected_jummah = 2.0 / (days_active / 7) as f64;
        assert!((features.jummah_participation_rate - expected_jummah).abs() < 1e-12);
        // 12:00 and 12:15 fall in the Dhuhr window; 09:00 and 03:00 do not.
        let expected_prayer = 2.0 / days_active as f64;
        assert!((features.prayer_time_interaction_rate - expected_prayer).abs() < 1e-12);
    }

    #[test]
    fn jummah_rate_is_capped_at_one() {
        let calendar = StaticCalendar::default();
        // Friday 2024-11-01 and Friday 2024-11-08, as-of a week later: 2 Fridays over 1 whole week.
        let first = at(2024, 11, 1, 10, 0);
        let events = vec![
            Event::new("u", first, "app_open"),
            Event::new("u", first + Duration::days(7), "app_open"),
        ];
        let features = islamic_features(&events, None, first + Duration::days(8), &calendar, Tz::UTC);
        assert_eq!(features.jummah_participation_rate, 1.0);
    }

    #[test]
    fn future_ramadan_is_ignored() {
        let calendar = StaticCalendar::default();
        let as_of = at(2024, 2, 1, 0, 0);
        let events = vec![Event::new("u", at(2024, 1, 20, 8, 0), "app_open")];
        let features = islamic_features(&events, None, as_of, &calendar, Tz::UTC);
        assert_eq!(features.days_since_ramadan, 0);
        assert_eq!(features.ramadan_engagement_ratio, 0.0);
    }
}
