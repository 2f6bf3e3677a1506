//! Raw user events and profiles, with CSV loaders.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const SESSION_EVENT_TYPE: &str = "app_open";

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub user_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub event_type: String,
    pub session_duration_seconds: Option<f64>,
    pub content_category: Option<String>,
    pub donation_amount: Option<f64>,
}

impl Event {
    pub fn new(
        user_id: impl Into<String>,
        event_timestamp: DateTime<Utc>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            event_timestamp,
            event_type: event_type.into(),
            session_duration_seconds: None,
            content_category: None,
            donation_amount: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.session_duration_seconds = Some(seconds);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.content_category = Some(category.into());
        self
    }

    pub fn with_donation(mut self, amount: f64) -> Self {
        self.donation_amount = Some(amount);
        self
    }

    pub fn is_session(&self) -> bool {
        self.event_type == SESSION_EVENT_TYPE
    }

    pub fn duration_or_zero(&self) -> f64 {
        self.session_duration_seconds.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Free,
    Basic,
    Premium,
}

impl SubscriptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "basic" => Some(Self::Basic),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub signup_date: NaiveDate,
    pub subscription_type: SubscriptionType,
    pub location: String,
    pub last_active: Option<NaiveDate>,
    /// Label column when the profile export already carries it.
    pub is_churned: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLoadReport {
    pub rows_read: u64,
    pub rows_loaded: u64,
    pub rows_missing_required: u64,
    pub rows_bad_timestamp: u64,
}

#[derive(Debug, Error)]
pub enum EventLoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("invalid profile field {field} on line {line}: '{value}'")]
    InvalidProfileField {
        line: u64,
        field: &'static str,
        value: String,
    },
    #[error("duplicate profile for user '{0}'")]
    DuplicateProfile(String),
}

pub(crate) struct HeaderIndex {
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    pub(crate) fn new(headers: &StringRecord) -> Self {
        let positions = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_string(), idx))
            .collect();
        Self { positions }
    }

    pub(crate) fn required(&self, name: &'static str) -> Result<usize, EventLoadError> {
        self.positions
            .get(name)
            .copied()
            .ok_or(EventLoadError::MissingColumn(name))
    }

    pub(crate) fn optional(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub(crate) fn first_of(&self, names: &[&str]) -> Option<usize> {
        names.iter().find_map(|name| self.optional(name))
    }
}

/// Parses the timestamp layouts seen in event exports. Naive values are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(trimmed).map(|ts| ts.date_naive()))
}

/// Empty cells and textual nulls read as absent; so do values that fail to parse.
pub fn parse_optional_f64(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if is_null_text(trimmed) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn is_null_text(trimmed: &str) -> bool {
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("nan")
        || trimmed.eq_ignore_ascii_case("null")
        || trimmed.eq_ignore_ascii_case("none")
}

pub fn local_date(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

pub fn load_events_csv(path: &Path) -> Result<(Vec<Event>, EventLoadReport), EventLoadError> {
    let file = File::open(path)?;
    let (events, report) = read_events_csv(file)?;
    info!(
        component = "events",
        event = "events.load.finish",
        path = %path.display(),
        rows_read = report.rows_read,
        rows_loaded = report.rows_loaded,
        rows_missing_required = report.rows_missing_required,
        rows_bad_timestamp = report.rows_bad_timestamp
    );
    Ok((events, report))
}

/// Rows missing a mandatory field or carrying an unparseable timestamp are dropped and counted.
pub fn read_events_csv<R: Read>(reader: R) -> Result<(Vec<Event>, EventLoadReport), EventLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = HeaderIndex::new(reader.headers()?);

    let user_idx = headers.required("user_id")?;
    let ts_idx = headers.required("event_timestamp")?;
    let type_idx = headers.required("event_type")?;
    let duration_idx = headers.first_of(&["session_duration_seconds", "session_duration"]);
    let category_idx = headers.optional("content_category");
    let donation_idx = headers.optional("donation_amount");

    let mut report = EventLoadReport::default();
    let mut events = Vec::new();

    for record in reader.records() {
        let record = record?;
        report.rows_read += 1;

        let user_id = record.get(user_idx).unwrap_or_default().trim();
        let event_type = record.get(type_idx).unwrap_or_default().trim();
        let raw_ts = record.get(ts_idx).unwrap_or_default();
        if user_id.is_empty() || event_type.is_empty() || raw_ts.trim().is_empty() {
            report.rows_missing_required += 1;
            continue;
        }

        let Some(event_timestamp) = parse_timestamp(raw_ts) else {
            report.rows_bad_timestamp += 1;
            continue;
        };

        let mut event = Event::new(user_id, event_timestamp, event_type);
        event.session_duration_seconds = duration_idx
            .and_then(|idx| record.get(idx))
            .and_then(parse_optional_f64);
        event.content_category = category_idx
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .filter(|value| !is_null_text(value))
            .map(str::to_string);
        event.donation_amount = donation_idx
            .and_then(|idx| record.get(idx))
            .and_then(parse_optional_f64);

        events.push(event);
        report.rows_loaded += 1;
    }

    if report.rows_bad_timestamp > 0 {
        warn!(
            component = "events",
            event = "events.load.bad_timestamps",
            rows_bad_timestamp = report.rows_bad_timestamp
        );
    }

    Ok((events, report))
}

pub fn load_profiles_csv(path: &Path) -> Result<Vec<UserProfile>, EventLoadError> {
    let file = File::open(path)?;
    let profiles = read_profiles_csv(file)?;
    info!(
        component = "events",
        event = "profiles.load.finish",
        path = %path.display(),
        profiles = profiles.len()
    );
    Ok(profiles)
}

/// Profiles form the master entity list, so malformed rows fail the load instead of being skipped.
pub fn read_profiles_csv<R: Read>(reader: R) -> Result<Vec<UserProfile>, EventLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);
    let headers = HeaderIndex::new(reader.headers()?);

    let user_idx = headers.required("user_id")?;
    let signup_idx = headers.required("signup_date")?;
    let subscription_idx = headers.required("subscription_type")?;
    let location_idx = headers.required("location")?;
    let last_active_idx = headers.optional("last_active");
    let churned_idx = headers.optional("is_churned");

    let mut seen = std::collections::HashSet::new();
    let mut profiles = Vec::new();

    for (offset, record) in reader.records().enumerate() {
        let record = record?;
        let line = offset as u64 + 2;

        let user_id = record.get(user_idx).unwrap_or_default().trim().to_string();
        if user_id.is_empty() {
            return Err(EventLoadError::InvalidProfileField {
                line,
                field: "user_id",
                value: String::new(),
            });
        }
        if !seen.insert(user_id.clone()) {
            return Err(EventLoadError::DuplicateProfile(user_id));
        }

        let raw_signup = record.get(signup_idx).unwrap_or_default();
        let signup_date =
            parse_date(raw_signup).ok_or_else(|| EventLoadError::InvalidProfileField {
                line,
                field: "signup_date",
                value: raw_signup.to_string(),
            })?;

        let raw_subscription = record.get(subscription_idx).unwrap_or_default();
        let subscription_type = SubscriptionType::parse(raw_subscription).ok_or_else(|| {
            EventLoadError::InvalidProfileField {
                line,
                field: "subscription_type",
                value: raw_subscription.to_string(),
            }
        })?;

        profiles.push(UserProfile {
            user_id,
            signup_date,
            subscription_type,
            location: record.get(location_idx).unwrap_or_default().trim().to_string(),
            last_active: last_active_idx
                .and_then(|idx| record.get(idx))
                .and_then(parse_date),
            is_churned: churned_idx
                .and_then(|idx| record.get(idx))
                .and_then(parse_flag),
        });
    }

    Ok(profiles)
}
