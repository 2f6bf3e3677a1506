//! Named calendar windows (Ramadan, Eid, ...) and daily prayer times, configured per deployment.

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const RAMADAN: &str = "ramadan";
pub const LAST_TEN_NIGHTS: &str = "last_10_nights";
pub const EID_AL_FITR: &str = "eid_al_fitr";
pub const MUHARRAM: &str = "muharram";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarWindow {
    pub name: String,
    pub start: NaiveDate,
    /// Inclusive.
    pub end: NaiveDate,
}

impl CalendarWindow {
    pub fn new(name: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            name: name.into(),
            start,
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub windows: Vec<CalendarWindow>,
    /// Hours from local midnight, e.g. 5.5 for 05:30.
    pub prayer_times_hours: Vec<f64>,
    pub prayer_window_hours: f64,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            windows: vec![
                CalendarWindow::new(RAMADAN, ymd(2024, 3, 11), ymd(2024, 4, 9)),
                CalendarWindow::new(LAST_TEN_NIGHTS, ymd(2024, 3, 30), ymd(2024, 4, 9)),
                CalendarWindow::new(EID_AL_FITR, ymd(2024, 4, 10), ymd(2024, 4, 12)),
                CalendarWindow::new(MUHARRAM, ymd(2024, 7, 7), ymd(2024, 8, 6)),
            ],
            // Fajr, Dhuhr, Asr, Maghrib, Isha
            prayer_times_hours: vec![5.5, 12.5, 15.5, 18.5, 20.0],
            prayer_window_hours: 1.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("calendar JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("calendar window '{name}' ends ({end}) before it starts ({start})")]
    InvertedWindow {
        name: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("prayer time {0} is outside [0, 24)")]
    InvalidPrayerTime(f64),
    #[error("prayer window must be >= 0, got {0}")]
    InvalidPrayerWindow(f64),
}

pub trait CalendarProvider: Send + Sync {
    fn occurrences(&self, name: &str) -> Vec<&CalendarWindow>;

    fn prayer_times_hours(&self) -> &[f64];

    fn prayer_window_hours(&self) -> f64;

    /// Latest occurrence of `name` starting on or before `as_of`. Future windows are never returned.
    fn window_asof(&self, name: &str, as_of: NaiveDate) -> Option<CalendarWindow> {
        self.occurrences(name)
            .into_iter()
            .filter(|window| window.start <= as_of)
            .max_by_key(|window| window.start)
            .cloned()
    }

    fn is_prayer_time(&self, hour_of_day: f64) -> bool {
        let window = self.prayer_window_hours();
        self.prayer_times_hours()
            .iter()
            .any(|prayer| (hour_of_day - prayer).abs() <= window)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticCalendar {
    config: CalendarConfig,
}

impl StaticCalendar {
    pub fn new(config: CalendarConfig) -> Result<Self, CalendarError> {
        for window in &config.windows {
            if window.end < window.start {
                return Err(CalendarError::InvertedWindow {
                    name: window.name.clone(),
                    start: window.start,
                    end: window.end,
                });
            }
        }
        for hour in &config.prayer_times_hours {
            if !(0.0..24.0).contains(hour) {
                return Err(CalendarError::InvalidPrayerTime(*hour));
            }
        }
        if config.prayer_window_hours.is_nan() || config.prayer_window_hours < 0.0 {
            return Err(CalendarError::InvalidPrayerWindow(config.prayer_window_hours));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CalendarConfig {
        &self.config
    }
}

impl Default for StaticCalendar {
    fn default() -> Self {
        Self {
            config: CalendarConfig::default(),
        }
    }
}

impl CalendarProvider for StaticCalendar {
    fn occurrences(&self, name: &str) -> Vec<&CalendarWindow> {
        self.config
            .windows
            .iter()
            .filter(|window| window.name == name)
            .collect()
    }

    fn prayer_times_hours(&self) -> &[f64] {
        &self.config.prayer_times_hours
    }

    fn prayer_window_hours(&self) -> f64 {
        self.config.prayer_window_hours
    }
}

pub fn load_calendar_json(path: &Path) -> Result<StaticCalendar, CalendarError> {
    let raw = fs::read_to_string(path)?;
    let config: CalendarConfig = serde_json::from_str(&raw)?;
    let calendar = StaticCalendar::new(config)?;
    info!(
        component = "calendar",
        event = "calendar.load.finish",
        path = %path.display(),
        windows = calendar.config.windows.len()
    );
    Ok(calendar)
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}
