//! Pipeline and server settings, read from `RETAIN_*` environment variables.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::events::parse_timestamp;

pub const DEFAULT_CHURN_INACTIVITY_DAYS: i64 = 30;
pub const DEFAULT_MANIFEST_PATH: &str = "models/feature_config.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub as_of: DateTime<Utc>,
    /// Churn labels look at activity up to this instant. Defaults to `as_of`.
    pub label_horizon: DateTime<Utc>,
    pub timezone: Tz,
    pub churn_inactivity_days: i64,
    /// JSON calendar file; the built-in windows are used when unset.
    pub calendar_path: Option<PathBuf>,
    pub simulate: bool,
    pub simulator_salt: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let as_of = Utc
            .with_ymd_and_hms(2024, 11, 10, 0, 0, 0)
            .single()
            .unwrap_or_default();
        Self {
            as_of,
            label_horizon: as_of,
            timezone: Tz::UTC,
            churn_inactivity_days: DEFAULT_CHURN_INACTIVITY_DAYS,
            calendar_path: None,
            simulate: true,
            simulator_salt: "retain".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub manifest_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST_PATH),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Unset or blank variables keep their defaults; malformed ones are errors.
pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    let as_of = read_var("RETAIN_AS_OF")
        .map(|raw| parse_timestamp(&raw).ok_or_else(|| invalid("RETAIN_AS_OF", raw)))
        .transpose()?;
    if let Some(as_of) = as_of {
        config.as_of = as_of;
        config.label_horizon = as_of;
    }

    if let Some(raw) = read_var("RETAIN_LABEL_HORIZON") {
        config.label_horizon =
            parse_timestamp(&raw).ok_or_else(|| invalid("RETAIN_LABEL_HORIZON", raw))?;
    }

    if let Some(raw) = read_var("RETAIN_TIMEZONE") {
        config.timezone = raw
            .parse::<Tz>()
            .map_err(|_| invalid("RETAIN_TIMEZONE", raw.clone()))?;
    }

    if let Some(raw) = read_var("RETAIN_CHURN_INACTIVITY_DAYS") {
        config.churn_inactivity_days = raw
            .parse::<i64>()
            .ok()
            .filter(|days| *days > 0)
            .ok_or_else(|| invalid("RETAIN_CHURN_INACTIVITY_DAYS", raw))?;
    }

    if let Some(raw) = read_var("RETAIN_CALENDAR_PATH") {
        config.calendar_path = Some(PathBuf::from(raw));
    }

    if let Some(raw) = read_var("RETAIN_SIMULATE") {
        config.simulate = parse_bool(&raw).ok_or_else(|| invalid("RETAIN_SIMULATE", raw))?;
    }

    Ok(config)
}

pub fn server_config_from_env() -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();

    if let Some(raw) = read_var("RETAIN_API_ADDR") {
        config.bind_addr = raw
            .parse::<SocketAddr>()
            .map_err(|_| invalid("RETAIN_API_ADDR", raw.clone()))?;
    }

    if let Some(raw) = read_var("RETAIN_MANIFEST_PATH") {
        config.manifest_path = PathBuf::from(raw);
    }

    Ok(config)
}

pub(crate) fn read_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn invalid(var: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { var, value }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
