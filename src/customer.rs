//! Telco customer rows: CSV loading, cleaning, and remote dataset fetch.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{is_null_text, parse_flag};

pub const TELCO_DATASET_URL: &str =
    "https://raw.githubusercontent.com/carlosfab/dsnp2/master/datasets/WA_Fn-UseC_-Telco-Customer-Churn.csv";

const NO_INTERNET_SERVICE: &str = "No internet service";
const NO_PHONE_SERVICE: &str = "No phone service";

/// One row of the Telco export exactly as it appears on disk.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawCustomerRecord {
    #[serde(rename = "customerID")]
    pub customer_id: String,
    pub gender: String,
    #[serde(rename = "SeniorCitizen")]
    pub senior_citizen: String,
    #[serde(rename = "Partner")]
    pub partner: String,
    #[serde(rename = "Dependents")]
    pub dependents: String,
    pub tenure: String,
    #[serde(rename = "PhoneService")]
    pub phone_service: String,
    #[serde(rename = "MultipleLines")]
    pub multiple_lines: String,
    #[serde(rename = "InternetService")]
    pub internet_service: String,
    #[serde(rename = "OnlineSecurity")]
    pub online_security: String,
    #[serde(rename = "OnlineBackup")]
    pub online_backup: String,
    #[serde(rename = "DeviceProtection")]
    pub device_protection: String,
    #[serde(rename = "TechSupport")]
    pub tech_support: String,
    #[serde(rename = "StreamingTV")]
    pub streaming_tv: String,
    #[serde(rename = "StreamingMovies")]
    pub streaming_movies: String,
    #[serde(rename = "Contract")]
    pub contract: String,
    #[serde(rename = "PaperlessBilling")]
    pub paperless_billing: String,
    #[serde(rename = "PaymentMethod")]
    pub payment_method: String,
    #[serde(rename = "MonthlyCharges")]
    pub monthly_charges: String,
    #[serde(rename = "TotalCharges")]
    pub total_charges: String,
    #[serde(rename = "Churn", default)]
    pub churn: Option<String>,
}

/// A cleaned customer. Service flags are already collapsed from the three-valued export columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: String,
    pub gender: String,
    pub senior_citizen: bool,
    pub partner: bool,
    pub dependents: bool,
    pub tenure_months: u32,
    pub phone_service: bool,
    pub multiple_lines: bool,
    /// `DSL`, `Fiber optic` or `No`.
    pub internet_service: String,
    pub online_security: bool,
    pub online_backup: bool,
    pub device_protection: bool,
    pub tech_support: bool,
    pub streaming_tv: bool,
    pub streaming_movies: bool,
    /// `Month-to-month`, `One year` or `Two year`.
    pub contract: String,
    pub paperless_billing: bool,
    pub payment_method: String,
    pub monthly_charges: f64,
    pub total_charges: f64,
    pub churn: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerLoadReport {
    pub rows_read: u64,
    pub rows_loaded: u64,
    pub rows_bad_total_charges: u64,
    pub rows_invalid: u64,
    pub service_values_rewritten: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CleanError {
    #[error("TotalCharges '{0}' is not a number")]
    TotalCharges(String),
    #[error("invalid {field} value '{value}'")]
    Field { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum CustomerLoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("duplicate customer '{0}'")]
    DuplicateCustomer(String),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFetchConfig {
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DatasetFetchConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 30_000,
            max_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

/// Collapses placeholder service values and coerces numeric columns. The returned count is the
/// number of `No internet service` / `No phone service` cells rewritten to `No`.
pub fn clean_customer(raw: &RawCustomerRecord) -> Result<(CustomerRecord, u64), CleanError> {
    let total_charges = raw
        .total_charges
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| CleanError::TotalCharges(raw.total_charges.clone()))?;

    let mut rewritten = 0;
    let mut service = |field: &'static str, value: &str, placeholder: &str| {
        let trimmed = value.trim();
        if trimmed == placeholder {
            rewritten += 1;
            return Ok(false);
        }
        yes_no(field, trimmed)
    };

    let record = CustomerRecord {
        customer_id: raw.customer_id.trim().to_string(),
        gender: raw.gender.trim().to_string(),
        senior_citizen: yes_no("SeniorCitizen", &raw.senior_citizen)?,
        partner: yes_no("Partner", &raw.partner)?,
        dependents: yes_no("Dependents", &raw.dependents)?,
        tenure_months: raw.tenure.trim().parse::<u32>().map_err(|_| CleanError::Field {
            field: "tenure",
            value: raw.tenure.clone(),
        })?,
        phone_service: yes_no("PhoneService", &raw.phone_service)?,
        multiple_lines: service("MultipleLines", &raw.multiple_lines, NO_PHONE_SERVICE)?,
        internet_service: raw.internet_service.trim().to_string(),
        online_security: service("OnlineSecurity", &raw.online_security, NO_INTERNET_SERVICE)?,
        online_backup: service("OnlineBackup", &raw.online_backup, NO_INTERNET_SERVICE)?,
        device_protection: service(
            "DeviceProtection",
            &raw.device_protection,
            NO_INTERNET_SERVICE,
        )?,
        tech_support: service("TechSupport", &raw.tech_support, NO_INTERNET_SERVICE)?,
        streaming_tv: service("StreamingTV", &raw.streaming_tv, NO_INTERNET_SERVICE)?,
        streaming_movies: service("StreamingMovies", &raw.streaming_movies, NO_INTERNET_SERVICE)?,
        contract: raw.contract.trim().to_string(),
        paperless_billing: yes_no("PaperlessBilling", &raw.paperless_billing)?,
        payment_method: raw.payment_method.trim().to_string(),
        monthly_charges: raw
            .monthly_charges
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| CleanError::Field {
                field: "MonthlyCharges",
                value: raw.monthly_charges.clone(),
            })?,
        total_charges,
        churn: match raw.churn.as_deref().map(str::trim) {
            Some(value) if !is_null_text(value) => Some(yes_no("Churn", value)?),
            _ => None,
        },
    };
    Ok((record, rewritten))
}

fn yes_no(field: &'static str, value: &str) -> Result<bool, CleanError> {
    parse_flag(value).ok_or_else(|| CleanError::Field {
        field,
        value: value.to_string(),
    })
}

pub fn load_customers_csv(
    path: &Path,
) -> Result<(Vec<CustomerRecord>, CustomerLoadReport), CustomerLoadError> {
    let file = File::open(path)?;
    let (customers, report) = read_customers_csv(file)?;
    info!(
        component = "customer",
        event = "customer.load.finish",
        path = %path.display(),
        rows_read = report.rows_read,
        rows_loaded = report.rows_loaded
    );
    Ok((customers, report))
}

/// Rows whose TotalCharges is blank or non-numeric are dropped and counted, as are rows with
/// any other malformed field. Duplicate customer ids fail the load.
pub fn read_customers_csv<R: Read>(
    reader: R,
) -> Result<(Vec<CustomerRecord>, CustomerLoadReport), CustomerLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let mut report = CustomerLoadReport::default();
    let mut seen = HashSet::new();
    let mut customers = Vec::new();

    for row in reader.deserialize::<RawCustomerRecord>() {
        let raw = row?;
        report.rows_read += 1;

        match clean_customer(&raw) {
            Ok((customer, rewritten)) => {
                if !seen.insert(customer.customer_id.clone()) {
                    return Err(CustomerLoadError::DuplicateCustomer(customer.customer_id));
                }
                report.service_values_rewritten += rewritten;
                report.rows_loaded += 1;
                customers.push(customer);
            }
            Err(CleanError::TotalCharges(_)) => report.rows_bad_total_charges += 1,
            Err(err) => {
                warn!(
                    component = "customer",
                    event = "customer.row.invalid",
                    customer_id = %raw.customer_id,
                    error = %err
                );
                report.rows_invalid += 1;
            }
        }
    }

    if report.rows_bad_total_charges > 0 {
        warn!(
            component = "customer",
            event = "customer.clean.dropped_total_charges",
            rows = report.rows_bad_total_charges
        );
    }

    Ok((customers, report))
}

pub trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, CustomerLoadError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, CustomerLoadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| CustomerLoadError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, CustomerLoadError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| CustomerLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CustomerLoadError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| CustomerLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

/// Downloads the raw CSV bytes; callers may persist them before parsing.
pub fn fetch_dataset(url: &str, cfg: &DatasetFetchConfig) -> Result<Vec<u8>, CustomerLoadError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    fetch_dataset_with(&fetcher, url, cfg)
}

pub fn fetch_dataset_with(
    fetcher: &dyn HttpFetcher,
    url: &str,
    cfg: &DatasetFetchConfig,
) -> Result<Vec<u8>, CustomerLoadError> {
    info!(
        component = "customer",
        event = "customer.fetch.start",
        url
    );
    let bytes = retry(cfg, || fetcher.get_bytes(url))?;
    info!(
        component = "customer",
        event = "customer.fetch.finish",
        url,
        bytes = bytes.len()
    );
    Ok(bytes)
}

fn retry<T>(
    cfg: &DatasetFetchConfig,
    mut f: impl FnMut() -> Result<T, CustomerLoadError>,
) -> Result<T, CustomerLoadError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "customer",
                    event = "customer.fetch.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}
