//! Feature values, per-calculator feature sets, and the schema manifest shared by training and inference.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Category(String),
}

impl FeatureValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Category(_) => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Category(value) => Some(value),
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<u32> for FeatureValue {
    fn from(value: u32) -> Self {
        Self::Number(value as f64)
    }
}

impl From<usize> for FeatureValue {
    fn from(value: usize) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for FeatureValue {
    fn from(value: bool) -> Self {
        Self::Number(if value { 1.0 } else { 0.0 })
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::Category(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        Self::Category(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputationError {
    #[error("feature '{feature}' evaluated to non-finite value {value}")]
    NonFinite { feature: &'static str, value: f64 },
    #[error("event store unavailable: {0}")]
    Store(String),
}

/// One calculator's output for one entity, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    values: Vec<(&'static str, FeatureValue)>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, value: impl Into<FeatureValue>) {
        let value = value.into();
        match self.values.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn with(mut self, name: &'static str, value: impl Into<FeatureValue>) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values
            .iter()
            .find(|(existing, _)| *existing == name)
            .map(|(_, value)| value)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FeatureValue::as_number)
    }

    pub fn category(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FeatureValue::as_category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FeatureValue)> {
        self.values.iter().map(|(name, value)| (*name, value))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.values.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rejects NaN and infinite numbers so a single bad entity can be degraded to defaults.
    pub fn ensure_finite(self) -> Result<Self, ComputationError> {
        for (name, value) in &self.values {
            if let FeatureValue::Number(number) = value {
                if !number.is_finite() {
                    return Err(ComputationError::NonFinite {
                        feature: name,
                        value: *number,
                    });
                }
            }
        }
        Ok(self)
    }
}

/// Output of one calculator over a batch of entities.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureGroupTable {
    pub group: &'static str,
    /// Used for master-list entities the calculator produced nothing for.
    pub defaults: Option<FeatureSet>,
    pub rows: Vec<(String, FeatureSet)>,
}

impl FeatureGroupTable {
    pub fn new(group: &'static str, defaults: Option<FeatureSet>) -> Self {
        Self {
            group,
            defaults,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, entity_id: impl Into<String>, features: FeatureSet) {
        self.rows.push((entity_id.into(), features));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureManifest {
    pub version: u32,
    pub fingerprint: String,
    pub feature_columns: Vec<String>,
    pub target_column: String,
    pub num_features: usize,
    pub categorical_encoded: Vec<String>,
    /// Columns filled by a feature simulator rather than observed data.
    #[serde(default)]
    pub simulated_columns: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest lists {listed} features but num_features is {declared}")]
    CountMismatch { listed: usize, declared: usize },
    #[error("manifest repeats feature column '{0}'")]
    DuplicateColumn(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

impl FeatureManifest {
    pub fn new(
        feature_columns: Vec<String>,
        target_column: impl Into<String>,
        categorical_encoded: Vec<String>,
        simulated_columns: Vec<String>,
    ) -> Self {
        let target_column = target_column.into();
        let fingerprint =
            manifest_fingerprint(FEATURE_SCHEMA_VERSION, &target_column, &feature_columns);

        info!(
            component = "features",
            event = "features.manifest.built",
            version = FEATURE_SCHEMA_VERSION,
            column_count = feature_columns.len(),
            categorical = ?categorical_encoded,
            fingerprint = fingerprint
        );

        Self {
            version: FEATURE_SCHEMA_VERSION,
            fingerprint,
            num_features: feature_columns.len(),
            feature_columns,
            target_column,
            categorical_encoded,
            simulated_columns,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.feature_columns.iter().position(|column| column == name)
    }

    /// Orders `values` by the manifest. Absent columns (e.g. a one-hot category unseen in new data)
    /// become 0; names the manifest does not know are dropped.
    pub fn reindex(&self, values: &HashMap<String, f64>) -> Vec<f64> {
        let known: HashSet<&str> = self.feature_columns.iter().map(String::as_str).collect();
        let unknown: Vec<&str> = values
            .keys()
            .map(String::as_str)
            .filter(|name| !known.contains(name) && *name != self.target_column)
            .collect();
        if !unknown.is_empty() {
            debug!(
                component = "features",
                event = "features.reindex.unknown_columns",
                unknown = ?unknown
            );
        }

        self.feature_columns
            .iter()
            .map(|column| values.get(column).copied().unwrap_or(0.0))
            .collect()
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body)?;
        info!(
            component = "features",
            event = "features.manifest.written",
            path = %path.display(),
            num_features = self.num_features
        );
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&raw)?;
        manifest.check_consistency()?;
        Ok(manifest)
    }

    fn check_consistency(&self) -> Result<(), ManifestError> {
        if self.feature_columns.len() != self.num_features {
            return Err(ManifestError::CountMismatch {
                listed: self.feature_columns.len(),
                declared: self.num_features,
            });
        }
        let mut seen = HashSet::new();
        for column in &self.feature_columns {
            if !seen.insert(column.as_str()) {
                return Err(ManifestError::DuplicateColumn(column.clone()));
            }
        }
        let expected =
            manifest_fingerprint(self.version, &self.target_column, &self.feature_columns);
        if expected != self.fingerprint {
            return Err(ManifestError::FingerprintMismatch {
                expected,
                actual: self.fingerprint.clone(),
            });
        }
        Ok(())
    }
}

pub fn assert_manifest_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureManifest,
) -> Result<(), ManifestError> {
    if expected_version != actual.version {
        return Err(ManifestError::VersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(ManifestError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn manifest_fingerprint(version: u32, target_column: &str, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!("target:{target_column};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
