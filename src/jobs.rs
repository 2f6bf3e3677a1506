//! Deferred analysis of uploaded event files and the in-memory store that tracks them.
//!
//! The store is lost on restart. Each job id has exactly one [`JobHandle`], which is the only
//! way to write that job's slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::assembly::{assemble, AssemblyError, Labels};
use crate::auto_features::auto_features;
use crate::calendar::CalendarProvider;
use crate::pipeline::{EVENT_TARGET_COLUMN, USER_ID_COLUMN};
use crate::upload::{summarize, table_to_events, RawTable, UploadSummary, ValidationReport};

const JOB_ID_HEX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserFeatureRow {
    pub user_id: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub as_of: DateTime<Utc>,
    pub summary: UploadSummary,
    pub warnings: Vec<String>,
    pub rows_dropped: usize,
    pub feature_columns: Vec<String>,
    pub users: Vec<UserFeatureRow>,
}

/// Runs the auto-feature engineer over an already validated upload.
pub fn analyze_upload(
    table: &RawTable,
    report: &ValidationReport,
    as_of: DateTime<Utc>,
    calendar: &dyn CalendarProvider,
    tz: Tz,
) -> Result<AnalysisResult, AssemblyError> {
    let uploaded = table_to_events(table);
    let features = auto_features(&uploaded, as_of, calendar, tz);
    let entity_ids: Vec<String> = features.rows.iter().map(|(id, _)| id.clone()).collect();
    let (assembled, _) = assemble(
        USER_ID_COLUMN,
        &entity_ids,
        &[features],
        &[],
        &Labels::new(EVENT_TARGET_COLUMN),
        &[],
    )?;

    let users = assembled
        .entity_ids
        .iter()
        .cloned()
        .zip(assembled.rows.iter().cloned())
        .map(|(user_id, values)| UserFeatureRow { user_id, values })
        .collect();
    Ok(AnalysisResult {
        as_of,
        summary: summarize(table),
        warnings: report.warnings.clone(),
        rows_dropped: uploaded.rows_dropped,
        feature_columns: assembled.columns,
        users,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed { result: Box<AnalysisResult> },
    Failed { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub filename: String,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
}

type JobSlots = Arc<RwLock<HashMap<String, JobRecord>>>;

#[derive(Clone, Default)]
pub struct JobStore {
    slots: JobSlots,
    sequence: Arc<AtomicU64>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queued job and returns the single handle allowed to update it.
    pub fn create(&self, filename: &str, payload: &[u8]) -> JobHandle {
        let submitted_at = Utc::now();
        let mut slots = self
            .slots
            .write()
            .expect("job store lock should not be poisoned");

        let job_id = loop {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let candidate = job_id_for(filename, payload, submitted_at, sequence);
            if !slots.contains_key(&candidate) {
                break candidate;
            }
        };
        slots.insert(
            job_id.clone(),
            JobRecord {
                job_id: job_id.clone(),
                filename: filename.to_string(),
                submitted_at,
                updated_at: submitted_at,
                status: JobStatus::Queued,
            },
        );
        info!(
            component = "jobs",
            event = "jobs.created",
            job_id = %job_id,
            filename = filename,
            bytes = payload.len()
        );

        JobHandle {
            job_id,
            slots: Arc::clone(&self.slots),
        }
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.slots
            .read()
            .expect("job store lock should not be poisoned")
            .get(job_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .expect("job store lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn job_id_for(filename: &str, payload: &[u8], submitted_at: DateTime<Utc>, sequence: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(b"|");
    hasher.update(submitted_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(b"|");
    hasher.update(sequence.to_le_bytes());
    hasher.update(b"|");
    hasher.update(payload);
    let digest = hex::encode(hasher.finalize());
    digest[..JOB_ID_HEX_LEN].to_string()
}

const ABORTED_ERROR: &str = "analysis aborted";

/// Owner of one job slot. Not `Clone`; terminal updates consume it. Dropping a handle whose
/// job never reached a terminal state, for example when the analysis panicked, fails the job.
pub struct JobHandle {
    job_id: String,
    slots: JobSlots,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.job_id
    }

    pub fn start(&self) {
        self.set(JobStatus::Running);
        info!(component = "jobs", event = "jobs.started", job_id = %self.job_id);
    }

    pub fn complete(self, result: AnalysisResult) {
        let users = result.users.len();
        self.set(JobStatus::Completed {
            result: Box::new(result),
        });
        info!(
            component = "jobs",
            event = "jobs.completed",
            job_id = %self.job_id,
            users = users
        );
    }

    pub fn fail(self, error: impl std::fmt::Display) {
        let error = error.to_string();
        warn!(
            component = "jobs",
            event = "jobs.failed",
            job_id = %self.job_id,
            error = %error
        );
        self.set(JobStatus::Failed { error });
    }

    fn set(&self, status: JobStatus) {
        let mut slots = self
            .slots
            .write()
            .expect("job store lock should not be poisoned");
        if let Some(record) = slots.get_mut(&self.job_id) {
            record.status = status;
            record.updated_at = Utc::now();
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        let Ok(mut slots) = self.slots.write() else {
            return;
        };
        let Some(record) = slots.get_mut(&self.job_id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        warn!(
            component = "jobs",
            event = "jobs.aborted",
            job_id = %self.job_id
        );
        record.status = JobStatus::Failed {
            error: ABORTED_ERROR.to_string(),
        };
        record.updated_at = Utc::now();
    }
}
