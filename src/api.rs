//! HTTP surface: upload analysis jobs, manifest reindexing and inference-context reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::calendar::CalendarProvider;
use crate::events::parse_timestamp;
use crate::features::{FeatureManifest, ManifestError};
use crate::jobs::{analyze_upload, JobStatus, JobStore};
use crate::upload::{parse_upload, validate, UploadError, MAX_UPLOAD_BYTES};

/// Loaded feature manifest. Never mutated; a reload builds a new context and swaps it in.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceContext {
    manifest: FeatureManifest,
    source: PathBuf,
    loaded_at: DateTime<Utc>,
}

impl InferenceContext {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let manifest = FeatureManifest::read_json(path)?;
        info!(
            component = "api",
            event = "api.context.loaded",
            path = %path.display(),
            num_features = manifest.num_features,
            fingerprint = %manifest.fingerprint
        );
        Ok(Self::from_manifest(manifest, path))
    }

    pub fn from_manifest(manifest: FeatureManifest, source: &Path) -> Self {
        Self {
            manifest,
            source: source.to_path_buf(),
            loaded_at: Utc::now(),
        }
    }

    pub fn manifest(&self) -> &FeatureManifest {
        &self.manifest
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn reindex(&self, values: &HashMap<String, f64>) -> Vec<f64> {
        self.manifest.reindex(values)
    }
}

#[derive(Clone)]
pub struct AppState {
    context: Arc<RwLock<Option<Arc<InferenceContext>>>>,
    manifest_path: PathBuf,
    jobs: JobStore,
    calendar: Arc<dyn CalendarProvider>,
    timezone: Tz,
}

impl AppState {
    pub fn new(
        context: Option<InferenceContext>,
        manifest_path: impl Into<PathBuf>,
        calendar: Arc<dyn CalendarProvider>,
        timezone: Tz,
    ) -> Self {
        Self {
            context: Arc::new(RwLock::new(context.map(Arc::new))),
            manifest_path: manifest_path.into(),
            jobs: JobStore::new(),
            calendar,
            timezone,
        }
    }

    /// Starts without a context when the manifest cannot be read; `/api/v1/context/reload`
    /// can load it later.
    pub fn with_manifest_path(
        manifest_path: impl Into<PathBuf>,
        calendar: Arc<dyn CalendarProvider>,
        timezone: Tz,
    ) -> Self {
        let manifest_path = manifest_path.into();
        let context = match InferenceContext::load(&manifest_path) {
            Ok(context) => Some(context),
            Err(err) => {
                warn!(
                    component = "api",
                    event = "api.context.unavailable",
                    path = %manifest_path.display(),
                    error = %err
                );
                None
            }
        };
        Self::new(context, manifest_path, calendar, timezone)
    }

    pub fn context(&self) -> Option<Arc<InferenceContext>> {
        self.context
            .read()
            .expect("inference context lock should not be poisoned")
            .clone()
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Loads the manifest again. On failure the current context stays in place.
    pub fn reload_context(&self) -> Result<Arc<InferenceContext>, ManifestError> {
        let fresh = Arc::new(InferenceContext::load(&self.manifest_path)?);
        *self
            .context
            .write()
            .expect("inference context lock should not be poisoned") = Some(Arc::clone(&fresh));
        Ok(fresh)
    }
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route(
            "/api/v1/uploads",
            post(post_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/v1/jobs/{job_id}", get(get_job))
        .route("/api/v1/jobs/{job_id}/users/{user_id}", get(get_job_user))
        .route("/api/v1/reindex", post(post_reindex))
        .route("/api/v1/context/reload", post(post_context_reload))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ValidationErrorBody {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn rejected(errors: Vec<String>, warnings: Vec<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ValidationErrorBody { errors, warnings }),
    )
        .into_response()
}

async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    let context = state.context();
    Json(json!({
        "status": "ok",
        "context_loaded": context.is_some(),
        "num_features": context.map(|ctx| ctx.manifest().num_features),
        "jobs": state.jobs.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: String,
    as_of: Option<String>,
}

async fn post_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Response {
    info!(
        component = "api",
        event = "http.upload.request",
        filename = %params.filename,
        bytes = body.len()
    );

    let as_of = match params.as_of.as_deref() {
        Some(raw) => match parse_timestamp(raw) {
            Some(ts) => ts,
            None => return rejected(vec![format!("invalid as_of '{raw}'")], Vec::new()),
        },
        None => Utc::now(),
    };

    let filename = params.filename.clone();
    let payload = body.clone();
    let gate = spawn_blocking_logged(move || {
        let table = parse_upload(&filename, &payload)?;
        Ok::<_, UploadError>((validate(&table), table))
    })
    .await;

    let (table, report) = match gate {
        Ok(Ok((Ok(report), table))) => (table, report),
        Ok(Ok((Err(failure), _))) => return rejected(failure.error_messages(), failure.warnings),
        Ok(Err(err)) => {
            warn!(
                component = "api",
                event = "http.upload.rejected",
                filename = %params.filename,
                error = %err
            );
            return rejected(vec![err.to_string()], Vec::new());
        }
        Err(err) => {
            warn!(
                component = "api",
                event = "http.upload.gate_failed",
                filename = %params.filename,
                error = %err
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "upload could not be parsed" })),
            )
                .into_response();
        }
    };

    let handle = state.jobs.create(&params.filename, &body);
    let job_id = handle.id().to_string();
    let warnings = report.warnings.clone();
    let calendar = Arc::clone(&state.calendar);
    let timezone = state.timezone;
    spawn_blocking_logged(move || {
        handle.start();
        match analyze_upload(&table, &report, as_of, calendar.as_ref(), timezone) {
            Ok(result) => handle.complete(result),
            Err(err) => handle.fail(err),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "status_url": format!("/api/v1/jobs/{job_id}"),
            "warnings": warnings,
        })),
    )
        .into_response()
}

/// Runs `work` on the blocking pool under the caller's tracing dispatcher.
fn spawn_blocking_logged<F, T>(work: F) -> tokio::task::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    tokio::task::spawn_blocking(move || tracing::dispatcher::with_default(&dispatch, work))
}

fn job_not_found(job_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown job '{job_id}'") })),
    )
        .into_response()
}

async fn get_job(State(state): State<AppState>, UrlPath(job_id): UrlPath<String>) -> Response {
    match state.jobs.get(&job_id) {
        Some(record) => Json(record).into_response(),
        None => job_not_found(&job_id),
    }
}

/// Users absent from a completed job get an all-zero row rather than a 404.
async fn get_job_user(
    State(state): State<AppState>,
    UrlPath((job_id, user_id)): UrlPath<(String, String)>,
) -> Response {
    let Some(record) = state.jobs.get(&job_id) else {
        return job_not_found(&job_id);
    };
    let JobStatus::Completed { result } = record.status else {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("job '{job_id}' has not completed") })),
        )
            .into_response();
    };

    let found = result.users.iter().find(|row| row.user_id == user_id);
    let values = found.map_or_else(
        || vec![0.0; result.feature_columns.len()],
        |row| row.values.clone(),
    );
    Json(json!({
        "user_id": user_id,
        "found": found.is_some(),
        "feature_columns": result.feature_columns,
        "values": values,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ReindexRequest {
    features: HashMap<String, f64>,
}

async fn post_reindex(
    State(state): State<AppState>,
    Json(request): Json<ReindexRequest>,
) -> Response {
    let Some(context) = state.context() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no feature manifest loaded" })),
        )
            .into_response();
    };
    let values = context.reindex(&request.features);
    Json(json!({
        "fingerprint": context.manifest().fingerprint,
        "feature_columns": context.manifest().feature_columns,
        "values": values,
    }))
    .into_response()
}

async fn post_context_reload(State(state): State<AppState>) -> Response {
    match state.reload_context() {
        Ok(context) => Json(json!({
            "num_features": context.manifest().num_features,
            "fingerprint": context.manifest().fingerprint,
            "loaded_at": context.loaded_at(),
        }))
        .into_response(),
        Err(err) => {
            warn!(
                component = "api",
                event = "api.context.reload_failed",
                path = %state.manifest_path.display(),
                error = %err
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::StaticCalendar;
    use tempfile::tempdir;

    fn manifest(columns: &[&str]) -> FeatureManifest {
        FeatureManifest::new(
            columns.iter().map(|c| c.to_string()).collect(),
            "is_churned",
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn reload_swaps_context_and_keeps_old_one_on_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("feature_config.json");
        manifest(&["a", "b"]).write_json(&path).unwrap();

        let state = AppState::with_manifest_path(&path, Arc::new(StaticCalendar::default()), Tz::UTC);
        let before = state.context().unwrap();
        assert_eq!(before.manifest().num_features, 2);

        manifest(&["a", "b", "c"]).write_json(&path).unwrap();
        let after = state.reload_context().unwrap();
        assert_eq!(after.manifest().num_features, 3);
        // handlers holding the old context still see it unchanged
        assert_eq!(before.manifest().num_features, 2);

        std::fs::write(&path, "{not json").unwrap();
        assert!(state.reload_context().is_err());
        assert_eq!(state.context().unwrap().manifest().num_features, 3);
    }

    #[test]
    fn missing_manifest_starts_without_context() {
        let dir = tempdir().unwrap();
        let state = AppState::with_manifest_path(
            dir.path().join("absent.json"),
            Arc::new(StaticCalendar::default()),
            Tz::UTC,
        );
        assert!(state.context().is_none());
    }
}
