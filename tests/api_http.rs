use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono_tz::Tz;
use retain::{api_router, AppState, FeatureManifest, StaticCalendar};
use serde_json::Value;
use tempfile::tempdir;
use tower::util::ServiceExt;

fn events_csv(rows: usize, users: usize) -> String {
    let mut body = String::from("user_id,event_timestamp,event_type,session_duration\n");
    for idx in 0..rows {
        let kind = if idx % 3 == 0 { "prayer_log" } else { "app_open" };
        body.push_str(&format!(
            "user_{},2024-04-{:02}T12:00:00Z,{kind},{}\n",
            idx % users,
            idx % 28 + 1,
            60 * (idx % 10)
        ));
    }
    body
}

fn state_without_context() -> AppState {
    AppState::new(
        None,
        "models/absent.json",
        Arc::new(StaticCalendar::default()),
        Tz::UTC,
    )
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

#[tokio::test]
async fn health_reports_context_and_jobs() {
    let app = api_router(state_without_context());
    let (status, body) = call(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["context_loaded"], false);
    assert_eq!(body["jobs"], 0);
}

#[tokio::test]
async fn invalid_upload_returns_every_error_and_warning() {
    let app = api_router(state_without_context());
    let (status, body) = call(
        &app,
        post("/api/v1/uploads?filename=events.csv", "user_id,event_type\nu1,app_open\n"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 3);
    assert!(errors[0].as_str().unwrap().contains("event_timestamp"));
    assert_eq!(body["warnings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let app = api_router(state_without_context());
    let (status, body) = call(&app, post("/api/v1/uploads?filename=events.txt", "a,b\n")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["errors"][0].as_str().unwrap().contains(".txt"));
}

#[tokio::test]
async fn accepted_upload_completes_as_a_job() {
    let app = api_router(state_without_context());
    let (status, accepted) = call(
        &app,
        post(
            "/api/v1/uploads?filename=events.csv&as_of=2024-05-01",
            events_csv(120, 12),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = accepted["job_id"].as_str().unwrap().to_string();
    assert_eq!(job_id.len(), 16);

    let mut record = Value::Null;
    for _ in 0..200 {
        let (status, body) = call(&app, get(&format!("/api/v1/jobs/{job_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"]["state"] == "completed" {
            record = body;
            break;
        }
        assert_ne!(body["status"]["state"], "failed", "{body}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = &record["status"]["result"];
    assert_eq!(result["summary"]["total_events"], 120);
    assert_eq!(result["summary"]["unique_users"], 12);
    assert_eq!(result["users"].as_array().unwrap().len(), 12);
    assert_eq!(result["users"][0]["user_id"], "user_0");

    let (status, known) = call(&app, get(&format!("/api/v1/jobs/{job_id}/users/user_3"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(known["found"], true);

    let (status, unknown) =
        call(&app, get(&format!("/api/v1/jobs/{job_id}/users/nobody"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(unknown["found"], false);
    assert!(unknown["values"]
        .as_array()
        .unwrap()
        .iter()
        .all(|value| value.as_f64() == Some(0.0)));
}

async fn wait_for_terminal(app: &Router, job_id: &str) -> Value {
    for _ in 0..200 {
        let (_, body) = call(app, get(&format!("/api/v1/jobs/{job_id}"))).await;
        let state = body["status"]["state"].as_str().unwrap_or_default().to_string();
        if state == "completed" || state == "failed" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never finished");
}

#[tokio::test]
async fn earliest_as_of_still_finishes_the_job() {
    let app = api_router(state_without_context());
    let (status, accepted) = call(
        &app,
        post(
            "/api/v1/uploads?filename=events.csv&as_of=-262143-01-01",
            events_csv(120, 12),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let record = wait_for_terminal(&app, accepted["job_id"].as_str().unwrap()).await;
    assert_eq!(record["status"]["state"], "completed");
    // every uploaded event lies after the cutoff
    assert_eq!(record["status"]["result"]["users"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = api_router(state_without_context());
    let (status, body) = call(&app, get("/api/v1/jobs/0123456789abcdef")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("0123456789abcdef"));
}

#[tokio::test]
async fn reindex_needs_a_context_and_follows_manifest_order() {
    let dir = tempdir().unwrap();
    let manifest_path = dir.path().join("feature_config.json");
    let state = AppState::new(
        None,
        manifest_path.clone(),
        Arc::new(StaticCalendar::default()),
        Tz::UTC,
    );
    let app = api_router(state);
    let request = r#"{"features": {"location_Lahore": 1.0, "total_sessions": 4.0, "extra": 9.0}}"#;

    let (status, _) = call(&app, post("/api/v1/reindex", request)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = call(&app, post("/api/v1/context/reload", "")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    FeatureManifest::new(
        vec![
            "total_sessions".to_string(),
            "location_Karachi".to_string(),
            "location_Lahore".to_string(),
        ],
        "is_churned",
        vec!["location".to_string()],
        Vec::new(),
    )
    .write_json(&manifest_path)
    .unwrap();

    let (status, reloaded) = call(&app, post("/api/v1/context/reload", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reloaded["num_features"], 3);

    let (status, body) = call(&app, post("/api/v1/reindex", request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["values"], serde_json::json!([4.0, 0.0, 1.0]));
}
