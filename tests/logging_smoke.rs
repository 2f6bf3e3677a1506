use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use retain::{
    api_router, log_app_bind, log_app_start, validate, AppState, DisabledSimulator, Event,
    EventPipeline, EventStore, LoggingConfig, PipelineConfig, RawTable, StaticCalendar,
    StoreError, SubscriptionType, UserProfile,
};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

struct UnreachableStore;

impl EventStore for UnreachableStore {
    fn events_asof(&self, user_id: &str, _cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
        Err(StoreError::InvalidTimestamp {
            user_id: user_id.to_string(),
            secs: i64::MIN,
            nanos: 0,
        })
    }

    fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

#[test]
fn pipeline_logs_degraded_entities_as_warnings() {
    let logs = capture_logs(Level::INFO, || {
        let config = PipelineConfig::default();
        let calendar = StaticCalendar::default();
        let profile = UserProfile {
            user_id: "u-degraded".to_string(),
            signup_date: chrono::NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            subscription_type: SubscriptionType::Free,
            location: "Lahore".to_string(),
            last_active: None,
            is_churned: None,
        };
        let output = EventPipeline::new(&UnreachableStore, &calendar, &DisabledSimulator, &config)
            .run(&[profile])
            .expect("store failures should degrade rather than abort");
        assert_eq!(output.report.degraded, 1);
    });

    assert!(logs.contains("\"event\":\"pipeline.start\""));
    assert!(logs.contains("\"event\":\"pipeline.entity.degraded\""));
    assert!(logs.contains("\"level\":\"WARN\""));
    assert!(logs.contains("u-degraded"));
    assert!(logs.contains("\"event\":\"pipeline.finish\""));
}

#[test]
fn validation_failure_is_logged() {
    let logs = capture_logs(Level::INFO, || {
        let table = RawTable::new(["user_id"]);
        assert!(validate(&table).is_err());
    });

    assert!(logs.contains("\"event\":\"upload.validation.failed\""));
}

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start("api_server", &cfg);
        log_app_bind("api_server", SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
    assert!(logs.contains("\"component\":\"api_server\""));
}

#[test]
fn rejected_upload_emits_http_event() {
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let state = AppState::new(None, "unused.json", Arc::new(StaticCalendar::default()), Tz::UTC);
            let app = api_router(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/api/v1/uploads?filename=events.csv")
                        .body(Body::from("user_id,event_timestamp,event_type\nu1,2024-01-01,app_open\n"))
                        .expect("request should build"),
                )
                .await
                .expect("upload request should complete");

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        });
    });

    assert!(logs.contains("\"event\":\"http.upload.request\""));
    assert!(logs.contains("\"event\":\"upload.parsed\""));
    assert!(logs.contains("\"event\":\"upload.validation.failed\""));
}
