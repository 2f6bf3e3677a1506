//! Churn feature engineering.
//!
//! Turns per-user event logs and tabular telco customer rows into fixed-width feature tables
//! plus a schema manifest, computing every feature as of a cutoff instant.
//!
//! - event domain: engagement, Islamic calendar, content, social and profile groups
//! - telco domain: demographic, tenure, service, billing and composite groups
//! - upload path: validation gate, auto features, deferred jobs and the HTTP surface

mod api;
mod assembly;
mod auto_features;
mod calendar;
mod config;
mod content;
mod customer;
mod engagement;
mod events;
mod features;
mod islamic;
mod jobs;
mod observability;
mod pipeline;
mod simulator;
mod social;
mod store;
mod tabular;
mod upload;

pub use api::{api_router, AppState, InferenceContext, ValidationErrorBody};
pub use assembly::{
    assemble, AssemblyError, CategoricalSpec, FeatureTable, Labels, UNKNOWN_CATEGORY,
};
pub use auto_features::{auto_features, AUTO_FEATURE_COLUMNS, AUTO_GROUP, NEVER_DAYS};
pub use calendar::{
    load_calendar_json, CalendarConfig, CalendarError, CalendarProvider, CalendarWindow,
    StaticCalendar, EID_AL_FITR, LAST_TEN_NIGHTS, MUHARRAM, RAMADAN,
};
pub use config::{
    pipeline_config_from_env, server_config_from_env, ConfigError, PipelineConfig, ServerConfig,
    DEFAULT_CHURN_INACTIVITY_DAYS, DEFAULT_MANIFEST_PATH,
};
pub use content::{
    content_defaults, content_features, CONTENT_GROUP, CONTENT_SIMULATED_COLUMNS,
    FAVORITE_CONTENT_TYPE, NO_FAVORITE_CONTENT,
};
pub use customer::{
    clean_customer, fetch_dataset, fetch_dataset_with, load_customers_csv, read_customers_csv,
    CleanError, CustomerLoadError, CustomerLoadReport, CustomerRecord, DatasetFetchConfig,
    HttpFetcher, RawCustomerRecord, ReqwestBlockingFetcher, TELCO_DATASET_URL,
};
pub use engagement::{
    engagement_features, streaks, EngagementFeatures, ENGAGEMENT_GROUP, NO_SESSION_RECENCY_DAYS,
};
pub use events::{
    load_events_csv, load_profiles_csv, local_date, parse_date, parse_flag, parse_optional_f64,
    parse_timestamp, read_events_csv, read_profiles_csv, Event, EventLoadError, EventLoadReport,
    SubscriptionType, UserProfile, SESSION_EVENT_TYPE,
};
pub use features::{
    assert_manifest_compatible, ComputationError, FeatureGroupTable, FeatureManifest,
    FeatureSet, FeatureValue, ManifestError, FEATURE_SCHEMA_VERSION,
};
pub use islamic::{islamic_features, IslamicFeatures, ISLAMIC_GROUP, RAMADAN_ONLY_RATIO};
pub use jobs::{
    analyze_upload, AnalysisResult, JobHandle, JobRecord, JobStatus, JobStore, UserFeatureRow,
};
pub use observability::{
    init_logging, log_app_bind, log_app_finish, log_app_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    build_calendar, build_simulator, churn_label, event_categoricals, profile_features,
    run_telco_pipeline, EventPipeline, FeatureOutput, PipelineError, PipelineReport,
    CUSTOMER_ID_COLUMN, EVENT_TARGET_COLUMN, PROFILE_GROUP, TELCO_TARGET_COLUMN, USER_ID_COLUMN,
};
pub use simulator::{DisabledSimulator, FeatureSimulator, HashSeededSimulator};
pub use social::{social_defaults, social_features, SOCIAL_GROUP, SOCIAL_SIMULATED_COLUMNS};
pub use store::{EventStore, InMemoryEventStore, SqliteEventStore, StoreError};
pub use tabular::{
    assign_segment, billing_features, composite_features, contract_length_months,
    default_segment_rules, demographic_features, payment_reliability, service_features,
    tenure_features, tenure_group, SegmentRule, ServiceCounts, TabularConfig, WeightedScore,
    BANK_TRANSFER, BILLING_GROUP, COMPOSITE_GROUP, CREDIT_CARD, DEMOGRAPHIC_GROUP, DSL,
    ELECTRONIC_CHECK, FALLBACK_SEGMENT, FIBER_OPTIC, MAILED_CHECK, MONTH_TO_MONTH, ONE_YEAR,
    SERVICE_GROUP, TELCO_CATEGORICAL_COLUMNS, TENURE_GROUP, TWO_YEAR,
};
pub use upload::{
    parse_csv, parse_json, parse_upload, parse_xlsx, summarize, table_to_events, validate,
    IssueKind, RawTable, UploadError, UploadFormat, UploadSummary, UploadedEvents,
    ValidationFailure, ValidationIssue, ValidationReport, MAX_UPLOAD_BYTES, MIN_UPLOAD_ROWS,
    MIN_UPLOAD_USERS, REQUIRED_UPLOAD_COLUMNS, SESSION_DURATION_COLUMNS,
};
