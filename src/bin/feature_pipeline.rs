use std::env;
use std::path::PathBuf;

use retain::{
    build_calendar, build_simulator, init_logging, load_events_csv, load_profiles_csv,
    log_app_finish, log_app_start, logging_config_from_env, pipeline_config_from_env,
    server_config_from_env, EventPipeline, EventStore, InMemoryEventStore, SqliteEventStore,
};

fn path_var(name: &str, default: &str) -> PathBuf {
    env::var(name)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("feature_pipeline", &logging_cfg);

    let config = pipeline_config_from_env()?;
    let manifest_path = server_config_from_env()?.manifest_path;
    let events_path = path_var("RETAIN_EVENTS_PATH", "data/raw/events.csv");
    let profiles_path = path_var("RETAIN_PROFILES_PATH", "data/raw/users.csv");
    let output_path = path_var("RETAIN_FEATURES_OUT", "data/processed/features.csv");

    let (events, load_report) = load_events_csv(&events_path)?;
    let profiles = load_profiles_csv(&profiles_path)?;

    // RETAIN_EVENT_STORE persists the events into SQLite and reads them back from there.
    let store: Box<dyn EventStore> = match env::var("RETAIN_EVENT_STORE") {
        Ok(raw) if !raw.trim().is_empty() => {
            let sqlite = SqliteEventStore::open(&PathBuf::from(raw.trim()))?;
            sqlite.insert_events(&events)?;
            Box::new(sqlite)
        }
        _ => Box::new(InMemoryEventStore::from_events(events)),
    };

    let calendar = build_calendar(&config)?;
    let simulator = build_simulator(&config);
    let output = EventPipeline::new(store.as_ref(), &calendar, simulator.as_ref(), &config)
        .run(&profiles)?;
    output.write(&output_path, &manifest_path)?;

    println!(
        "Features written | rows={} features={} degraded={} churned={} events_loaded={} events_dropped={} out={} manifest={}",
        output.table.len(),
        output.report.num_features,
        output.report.degraded,
        output.report.positive_labels,
        load_report.rows_loaded,
        load_report.rows_read - load_report.rows_loaded,
        output_path.display(),
        manifest_path.display()
    );
    log_app_finish(
        "feature_pipeline",
        output.report.entities,
        output.report.degraded,
        &output_path,
    );
    Ok(())
}
