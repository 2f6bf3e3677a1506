use std::env;
use std::fs;
use std::path::PathBuf;

use retain::{
    fetch_dataset, init_logging, load_customers_csv, log_app_finish, log_app_start,
    logging_config_from_env, run_telco_pipeline, DatasetFetchConfig, TabularConfig,
    TELCO_DATASET_URL,
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
    log_app_start("telco_pipeline", &logging_cfg);

    let raw_path = path_var("RETAIN_TELCO_PATH", "data/raw/telco_churn.csv");
    let output_path = path_var("RETAIN_TELCO_FEATURES_OUT", "data/processed/telco_features.csv");
    let manifest_path = path_var("RETAIN_TELCO_MANIFEST_PATH", "models/telco_feature_config.json");

    if !raw_path.exists() {
        let url = env::var("RETAIN_TELCO_URL").unwrap_or_else(|_| TELCO_DATASET_URL.to_string());
        let body = fetch_dataset(&url, &DatasetFetchConfig::default())?;
        if let Some(parent) = raw_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&raw_path, body)?;
        println!("Downloaded {} -> {}", url, raw_path.display());
    }

    let (customers, load_report) = load_customers_csv(&raw_path)?;
    let output = run_telco_pipeline(&customers, &TabularConfig::default())?;
    output.write(&output_path, &manifest_path)?;

    println!(
        "Telco features written | customers={} features={} churned={} bad_total_charges={} invalid={} out={} manifest={}",
        output.table.len(),
        output.report.num_features,
        output.report.positive_labels,
        load_report.rows_bad_total_charges,
        load_report.rows_invalid,
        output_path.display(),
        manifest_path.display()
    );
    log_app_finish(
        "telco_pipeline",
        output.report.entities,
        output.report.degraded,
        &output_path,
    );
    Ok(())
}
