use std::io::Cursor;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use retain::{
    assemble, assert_manifest_compatible, read_profiles_csv, CategoricalSpec, Event,
    EventPipeline, FeatureGroupTable, FeatureManifest, FeatureOutput, FeatureSet,
    HashSeededSimulator, InMemoryEventStore, Labels, PipelineConfig, SqliteEventStore,
    StaticCalendar, UserProfile, FEATURE_SCHEMA_VERSION,
};
use tempfile::tempdir;

const PROFILES_CSV: &str = "\
user_id,signup_date,subscription_type,location,last_active,is_churned
u1,2024-01-15,premium,Lahore,2024-11-08,
u2,2024-03-01,free,Karachi,,
u3,2024-05-20,basic,Lahore,,0
u4,2024-09-01,free,Dubai,,
u5,2024-10-01,basic,Karachi,,
";

fn as_of() -> DateTime<Utc> {
    PipelineConfig::default().as_of
}

fn profiles() -> Vec<UserProfile> {
    read_profiles_csv(Cursor::new(PROFILES_CSV)).unwrap()
}

fn events() -> Vec<Event> {
    let at = |days_before: i64| as_of() - Duration::days(days_before) + Duration::hours(5);
    vec![
        Event::new("u1", at(3), "app_open").with_duration(600.0),
        Event::new("u1", at(3), "quran_read").with_duration(900.0),
        Event::new("u1", at(2), "app_open").with_duration(300.0),
        Event::new("u1", at(1), "lecture_view").with_duration(1_200.0),
        Event::new("u2", at(45), "app_open"),
        Event::new("u2", at(44), "hadith_read"),
        Event::new("u3", at(20), "app_open"),
        Event::new("u3", at(19), "donation").with_donation(25.0),
        // after the cutoff: must not leak into features
        Event::new("u5", as_of() + Duration::days(2), "app_open"),
    ]
}

fn run(store: &dyn retain::EventStore) -> FeatureOutput {
    let config = PipelineConfig::default();
    let calendar = StaticCalendar::default();
    let simulator = HashSeededSimulator::new(config.simulator_salt.clone());
    EventPipeline::new(store, &calendar, &simulator, &config)
        .run(&profiles())
        .unwrap()
}

fn encoded(output: &FeatureOutput, prefix: &str, categories: &[&str]) -> Vec<usize> {
    categories
        .iter()
        .map(|category| {
            output
                .manifest
                .column_index(&format!("{prefix}_{category}"))
                .unwrap_or_else(|| panic!("missing encoded column {prefix}_{category}"))
        })
        .collect()
}

#[test]
fn every_profile_gets_exactly_one_row() {
    let output = run(&InMemoryEventStore::from_events(events()));

    assert_eq!(output.table.len(), 5);
    assert_eq!(output.table.entity_ids, vec!["u1", "u2", "u3", "u4", "u5"]);
    assert_eq!(output.report.degraded, 0);
    assert_eq!(output.manifest.num_features, output.table.columns.len());

    // u5 only has an event after the cutoff
    assert_eq!(output.table.value("u5", "total_sessions"), Some(0.0));
    assert_eq!(output.table.value("u5", "days_since_last_session"), Some(180.0));
    assert_eq!(output.table.value("u1", "total_sessions"), Some(2.0));
}

#[test]
fn categorical_columns_are_one_hot_with_exactly_one_set() {
    let output = run(&InMemoryEventStore::from_events(events()));

    let location = encoded(&output, "location", &["Dubai", "Karachi", "Lahore"]);
    let subscription = encoded(&output, "subscription", &["free", "basic", "premium"]);
    let content = encoded(&output, "content", &["donation", "hadith_read", "lecture_view", "none"]);

    for row in &output.table.rows {
        for columns in [&location, &subscription, &content] {
            let hot: f64 = columns.iter().map(|idx| row[*idx]).sum();
            assert_eq!(hot, 1.0);
            assert!(columns.iter().all(|idx| row[*idx] == 0.0 || row[*idx] == 1.0));
        }
    }
    assert_eq!(
        output.manifest.categorical_encoded,
        vec!["favorite_content_type", "subscription_type", "location"]
    );
    assert_eq!(
        output.manifest.simulated_columns,
        vec![
            "bookmark_count",
            "friends_count",
            "shares_sent",
            "comments_made",
            "days_since_last_social"
        ]
    );
}

#[test]
fn reruns_are_identical_and_store_backends_agree() {
    let memory = run(&InMemoryEventStore::from_events(events()));
    let again = run(&InMemoryEventStore::from_events(events()));
    assert_eq!(memory.table, again.table);
    assert_eq!(memory.manifest, again.manifest);

    let dir = tempdir().unwrap();
    let sqlite = SqliteEventStore::open(&dir.path().join("events.sqlite")).unwrap();
    sqlite.insert_events(&events()).unwrap();
    let from_sqlite = run(&sqlite);
    assert_eq!(memory.table.columns, from_sqlite.table.columns);
    for (id, row) in memory.table.entity_ids.iter().zip(&memory.table.rows) {
        let other = from_sqlite.table.row(id).unwrap();
        for ((column, left), right) in memory.table.columns.iter().zip(row).zip(other) {
            assert!((left - right).abs() < 1e-9, "{id}.{column}: {left} vs {right}");
        }
    }
}

#[test]
fn labels_follow_profile_flag_then_inactivity() {
    let output = run(&InMemoryEventStore::from_events(events()));
    let label = |id: &str| {
        let idx = output.table.entity_ids.iter().position(|e| e == id).unwrap();
        output.table.targets[idx]
    };

    // last_active two days before the horizon
    assert_eq!(label("u1"), Some(0.0));
    // last session 44 days back
    assert_eq!(label("u2"), Some(1.0));
    // stored flag wins
    assert_eq!(label("u3"), Some(0.0));
    // never active before the horizon
    assert_eq!(label("u4"), Some(1.0));
    assert_eq!(label("u5"), Some(1.0));
    assert_eq!(output.report.positive_labels, 3);
}

#[test]
fn written_manifest_reloads_and_stays_compatible() {
    let output = run(&InMemoryEventStore::from_events(events()));
    let dir = tempdir().unwrap();
    let table_path = dir.path().join("processed/features.csv");
    let manifest_path = dir.path().join("models/feature_config.json");
    output.write(&table_path, &manifest_path).unwrap();

    let reloaded = FeatureManifest::read_json(&manifest_path).unwrap();
    assert_eq!(reloaded, output.manifest);
    assert_manifest_compatible(FEATURE_SCHEMA_VERSION, &output.manifest.fingerprint, &reloaded)
        .unwrap();

    let csv = std::fs::read_to_string(&table_path).unwrap();
    let header = csv.lines().next().unwrap();
    assert!(header.starts_with("user_id,"));
    assert!(header.ends_with(",is_churned"));
    assert_eq!(csv.lines().count(), 6);
}

#[test]
fn unseen_categories_reindex_to_zero() {
    let rows = |location: &str| {
        let mut group = FeatureGroupTable::new("profile", None);
        group.push(
            "a",
            FeatureSet::new()
                .with("tenure_days", 10_u32)
                .with("location", location),
        );
        group
    };
    let training = assemble(
        "user_id",
        &["a".to_string()],
        &[rows("Lahore")],
        &[CategoricalSpec::same_prefix("location")],
        &Labels::new("is_churned"),
        &[],
    )
    .unwrap()
    .1;
    let (inference, _) = assemble(
        "user_id",
        &["a".to_string()],
        &[rows("Quetta")],
        &[CategoricalSpec::same_prefix("location")],
        &Labels::new("is_churned"),
        &[],
    )
    .unwrap();

    let aligned = training.reindex(&inference.row_map("a").unwrap());
    assert_eq!(training.feature_columns, vec!["tenure_days", "location_Lahore"]);
    assert_eq!(aligned, vec![10.0, 0.0]);
}

#[test]
fn signup_date_anchors_days_since_signup() {
    let output = run(&InMemoryEventStore::new());
    let expected =
        (as_of().date_naive() - NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()).num_days() as f64;
    assert_eq!(output.table.value("u1", "days_since_signup"), Some(expected));
    assert_eq!(output.report.degraded, 0);
}
