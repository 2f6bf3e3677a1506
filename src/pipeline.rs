//! Batch feature pipelines for the event domain and the telco domain.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::assembly::{assemble, AssemblyError, CategoricalSpec, FeatureTable, Labels};
use crate::calendar::{load_calendar_json, CalendarError, CalendarProvider, StaticCalendar};
use crate::config::PipelineConfig;
use crate::content::{
    content_defaults, content_features, CONTENT_GROUP, CONTENT_SIMULATED_COLUMNS,
    FAVORITE_CONTENT_TYPE,
};
use crate::customer::CustomerRecord;
use crate::engagement::{engagement_features, EngagementFeatures, ENGAGEMENT_GROUP};
use crate::events::{local_date, Event, UserProfile};
use crate::features::{
    ComputationError, FeatureGroupTable, FeatureManifest, FeatureSet, ManifestError,
};
use crate::islamic::{islamic_features, ISLAMIC_GROUP};
use crate::simulator::{DisabledSimulator, FeatureSimulator, HashSeededSimulator};
use crate::social::{social_defaults, social_features, SOCIAL_GROUP, SOCIAL_SIMULATED_COLUMNS};
use crate::store::EventStore;
use crate::tabular::{
    billing_features, composite_features, demographic_features, service_features,
    tenure_features, TabularConfig, BILLING_GROUP, COMPOSITE_GROUP, DEMOGRAPHIC_GROUP,
    SERVICE_GROUP, TELCO_CATEGORICAL_COLUMNS, TENURE_GROUP,
};

pub const PROFILE_GROUP: &str = "profile";
pub const USER_ID_COLUMN: &str = "user_id";
pub const CUSTOMER_ID_COLUMN: &str = "customerID";
pub const EVENT_TARGET_COLUMN: &str = "is_churned";
pub const TELCO_TARGET_COLUMN: &str = "Churn";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("event store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),
    #[error("calendar error: {0}")]
    Calendar(#[from] CalendarError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub entities: usize,
    /// Entities whose features fell back to defaults after a computation error.
    pub degraded: usize,
    pub labelled: usize,
    pub positive_labels: usize,
    pub num_features: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureOutput {
    pub table: FeatureTable,
    pub manifest: FeatureManifest,
    pub report: PipelineReport,
}

impl FeatureOutput {
    pub fn write(&self, table_path: &Path, manifest_path: &Path) -> Result<(), PipelineError> {
        self.table.write_csv(table_path)?;
        self.manifest.write_json(manifest_path)?;
        Ok(())
    }
}

pub fn build_calendar(config: &PipelineConfig) -> Result<StaticCalendar, PipelineError> {
    match &config.calendar_path {
        Some(path) => Ok(load_calendar_json(path)?),
        None => Ok(StaticCalendar::default()),
    }
}

pub fn build_simulator(config: &PipelineConfig) -> Box<dyn FeatureSimulator> {
    if config.simulate {
        Box::new(HashSeededSimulator::new(config.simulator_salt.clone()))
    } else {
        Box::new(DisabledSimulator)
    }
}

pub fn profile_features(profile: &UserProfile, as_of: DateTime<Utc>, tz: Tz) -> FeatureSet {
    FeatureSet::new()
        .with(
            "days_since_signup",
            (local_date(as_of, tz) - profile.signup_date).num_days(),
        )
        .with("subscription_type", profile.subscription_type.as_str())
        .with("location", profile.location.as_str())
}

/// A stored `is_churned` wins. Otherwise the user is churned when their latest activity on or
/// before the horizon is more than `inactivity_days` before it, or when there is none.
pub fn churn_label(
    profile: &UserProfile,
    last_event: Option<DateTime<Utc>>,
    horizon: DateTime<Utc>,
    inactivity_days: i64,
    tz: Tz,
) -> bool {
    if let Some(stored) = profile.is_churned {
        return stored;
    }

    let horizon_date = local_date(horizon, tz);
    let last_activity: Option<NaiveDate> = [
        last_event
            .filter(|ts| *ts <= horizon)
            .map(|ts| local_date(ts, tz)),
        profile.last_active.filter(|date| *date <= horizon_date),
    ]
    .into_iter()
    .flatten()
    .max();

    match last_activity {
        Some(date) => (horizon_date - date).num_days() > inactivity_days,
        None => true,
    }
}

/// Categorical specs of the event-domain table.
pub fn event_categoricals() -> Vec<CategoricalSpec> {
    vec![
        CategoricalSpec::new(FAVORITE_CONTENT_TYPE, "content"),
        CategoricalSpec::new("subscription_type", "subscription")
            .with_categories(["free", "basic", "premium"]),
        CategoricalSpec::new("location", "location"),
    ]
}

struct EventGroups {
    engagement: FeatureSet,
    islamic: FeatureSet,
    content: FeatureSet,
    social: FeatureSet,
}

pub struct EventPipeline<'a> {
    store: &'a dyn EventStore,
    calendar: &'a dyn CalendarProvider,
    simulator: &'a dyn FeatureSimulator,
    config: &'a PipelineConfig,
}

impl<'a> EventPipeline<'a> {
    pub fn new(
        store: &'a dyn EventStore,
        calendar: &'a dyn CalendarProvider,
        simulator: &'a dyn FeatureSimulator,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            store,
            calendar,
            simulator,
            config,
        }
    }

    /// Profiles are the master entity list: every profile yields exactly one row, in order.
    pub fn run(&self, profiles: &[UserProfile]) -> Result<FeatureOutput, PipelineError> {
        let as_of = self.config.as_of;
        info!(
            component = "pipeline",
            event = "pipeline.start",
            domain = "events",
            entities = profiles.len(),
            as_of = %as_of,
            timezone = %self.config.timezone,
            simulate = self.simulator.is_enabled()
        );

        let mut engagement = FeatureGroupTable::new(
            ENGAGEMENT_GROUP,
            Some(EngagementFeatures::default().to_feature_set()),
        );
        let mut islamic = FeatureGroupTable::new(ISLAMIC_GROUP, None);
        let mut content = FeatureGroupTable::new(CONTENT_GROUP, Some(content_defaults()));
        let mut social = FeatureGroupTable::new(SOCIAL_GROUP, Some(social_defaults()));
        let mut profile_group = FeatureGroupTable::new(PROFILE_GROUP, None);
        let mut labels = Labels::new(EVENT_TARGET_COLUMN);
        let mut report = PipelineReport {
            entities: profiles.len(),
            ..PipelineReport::default()
        };

        for profile in profiles {
            let groups = match self.entity_groups(profile) {
                Ok(groups) => groups,
                Err(err) => {
                    warn!(
                        component = "pipeline",
                        event = "pipeline.entity.degraded",
                        entity_id = %profile.user_id,
                        error = %err
                    );
                    report.degraded += 1;
                    self.groups_for(profile, &[])
                }
            };
            engagement.push(profile.user_id.clone(), groups.engagement);
            islamic.push(profile.user_id.clone(), groups.islamic);
            content.push(profile.user_id.clone(), groups.content);
            social.push(profile.user_id.clone(), groups.social);
            profile_group.push(
                profile.user_id.clone(),
                profile_features(profile, as_of, self.config.timezone),
            );

            let churned = churn_label(
                profile,
                self.last_event_before_horizon(&profile.user_id),
                self.config.label_horizon,
                self.config.churn_inactivity_days,
                self.config.timezone,
            );
            labels.insert(profile.user_id.clone(), churned);
            report.labelled += 1;
            report.positive_labels += usize::from(churned);
        }

        let entity_ids: Vec<String> = profiles.iter().map(|p| p.user_id.clone()).collect();
        let simulated: Vec<&str> = CONTENT_SIMULATED_COLUMNS
            .iter()
            .chain(SOCIAL_SIMULATED_COLUMNS.iter())
            .copied()
            .collect();
        let (table, manifest) = assemble(
            USER_ID_COLUMN,
            &entity_ids,
            &[engagement, islamic, content, social, profile_group],
            &event_categoricals(),
            &labels,
            &simulated,
        )?;
        report.num_features = manifest.num_features;

        info!(
            component = "pipeline",
            event = "pipeline.finish",
            domain = "events",
            entities = report.entities,
            degraded = report.degraded,
            positive_labels = report.positive_labels,
            num_features = report.num_features
        );
        Ok(FeatureOutput {
            table,
            manifest,
            report,
        })
    }

    fn entity_groups(&self, profile: &UserProfile) -> Result<EventGroups, ComputationError> {
        let events = self
            .store
            .events_asof(&profile.user_id, self.config.as_of)
            .map_err(|err| ComputationError::Store(err.to_string()))?;
        let groups = self.groups_for(profile, &events);
        Ok(EventGroups {
            engagement: groups.engagement.ensure_finite()?,
            islamic: groups.islamic.ensure_finite()?,
            content: groups.content.ensure_finite()?,
            social: groups.social.ensure_finite()?,
        })
    }

    fn groups_for(&self, profile: &UserProfile, events: &[Event]) -> EventGroups {
        let as_of = self.config.as_of;
        let tz = self.config.timezone;
        EventGroups {
            engagement: engagement_features(events, as_of, tz).to_feature_set(),
            islamic: islamic_features(events, Some(profile), as_of, self.calendar, tz)
                .to_feature_set(),
            content: content_features(&profile.user_id, events, self.simulator),
            social: social_features(&profile.user_id, events.len(), self.simulator),
        }
    }

    fn last_event_before_horizon(&self, user_id: &str) -> Option<DateTime<Utc>> {
        match self.store.events_asof(user_id, self.config.label_horizon) {
            Ok(events) => events.last().map(|event| event.event_timestamp),
            Err(err) => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.label.store_error",
                    entity_id = user_id,
                    error = %err
                );
                None
            }
        }
    }
}

/// Customers are the master entity list. A customer whose row for a group is not finite is
/// left out of that group, so assembly fills it with 0 / `unknown`.
pub fn run_telco_pipeline(
    customers: &[CustomerRecord],
    config: &TabularConfig,
) -> Result<FeatureOutput, PipelineError> {
    info!(
        component = "pipeline",
        event = "pipeline.start",
        domain = "telco",
        entities = customers.len()
    );

    let mut groups = [
        FeatureGroupTable::new(DEMOGRAPHIC_GROUP, None),
        FeatureGroupTable::new(TENURE_GROUP, None),
        FeatureGroupTable::new(SERVICE_GROUP, None),
        FeatureGroupTable::new(BILLING_GROUP, None),
        FeatureGroupTable::new(COMPOSITE_GROUP, None),
    ];
    let mut labels = Labels::new(TELCO_TARGET_COLUMN);
    let mut report = PipelineReport {
        entities: customers.len(),
        ..PipelineReport::default()
    };

    for customer in customers {
        let rows = [
            demographic_features(customer),
            tenure_features(customer),
            service_features(customer),
            billing_features(customer, &config.billing_risk),
            composite_features(
                customer,
                &config.service_satisfaction,
                &config.segment_rules,
            ),
        ];

        let mut degraded = false;
        for (group, row) in groups.iter_mut().zip(rows) {
            match row.ensure_finite() {
                Ok(row) => group.push(customer.customer_id.clone(), row),
                Err(err) => {
                    warn!(
                        component = "pipeline",
                        event = "pipeline.entity.degraded",
                        entity_id = %customer.customer_id,
                        group = group.group,
                        error = %err
                    );
                    degraded = true;
                }
            }
        }
        report.degraded += usize::from(degraded);

        if let Some(churned) = customer.churn {
            labels.insert(customer.customer_id.clone(), churned);
            report.labelled += 1;
            report.positive_labels += usize::from(churned);
        }
    }

    let entity_ids: Vec<String> = customers.iter().map(|c| c.customer_id.clone()).collect();
    let categoricals: Vec<CategoricalSpec> = TELCO_CATEGORICAL_COLUMNS
        .iter()
        .map(|column| CategoricalSpec::same_prefix(*column))
        .collect();
    let (table, manifest) = assemble(
        CUSTOMER_ID_COLUMN,
        &entity_ids,
        &groups,
        &categoricals,
        &labels,
        &[],
    )?;
    report.num_features = manifest.num_features;

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        domain = "telco",
        entities = report.entities,
        degraded = report.degraded,
        positive_labels = report.positive_labels,
        num_features = report.num_features
    );
    Ok(FeatureOutput {
        table,
        manifest,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SubscriptionType;
    use crate::store::{InMemoryEventStore, StoreError};
    use chrono::{Duration, TimeZone};

    fn profile(user_id: &str, is_churned: Option<bool>) -> UserProfile {
        UserProfile {
            user_id: user_id.to_string(),
            signup_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            subscription_type: SubscriptionType::Basic,
            location: "Lahore".to_string(),
            last_active: None,
            is_churned,
        }
    }

    fn horizon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 10, 0, 0, 0).unwrap()
    }

    #[test]
    fn churn_label_uses_inactivity_window() {
        let p = profile("u1", None);
        let recent = horizon() - Duration::days(30);
        let stale = horizon() - Duration::days(31);
        assert!(!churn_label(&p, Some(recent), horizon(), 30, Tz::UTC));
        assert!(churn_label(&p, Some(stale), horizon(), 30, Tz::UTC));
        assert!(churn_label(&p, None, horizon(), 30, Tz::UTC));
        assert!(!churn_label(&profile("u2", Some(false)), None, horizon(), 30, Tz::UTC));

        let mut with_last_active = profile("u3", None);
        with_last_active.last_active = NaiveDate::from_ymd_opt(2024, 11, 1);
        assert!(!churn_label(&with_last_active, Some(stale), horizon(), 30, Tz::UTC));
    }

    struct FailingStore;

    impl EventStore for FailingStore {
        fn events_asof(&self, user_id: &str, _cutoff: DateTime<Utc>) -> Result<Vec<Event>, StoreError> {
            Err(StoreError::InvalidTimestamp {
                user_id: user_id.to_string(),
                secs: -1,
                nanos: -1,
            })
        }

        fn user_ids(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn store_failures_degrade_entities_instead_of_aborting() {
        let config = PipelineConfig::default();
        let calendar = StaticCalendar::default();
        let pipeline = EventPipeline::new(&FailingStore, &calendar, &DisabledSimulator, &config);
        let output = pipeline
            .run(&[profile("u1", None), profile("u2", Some(false))])
            .unwrap();

        assert_eq!(output.report.degraded, 2);
        assert_eq!(output.table.len(), 2);
        assert_eq!(output.table.value("u1", "days_since_last_session"), Some(180.0));
        assert_eq!(output.table.targets, vec![Some(1.0), Some(0.0)]);
    }

    #[test]
    fn events_after_as_of_do_not_change_features() {
        let config = PipelineConfig::default();
        let calendar = StaticCalendar::default();
        let base = vec![
            Event::new("u1", config.as_of - Duration::days(3), "app_open"),
            Event::new("u1", config.as_of - Duration::days(2), "quran_read"),
        ];
        let mut leaked = base.clone();
        leaked.push(Event::new("u1", config.as_of + Duration::hours(1), "app_open"));
        leaked.push(Event::new("u1", config.as_of + Duration::days(5), "lecture_view"));

        let run = |events: Vec<Event>| {
            let store = InMemoryEventStore::from_events(events);
            EventPipeline::new(&store, &calendar, &DisabledSimulator, &config)
                .run(&[profile("u1", Some(false))])
                .unwrap()
                .table
        };
        assert_eq!(run(base), run(leaked));
    }
}
