//! Content consumption features over non-session events.

use std::collections::BTreeMap;

use crate::events::Event;
use crate::features::FeatureSet;
use crate::simulator::FeatureSimulator;

pub const CONTENT_GROUP: &str = "content";
pub const FAVORITE_CONTENT_TYPE: &str = "favorite_content_type";
pub const NO_FAVORITE_CONTENT: &str = "none";
pub const CONTENT_SIMULATED_COLUMNS: [&str; 1] = ["bookmark_count"];

/// Events longer than this count as completed content.
const COMPLETION_SECONDS: f64 = 300.0;

pub fn content_defaults() -> FeatureSet {
    FeatureSet::new()
        .with("quran_reading_pct", 0.0)
        .with("hadith_engagement_pct", 0.0)
        .with("lecture_watch_minutes", 0.0)
        .with("fiqh_content_views", 0_u32)
        .with("seerah_content_views", 0_u32)
        .with("tafsir_engagement", 0_u32)
        .with("topic_diversity_score", 0.0)
        .with(FAVORITE_CONTENT_TYPE, NO_FAVORITE_CONTENT)
        .with("content_completion_rate", 0.0)
        .with("bookmark_count", 0_u32)
}

pub fn content_features(
    entity_id: &str,
    events: &[Event],
    simulator: &dyn FeatureSimulator,
) -> FeatureSet {
    let content: Vec<&Event> = events.iter().filter(|event| !event.is_session()).collect();
    if content.is_empty() {
        return content_defaults();
    }

    let total = content.len();
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for event in &content {
        *by_type.entry(event.event_type.as_str()).or_insert(0) += 1;
    }
    let count_of = |event_type: &str| by_type.get(event_type).copied().unwrap_or(0);
    let share = |count: usize| count as f64 / total as f64;

    let lecture_seconds: f64 = content
        .iter()
        .filter(|event| event.event_type == "lecture_view")
        .map(|event| event.duration_or_zero())
        .sum();
    let tafsir = content
        .iter()
        .filter(|event| {
            event.event_type == "tafsir_read" || event.content_category.as_deref() == Some("Tafsir")
        })
        .count();
    let completed = content
        .iter()
        .filter(|event| event.duration_or_zero() > COMPLETION_SECONDS)
        .count();

    // BTreeMap iteration is sorted, so keeping the first strict maximum breaks ties alphabetically.
    let mut favorite = NO_FAVORITE_CONTENT;
    let mut favorite_count = 0;
    for (event_type, count) in &by_type {
        if *count > favorite_count {
            favorite = *event_type;
            favorite_count = *count;
        }
    }

    FeatureSet::new()
        .with("quran_reading_pct", share(count_of("quran_read")))
        .with("hadith_engagement_pct", share(count_of("hadith_read")))
        .with("lecture_watch_minutes", lecture_seconds / 60.0)
        .with("fiqh_content_views", count_of("fiqh_content"))
        .with("seerah_content_views", count_of("seerah_read"))
        .with("tafsir_engagement", tafsir)
        .with("topic_diversity_score", by_type.len() as f64)
        .with(FAVORITE_CONTENT_TYPE, favorite)
        .with("content_completion_rate", share(completed))
        .with("bookmark_count", bookmark_count(entity_id, total, simulator))
}

fn bookmark_count(entity_id: &str, content_events: usize, simulator: &dyn FeatureSimulator) -> u32 {
    let draw = if content_events > 100 {
        simulator
            .exponential(entity_id, "bookmark_count", content_events as f64 / 50.0)
            .min(100.0)
    } else if content_events > 20 {
        simulator.exponential(entity_id, "bookmark_count", 5.0)
    } else {
        0.0
    };
    draw.floor() as u32
}
