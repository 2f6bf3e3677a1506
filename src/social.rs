//! Social activity features. No social data source exists yet, so every value here is simulated,
//! scaled by how active the user is.

use crate::features::FeatureSet;
use crate::simulator::FeatureSimulator;

pub const SOCIAL_GROUP: &str = "social";
pub const SOCIAL_SIMULATED_COLUMNS: [&str; 4] = [
    "friends_count",
    "shares_sent",
    "comments_made",
    "days_since_last_social",
];

struct Draw {
    column: &'static str,
    heavy_mean: f64,
    light_mean: f64,
    cap: f64,
}

const DRAWS: [Draw; 3] = [
    Draw {
        column: "friends_count",
        heavy_mean: 20.0,
        light_mean: 5.0,
        cap: 500.0,
    },
    Draw {
        column: "shares_sent",
        heavy_mean: 10.0,
        light_mean: 2.0,
        cap: 200.0,
    },
    Draw {
        column: "comments_made",
        heavy_mean: 8.0,
        light_mean: 1.0,
        cap: 300.0,
    },
];

pub fn social_defaults() -> FeatureSet {
    SOCIAL_SIMULATED_COLUMNS
        .iter()
        .fold(FeatureSet::new(), |set, column| set.with(*column, 0_u32))
}

/// `total_events` is the user's event count as of the cutoff.
pub fn social_features(entity_id: &str, total_events: usize, simulator: &dyn FeatureSimulator) -> FeatureSet {
    let mut features = FeatureSet::new();
    for draw in &DRAWS {
        let mean = if total_events > 100 {
            draw.heavy_mean
        } else if total_events > 20 {
            draw.light_mean
        } else {
            0.0
        };
        let value = simulator
            .exponential(entity_id, draw.column, mean)
            .floor()
            .min(draw.cap);
        features.push(draw.column, value);
    }

    let upper = (total_events as u64 + 1).min(31);
    features.push(
        "days_since_last_social",
        simulator.below(entity_id, "days_since_last_social", upper) as f64,
    );
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{DisabledSimulator, HashSeededSimulator};

    #[test]
    fn inactive_users_have_no_social_activity() {
        let sim = HashSeededSimulator::new("social");
        let features = social_features("u1", 0, &sim);
        assert_eq!(features, social_defaults());
        assert_eq!(features.names(), SOCIAL_SIMULATED_COLUMNS.to_vec());
    }

    #[test]
    fn simulated_values_respect_caps() {
        let sim = HashSeededSimulator::new("social");
        for idx in 0..100 {
            let id = format!("user-{idx}");
            let features = social_features(&id, 250, &sim);
            assert!(features.number("friends_count").unwrap() <= 500.0);
            assert!(features.number("shares_sent").unwrap() <= 200.0);
            assert!(features.number("comments_made").unwrap() <= 300.0);
            assert!(features.number("days_since_last_social").unwrap() < 31.0);
        }
    }

    #[test]
    fn disabled_simulator_yields_defaults() {
        assert_eq!(social_features("u1", 500, &DisabledSimulator), social_defaults());
    }
}
