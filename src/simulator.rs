//! Stand-in values for features with no backing data source yet (social activity, bookmarks).
//!
//! Every simulated column is listed in the manifest's `simulated_columns`.

use sha2::{Digest, Sha256};

pub trait FeatureSimulator: Send + Sync {
    /// Draw from an exponential distribution with the given mean, keyed by entity and slot.
    fn exponential(&self, entity_id: &str, slot: &str, mean: f64) -> f64;

    /// Uniform integer in `[0, upper_exclusive)`; 0 when the range is empty.
    fn below(&self, entity_id: &str, slot: &str, upper_exclusive: u64) -> u64;

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Seeds each draw from SHA-256 of the entity id and slot, so reruns over the same ids agree.
#[derive(Debug, Clone, Default)]
pub struct HashSeededSimulator {
    salt: String,
}

impl HashSeededSimulator {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    fn unit(&self, entity_id: &str, slot: &str) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b"|");
        hasher.update(entity_id.as_bytes());
        hasher.update(b"|");
        hasher.update(slot.as_bytes());
        let digest = hasher.finalize();

        let mut seed = [0_u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mixed = splitmix64(u64::from_le_bytes(seed));
        // 53 significant bits -> [0, 1)
        (mixed >> 11) as f64 / (1_u64 << 53) as f64
    }
}

impl FeatureSimulator for HashSeededSimulator {
    fn exponential(&self, entity_id: &str, slot: &str, mean: f64) -> f64 {
        if mean <= 0.0 {
            return 0.0;
        }
        let u = self.unit(entity_id, slot);
        -mean * (1.0 - u).ln()
    }

    fn below(&self, entity_id: &str, slot: &str, upper_exclusive: u64) -> u64 {
        if upper_exclusive == 0 {
            return 0;
        }
        let u = self.unit(entity_id, slot);
        ((u * upper_exclusive as f64) as u64).min(upper_exclusive - 1)
    }
}

/// Emits zeros; use when simulated columns must not carry any signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSimulator;

impl FeatureSimulator for DisabledSimulator {
    fn exponential(&self, _entity_id: &str, _slot: &str, _mean: f64) -> f64 {
        0.0
    }

    fn below(&self, _entity_id: &str, _slot: &str, _upper_exclusive: u64) -> u64 {
        0
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
