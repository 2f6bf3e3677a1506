//! Telco feature calculators: demographic, tenure, service, billing and composite groups.

use serde::{Deserialize, Serialize};

use crate::customer::CustomerRecord;
use crate::features::FeatureSet;

pub const DEMOGRAPHIC_GROUP: &str = "demographic";
pub const TENURE_GROUP: &str = "tenure";
pub const SERVICE_GROUP: &str = "service";
pub const BILLING_GROUP: &str = "billing";
pub const COMPOSITE_GROUP: &str = "composite";

pub const MONTH_TO_MONTH: &str = "Month-to-month";
pub const ONE_YEAR: &str = "One year";
pub const TWO_YEAR: &str = "Two year";
pub const FIBER_OPTIC: &str = "Fiber optic";
pub const DSL: &str = "DSL";
pub const ELECTRONIC_CHECK: &str = "Electronic check";
pub const MAILED_CHECK: &str = "Mailed check";
pub const BANK_TRANSFER: &str = "Bank transfer (automatic)";
pub const CREDIT_CARD: &str = "Credit card (automatic)";

/// Categorical columns of the telco table, each one-hot encoded under its own name.
pub const TELCO_CATEGORICAL_COLUMNS: [&str; 6] = [
    "household_type",
    "tenure_group",
    "internet_type",
    "contract_type",
    "payment_method",
    "churn_likelihood_segment",
];

const SERVICE_COUNT: f64 = 9.0;
const HIGH_VALUE_MONTHLY_CHARGE: f64 = 80.0;

pub fn demographic_features(customer: &CustomerRecord) -> FeatureSet {
    let household_type = if customer.dependents {
        "family"
    } else if customer.partner {
        "couple"
    } else {
        "single"
    };

    FeatureSet::new()
        .with("is_senior", customer.senior_citizen)
        .with("has_partner", customer.partner)
        .with("has_dependents", customer.dependents)
        .with("is_male", customer.gender == "Male")
        .with(
            "family_size",
            1 + u32::from(customer.partner) + u32::from(customer.dependents),
        )
        .with("household_type", household_type)
}

pub fn tenure_group(tenure_months: u32) -> &'static str {
    match tenure_months {
        0..=6 => "0-6 months",
        7..=12 => "7-12 months",
        13..=24 => "13-24 months",
        25..=48 => "25-48 months",
        _ => "49+ months",
    }
}

pub fn tenure_features(customer: &CustomerRecord) -> FeatureSet {
    let tenure = customer.tenure_months;
    let tenure_f = tenure as f64;
    let lifetime_denominator = customer.monthly_charges * tenure_f;
    let is_monthly = customer.contract == MONTH_TO_MONTH;

    FeatureSet::new()
        .with("tenure_months", tenure)
        .with("tenure_years", (tenure_f / 12.0 * 10.0).round() / 10.0)
        .with("tenure_group", tenure_group(tenure))
        .with("is_new_customer", tenure <= 6)
        .with(
            "customer_lifetime_ratio",
            if lifetime_denominator > 0.0 {
                customer.total_charges / lifetime_denominator
            } else {
                0.0
            },
        )
        .with(
            "avg_monthly_spend",
            if tenure > 0 {
                customer.total_charges / tenure_f
            } else {
                customer.monthly_charges
            },
        )
        .with("early_lifecycle_risk", tenure < 12 && is_monthly)
        .with(
            "tenure_contract_mismatch",
            (tenure < 12 && customer.contract == TWO_YEAR) || (tenure > 24 && is_monthly),
        )
}

/// Counts shared by the service, billing and composite groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceCounts {
    pub total: u32,
    pub security: u32,
    pub streaming: u32,
}

impl ServiceCounts {
    pub fn of(customer: &CustomerRecord) -> Self {
        let flags = [
            customer.phone_service,
            customer.multiple_lines,
            has_internet(customer),
            customer.online_security,
            customer.online_backup,
            customer.device_protection,
            customer.tech_support,
            customer.streaming_tv,
            customer.streaming_movies,
        ];
        Self {
            total: flags.iter().filter(|flag| **flag).count() as u32,
            security: [
                customer.online_security,
                customer.online_backup,
                customer.device_protection,
            ]
            .iter()
            .filter(|flag| **flag)
            .count() as u32,
            streaming: u32::from(customer.streaming_tv) + u32::from(customer.streaming_movies),
        }
    }

    pub fn penetration_rate(&self) -> f64 {
        self.total as f64 / SERVICE_COUNT
    }
}

fn has_internet(customer: &CustomerRecord) -> bool {
    customer.internet_service != "No"
}

pub fn service_features(customer: &CustomerRecord) -> FeatureSet {
    let counts = ServiceCounts::of(customer);
    FeatureSet::new()
        .with("has_phone_service", customer.phone_service)
        .with("has_multiple_lines", customer.multiple_lines)
        .with("has_internet", has_internet(customer))
        .with("internet_type", customer.internet_service.as_str())
        .with("has_online_security", customer.online_security)
        .with("has_online_backup", customer.online_backup)
        .with("has_device_protection", customer.device_protection)
        .with("has_tech_support", customer.tech_support)
        .with("has_streaming_tv", customer.streaming_tv)
        .with("has_streaming_movies", customer.streaming_movies)
        .with("total_services", counts.total)
        .with("security_services_count", counts.security)
        .with("streaming_services_count", counts.streaming)
        .with("service_penetration_rate", counts.penetration_rate())
        .with("has_premium_internet", customer.internet_service == FIBER_OPTIC)
}

/// A named weighted sum of `[0, 1]` signals, divided by `normalizer` and optionally clipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    pub name: String,
    pub weights: Vec<(String, f64)>,
    pub normalizer: f64,
    pub clip_unit: bool,
}

impl WeightedScore {
    pub fn billing_risk() -> Self {
        Self {
            name: "billing_risk_score".to_string(),
            weights: vec![
                ("paperless".to_string(), 0.3),
                ("electronic_check".to_string(), 0.5),
                ("monthly_contract".to_string(), 0.4),
            ],
            normalizer: 1.2,
            clip_unit: false,
        }
    }

    pub fn service_satisfaction() -> Self {
        Self {
            name: "service_satisfaction_score".to_string(),
            weights: vec![
                ("fiber".to_string(), 0.2),
                ("dsl".to_string(), 0.1),
                ("security_share".to_string(), 0.3),
                ("streaming_share".to_string(), 0.2),
                ("tech_support".to_string(), 0.15),
                ("penetration".to_string(), 0.15),
            ],
            normalizer: 1.0,
            clip_unit: true,
        }
    }

    /// Signals missing from `signals` contribute nothing.
    pub fn score(&self, signals: &[(&str, f64)]) -> f64 {
        let raw: f64 = self
            .weights
            .iter()
            .map(|(signal, weight)| {
                signals
                    .iter()
                    .find(|(name, _)| *name == signal.as_str())
                    .map(|(_, value)| value * weight)
                    .unwrap_or(0.0)
            })
            .sum();
        let normalized = if self.normalizer > 0.0 {
            raw / self.normalizer
        } else {
            raw
        };
        if self.clip_unit {
            normalized.clamp(0.0, 1.0)
        } else {
            normalized
        }
    }
}

pub fn payment_reliability(payment_method: &str) -> f64 {
    match payment_method {
        BANK_TRANSFER => 1.0,
        CREDIT_CARD => 0.95,
        MAILED_CHECK => 0.75,
        ELECTRONIC_CHECK => 0.6,
        _ => 0.7,
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

pub fn billing_features(customer: &CustomerRecord, billing_risk: &WeightedScore) -> FeatureSet {
    let counts = ServiceCounts::of(customer);
    let is_monthly = customer.contract == MONTH_TO_MONTH;
    let method = customer.payment_method.as_str();

    FeatureSet::new()
        .with("contract_type", customer.contract.as_str())
        .with("is_monthly_contract", is_monthly)
        .with("has_paperless_billing", customer.paperless_billing)
        .with("payment_method", method)
        .with(
            "is_electronic_payment",
            matches!(method, ELECTRONIC_CHECK | BANK_TRANSFER | CREDIT_CARD),
        )
        .with("is_manual_payment", method == MAILED_CHECK)
        .with("monthly_charges", customer.monthly_charges)
        .with("total_charges", customer.total_charges)
        .with(
            "charges_per_service",
            if counts.total > 0 {
                customer.monthly_charges / counts.total as f64
            } else {
                0.0
            },
        )
        .with(
            "is_high_value_customer",
            customer.monthly_charges > HIGH_VALUE_MONTHLY_CHARGE,
        )
        .with("payment_reliability_score", payment_reliability(method))
        .with(
            "billing_risk_score",
            billing_risk.score(&[
                ("paperless", flag(customer.paperless_billing)),
                ("electronic_check", flag(method == ELECTRONIC_CHECK)),
                ("monthly_contract", flag(is_monthly)),
            ]),
        )
}

/// Ordered churn-segment rules; the first matching rule assigns the label.
pub struct SegmentRule {
    pub label: &'static str,
    pub predicate: fn(&CustomerRecord) -> bool,
}

pub const FALLBACK_SEGMENT: &str = "Low";

pub fn default_segment_rules() -> Vec<SegmentRule> {
    vec![
        SegmentRule {
            label: "Very High",
            predicate: |c| {
                c.contract == MONTH_TO_MONTH && c.tenure_months < 12 && c.internet_service == FIBER_OPTIC
            },
        },
        SegmentRule {
            label: "High",
            predicate: |c| {
                c.contract == MONTH_TO_MONTH
                    && (c.tenure_months < 24 || c.payment_method == ELECTRONIC_CHECK)
            },
        },
        SegmentRule {
            label: "Medium",
            predicate: |c| c.contract == MONTH_TO_MONTH || c.tenure_months < 12,
        },
    ]
}

pub fn assign_segment(customer: &CustomerRecord, rules: &[SegmentRule]) -> &'static str {
    rules
        .iter()
        .find(|rule| (rule.predicate)(customer))
        .map(|rule| rule.label)
        .unwrap_or(FALLBACK_SEGMENT)
}

pub fn contract_length_months(contract: &str) -> u32 {
    match contract {
        ONE_YEAR => 12,
        TWO_YEAR => 24,
        _ => 1,
    }
}

pub fn composite_features(
    customer: &CustomerRecord,
    satisfaction: &WeightedScore,
    rules: &[SegmentRule],
) -> FeatureSet {
    let counts = ServiceCounts::of(customer);
    let is_monthly = customer.contract == MONTH_TO_MONTH;
    let contract_length = contract_length_months(&customer.contract);

    FeatureSet::new()
        .with(
            "high_risk_profile",
            is_monthly
                && customer.payment_method == ELECTRONIC_CHECK
                && counts.total < 3
                && customer.tenure_months < 12,
        )
        .with(
            "service_satisfaction_score",
            satisfaction.score(&[
                ("fiber", flag(customer.internet_service == FIBER_OPTIC)),
                ("dsl", flag(customer.internet_service == DSL)),
                ("security_share", counts.security as f64 / 3.0),
                ("streaming_share", counts.streaming as f64 / 2.0),
                ("tech_support", flag(customer.tech_support)),
                ("penetration", counts.penetration_rate()),
            ]),
        )
        .with("contract_length_months", contract_length)
        .with(
            "contract_value_ratio",
            if customer.monthly_charges > 0.0 {
                contract_length as f64 / (customer.monthly_charges / 10.0)
            } else {
                0.0
            },
        )
        .with("churn_likelihood_segment", assign_segment(customer, rules))
}

/// Score configurations and segment rules used by the telco pipeline.
pub struct TabularConfig {
    pub billing_risk: WeightedScore,
    pub service_satisfaction: WeightedScore,
    pub segment_rules: Vec<SegmentRule>,
}

impl Default for TabularConfig {
    fn default() -> Self {
        Self {
            billing_risk: WeightedScore::billing_risk(),
            service_satisfaction: WeightedScore::service_satisfaction(),
            segment_rules: default_segment_rules(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> CustomerRecord {
        CustomerRecord {
            customer_id: "0001-TEST".to_string(),
            gender: "Female".to_string(),
            senior_citizen: false,
            partner: true,
            dependents: false,
            tenure_months: 5,
            phone_service: true,
            multiple_lines: false,
            internet_service: FIBER_OPTIC.to_string(),
            online_security: false,
            online_backup: true,
            device_protection: false,
            tech_support: false,
            streaming_tv: true,
            streaming_movies: false,
            contract: MONTH_TO_MONTH.to_string(),
            paperless_billing: true,
            payment_method: ELECTRONIC_CHECK.to_string(),
            monthly_charges: 90.0,
            total_charges: 400.0,
            churn: Some(true),
        }
    }

    #[test]
    fn tenure_groups_cover_boundaries() {
        assert_eq!(tenure_group(0), "0-6 months");
        assert_eq!(tenure_group(6), "0-6 months");
        assert_eq!(tenure_group(7), "7-12 months");
        assert_eq!(tenure_group(24), "13-24 months");
        assert_eq!(tenure_group(48), "25-48 months");
        assert_eq!(tenure_group(72), "49+ months");
    }

    #[test]
    fn service_counts_include_internet_itself() {
        let counts = ServiceCounts::of(&customer());
        // phone, internet, backup, streaming tv
        assert_eq!(counts.total, 4);
        assert_eq!(counts.security, 1);
        assert_eq!(counts.streaming, 1);
    }

    #[test]
    fn billing_risk_is_normalized_weighted_sum() {
        let features = billing_features(&customer(), &WeightedScore::billing_risk());
        assert!((features.number("billing_risk_score").unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(features.number("charges_per_service"), Some(22.5));
        assert_eq!(features.number("is_high_value_customer"), Some(1.0));
        assert_eq!(features.number("payment_reliability_score"), Some(0.6));
    }

    #[test]
    fn segment_rules_apply_in_order() {
        let rules = default_segment_rules();
        let mut c = customer();
        assert_eq!(assign_segment(&c, &rules), "Very High");

        c.internet_service = DSL.to_string();
        assert_eq!(assign_segment(&c, &rules), "High");

        c.tenure_months = 30;
        c.payment_method = MAILED_CHECK.to_string();
        assert_eq!(assign_segment(&c, &rules), "Medium");

        c.contract = ONE_YEAR.to_string();
        assert_eq!(assign_segment(&c, &rules), FALLBACK_SEGMENT);
    }

    #[test]
    fn satisfaction_score_is_clipped() {
        let score = WeightedScore::service_satisfaction().score(&[
            ("fiber", 1.0),
            ("dsl", 1.0),
            ("security_share", 1.0),
            ("streaming_share", 1.0),
            ("tech_support", 1.0),
            ("penetration", 1.0),
        ]);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn zero_tenure_spend_falls_back_to_monthly_charge() {
        let mut c = customer();
        c.tenure_months = 0;
        let features = tenure_features(&c);
        assert_eq!(features.number("avg_monthly_spend"), Some(90.0));
        assert_eq!(features.number("customer_lifetime_ratio"), Some(0.0));
        assert_eq!(features.number("early_lifecycle_risk"), Some(1.0));
    }
}
