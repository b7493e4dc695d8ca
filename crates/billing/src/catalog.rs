//! Plan Catalog
//!
//! Process-wide, read-only table of the plans CareBill sells. Loaded once at start-up;
//! a plan id uniquely determines its specialty and tier.
//!
//! Tier hierarchy per specialty: basic (1) → pro (2). `general-premium` (3) covers every
//! specialty.

use std::collections::BTreeMap;

use carebill_shared::{BillingInterval, FeatureLimits, Specialty, UNLIMITED};
use serde::{Deserialize, Serialize};

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};

/// Immutable catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanConfig {
    pub id: String,
    pub name: String,
    /// Price in cents per interval
    pub price_cents: i64,
    pub interval: BillingInterval,
    pub specialty: Specialty,
    /// Higher is more inclusive
    pub tier: u8,
    pub features: Vec<String>,
    pub limits: FeatureLimits,
    /// Gateway price reference
    pub gateway_price_id: String,
}

impl PlanConfig {
    /// Whether an existing plan already covers this one
    pub fn is_covered_by(&self, existing: &PlanConfig) -> bool {
        let same_line = existing.specialty == self.specialty || existing.specialty == Specialty::General;
        same_line && self.tier <= existing.tier
    }
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: BTreeMap<String, PlanConfig>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl PlanCatalog {
    /// The standard healthcare plan line-up
    pub fn standard() -> Self {
        let plans = vec![
            plan(
                "nursing-basic",
                "Nursing Basic",
                2900,
                Specialty::Nursing,
                1,
                &["care-plans", "shift-notes", "medication-tracking"],
                limits(50, 20, 100, 1024, 1),
            ),
            plan(
                "nursing-pro",
                "Nursing Pro",
                7900,
                Specialty::Nursing,
                2,
                &[
                    "care-plans",
                    "shift-notes",
                    "medication-tracking",
                    "ai-documentation",
                    "care-team-sharing",
                ],
                limits(500, 200, 1000, 10_240, 5),
            ),
            plan(
                "pt-basic",
                "Physical Therapy Basic",
                3900,
                Specialty::PhysicalTherapy,
                1,
                &["exercise-programs", "progress-tracking", "soap-notes"],
                limits(50, 20, 100, 1024, 1),
            ),
            plan(
                "pt-pro",
                "Physical Therapy Pro",
                9900,
                Specialty::PhysicalTherapy,
                2,
                &[
                    "exercise-programs",
                    "progress-tracking",
                    "soap-notes",
                    "ai-documentation",
                    "outcome-analytics",
                ],
                limits(500, 200, UNLIMITED, 10_240, 5),
            ),
            plan(
                "provider-basic",
                "Medical Provider Basic",
                4900,
                Specialty::MedicalProvider,
                1,
                &["clinical-notes", "lab-results", "e-prescribing-prep"],
                limits(100, 50, 250, 2048, 2),
            ),
            plan(
                "provider-pro",
                "Medical Provider Pro",
                15_200,
                Specialty::MedicalProvider,
                2,
                &[
                    "clinical-notes",
                    "lab-results",
                    "e-prescribing-prep",
                    "ai-documentation",
                    "ai-differential",
                    "care-team-sharing",
                ],
                limits(UNLIMITED, 500, UNLIMITED, 51_200, 10),
            ),
            plan(
                "general-basic",
                "General Basic",
                1900,
                Specialty::General,
                1,
                &["patient-records", "document-upload"],
                limits(25, 10, 50, 512, 1),
            ),
            plan(
                "general-premium",
                "General Premium",
                24_900,
                Specialty::General,
                3,
                &[
                    "patient-records",
                    "document-upload",
                    "ai-documentation",
                    "ai-differential",
                    "care-team-sharing",
                    "outcome-analytics",
                    "priority-support",
                ],
                limits(UNLIMITED, UNLIMITED, UNLIMITED, 102_400, 25),
            ),
        ];

        Self::from_plans(plans)
    }

    pub fn from_plans(plans: impl IntoIterator<Item = PlanConfig>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Replace default gateway price references with configured ones
    pub fn with_price_overrides(mut self, config: &StripeConfig) -> Self {
        for plan in self.plans.values_mut() {
            if let Some(price) = config.price_for_plan(&plan.id) {
                plan.gateway_price_id = price.to_string();
            }
        }
        self
    }

    pub fn get(&self, plan_id: &str) -> Option<&PlanConfig> {
        self.plans.get(plan_id)
    }

    pub fn require(&self, plan_id: &str) -> BillingResult<&PlanConfig> {
        self.get(plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &PlanConfig> {
        self.plans.values()
    }

    pub fn by_price_id(&self, price_id: &str) -> Option<&PlanConfig> {
        self.plans.values().find(|p| p.gateway_price_id == price_id)
    }
}

fn plan(
    id: &str,
    name: &str,
    price_cents: i64,
    specialty: Specialty,
    tier: u8,
    features: &[&str],
    limits: FeatureLimits,
) -> PlanConfig {
    PlanConfig {
        id: id.to_string(),
        name: name.to_string(),
        price_cents,
        interval: BillingInterval::Monthly,
        specialty,
        tier,
        features: features.iter().map(|f| f.to_string()).collect(),
        limits,
        gateway_price_id: format!("price_{}", id.replace('-', "_")),
    }
}

fn limits(
    file_uploads: i64,
    ai_analyses: i64,
    patient_records: i64,
    storage_mb: i64,
    team_members: i64,
) -> FeatureLimits {
    FeatureLimits {
        file_uploads,
        ai_analyses,
        patient_records,
        storage_mb,
        team_members,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_standard_catalog_is_well_formed() {
        let catalog = PlanCatalog::standard();
        assert_eq!(catalog.all().count(), 8);
        for plan in catalog.all() {
            assert!(plan.price_cents > 0, "{} has no price", plan.id);
            assert!(plan.tier >= 1);
            assert!(!plan.features.is_empty());
        }
    }

    #[test]
    fn test_coverage_within_specialty() {
        let catalog = PlanCatalog::standard();
        let basic = catalog.require("nursing-basic").unwrap();
        let pro = catalog.require("nursing-pro").unwrap();
        let pt = catalog.require("pt-basic").unwrap();
        let premium = catalog.require("general-premium").unwrap();

        assert!(basic.is_covered_by(pro));
        assert!(!pro.is_covered_by(basic));
        assert!(!pt.is_covered_by(pro));
        assert!(pro.is_covered_by(premium));
        assert!(!premium.is_covered_by(pro));
    }

    #[test]
    fn test_unknown_plan() {
        let catalog = PlanCatalog::standard();
        assert!(matches!(
            catalog.require("dental-pro"),
            Err(BillingError::PlanNotFound(_))
        ));
    }

    #[test]
    fn test_price_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("pt-pro".to_string(), "price_live_ptpro".to_string());
        let config = StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_overrides: overrides,
        };

        let catalog = PlanCatalog::standard().with_price_overrides(&config);
        assert_eq!(catalog.require("pt-pro").unwrap().gateway_price_id, "price_live_ptpro");
        assert_eq!(catalog.require("pt-basic").unwrap().gateway_price_id, "price_pt_basic");
        assert_eq!(catalog.by_price_id("price_live_ptpro").unwrap().id, "pt-pro");
    }
}
