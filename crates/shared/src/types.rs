//! Common types used across CareBill

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::SharedError;

/// Limit value meaning "no cap"
pub const UNLIMITED: i64 = -1;

// =============================================================================
// Enums
// =============================================================================

/// Clinical specialty a plan is sold into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Specialty {
    Nursing,
    PhysicalTherapy,
    MedicalProvider,
    /// Cross-specialty plans; a general plan covers every specialty up to its tier
    General,
}

impl Specialty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nursing => "nursing",
            Self::PhysicalTherapy => "physical-therapy",
            Self::MedicalProvider => "medical-provider",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for Specialty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Specialty {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "nursing" => Ok(Self::Nursing),
            "physical-therapy" => Ok(Self::PhysicalTherapy),
            "medical-provider" => Ok(Self::MedicalProvider),
            "general" => Ok(Self::General),
            _ => Err(SharedError::invalid("specialty", s)),
        }
    }
}

/// Subscription status
///
/// ```text
/// incomplete -> {trialing, active} -> past_due <-> active -> canceled
/// active/trialing -> paused -> active
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
        }
    }

    /// Statuses that grant features and count for conflict detection
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub const ENTITLED: [SubscriptionStatus; 2] = [Self::Active, Self::Trialing];
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incomplete" => Ok(Self::Incomplete),
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "paused" => Ok(Self::Paused),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(SharedError::invalid("subscription status", s)),
        }
    }
}

/// Billing interval for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Annual,
}

impl BillingInterval {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "annual" | "yearly" | "year" => Some(Self::Annual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

// =============================================================================
// Entitlements
// =============================================================================

/// The closed set of numeric limits a plan can grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitName {
    FileUploads,
    AiAnalyses,
    PatientRecords,
    StorageMb,
    TeamMembers,
}

impl LimitName {
    pub const ALL: [LimitName; 5] = [
        Self::FileUploads,
        Self::AiAnalyses,
        Self::PatientRecords,
        Self::StorageMb,
        Self::TeamMembers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileUploads => "fileUploads",
            Self::AiAnalyses => "aiAnalyses",
            Self::PatientRecords => "patientRecords",
            Self::StorageMb => "storageMb",
            Self::TeamMembers => "teamMembers",
        }
    }
}

impl std::fmt::Display for LimitName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric limits, one slot per [`LimitName`]. `-1` means unlimited.
///
/// Missing keys deserialize to `0` so a partially written cache is still well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureLimits {
    pub file_uploads: i64,
    pub ai_analyses: i64,
    pub patient_records: i64,
    pub storage_mb: i64,
    pub team_members: i64,
}

impl FeatureLimits {
    pub fn get(&self, name: LimitName) -> i64 {
        match name {
            LimitName::FileUploads => self.file_uploads,
            LimitName::AiAnalyses => self.ai_analyses,
            LimitName::PatientRecords => self.patient_records,
            LimitName::StorageMb => self.storage_mb,
            LimitName::TeamMembers => self.team_members,
        }
    }

    pub fn set(&mut self, name: LimitName, value: i64) {
        let slot = match name {
            LimitName::FileUploads => &mut self.file_uploads,
            LimitName::AiAnalyses => &mut self.ai_analyses,
            LimitName::PatientRecords => &mut self.patient_records,
            LimitName::StorageMb => &mut self.storage_mb,
            LimitName::TeamMembers => &mut self.team_members,
        };
        *slot = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (LimitName, i64)> + '_ {
        LimitName::ALL.into_iter().map(move |name| (name, self.get(name)))
    }

    /// Combine with another grant: unlimited dominates, otherwise the larger value wins
    pub fn combine_max(&mut self, other: &FeatureLimits) {
        for name in LimitName::ALL {
            let (a, b) = (self.get(name), other.get(name));
            let combined = if a == UNLIMITED || b == UNLIMITED {
                UNLIMITED
            } else {
                a.max(b)
            };
            self.set(name, combined);
        }
    }

    /// Whether `used` units still fit under the named limit
    pub fn allows(&self, name: LimitName, used: i64) -> bool {
        let limit = self.get(name);
        limit == UNLIMITED || used < limit
    }
}

/// Denormalized, rebuildable snapshot of a user's combined entitlements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAccess {
    pub features: BTreeSet<String>,
    pub limits: FeatureLimits,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

/// The entitlements of a user with no active subscription
pub fn default_feature_access() -> FeatureAccess {
    FeatureAccess {
        features: BTreeSet::new(),
        limits: FeatureLimits::default(),
        last_updated: None,
    }
}

impl Default for FeatureAccess {
    fn default() -> Self {
        default_feature_access()
    }
}

impl FeatureAccess {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn limit(&self, name: LimitName) -> i64 {
        self.limits.get(name)
    }

    /// A cache without a timestamp, or older than `max_age`, must be recomputed by the caller
    pub fn is_stale(&self, now: OffsetDateTime, max_age: Duration) -> bool {
        match self.last_updated {
            Some(updated) => now - updated > max_age,
            None => true,
        }
    }

    /// Repair a cache that was written by an older or buggy writer.
    ///
    /// Idempotent: `normalize(normalize(x).1) == (false, normalize(x).1)`.
    pub fn normalize(mut self) -> (bool, FeatureAccess) {
        let mut changed = false;

        let cleaned: BTreeSet<String> = self
            .features
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if cleaned != self.features {
            self.features = cleaned;
            changed = true;
        }

        for name in LimitName::ALL {
            if self.limits.get(name) < UNLIMITED {
                self.limits.set(name, 0);
                changed = true;
            }
        }

        (changed, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specialty_round_trip_strings() {
        assert_eq!("physical-therapy".parse::<Specialty>().unwrap(), Specialty::PhysicalTherapy);
        assert_eq!("medical_provider".parse::<Specialty>().unwrap(), Specialty::MedicalProvider);
        assert!("dentistry".parse::<Specialty>().is_err());
        assert_eq!(Specialty::General.to_string(), "general");
    }

    #[test]
    fn test_status_entitlement() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
        assert!(!SubscriptionStatus::Paused.is_entitled());
        assert_eq!("cancelled".parse::<SubscriptionStatus>().unwrap(), SubscriptionStatus::Canceled);
    }

    #[test]
    fn test_combine_max_unlimited_dominates() {
        let mut a = FeatureLimits {
            file_uploads: 5,
            ai_analyses: 10,
            ..Default::default()
        };
        let b = FeatureLimits {
            file_uploads: UNLIMITED,
            ai_analyses: 25,
            ..Default::default()
        };
        a.combine_max(&b);
        assert_eq!(a.file_uploads, UNLIMITED);
        assert_eq!(a.ai_analyses, 25);
        assert_eq!(a.storage_mb, 0);
    }

    #[test]
    fn test_missing_limit_keys_deserialize_to_zero() {
        let access: FeatureAccess =
            serde_json::from_str(r#"{"features":["charting"],"limits":{"fileUploads":3}}"#)
                .unwrap();
        assert_eq!(access.limit(LimitName::FileUploads), 3);
        assert_eq!(access.limit(LimitName::TeamMembers), 0);
        assert!(access.last_updated.is_none());
    }

    #[test]
    fn test_staleness() {
        let now = OffsetDateTime::now_utc();
        let mut access = default_feature_access();
        assert!(access.is_stale(now, Duration::hours(24)));

        access.last_updated = Some(now - Duration::hours(2));
        assert!(!access.is_stale(now, Duration::hours(24)));

        access.last_updated = Some(now - Duration::hours(25));
        assert!(access.is_stale(now, Duration::hours(24)));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut access = default_feature_access();
        access.features.insert("  charting ".to_string());
        access.features.insert(String::new());
        access.limits.storage_mb = -7;

        let (changed, once) = access.normalize();
        assert!(changed);
        assert!(once.has_feature("charting"));
        assert_eq!(once.features.len(), 1);
        assert_eq!(once.limits.storage_mb, 0);

        let (changed_again, twice) = once.clone().normalize();
        assert!(!changed_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_limits_allow() {
        let limits = FeatureLimits {
            file_uploads: 2,
            ai_analyses: UNLIMITED,
            ..Default::default()
        };
        assert!(limits.allows(LimitName::FileUploads, 1));
        assert!(!limits.allows(LimitName::FileUploads, 2));
        assert!(limits.allows(LimitName::AiAnalyses, 1_000_000));
        assert!(!limits.allows(LimitName::TeamMembers, 0));
    }
}
