//! Risk assessment for purchase attempts
//!
//! Signal collection ([`RiskSignalCollector`]) does the I/O: velocity counting and
//! geolocation. Scoring ([`RiskEngine::assess`]) is a pure function of the collected
//! [`RiskContext`], so identical inputs always produce the same assessment.

mod checks;
mod geo;
mod signals;

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use geo::{GeoLocation, GeoResolver, HttpGeoResolver, NoopGeoResolver};
pub use signals::{RiskSignalCollector, VelocityCounts, VelocityTracker};

/// Score at which a purchase is no longer low risk
pub const MEDIUM_THRESHOLD: i32 = 20;
pub const HIGH_THRESHOLD: i32 = 50;
pub const CRITICAL_THRESHOLD: i32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: i32) -> Self {
        if score >= CRITICAL_THRESHOLD {
            Self::Critical
        } else if score >= HIGH_THRESHOLD {
            Self::High
        } else if score >= MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn recommendation(&self) -> Recommendation {
        match self {
            Self::Low => Recommendation::Approve,
            Self::Medium => Recommendation::Review,
            Self::High => Recommendation::Challenge,
            Self::Critical => Recommendation::Decline,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Approve,
    Review,
    Challenge,
    Decline,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Review => "review",
            Self::Challenge => "challenge",
            Self::Decline => "decline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub score: i32,
    pub level: RiskLevel,
    /// Contributing factor tags in check order
    pub factors: Vec<String>,
    pub recommendation: Recommendation,
}

impl RiskAssessment {
    pub fn is_declined(&self) -> bool {
        self.recommendation == Recommendation::Decline
    }
}

/// Declared billing location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// What the client told us about the purchase attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PurchaseSignals {
    pub ip: Option<String>,
    pub email: String,
    pub plan_id: String,
    /// Stable fingerprint of the payment instrument
    pub card_fingerprint: Option<String>,
    /// Leading card digits (BIN)
    pub card_prefix: Option<String>,
    pub billing_country: Option<String>,
    pub billing_location: Option<Coordinates>,
    pub full_name: Option<String>,
    pub device_fingerprint: Option<String>,
    /// 0.0 (bad) to 1.0 (good)
    pub device_reputation: Option<f64>,
    pub user_agent: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub form_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub form_submitted_at: Option<OffsetDateTime>,
    /// Every field was pasted rather than typed
    pub paste_only: bool,
}

/// Everything the engine scores, gathered ahead of time
#[derive(Debug, Clone)]
pub struct RiskContext {
    pub purchase: PurchaseSignals,
    pub velocity: VelocityCounts,
    /// `Err` carries the lookup failure
    pub geo: Result<Option<GeoLocation>, String>,
    pub account_age: time::Duration,
    /// Plan switches by this identity in the trailing day
    pub recent_plan_switches: u32,
}

/// Thresholds and lists the checks run against
#[derive(Debug, Clone)]
pub struct RiskRules {
    pub velocity_window: Duration,
    pub ip_velocity_limit: u32,
    pub email_velocity_limit: u32,
    pub card_velocity_limit: u32,
    pub blocked_countries: HashSet<String>,
    pub max_billing_distance_km: f64,
    pub min_device_reputation: f64,
    pub min_fill_time: time::Duration,
    pub max_fill_time: time::Duration,
    pub disposable_domains: HashSet<String>,
    pub blacklisted_ips: HashSet<String>,
    pub blacklisted_emails: HashSet<String>,
    pub blacklisted_card_prefixes: HashSet<String>,
    pub known_fraud_devices: HashSet<String>,
    pub new_account_age: time::Duration,
    pub plan_switch_limit: u32,
}

impl Default for RiskRules {
    fn default() -> Self {
        Self {
            velocity_window: Duration::from_secs(3600),
            ip_velocity_limit: 5,
            email_velocity_limit: 3,
            card_velocity_limit: 3,
            blocked_countries: HashSet::new(),
            max_billing_distance_km: 500.0,
            min_device_reputation: 0.3,
            min_fill_time: time::Duration::seconds(10),
            max_fill_time: time::Duration::minutes(30),
            disposable_domains: checks::DISPOSABLE_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            blacklisted_ips: HashSet::new(),
            blacklisted_emails: HashSet::new(),
            blacklisted_card_prefixes: HashSet::new(),
            known_fraud_devices: HashSet::new(),
            new_account_age: time::Duration::hours(24),
            plan_switch_limit: 3,
        }
    }
}

/// Scores purchase attempts
#[derive(Debug, Clone, Default)]
pub struct RiskEngine {
    rules: RiskRules,
}

impl RiskEngine {
    pub fn new(rules: RiskRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RiskRules {
        &self.rules
    }

    /// Sum every sub-check. A failing check adds a fixed penalty and an `<check>_error`
    /// factor instead of aborting the assessment.
    pub fn assess(&self, ctx: &RiskContext) -> RiskAssessment {
        let mut score = 0;
        let mut factors = Vec::new();

        for (name, check) in checks::ALL {
            match check(&self.rules, ctx) {
                Ok(hits) => {
                    for (penalty, factor) in hits {
                        score += penalty;
                        factors.push(factor.to_string());
                    }
                }
                Err(reason) => {
                    tracing::debug!(check = name, reason = %reason, "Risk check failed");
                    score += checks::CHECK_ERROR_PENALTY;
                    factors.push(format!("{}_error", name));
                }
            }
        }

        let level = RiskLevel::from_score(score);
        RiskAssessment {
            score,
            level,
            factors,
            recommendation: level.recommendation(),
        }
    }
}
