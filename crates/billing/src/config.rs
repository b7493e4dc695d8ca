//! Engine tuning knobs, read from the environment with typed defaults

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrator::RetryPolicy;
use crate::risk::RiskRules;

/// Configuration for the billing engine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Duplicate purchases inside this window are rejected
    pub idempotency_window: Duration,
    /// Guard entries older than this are purged on the next admission check
    pub idempotency_cleanup: Duration,
    pub payment_max_attempts: u32,
    /// First retry delay; doubles on every further attempt
    pub payment_retry_base: Duration,
    /// Upper bound on a single gateway call
    pub gateway_timeout: Duration,
    /// Accounts younger than this skip the plan-hierarchy conflict check
    pub conflict_grace: time::Duration,
    /// Entitlement caches older than this are recomputed
    pub feature_cache_max_age: time::Duration,
    /// Prorated refunds below this are not attempted
    pub min_refund_cents: i64,
    pub risk: RiskRules,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            idempotency_window: Duration::from_secs(10),
            idempotency_cleanup: Duration::from_secs(60),
            payment_max_attempts: 3,
            payment_retry_base: Duration::from_millis(2000),
            gateway_timeout: Duration::from_secs(20),
            conflict_grace: time::Duration::seconds(300),
            feature_cache_max_age: time::Duration::hours(24),
            min_refund_cents: 50,
            risk: RiskRules::default(),
        }
    }
}

impl BillingConfig {
    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut risk = RiskRules {
            velocity_window: Duration::from_secs(env_or("RISK_VELOCITY_WINDOW_SECS", 3600)),
            ..RiskRules::default()
        };
        risk.blocked_countries = env_list("RISK_BLOCKED_COUNTRIES")
            .into_iter()
            .map(|c| c.to_uppercase())
            .collect();
        risk.blacklisted_ips = env_list("RISK_BLACKLIST_IPS");
        risk.blacklisted_emails = env_list("RISK_BLACKLIST_EMAILS")
            .into_iter()
            .map(|e| e.to_lowercase())
            .collect();
        risk.blacklisted_card_prefixes = env_list("RISK_BLACKLIST_CARD_PREFIXES");
        risk.known_fraud_devices = env_list("RISK_KNOWN_FRAUD_DEVICES");

        Self {
            idempotency_window: Duration::from_secs(env_or(
                "IDEMPOTENCY_WINDOW_SECS",
                defaults.idempotency_window.as_secs(),
            )),
            idempotency_cleanup: Duration::from_secs(env_or(
                "IDEMPOTENCY_CLEANUP_SECS",
                defaults.idempotency_cleanup.as_secs(),
            )),
            payment_max_attempts: env_or("PAYMENT_MAX_ATTEMPTS", defaults.payment_max_attempts).max(1),
            payment_retry_base: Duration::from_millis(env_or("PAYMENT_RETRY_BASE_MS", 2000)),
            gateway_timeout: Duration::from_secs(env_or(
                "GATEWAY_TIMEOUT_SECS",
                defaults.gateway_timeout.as_secs(),
            )),
            conflict_grace: time::Duration::seconds(env_or("CONFLICT_GRACE_SECS", 300)),
            feature_cache_max_age: time::Duration::hours(env_or("FEATURE_CACHE_MAX_AGE_HOURS", 24)),
            min_refund_cents: env_or("MIN_REFUND_CENTS", defaults.min_refund_cents),
            risk,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.payment_max_attempts,
            base_delay: self.payment_retry_base,
            call_timeout: self.gateway_timeout,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma-separated list; blank entries are dropped
fn env_list(key: &str) -> HashSet<String> {
    std::env::var(key)
        .map(|v| parse_list(&v))
        .unwrap_or_default()
}

fn parse_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BillingConfig::default();
        assert_eq!(config.idempotency_window, Duration::from_secs(10));
        assert_eq!(config.idempotency_cleanup, Duration::from_secs(60));
        assert_eq!(config.payment_max_attempts, 3);
        assert_eq!(config.payment_retry_base, Duration::from_secs(2));
        assert_eq!(config.feature_cache_max_age, time::Duration::hours(24));
        assert_eq!(config.min_refund_cents, 50);
    }

    #[test]
    fn test_parse_list_skips_blanks() {
        let list = parse_list(" 10.0.0.1, ,10.0.0.2,,");
        assert_eq!(list.len(), 2);
        assert!(list.contains("10.0.0.1"));
        assert!(list.contains("10.0.0.2"));
    }

    #[test]
    fn test_retry_policy_follows_config() {
        let config = BillingConfig {
            payment_max_attempts: 5,
            payment_retry_base: Duration::from_millis(10),
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
    }
}
