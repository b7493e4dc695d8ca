//! Worker configuration

use std::env;

/// Users whose entitlement cache is refreshed per hourly run
const DEFAULT_REFRESH_BATCH: i64 = 500;
/// Stripe gives up on an unpaid first invoice after 23 hours
const DEFAULT_INCOMPLETE_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Enables the shared idempotency guard for the billing service
    pub redis_url: Option<String>,
    pub entitlement_refresh_batch: i64,
    /// Age after which an `incomplete` subscription is treated as abandoned
    pub incomplete_expiry_hours: i64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").map_err(|_| WorkerConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_number("DATABASE_MAX_CONNECTIONS", env::var("DATABASE_MAX_CONNECTIONS").ok(), 5)?,
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            entitlement_refresh_batch: parse_number(
                "ENTITLEMENT_REFRESH_BATCH",
                env::var("ENTITLEMENT_REFRESH_BATCH").ok(),
                DEFAULT_REFRESH_BATCH,
            )?,
            incomplete_expiry_hours: parse_number(
                "INCOMPLETE_EXPIRY_HOURS",
                env::var("INCOMPLETE_EXPIRY_HOURS").ok(),
                DEFAULT_INCOMPLETE_EXPIRY_HOURS,
            )?,
        })
    }
}

fn parse_number<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, WorkerConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = value else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(parsed),
        _ => Err(WorkerConfigError::Invalid(name, raw)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{0} must be a positive number, got {1:?}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("N", None, 500i64).unwrap(), 500);
        assert_eq!(parse_number("N", Some(" 25 ".to_string()), 500i64).unwrap(), 25);
        assert!(parse_number("N", Some("0".to_string()), 500i64).is_err());
        assert!(parse_number("N", Some("lots".to_string()), 5u32).is_err());
    }
}
