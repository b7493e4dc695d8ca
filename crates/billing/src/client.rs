//! Stripe client configuration

use std::collections::HashMap;

use stripe::Client;

use crate::error::{BillingError, BillingResult};

const PRICE_ENV_PREFIX: &str = "STRIPE_PRICE_";

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs keyed by plan id, overriding the catalog defaults
    pub price_overrides: HashMap<String, String>,
}

impl StripeConfig {
    /// Create config from environment variables
    ///
    /// `STRIPE_PRICE_NURSING_BASIC=price_123` overrides the price of plan `nursing-basic`.
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_overrides: price_overrides_from(std::env::vars()),
        })
    }

    /// Get the configured price ID for a plan, if overridden
    pub fn price_for_plan(&self, plan_id: &str) -> Option<&str> {
        self.price_overrides.get(plan_id).map(String::as_str)
    }
}

fn price_overrides_from(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter_map(|(key, value)| {
        let plan = key.strip_prefix(PRICE_ENV_PREFIX)?;
        let value = value.trim();
        if plan.is_empty() || value.is_empty() {
            return None;
        }
        Some((plan.to_lowercase().replace('_', "-"), value.to_string()))
    })
    .collect()
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_overrides_map_env_names_to_plan_ids() {
        let vars = vec![
            ("STRIPE_PRICE_NURSING_BASIC".to_string(), "price_nb".to_string()),
            ("STRIPE_PRICE_GENERAL_PREMIUM".to_string(), " price_gp ".to_string()),
            ("STRIPE_PRICE_".to_string(), "price_x".to_string()),
            ("STRIPE_SECRET_KEY".to_string(), "sk_test".to_string()),
            ("STRIPE_PRICE_PT_PRO".to_string(), "".to_string()),
        ];
        let overrides = price_overrides_from(vars.into_iter());
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides.get("nursing-basic").map(String::as_str), Some("price_nb"));
        assert_eq!(overrides.get("general-premium").map(String::as_str), Some("price_gp"));
    }
}
