//! Coarse IP geolocation

use std::net::IpAddr;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub proxy: bool,
    /// Datacenter or hosting range
    pub hosting: bool,
}

#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// `Ok(None)` when the address has no meaningful public location
    async fn resolve(&self, ip: &str) -> BillingResult<Option<GeoLocation>>;
}

/// Resolver used when no geolocation service is configured
pub struct NoopGeoResolver;

#[async_trait]
impl GeoResolver for NoopGeoResolver {
    async fn resolve(&self, _ip: &str) -> BillingResult<Option<GeoLocation>> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    status: String,
    message: Option<String>,
    country_code: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    proxy: bool,
    #[serde(default)]
    hosting: bool,
}

/// Client for an ip-api compatible JSON endpoint (`GEOIP_API_URL`)
#[derive(Clone)]
pub struct HttpGeoResolver {
    client: Client,
    base_url: String,
}

impl HttpGeoResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create from environment config, returns None if not configured
    pub fn from_env() -> Option<Self> {
        std::env::var("GEOIP_API_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl GeoResolver for HttpGeoResolver {
    async fn resolve(&self, ip: &str) -> BillingResult<Option<GeoLocation>> {
        let addr: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| BillingError::Validation(format!("Invalid IP address: {}", ip)))?;
        if !is_public(&addr) {
            return Ok(None);
        }

        let url = format!(
            "{}/{}?fields=status,message,countryCode,lat,lon,proxy,hosting",
            self.base_url, addr
        );
        let response: LookupResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.status != "success" {
            return Err(BillingError::Http(format!(
                "Geolocation lookup failed: {}",
                response.message.unwrap_or_else(|| response.status.clone())
            )));
        }

        match (response.country_code, response.lat, response.lon) {
            (Some(country_code), Some(latitude), Some(longitude)) => Ok(Some(GeoLocation {
                country_code,
                latitude,
                longitude,
                proxy: response.proxy,
                hosting: response.hosting,
            })),
            _ => Ok(None),
        }
    }
}

fn is_public(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_addresses_are_not_public() {
        assert!(!is_public(&"10.1.2.3".parse().unwrap()));
        assert!(!is_public(&"127.0.0.1".parse().unwrap()));
        assert!(!is_public(&"192.168.0.10".parse().unwrap()));
        assert!(!is_public(&"::1".parse().unwrap()));
        assert!(is_public(&"8.8.8.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_private_address_resolves_to_none_without_lookup() {
        let resolver = HttpGeoResolver::new("http://127.0.0.1:9/json");
        assert_eq!(resolver.resolve("192.168.1.20").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_address_is_an_error() {
        let resolver = HttpGeoResolver::new("http://127.0.0.1:9/json");
        assert!(resolver.resolve("not-an-ip").await.is_err());
    }

    #[test]
    fn test_lookup_response_parses() {
        let body = r#"{"status":"success","countryCode":"DE","lat":52.52,"lon":13.4,"proxy":true}"#;
        let parsed: LookupResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.country_code.as_deref(), Some("DE"));
        assert!(parsed.proxy);
        assert!(!parsed.hosting);
    }
}
