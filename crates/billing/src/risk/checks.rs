//! Individual risk checks. Each returns the penalties it found, or an error when its
//! input could not be evaluated.

use super::{RiskContext, RiskRules};

type Hits = Vec<(i32, &'static str)>;
type CheckResult = Result<Hits, String>;
type Check = fn(&RiskRules, &RiskContext) -> CheckResult;

pub(super) const CHECK_ERROR_PENALTY: i32 = 15;

const IP_VELOCITY_PENALTY: i32 = 20;
const EMAIL_VELOCITY_PENALTY: i32 = 25;
const CARD_VELOCITY_PENALTY: i32 = 30;
const BLOCKED_REGION_PENALTY: i32 = 30;
const PROXY_PENALTY: i32 = 25;
const DISTANCE_PENALTY: i32 = 15;
const COUNTRY_MISMATCH_PENALTY: i32 = 10;
const MISSING_DEVICE_PENALTY: i32 = 10;
const FRAUD_DEVICE_PENALTY: i32 = 50;
const LOW_REPUTATION_PENALTY: i32 = 20;
const BOT_AGENT_PENALTY: i32 = 30;
const TOO_FAST_PENALTY: i32 = 20;
const TOO_SLOW_PENALTY: i32 = 10;
const PASTE_ONLY_PENALTY: i32 = 15;
const DISPOSABLE_EMAIL_PENALTY: i32 = 25;
const SUSPICIOUS_IDENTITY_PENALTY: i32 = 15;
const BLACKLIST_PENALTY: i32 = 100;
const NEW_ACCOUNT_PENALTY: i32 = 10;
const PLAN_SWITCH_PENALTY: i32 = 15;

const EARTH_RADIUS_KM: f64 = 6371.0;

pub(super) const DISPOSABLE_DOMAINS: &[&str] = &[
    "mailinator.com",
    "guerrillamail.com",
    "10minutemail.com",
    "tempmail.com",
    "temp-mail.org",
    "throwawaymail.com",
    "trashmail.com",
    "yopmail.com",
    "sharklasers.com",
    "getnada.com",
];

const BOT_AGENT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "curl",
    "wget",
    "python-requests",
    "httpclient",
    "headless",
    "phantomjs",
    "selenium",
];

const SUSPICIOUS_IDENTITY_MARKERS: &[&str] = &["test", "fake", "fraud", "asdf", "qwerty", "example123"];

pub(super) const ALL: [(&str, Check); 7] = [
    ("velocity", velocity),
    ("geolocation", geolocation),
    ("device", device),
    ("behavior", behavior),
    ("identity", identity),
    ("blacklist", blacklist),
    ("account", account),
];

fn velocity(rules: &RiskRules, ctx: &RiskContext) -> CheckResult {
    let mut hits = Hits::new();
    if ctx.velocity.ip > rules.ip_velocity_limit {
        hits.push((IP_VELOCITY_PENALTY, "ip_velocity"));
    }
    if ctx.velocity.email > rules.email_velocity_limit {
        hits.push((EMAIL_VELOCITY_PENALTY, "email_velocity"));
    }
    if ctx.velocity.card > rules.card_velocity_limit {
        hits.push((CARD_VELOCITY_PENALTY, "card_velocity"));
    }
    Ok(hits)
}

fn geolocation(rules: &RiskRules, ctx: &RiskContext) -> CheckResult {
    let location = match &ctx.geo {
        Ok(Some(location)) => location,
        Ok(None) => return Ok(Hits::new()),
        Err(e) => return Err(e.clone()),
    };

    let mut hits = Hits::new();
    let country = location.country_code.to_uppercase();
    if rules.blocked_countries.contains(&country) {
        hits.push((BLOCKED_REGION_PENALTY, "blocked_region"));
    }
    if location.proxy || location.hosting {
        hits.push((PROXY_PENALTY, "proxy_or_vpn"));
    }
    if let Some(declared) = ctx.purchase.billing_location {
        let km = haversine_km(
            location.latitude,
            location.longitude,
            declared.latitude,
            declared.longitude,
        );
        if km > rules.max_billing_distance_km {
            hits.push((DISTANCE_PENALTY, "billing_distance"));
        }
    }
    if let Some(billing_country) = &ctx.purchase.billing_country {
        if !billing_country.eq_ignore_ascii_case(&country) {
            hits.push((COUNTRY_MISMATCH_PENALTY, "country_mismatch"));
        }
    }
    Ok(hits)
}

fn device(rules: &RiskRules, ctx: &RiskContext) -> CheckResult {
    let purchase = &ctx.purchase;
    let mut hits = Hits::new();

    match purchase.device_fingerprint.as_deref().map(str::trim) {
        None | Some("") => hits.push((MISSING_DEVICE_PENALTY, "missing_device_fingerprint")),
        Some(fingerprint) if rules.known_fraud_devices.contains(fingerprint) => {
            hits.push((FRAUD_DEVICE_PENALTY, "known_fraud_device"))
        }
        Some(_) => {}
    }

    if let Some(reputation) = purchase.device_reputation {
        if !(0.0..=1.0).contains(&reputation) {
            return Err(format!("device reputation {} out of range", reputation));
        }
        if reputation < rules.min_device_reputation {
            hits.push((LOW_REPUTATION_PENALTY, "low_device_reputation"));
        }
    }

    let bot_like = match purchase.user_agent.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(agent) => {
            let agent = agent.to_lowercase();
            BOT_AGENT_MARKERS.iter().any(|m| agent.contains(m))
        }
    };
    if bot_like {
        hits.push((BOT_AGENT_PENALTY, "bot_user_agent"));
    }
    Ok(hits)
}

fn behavior(rules: &RiskRules, ctx: &RiskContext) -> CheckResult {
    let purchase = &ctx.purchase;
    let mut hits = Hits::new();

    if let (Some(started), Some(submitted)) = (purchase.form_started_at, purchase.form_submitted_at) {
        let elapsed = submitted - started;
        if elapsed.is_negative() {
            return Err("form submitted before it was started".to_string());
        }
        if elapsed < rules.min_fill_time {
            hits.push((TOO_FAST_PENALTY, "form_too_fast"));
        } else if elapsed > rules.max_fill_time {
            hits.push((TOO_SLOW_PENALTY, "form_too_slow"));
        }
    }
    if purchase.paste_only {
        hits.push((PASTE_ONLY_PENALTY, "paste_only_input"));
    }
    Ok(hits)
}

fn identity(rules: &RiskRules, ctx: &RiskContext) -> CheckResult {
    let email = ctx.purchase.email.trim().to_lowercase();
    let (local, domain) = email
        .rsplit_once('@')
        .filter(|(local, domain)| !local.is_empty() && domain.contains('.'))
        .ok_or_else(|| format!("malformed email {:?}", email))?;

    let mut hits = Hits::new();
    if rules.disposable_domains.contains(domain) {
        hits.push((DISPOSABLE_EMAIL_PENALTY, "disposable_email"));
    }

    let name = ctx
        .purchase
        .full_name
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let suspicious = SUSPICIOUS_IDENTITY_MARKERS
        .iter()
        .any(|m| local.contains(m) || name.contains(m));
    if suspicious {
        hits.push((SUSPICIOUS_IDENTITY_PENALTY, "suspicious_identity"));
    }
    Ok(hits)
}

fn blacklist(rules: &RiskRules, ctx: &RiskContext) -> CheckResult {
    let purchase = &ctx.purchase;
    let mut hits = Hits::new();

    if let Some(ip) = &purchase.ip {
        if rules.blacklisted_ips.contains(ip.trim()) {
            hits.push((BLACKLIST_PENALTY, "blacklisted_ip"));
        }
    }
    if rules
        .blacklisted_emails
        .contains(&purchase.email.trim().to_lowercase())
    {
        hits.push((BLACKLIST_PENALTY, "blacklisted_email"));
    }
    if let Some(prefix) = &purchase.card_prefix {
        if rules
            .blacklisted_card_prefixes
            .iter()
            .any(|blocked| prefix.starts_with(blocked.as_str()))
        {
            hits.push((BLACKLIST_PENALTY, "blacklisted_card"));
        }
    }
    Ok(hits)
}

fn account(rules: &RiskRules, ctx: &RiskContext) -> CheckResult {
    let mut hits = Hits::new();
    if ctx.account_age < rules.new_account_age {
        hits.push((NEW_ACCOUNT_PENALTY, "new_account"));
    }
    if ctx.recent_plan_switches > rules.plan_switch_limit {
        hits.push((PLAN_SWITCH_PENALTY, "rapid_plan_switching"));
    }
    Ok(hits)
}

/// Great-circle distance in kilometres
pub(super) fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::tests::clean_context;
    use crate::risk::{Coordinates, GeoLocation, RiskEngine};

    fn factors(ctx: &RiskContext) -> Vec<String> {
        RiskEngine::default().assess(ctx).factors
    }

    #[test]
    fn test_haversine_known_distance() {
        // New York to Los Angeles is roughly 3936 km
        let km = haversine_km(40.7128, -74.0060, 34.0522, -118.2437);
        assert!((km - 3936.0).abs() < 20.0, "got {}", km);
        assert!(haversine_km(10.0, 10.0, 10.0, 10.0) < 1e-9);
    }

    #[test]
    fn test_velocity_thresholds_are_exclusive() {
        let mut ctx = clean_context();
        ctx.velocity.ip = 5;
        ctx.velocity.email = 3;
        ctx.velocity.card = 3;
        assert!(factors(&ctx).is_empty());

        ctx.velocity.ip = 6;
        ctx.velocity.email = 4;
        ctx.velocity.card = 4;
        let assessment = RiskEngine::default().assess(&ctx);
        assert_eq!(assessment.score, 75);
        assert_eq!(assessment.factors, vec!["ip_velocity", "email_velocity", "card_velocity"]);
    }

    #[test]
    fn test_geolocation_penalties() {
        let mut rules = RiskRules::default();
        rules.blocked_countries.insert("KP".to_string());
        let mut ctx = clean_context();
        ctx.geo = Ok(Some(GeoLocation {
            country_code: "kp".to_string(),
            latitude: 39.03,
            longitude: 125.75,
            proxy: true,
            hosting: false,
        }));
        ctx.purchase.billing_location = Some(Coordinates {
            latitude: 40.71,
            longitude: -74.0,
        });

        let assessment = RiskEngine::new(rules).assess(&ctx);
        assert_eq!(
            assessment.factors,
            vec!["blocked_region", "proxy_or_vpn", "billing_distance", "country_mismatch"]
        );
        assert_eq!(assessment.score, 80);
    }

    #[test]
    fn test_unresolved_location_is_not_penalized() {
        let mut ctx = clean_context();
        ctx.geo = Ok(None);
        assert!(factors(&ctx).is_empty());
    }

    #[test]
    fn test_device_checks() {
        let mut rules = RiskRules::default();
        rules.known_fraud_devices.insert("dev_bad".to_string());

        let mut ctx = clean_context();
        ctx.purchase.device_fingerprint = Some("dev_bad".to_string());
        ctx.purchase.device_reputation = Some(0.1);
        ctx.purchase.user_agent = Some("python-requests/2.31".to_string());
        assert_eq!(
            RiskEngine::new(rules).assess(&ctx).factors,
            vec!["known_fraud_device", "low_device_reputation", "bot_user_agent"]
        );

        let mut ctx = clean_context();
        ctx.purchase.device_fingerprint = None;
        ctx.purchase.user_agent = None;
        assert_eq!(factors(&ctx), vec!["missing_device_fingerprint", "bot_user_agent"]);
    }

    #[test]
    fn test_out_of_range_reputation_is_a_check_error() {
        let mut ctx = clean_context();
        ctx.purchase.device_reputation = Some(1.7);
        assert_eq!(factors(&ctx), vec!["device_error"]);
    }

    #[test]
    fn test_behavior_checks() {
        let mut ctx = clean_context();
        let submitted = ctx.purchase.form_submitted_at.unwrap();
        ctx.purchase.form_started_at = Some(submitted - time::Duration::seconds(4));
        ctx.purchase.paste_only = true;
        assert_eq!(factors(&ctx), vec!["form_too_fast", "paste_only_input"]);

        ctx.purchase.paste_only = false;
        ctx.purchase.form_started_at = Some(submitted - time::Duration::minutes(45));
        assert_eq!(factors(&ctx), vec!["form_too_slow"]);

        ctx.purchase.form_started_at = Some(submitted + time::Duration::minutes(1));
        assert_eq!(factors(&ctx), vec!["behavior_error"]);
    }

    #[test]
    fn test_identity_checks() {
        let mut ctx = clean_context();
        ctx.purchase.email = "someone@Mailinator.com".to_string();
        assert_eq!(factors(&ctx), vec!["disposable_email"]);

        ctx.purchase.email = "jordan@clinic.example".to_string();
        ctx.purchase.full_name = Some("Fake Person".to_string());
        assert_eq!(factors(&ctx), vec!["suspicious_identity"]);

        ctx.purchase.email = "not-an-email".to_string();
        ctx.purchase.full_name = None;
        assert_eq!(factors(&ctx), vec!["identity_error"]);
    }

    #[test]
    fn test_card_prefix_blacklist() {
        let mut rules = RiskRules::default();
        rules.blacklisted_card_prefixes.insert("4242".to_string());
        let assessment = RiskEngine::new(rules).assess(&clean_context());
        assert_eq!(assessment.factors, vec!["blacklisted_card"]);
        assert!(assessment.is_declined());
    }
}
