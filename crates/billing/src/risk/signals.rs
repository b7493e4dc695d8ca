//! Gathering the inputs the risk checks score

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::{GeoResolver, PurchaseSignals, RiskContext};

const PLAN_SWITCH_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Recent attempt counts, including the attempt being assessed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VelocityCounts {
    pub ip: u32,
    pub email: u32,
    pub card: u32,
}

#[derive(Default)]
struct VelocityState {
    attempts: HashMap<String, VecDeque<Instant>>,
    /// Requested plan ids per email, oldest first
    plans: HashMap<String, VecDeque<(Instant, String)>>,
}

/// Sliding-window attempt counter keyed by network identity, email and card fingerprint
pub struct VelocityTracker {
    window: Duration,
    state: Mutex<VelocityState>,
}

impl VelocityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(VelocityState::default()),
        }
    }

    /// Record an attempt and return the counts and plan switches it brings the identity to
    pub async fn record(&self, signals: &PurchaseSignals) -> (VelocityCounts, u32) {
        self.record_at(signals, Instant::now()).await
    }

    async fn record_at(&self, signals: &PurchaseSignals, now: Instant) -> (VelocityCounts, u32) {
        let mut state = self.state.lock().await;
        let email = signals.email.trim().to_lowercase();

        let mut bump = |key: Option<String>| -> u32 {
            let Some(key) = key else { return 0 };
            let entries = state.attempts.entry(key).or_default();
            while entries
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
            {
                entries.pop_front();
            }
            entries.push_back(now);
            entries.len() as u32
        };

        let counts = VelocityCounts {
            ip: bump(signals.ip.as_ref().map(|ip| format!("ip:{}", ip.trim()))),
            email: bump(Some(format!("email:{}", email))),
            card: bump(signals.card_fingerprint.as_ref().map(|fp| format!("card:{}", fp))),
        };

        let plans = state.plans.entry(email).or_default();
        while plans
            .front()
            .is_some_and(|(t, _)| now.saturating_duration_since(*t) >= PLAN_SWITCH_WINDOW)
        {
            plans.pop_front();
        }
        plans.push_back((now, signals.plan_id.clone()));
        let switches = plans
            .iter()
            .zip(plans.iter().skip(1))
            .filter(|((_, a), (_, b))| a != b)
            .count() as u32;

        // Drop identities with nothing left in the window
        let window = self.window;
        state
            .attempts
            .retain(|_, entries| entries.back().is_some_and(|t| now.saturating_duration_since(*t) < window));
        state.plans.retain(|_, plans| {
            plans
                .back()
                .is_some_and(|(t, _)| now.saturating_duration_since(*t) < PLAN_SWITCH_WINDOW)
        });

        (counts, switches)
    }

    /// Identities and emails currently tracked
    #[cfg(test)]
    async fn tracked(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.attempts.len(), state.plans.len())
    }
}

/// Collects velocity and geolocation signals for one purchase attempt
pub struct RiskSignalCollector {
    velocity: VelocityTracker,
    geo: Arc<dyn GeoResolver>,
    lookup_timeout: Duration,
}

impl RiskSignalCollector {
    pub fn new(velocity: VelocityTracker, geo: Arc<dyn GeoResolver>, lookup_timeout: Duration) -> Self {
        Self {
            velocity,
            geo,
            lookup_timeout,
        }
    }

    /// Never fails: a geolocation failure is carried in the context for the engine to score
    pub async fn collect(&self, purchase: PurchaseSignals, account_age: time::Duration) -> RiskContext {
        let (velocity, recent_plan_switches) = self.velocity.record(&purchase).await;

        let geo = match purchase.ip.as_deref() {
            None => Ok(None),
            Some(ip) => match tokio::time::timeout(self.lookup_timeout, self.geo.resolve(ip)).await {
                Ok(Ok(location)) => Ok(location),
                Ok(Err(e)) => {
                    tracing::warn!(ip = %ip, error = %e, "Geolocation lookup failed");
                    Err(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(ip = %ip, "Geolocation lookup timed out");
                    Err(format!("lookup timed out after {:?}", self.lookup_timeout))
                }
            },
        };

        RiskContext {
            purchase,
            velocity,
            geo,
            account_age,
            recent_plan_switches,
        }
    }
}
