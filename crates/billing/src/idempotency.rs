//! Duplicate purchase suppression
//!
//! A purchase is identified by who sent it (network identity), who it is for (email)
//! and what it buys (plan id). A second request with the same key inside the window is
//! rejected with `DUPLICATE_REQUEST` before any other work happens.
//!
//! The in-memory guard is single-process and best-effort. Deployments running more
//! than one API instance should configure `REDIS_URL` so every instance shares the
//! same window; that is still de-duplication, not a lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};

/// Signature of a purchase request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(network_identity: &str, email: &str, plan_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(network_identity.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(email.trim().to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(plan_id.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// `true` when the key was not seen inside the window and is now recorded
    async fn admit(&self, key: &IdempotencyKey) -> BillingResult<bool>;
}

/// Time-bounded map of recently admitted keys
pub struct InMemoryIdempotencyGuard {
    window: Duration,
    cleanup_after: Duration,
    seen: Mutex<HashMap<IdempotencyKey, Instant>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new(window: Duration, cleanup_after: Duration) -> Self {
        Self {
            window,
            cleanup_after: cleanup_after.max(window),
            seen: Mutex::new(HashMap::new()),
        }
    }

    async fn admit_at(&self, key: &IdempotencyKey, now: Instant) -> bool {
        let mut seen = self.seen.lock().await;

        // Lazy purge
        seen.retain(|_, admitted| now.saturating_duration_since(*admitted) < self.cleanup_after);

        if let Some(admitted) = seen.get(key) {
            if now.saturating_duration_since(*admitted) < self.window {
                return false;
            }
        }
        seen.insert(key.clone(), now);
        true
    }

    pub async fn tracked_keys(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn admit(&self, key: &IdempotencyKey) -> BillingResult<bool> {
        Ok(self.admit_at(key, Instant::now()).await)
    }
}

/// Guard shared across instances through Redis `SET NX PX`
///
/// Falls back to an in-process window when Redis is unreachable so an outage degrades
/// de-duplication instead of blocking purchases.
pub struct RedisIdempotencyGuard {
    manager: ConnectionManager,
    window: Duration,
    fallback: InMemoryIdempotencyGuard,
}

impl RedisIdempotencyGuard {
    pub async fn connect(redis_url: &str, window: Duration, cleanup_after: Duration) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BillingError::Config(format!("Invalid REDIS_URL: {}", e)))?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            window,
            fallback: InMemoryIdempotencyGuard::new(window, cleanup_after),
        })
    }

    fn redis_key(key: &IdempotencyKey) -> String {
        format!("billing:purchase:{}", key)
    }
}

#[async_trait]
impl IdempotencyGuard for RedisIdempotencyGuard {
    async fn admit(&self, key: &IdempotencyKey) -> BillingResult<bool> {
        let mut conn = self.manager.clone();
        let result: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(Self::redis_key(key))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(self.window.as_millis() as u64)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(reply) => Ok(reply.is_some()),
            Err(e) => {
                tracing::warn!(error = %e, "Redis idempotency check failed, using in-process window");
                self.fallback.admit(key).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> InMemoryIdempotencyGuard {
        InMemoryIdempotencyGuard::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    #[test]
    fn test_key_normalizes_email() {
        let a = IdempotencyKey::derive("10.0.0.1", "Nurse@Example.com ", "nursing-basic");
        let b = IdempotencyKey::derive("10.0.0.1", "nurse@example.com", "nursing-basic");
        let c = IdempotencyKey::derive("10.0.0.1", "nurse@example.com", "nursing-pro");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_second_request_inside_window_rejected() {
        let guard = guard();
        let key = IdempotencyKey::derive("10.0.0.1", "a@example.com", "pt-basic");
        assert!(guard.admit(&key).await.unwrap());
        assert!(!guard.admit(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_admitted_again_after_window() {
        let guard = guard();
        let key = IdempotencyKey::derive("10.0.0.1", "a@example.com", "pt-basic");
        let start = Instant::now();
        assert!(guard.admit_at(&key, start).await);
        assert!(!guard.admit_at(&key, start + Duration::from_secs(9)).await);
        assert!(guard.admit_at(&key, start + Duration::from_secs(11)).await);
    }

    #[tokio::test]
    async fn test_old_entries_purged() {
        let guard = guard();
        let start = Instant::now();
        let old = IdempotencyKey::derive("10.0.0.1", "old@example.com", "pt-basic");
        let fresh = IdempotencyKey::derive("10.0.0.2", "new@example.com", "pt-basic");

        guard.admit_at(&old, start).await;
        guard.admit_at(&fresh, start + Duration::from_secs(61)).await;
        assert_eq!(guard.tracked_keys().await, 1);
    }

    #[tokio::test]
    async fn test_different_plans_do_not_collide() {
        let guard = guard();
        let a = IdempotencyKey::derive("10.0.0.1", "a@example.com", "nursing-basic");
        let b = IdempotencyKey::derive("10.0.0.1", "a@example.com", "pt-basic");
        assert!(guard.admit(&a).await.unwrap());
        assert!(guard.admit(&b).await.unwrap());
    }
}
