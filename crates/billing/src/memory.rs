//! In-memory adapters for local development and tests

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use carebill_shared::{Subscription, SubscriptionStatus, User};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{AuditAction, AuditEntry, AuditSink};
use crate::store::BillingStore;

/// In-memory [`BillingStore`] with the same version semantics as the Postgres store
#[derive(Default)]
pub struct InMemoryBillingStore {
    users: RwLock<HashMap<Uuid, User>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    webhook_events: RwLock<HashSet<String>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn insert_user(&self, user: &User) -> BillingResult<()> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.id) || users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(BillingError::ConcurrentModification(format!(
                "user {} already exists",
                user.email
            )));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn save_user(&self, user: &User) -> BillingResult<User> {
        let mut users = self.users.write().await;
        let stored = users
            .get_mut(&user.id)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user.id)))?;
        if stored.version != user.version {
            return Err(BillingError::ConcurrentModification(format!(
                "user {} was modified concurrently",
                user.id
            )));
        }
        let mut next = user.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn find_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(&subscription_id).cloned())
    }

    async fn find_subscriptions(
        &self,
        user_id: Uuid,
        statuses: &[SubscriptionStatus],
    ) -> BillingResult<Vec<Subscription>> {
        let subs = self.subscriptions.read().await;
        let mut found: Vec<Subscription> = subs
            .values()
            .filter(|s| s.user_id == user_id)
            .filter(|s| statuses.is_empty() || statuses.contains(&s.status))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn find_subscription_by_external_id(
        &self,
        gateway_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .find(|s| s.gateway_subscription_id == gateway_subscription_id)
            .cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut subs = self.subscriptions.write().await;
        if subs
            .values()
            .any(|s| s.gateway_subscription_id == subscription.gateway_subscription_id)
        {
            return Err(BillingError::ConcurrentModification(format!(
                "gateway subscription {} already recorded",
                subscription.gateway_subscription_id
            )));
        }
        subs.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn save_subscription(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut subs = self.subscriptions.write().await;
        let stored = subs
            .get_mut(&subscription.id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription.id)))?;
        if stored.version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified concurrently",
                subscription.id
            )));
        }
        let mut next = subscription.clone();
        next.version += 1;
        next.updated_at = OffsetDateTime::now_utc();
        *stored = next.clone();
        Ok(next)
    }

    async fn find_subscriptions_due_for_cancellation(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let subs = self.subscriptions.read().await;
        let mut due: Vec<Subscription> = subs
            .values()
            .filter(|s| {
                s.cancel_at_period_end
                    && matches!(
                        s.status,
                        SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
                    )
                    && s.current_period_end <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.current_period_end);
        Ok(due)
    }

    async fn find_users_with_stale_cache(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Uuid>> {
        let users = self.users.read().await;
        let mut stale: Vec<&User> = users
            .values()
            .filter(|u| match u.feature_access.as_ref().and_then(|a| a.last_updated) {
                Some(updated) => updated < cutoff,
                None => true,
            })
            .collect();
        stale.sort_by_key(|u| u.created_at);
        Ok(stale
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|u| u.id)
            .collect())
    }

    async fn find_incomplete_subscriptions(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs = self.subscriptions.read().await;
        let mut abandoned: Vec<Subscription> = subs
            .values()
            .filter(|s| s.status == SubscriptionStatus::Incomplete && s.created_at < cutoff)
            .cloned()
            .collect();
        abandoned.sort_by_key(|s| s.created_at);
        abandoned.truncate(limit.max(0) as usize);
        Ok(abandoned)
    }

    async fn claim_webhook_event(&self, event_id: &str, _event_type: &str) -> BillingResult<bool> {
        Ok(self.webhook_events.write().await.insert(event_id.to_string()))
    }

    async fn release_webhook_event(&self, event_id: &str) -> BillingResult<()> {
        self.webhook_events.write().await.remove(event_id);
        Ok(())
    }
}

/// Audit sink that keeps entries in memory
#[derive(Default)]
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn count(&self, action: AuditAction) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::subscription_fixture;

    #[tokio::test]
    async fn test_subscription_version_check() {
        let store = InMemoryBillingStore::new();
        let sub = subscription_fixture(Uuid::new_v4(), "nursing-basic", SubscriptionStatus::Active);
        store.insert_subscription(&sub).await.unwrap();

        let saved = store.save_subscription(&sub).await.unwrap();
        assert_eq!(saved.version, sub.version + 1);

        let err = store.save_subscription(&sub).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_duplicate_gateway_subscription_rejected() {
        let store = InMemoryBillingStore::new();
        let sub = subscription_fixture(Uuid::new_v4(), "nursing-basic", SubscriptionStatus::Active);
        store.insert_subscription(&sub).await.unwrap();

        let mut again = sub.clone();
        again.id = Uuid::new_v4();
        assert!(matches!(
            store.insert_subscription(&again).await,
            Err(BillingError::ConcurrentModification(_))
        ));
    }

    #[tokio::test]
    async fn test_status_filter_and_due_cancellations() {
        let store = InMemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let active = subscription_fixture(user_id, "nursing-basic", SubscriptionStatus::Active);
        let mut ending = subscription_fixture(user_id, "pt-basic", SubscriptionStatus::Active);
        ending.cancel_at_period_end = true;
        ending.current_period_end = now - time::Duration::minutes(1);
        let canceled = subscription_fixture(user_id, "provider-basic", SubscriptionStatus::Canceled);

        for sub in [&active, &ending, &canceled] {
            store.insert_subscription(sub).await.unwrap();
        }

        let entitled = store
            .find_subscriptions(user_id, &SubscriptionStatus::ENTITLED)
            .await
            .unwrap();
        assert_eq!(entitled.len(), 2);
        assert_eq!(store.find_subscriptions(user_id, &[]).await.unwrap().len(), 3);

        let due = store.find_subscriptions_due_for_cancellation(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ending.id);
    }

    #[tokio::test]
    async fn test_webhook_claim_once() {
        let store = InMemoryBillingStore::new();
        assert!(store.claim_webhook_event("evt_1", "invoice.payment_failed").await.unwrap());
        assert!(!store.claim_webhook_event("evt_1", "invoice.payment_failed").await.unwrap());
        store.release_webhook_event("evt_1").await.unwrap();
        assert!(store.claim_webhook_event("evt_1", "invoice.payment_failed").await.unwrap());
    }
}
