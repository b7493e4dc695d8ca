//! Feature Access Aggregator
//!
//! Answers "what can this user do right now?" by combining every active or trialing
//! subscription the user holds.
//!
//! ## Rules
//!
//! 1. **Derived, never authoritative**: the cached [`FeatureAccess`] on the user can be
//!    thrown away and rebuilt from subscriptions at any time.
//! 2. **Union of features**: a feature granted by any contributing subscription is granted.
//! 3. **Max of limits**: `-1` (unlimited) dominates; otherwise the largest grant wins.
//!    Quotas from two plans do not add up.
//! 4. **Passive**: the aggregator recomputes only when asked. Callers that read a stale
//!    cache (missing, untimestamped or older than the horizon) trigger [`refresh`].
//! 5. **Versioned writes**: the cache is saved with the user's version check and retried
//!    against a fresh read when another writer got there first.
//!
//! [`refresh`]: FeatureAccessAggregator::refresh

use std::sync::Arc;

use carebill_shared::{default_feature_access, FeatureAccess, Subscription, SubscriptionStatus, User};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorMeta, AuditAction, AuditEntry, AuditLog};
use crate::store::BillingStore;

const SAVE_ATTEMPTS: u32 = 3;

/// Combine the entitlements of a user's subscriptions. Subscriptions that are not active
/// or trialing contribute nothing.
pub fn aggregate(subscriptions: &[Subscription], now: OffsetDateTime) -> FeatureAccess {
    let mut access = default_feature_access();
    let mut contributing = subscriptions.iter().filter(|s| s.status.is_entitled());

    if let Some(first) = contributing.next() {
        access.limits = first.limits;
        access.features.extend(first.features.iter().cloned());
        for sub in contributing {
            access.limits.combine_max(&sub.limits);
            access.features.extend(sub.features.iter().cloned());
        }
    }

    access.last_updated = Some(now);
    access
}

pub struct FeatureAccessAggregator {
    store: Arc<dyn BillingStore>,
    audit: AuditLog,
    max_age: time::Duration,
}

impl FeatureAccessAggregator {
    pub fn new(store: Arc<dyn BillingStore>, audit: AuditLog, max_age: time::Duration) -> Self {
        Self {
            store,
            audit,
            max_age,
        }
    }

    pub fn max_age(&self) -> time::Duration {
        self.max_age
    }

    /// Write `access` as the user's cache, reloading and retrying on a version conflict.
    /// Returns the saved user.
    pub async fn store_access(&self, user_id: Uuid, access: &FeatureAccess) -> BillingResult<User> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut user = self
                .store
                .find_user(user_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
            user.feature_access = Some(access.clone());

            match self.store.save_user(&user).await {
                Ok(saved) => return Ok(saved),
                Err(BillingError::ConcurrentModification(reason)) if attempt < SAVE_ATTEMPTS => {
                    tracing::debug!(
                        user_id = %user_id,
                        attempt = attempt,
                        reason = %reason,
                        "Version conflict, reloading user"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Recompute the user's entitlements from their subscriptions and store them
    pub async fn refresh(&self, user_id: Uuid) -> BillingResult<FeatureAccess> {
        if self.store.find_user(user_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("user {}", user_id)));
        }

        let subscriptions = self
            .store
            .find_subscriptions(user_id, &SubscriptionStatus::ENTITLED)
            .await?;
        let access = aggregate(&subscriptions, OffsetDateTime::now_utc());

        self.store_access(user_id, &access).await?;

        tracing::info!(
            user_id = %user_id,
            subscriptions = subscriptions.len(),
            features = access.features.len(),
            "Refreshed feature access"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::FeatureAccessRefreshed)
                    .user(user_id)
                    .actor(&ActorMeta::system())
                    .data(serde_json::json!({
                        "subscriptions": subscriptions.iter().map(|s| s.plan_id.as_str()).collect::<Vec<_>>(),
                        "limits": access.limits,
                    })),
            )
            .await;

        Ok(access)
    }

    /// The user's entitlements, recomputed if the cache is missing or stale.
    ///
    /// A cache that only needed normalizing is repaired in place.
    pub async fn current(&self, user_id: Uuid) -> BillingResult<FeatureAccess> {
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        let Some(cached) = user.feature_access else {
            return self.refresh(user_id).await;
        };

        let (changed, access) = cached.normalize();
        if access.is_stale(OffsetDateTime::now_utc(), self.max_age) {
            return self.refresh(user_id).await;
        }
        if changed {
            tracing::debug!(user_id = %user_id, "Repaired malformed feature access cache");
            self.store_access(user_id, &access).await?;
        }
        Ok(access)
    }

    /// Refresh up to `limit` caches older than the staleness horizon. Returns how many
    /// were refreshed; individual failures are logged and skipped.
    pub async fn refresh_stale(&self, limit: i64) -> BillingResult<usize> {
        let cutoff = OffsetDateTime::now_utc() - self.max_age;
        let users = self.store.find_users_with_stale_cache(cutoff, limit).await?;

        let mut refreshed = 0;
        for user_id in users {
            match self.refresh(user_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to refresh stale feature access")
                }
            }
        }
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryAuditSink, InMemoryBillingStore};
    use crate::test_support::subscription_fixture;
    use carebill_shared::{LimitName, User, UNLIMITED};

    fn aggregator(store: Arc<InMemoryBillingStore>) -> FeatureAccessAggregator {
        FeatureAccessAggregator::new(
            store,
            AuditLog::new(Arc::new(InMemoryAuditSink::new())),
            time::Duration::hours(24),
        )
    }

    fn with_uploads(user_id: Uuid, plan: &str, uploads: i64) -> Subscription {
        let mut sub = subscription_fixture(user_id, plan, SubscriptionStatus::Active);
        sub.limits.file_uploads = uploads;
        sub
    }

    #[test]
    fn test_unlimited_dominates() {
        let user = Uuid::new_v4();
        let subs = [with_uploads(user, "nursing-basic", 5), with_uploads(user, "pt-basic", UNLIMITED)];
        let access = aggregate(&subs, OffsetDateTime::now_utc());
        assert_eq!(access.limit(LimitName::FileUploads), UNLIMITED);
    }

    #[test]
    fn test_limits_take_max_not_sum() {
        let user = Uuid::new_v4();
        let subs = [with_uploads(user, "nursing-basic", 10), with_uploads(user, "pt-basic", 25)];
        let access = aggregate(&subs, OffsetDateTime::now_utc());
        assert_eq!(access.limit(LimitName::FileUploads), 25);
    }

    #[test]
    fn test_features_are_unioned_and_inactive_ignored() {
        let user = Uuid::new_v4();
        let nursing = subscription_fixture(user, "nursing-basic", SubscriptionStatus::Active);
        let provider = subscription_fixture(user, "provider-pro", SubscriptionStatus::Trialing);
        let canceled = subscription_fixture(user, "general-premium", SubscriptionStatus::Canceled);

        let access = aggregate(&[nursing.clone(), provider.clone(), canceled], OffsetDateTime::now_utc());
        for feature in nursing.features.iter().chain(provider.features.iter()) {
            assert!(access.has_feature(feature), "missing {}", feature);
        }
        assert_eq!(
            access.features.len(),
            nursing.features.union(&provider.features).count()
        );
    }

    #[test]
    fn test_no_subscriptions_gives_defaults() {
        let access = aggregate(&[], OffsetDateTime::now_utc());
        assert!(access.features.is_empty());
        assert_eq!(access.limits, default_feature_access().limits);
        assert!(access.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_refresh_writes_cache() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = User::new("riley@clinic.example");
        store.insert_user(&user).await.unwrap();
        store
            .insert_subscription(&with_uploads(user.id, "nursing-basic", 10))
            .await
            .unwrap();

        let access = aggregator(store.clone()).refresh(user.id).await.unwrap();
        let cached = store.find_user(user.id).await.unwrap().unwrap().feature_access.unwrap();
        assert_eq!(cached, access);
        assert_eq!(cached.limit(LimitName::FileUploads), 10);
    }

    #[tokio::test]
    async fn test_current_recomputes_stale_cache() {
        let store = Arc::new(InMemoryBillingStore::new());
        let mut user = User::new("riley@clinic.example");
        let mut stale = default_feature_access();
        stale.last_updated = Some(OffsetDateTime::now_utc() - time::Duration::hours(25));
        user.feature_access = Some(stale);
        store.insert_user(&user).await.unwrap();
        store
            .insert_subscription(&with_uploads(user.id, "pt-basic", 40))
            .await
            .unwrap();

        let access = aggregator(store).current(user.id).await.unwrap();
        assert_eq!(access.limit(LimitName::FileUploads), 40);
    }

    #[tokio::test]
    async fn test_current_keeps_fresh_cache() {
        let store = Arc::new(InMemoryBillingStore::new());
        let mut user = User::new("riley@clinic.example");
        let mut fresh = default_feature_access();
        fresh.last_updated = Some(OffsetDateTime::now_utc());
        fresh.limits.team_members = 7;
        user.feature_access = Some(fresh);
        store.insert_user(&user).await.unwrap();

        let access = aggregator(store).current(user.id).await.unwrap();
        assert_eq!(access.limit(LimitName::TeamMembers), 7);
    }

    #[tokio::test]
    async fn test_refresh_stale_skips_fresh_users() {
        let store = Arc::new(InMemoryBillingStore::new());
        let missing = User::new("a@clinic.example");
        let mut fresh = User::new("b@clinic.example");
        let mut access = default_feature_access();
        access.last_updated = Some(OffsetDateTime::now_utc());
        fresh.feature_access = Some(access);
        store.insert_user(&missing).await.unwrap();
        store.insert_user(&fresh).await.unwrap();

        assert_eq!(aggregator(store.clone()).refresh_stale(100).await.unwrap(), 1);
        assert!(store.find_user(missing.id).await.unwrap().unwrap().feature_access.is_some());
    }

    /// Store where another writer saves the user just before each of the next `races` saves
    struct RacingStore {
        inner: InMemoryBillingStore,
        races: std::sync::atomic::AtomicU32,
    }

    impl RacingStore {
        fn new(races: u32) -> Self {
            Self {
                inner: InMemoryBillingStore::new(),
                races: std::sync::atomic::AtomicU32::new(races),
            }
        }
    }

    #[async_trait::async_trait]
    impl BillingStore for RacingStore {
        async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
            self.inner.find_user(user_id).await
        }
        async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
            self.inner.find_user_by_email(email).await
        }
        async fn insert_user(&self, user: &User) -> BillingResult<()> {
            self.inner.insert_user(user).await
        }
        async fn save_user(&self, user: &User) -> BillingResult<User> {
            use std::sync::atomic::Ordering;
            let racing = self
                .races
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if racing {
                let current = self.inner.find_user(user.id).await?.unwrap();
                self.inner.save_user(&current).await?;
            }
            self.inner.save_user(user).await
        }
        async fn find_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
            self.inner.find_subscription(id).await
        }
        async fn find_subscriptions(
            &self,
            user_id: Uuid,
            statuses: &[SubscriptionStatus],
        ) -> BillingResult<Vec<Subscription>> {
            self.inner.find_subscriptions(user_id, statuses).await
        }
        async fn find_subscription_by_external_id(&self, id: &str) -> BillingResult<Option<Subscription>> {
            self.inner.find_subscription_by_external_id(id).await
        }
        async fn insert_subscription(&self, sub: &Subscription) -> BillingResult<()> {
            self.inner.insert_subscription(sub).await
        }
        async fn save_subscription(&self, sub: &Subscription) -> BillingResult<Subscription> {
            self.inner.save_subscription(sub).await
        }
        async fn find_subscriptions_due_for_cancellation(
            &self,
            now: OffsetDateTime,
        ) -> BillingResult<Vec<Subscription>> {
            self.inner.find_subscriptions_due_for_cancellation(now).await
        }
        async fn find_users_with_stale_cache(&self, cutoff: OffsetDateTime, limit: i64) -> BillingResult<Vec<Uuid>> {
            self.inner.find_users_with_stale_cache(cutoff, limit).await
        }
        async fn find_incomplete_subscriptions(
            &self,
            cutoff: OffsetDateTime,
            limit: i64,
        ) -> BillingResult<Vec<Subscription>> {
            self.inner.find_incomplete_subscriptions(cutoff, limit).await
        }
        async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
            self.inner.claim_webhook_event(event_id, event_type).await
        }
        async fn release_webhook_event(&self, event_id: &str) -> BillingResult<()> {
            self.inner.release_webhook_event(event_id).await
        }
    }

    fn racing_aggregator(store: Arc<RacingStore>) -> FeatureAccessAggregator {
        FeatureAccessAggregator::new(
            store,
            AuditLog::new(Arc::new(InMemoryAuditSink::new())),
            time::Duration::hours(24),
        )
    }

    #[tokio::test]
    async fn test_refresh_retries_version_conflicts() {
        let store = Arc::new(RacingStore::new(2));
        let user = User::new("riley@clinic.example");
        store.insert_user(&user).await.unwrap();
        store
            .insert_subscription(&with_uploads(user.id, "nursing-basic", 10))
            .await
            .unwrap();

        let access = racing_aggregator(store.clone()).refresh(user.id).await.unwrap();

        let saved = store.find_user(user.id).await.unwrap().unwrap();
        assert_eq!(saved.feature_access, Some(access));
        // two competing writes plus ours
        assert_eq!(saved.version, user.version + 3);
    }

    #[tokio::test]
    async fn test_refresh_gives_up_after_bounded_conflicts() {
        let store = Arc::new(RacingStore::new(SAVE_ATTEMPTS));
        let user = User::new("riley@clinic.example");
        store.insert_user(&user).await.unwrap();

        assert!(matches!(
            racing_aggregator(store).refresh(user.id).await,
            Err(BillingError::ConcurrentModification(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_is_version_checked() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = User::new("riley@clinic.example");
        store.insert_user(&user).await.unwrap();
        let stale = store.find_user(user.id).await.unwrap().unwrap();

        aggregator(store.clone()).refresh(user.id).await.unwrap();

        assert_eq!(store.find_user(user.id).await.unwrap().unwrap().version, stale.version + 1);
        assert!(matches!(
            store.save_user(&stale).await,
            Err(BillingError::ConcurrentModification(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_unknown_user() {
        let store = Arc::new(InMemoryBillingStore::new());
        assert!(matches!(
            aggregator(store).refresh(Uuid::new_v4()).await,
            Err(BillingError::NotFound(_))
        ));
    }
}
