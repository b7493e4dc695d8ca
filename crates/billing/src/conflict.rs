//! Conflict Resolver
//!
//! Stops a purchase before any charge when the user already holds the same plan, or a
//! plan in the same specialty (or a `general` plan) whose tier covers the requested one.
//! Plans in different specialties never conflict.

use std::sync::Arc;

use carebill_shared::{Subscription, SubscriptionStatus, User};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{PlanCatalog, PlanConfig};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DuplicatePlan,
    CoveredByHigherTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    pub kind: ConflictKind,
    pub requested_plan_id: String,
    pub existing_plan_id: String,
    pub existing_subscription_id: Uuid,
    pub message: String,
    pub suggestions: Vec<String>,
}

impl From<ConflictDetail> for BillingError {
    fn from(detail: ConflictDetail) -> Self {
        BillingError::SubscriptionConflict {
            reason: detail.message,
            suggestions: detail.suggestions,
        }
    }
}

/// How much conflict checking an identity gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountAge {
    /// Created by the request being checked; it cannot own subscriptions yet
    CreatedInRequest,
    /// Inside the grace window: only exact duplicates are rejected
    WithinGrace,
    Established,
}

pub struct ConflictResolver {
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
    grace: time::Duration,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn BillingStore>, catalog: Arc<PlanCatalog>, grace: time::Duration) -> Self {
        Self {
            store,
            catalog,
            grace,
        }
    }

    pub fn account_age(&self, user: &User, created_in_request: bool, now: OffsetDateTime) -> AccountAge {
        if created_in_request {
            AccountAge::CreatedInRequest
        } else if now - user.created_at < self.grace {
            AccountAge::WithinGrace
        } else {
            AccountAge::Established
        }
    }

    /// Check the user's active and trialing subscriptions against `plan_id`
    pub async fn check_conflict(
        &self,
        user: &User,
        created_in_request: bool,
        plan_id: &str,
    ) -> BillingResult<Option<ConflictDetail>> {
        let plan = self.catalog.require(plan_id)?;
        let age = self.account_age(user, created_in_request, OffsetDateTime::now_utc());
        if age == AccountAge::CreatedInRequest {
            tracing::debug!(user_id = %user.id, plan_id = %plan_id, "Skipping conflict check for new account");
            return Ok(None);
        }

        let existing = self
            .store
            .find_subscriptions(user.id, &SubscriptionStatus::ENTITLED)
            .await?;
        let conflict = self.evaluate(plan, &existing, age);

        if let Some(detail) = &conflict {
            tracing::info!(
                user_id = %user.id,
                plan_id = %plan_id,
                existing_plan_id = %detail.existing_plan_id,
                kind = ?detail.kind,
                "Subscription conflict detected"
            );
        }
        Ok(conflict)
    }

    /// Pure conflict rule over a set of subscriptions
    pub fn evaluate(
        &self,
        plan: &PlanConfig,
        existing: &[Subscription],
        age: AccountAge,
    ) -> Option<ConflictDetail> {
        if age == AccountAge::CreatedInRequest {
            return None;
        }
        let entitled = existing.iter().filter(|s| s.status.is_entitled());

        for sub in entitled.clone() {
            if sub.plan_id == plan.id {
                return Some(ConflictDetail {
                    kind: ConflictKind::DuplicatePlan,
                    requested_plan_id: plan.id.clone(),
                    existing_plan_id: sub.plan_id.clone(),
                    existing_subscription_id: sub.id,
                    message: format!("You already have an active {} subscription.", plan.name),
                    suggestions: vec![
                        "Manage your existing subscription from the billing page".to_string(),
                        "Choose a different plan".to_string(),
                    ],
                });
            }
        }

        if age == AccountAge::WithinGrace {
            return None;
        }

        for sub in entitled {
            let Some(current) = self.catalog.get(&sub.plan_id) else {
                continue;
            };
            if plan.is_covered_by(current) {
                return Some(ConflictDetail {
                    kind: ConflictKind::CoveredByHigherTier,
                    requested_plan_id: plan.id.clone(),
                    existing_plan_id: current.id.clone(),
                    existing_subscription_id: sub.id,
                    message: format!(
                        "Your {} plan already includes everything in {}.",
                        current.name, plan.name
                    ),
                    suggestions: vec![
                        format!("Keep your current {} plan", current.name),
                        "Upgrade to a higher tier instead".to_string(),
                        "Choose a plan for a different specialty".to_string(),
                    ],
                });
            }
        }
        None
    }
}
