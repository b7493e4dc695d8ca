//! End-to-end properties of the engine, exercised through [`BillingService`] with
//! in-memory adapters and a scripted gateway.

use std::time::Duration;

use carebill_shared::{LimitName, SubscriptionStatus, UNLIMITED};
use time::OffsetDateTime;

use crate::catalog::PlanCatalog;
use crate::conflict::AccountAge;
use crate::entitlement::aggregate;
use crate::error::{BillingError, ErrorCode};
use crate::events::{ActorMeta, AuditAction};
use crate::gateway::{GatewayError, GatewayErrorCategory};
use crate::lifecycle::CancelRequest;
use crate::refund::{calculate_prorated_amount, RefundOutcome, RefundRequest};
use crate::risk::{PurchaseSignals, RiskContext, RiskEngine, VelocityCounts};
use crate::store::BillingStore;
use crate::test_support::{purchase_request, subscription_fixture, user_actor, Harness};
use carebill_shared::Specialty;

#[tokio::test]
async fn test_duplicate_submission_admits_one_attempt() {
    let h = Harness::new();
    let actor = user_actor("203.0.113.9");
    let request = purchase_request("casey@clinic.example", "provider-pro");

    let (first, second) = tokio::join!(
        h.service.purchases.purchase(&request, &actor),
        h.service.purchases.purchase(&request, &actor),
    );

    let outcomes = [first, second];
    let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
    let duplicates = outcomes
        .iter()
        .filter(|r| matches!(r, Err(f) if f.error.code() == ErrorCode::DuplicateRequest))
        .count();
    assert_eq!(admitted, 1);
    assert_eq!(duplicates, 1);
    assert_eq!(h.gateway.call_count("create_subscription"), 1);
}

#[test]
fn test_conflict_monotonicity_over_catalog() {
    let h = Harness::new();
    let catalog = PlanCatalog::standard();
    let user = uuid::Uuid::new_v4();

    for held in catalog.all() {
        let existing = [subscription_fixture(user, &held.id, SubscriptionStatus::Active)];
        for requested in catalog.all().filter(|p| p.id != held.id) {
            let conflict = h
                .service
                .conflicts
                .evaluate(requested, &existing, AccountAge::Established);

            if requested.specialty == held.specialty && requested.tier <= held.tier {
                assert!(conflict.is_some(), "{} should be blocked by {}", requested.id, held.id);
            }
            if requested.specialty != held.specialty && held.specialty != Specialty::General {
                assert!(conflict.is_none(), "{} wrongly blocked by {}", requested.id, held.id);
            }
        }
    }
}

#[tokio::test]
async fn test_concurrent_purchases_for_one_user_are_serialized() {
    let h = Harness::new();
    h.seed_user("casey@clinic.example", time::Duration::days(90)).await;
    let request = purchase_request("casey@clinic.example", "nursing-pro");

    // Different networks, so the idempotency guard does not collapse them
    let first_actor = user_actor("203.0.113.10");
    let second_actor = user_actor("203.0.113.11");
    let (first, second) = tokio::join!(
        h.service.purchases.purchase(&request, &first_actor),
        h.service.purchases.purchase(&request, &second_actor),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(f) if f.error.code() == ErrorCode::SubscriptionConflict)));
    assert_eq!(h.store.subscription_count().await, 1);
}

#[test]
fn test_risk_scoring_is_deterministic() {
    let engine = RiskEngine::default();
    let context = RiskContext {
        purchase: PurchaseSignals {
            ip: Some("203.0.113.12".to_string()),
            email: "qwerty@mailinator.com".to_string(),
            plan_id: "pt-pro".to_string(),
            user_agent: Some("curl/8.4".to_string()),
            paste_only: true,
            ..PurchaseSignals::default()
        },
        velocity: VelocityCounts {
            ip: 9,
            email: 1,
            card: 0,
        },
        geo: Err("lookup timed out".to_string()),
        account_age: time::Duration::minutes(3),
        recent_plan_switches: 0,
    };

    let first = engine.assess(&context);
    for _ in 0..10 {
        assert_eq!(engine.assess(&context), first);
    }
    assert!(first.score > 0);
}

#[test]
fn test_proration_examples() {
    let start = OffsetDateTime::now_utc() - time::Duration::days(10);
    let end = start + time::Duration::days(30);
    assert_eq!(calculate_prorated_amount(18240, start, end, start + time::Duration::days(10)), 12160);
    assert_eq!(calculate_prorated_amount(18240, start, end, start), 18240);
}

#[tokio::test]
async fn test_prorated_refund_below_minimum_needs_no_refund() {
    let h = Harness::new();
    let user = h.seed_user("casey@clinic.example", time::Duration::days(90)).await;
    let mut sub = h.seed_subscription(user.id, "nursing-basic", SubscriptionStatus::Active).await;
    sub.current_period_start = OffsetDateTime::now_utc() - time::Duration::days(30) + time::Duration::hours(1);
    sub.current_period_end = OffsetDateTime::now_utc() + time::Duration::hours(1);
    h.store.save_subscription(&sub).await.unwrap();

    let outcome = h
        .service
        .refunds
        .prorated_refund(sub.id, &RefundRequest::default(), &ActorMeta::system())
        .await
        .unwrap();
    assert_eq!(outcome, RefundOutcome::NoRefundNeeded { calculated_cents: 0 });
    assert_eq!(h.gateway.call_count("create_refund"), 0);
}

#[test]
fn test_aggregation_examples() {
    let user = uuid::Uuid::new_v4();
    let mut five = subscription_fixture(user, "nursing-basic", SubscriptionStatus::Active);
    five.limits.file_uploads = 5;
    let mut unlimited = subscription_fixture(user, "pt-basic", SubscriptionStatus::Active);
    unlimited.limits.file_uploads = UNLIMITED;
    let access = aggregate(&[five.clone(), unlimited], OffsetDateTime::now_utc());
    assert_eq!(access.limit(LimitName::FileUploads), UNLIMITED);

    let mut ten = five;
    ten.limits.file_uploads = 10;
    let mut twenty_five = subscription_fixture(user, "provider-basic", SubscriptionStatus::Trialing);
    twenty_five.limits.file_uploads = 25;
    let access = aggregate(&[ten, twenty_five], OffsetDateTime::now_utc());
    assert_eq!(access.limit(LimitName::FileUploads), 25);
}

#[tokio::test]
async fn test_canceled_subscription_cannot_be_canceled_again() {
    let h = Harness::new();
    let user = h.seed_user("casey@clinic.example", time::Duration::days(90)).await;
    let sub = h.seed_subscription(user.id, "pt-pro", SubscriptionStatus::Canceled).await;

    let err = h
        .service
        .lifecycle
        .cancel(sub.id, &CancelRequest::default(), &ActorMeta::system())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BillingError::InvalidTransition {
            from: SubscriptionStatus::Canceled,
            ..
        }
    ));
    assert_eq!(h.gateway.call_count("update_subscription"), 0);
    assert_eq!(h.audit.count(AuditAction::TransitionRejected).await, 1);
}

#[tokio::test]
async fn test_persistent_gateway_failure_is_bounded() {
    let h = Harness::new();
    h.gateway.always_fail(
        "create_customer",
        GatewayError::new(GatewayErrorCategory::Network, "connection reset by peer"),
    );

    let err = h
        .service
        .purchases
        .purchase(
            &purchase_request("casey@clinic.example", "general-basic"),
            &user_actor("203.0.113.13"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.error.code(), ErrorCode::NetworkError);
    assert_eq!(h.gateway.call_count("create_customer"), 3);
    assert_eq!(h.gateway.call_count("create_subscription"), 0);
    assert_eq!(h.audit.count(AuditAction::PaymentAttempt).await, 3);
}

#[tokio::test]
async fn test_gateway_commit_then_timeout_charges_once() {
    let h = Harness::new();
    // Both creates succeed on the gateway but answer after the 200ms call timeout
    h.gateway.linger_once("create_customer", Duration::from_millis(500));
    h.gateway.linger_once("create_subscription", Duration::from_millis(500));

    let receipt = h
        .service
        .purchases
        .purchase(
            &purchase_request("casey@clinic.example", "nursing-pro"),
            &user_actor("203.0.113.14"),
        )
        .await
        .unwrap();

    for op in ["create_customer", "create_subscription"] {
        assert_eq!(h.gateway.call_count(op), 2, "{op}");
        let keys = h.gateway.idempotency_keys(op);
        assert_eq!(keys[0], keys[1], "{op}");
    }
    assert_eq!(h.gateway.subscription_count(), 1);
    assert_eq!(h.store.subscription_count().await, 1);

    let remote = h
        .gateway
        .gateway_subscription(&receipt.subscription.gateway_subscription_id)
        .unwrap();
    assert_eq!(remote.customer_id, receipt.subscription.gateway_customer_id);
    assert_eq!(receipt.subscription.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_partial_refund_over_ceiling_is_rejected_before_gateway() {
    let h = Harness::new();
    let user = h.seed_user("casey@clinic.example", time::Duration::days(90)).await;
    let sub = h.seed_subscription(user.id, "provider-basic", SubscriptionStatus::Active).await;

    let err = h
        .service
        .refunds
        .partial_refund(sub.id, sub.amount_paid_cents + 1, &RefundRequest::default(), &ActorMeta::system())
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::RefundAmountExceedsCharge { .. }));
    assert_eq!(h.gateway.call_count("create_refund"), 0);
}
