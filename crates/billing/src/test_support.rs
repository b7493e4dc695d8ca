//! Test doubles and fixtures shared by the unit tests of this crate

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use carebill_shared::{BillingInterval, RefundStatus, Subscription, SubscriptionStatus, User};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::events::ActorMeta;
use crate::gateway::{
    CollectionChange, CreateCustomerRequest, CreateRefundRequest, CreateSubscriptionRequest,
    GatewayCustomer, GatewayError, GatewayInvoice, GatewayRefund, GatewayResult,
    GatewaySubscription, PaymentGateway, PaymentState, SubscriptionUpdate,
};
use crate::idempotency::InMemoryIdempotencyGuard;
use crate::memory::{InMemoryAuditSink, InMemoryBillingStore};
use crate::notify::{NotificationEvent, Notifier};
use crate::orchestrator::RetryPolicy;
use crate::purchase::PurchaseRequest;
use crate::risk::{NoopGeoResolver, PurchaseSignals};
use crate::{BillingDeps, BillingService};

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(2),
        call_timeout: Duration::from_millis(200),
    }
}

pub fn test_config() -> BillingConfig {
    BillingConfig {
        payment_retry_base: Duration::from_millis(2),
        gateway_timeout: Duration::from_millis(200),
        ..BillingConfig::default()
    }
}

/// A purchase from a browser with a known device, which scores as low risk
pub fn purchase_request(email: &str, plan_id: &str) -> PurchaseRequest {
    let now = OffsetDateTime::now_utc();
    PurchaseRequest {
        email: email.to_string(),
        plan_id: plan_id.to_string(),
        payment_method_id: Some("pm_card_visa".to_string()),
        signals: PurchaseSignals {
            device_fingerprint: Some("dev_7f3a9c".to_string()),
            device_reputation: Some(0.9),
            user_agent: Some(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 Safari/605.1.15".to_string(),
            ),
            full_name: Some("Jordan Reyes".to_string()),
            form_started_at: Some(now - time::Duration::seconds(90)),
            form_submitted_at: Some(now),
            ..PurchaseSignals::default()
        },
    }
}

pub fn user_actor(ip: &str) -> ActorMeta {
    ActorMeta::user(None, Some(ip.to_string()), Some("sess_test".to_string()))
}

/// A subscription on a standard plan whose period started a day ago
pub fn subscription_fixture(user_id: Uuid, plan_id: &str, status: SubscriptionStatus) -> Subscription {
    let catalog = PlanCatalog::standard();
    let plan = catalog.get(plan_id).cloned().unwrap_or_else(|| panic!("unknown plan {}", plan_id));
    let now = OffsetDateTime::now_utc();
    let start = now - time::Duration::days(1);
    let suffix = Uuid::new_v4().simple().to_string();

    Subscription {
        id: Uuid::new_v4(),
        user_id,
        plan_id: plan.id.clone(),
        gateway_customer_id: format!("cus_{}", &suffix[..12]),
        gateway_subscription_id: format!("sub_{}", &suffix[..12]),
        latest_invoice_id: Some(format!("in_{}", &suffix[..12])),
        status,
        amount_cents: plan.price_cents,
        amount_paid_cents: plan.price_cents,
        interval: BillingInterval::Monthly,
        current_period_start: start,
        current_period_end: start + time::Duration::days(30),
        cancel_at_period_end: false,
        canceled_at: None,
        cancel_reason: None,
        paused_at: None,
        resumed_at: None,
        failed_payment_count: 0,
        features: plan.features.iter().cloned().collect::<BTreeSet<_>>(),
        limits: plan.limits,
        refunds: Vec::new(),
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

#[derive(Default)]
struct GatewayState {
    calls: Vec<String>,
    always_fail: HashMap<String, GatewayError>,
    next_failures: HashMap<String, VecDeque<GatewayError>>,
    delays: HashMap<String, Duration>,
    lingers: HashMap<String, VecDeque<Duration>>,
    keys: Vec<(String, String)>,
    keyed_customers: HashMap<String, GatewayCustomer>,
    keyed_subscriptions: HashMap<String, String>,
    payment_states: VecDeque<PaymentState>,
    refund_status: Option<RefundStatus>,
    subscriptions: HashMap<String, GatewaySubscription>,
    invoices: HashMap<String, GatewayInvoice>,
    refunds: HashMap<String, GatewayRefund>,
}

/// Scripted [`PaymentGateway`]: records every call and replays queued outcomes.
/// Unscripted calls succeed.
pub struct ScriptedGateway {
    state: Mutex<GatewayState>,
    prices: HashMap<String, i64>,
    ids: AtomicU64,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        let prices = PlanCatalog::standard()
            .all()
            .map(|p| (p.gateway_price_id.clone(), p.price_cents))
            .collect();
        Self {
            state: Mutex::new(GatewayState::default()),
            prices,
            ids: AtomicU64::new(1),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    pub fn always_fail(&self, operation: &str, error: GatewayError) {
        self.state
            .lock()
            .unwrap()
            .always_fail
            .insert(operation.to_string(), error);
    }

    pub fn fail_next(&self, operation: &str, error: GatewayError) {
        self.state
            .lock()
            .unwrap()
            .next_failures
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn delay(&self, operation: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(operation.to_string(), delay);
    }

    /// The next call of `operation` commits, then keeps the caller waiting for `delay`
    pub fn linger_once(&self, operation: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .lingers
            .entry(operation.to_string())
            .or_default()
            .push_back(delay);
    }

    /// Idempotency keys received by `operation`, one per call
    pub fn idempotency_keys(&self, operation: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .keys
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscriptions.len()
    }

    /// Payment state of the next created subscription
    pub fn next_payment_state(&self, state: PaymentState) {
        self.state.lock().unwrap().payment_states.push_back(state);
    }

    pub fn set_refund_status(&self, status: RefundStatus) {
        self.state.lock().unwrap().refund_status = Some(status);
    }

    /// Make the gateway aware of a subscription created outside of it
    pub fn seed(&self, sub: &Subscription, price_id: &str) {
        let invoice = sub.latest_invoice_id.as_ref().map(|id| GatewayInvoice {
            id: id.clone(),
            subscription_id: Some(sub.gateway_subscription_id.clone()),
            amount_paid_cents: sub.amount_paid_cents,
            paid: true,
            charge_id: Some(format!("ch_{}", id)),
            payment_state: PaymentState::Succeeded,
        });
        let gateway_sub = GatewaySubscription {
            id: sub.gateway_subscription_id.clone(),
            customer_id: sub.gateway_customer_id.clone(),
            status: sub.status,
            price_id: Some(price_id.to_string()),
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            latest_invoice: invoice.clone(),
        };
        let mut state = self.state.lock().unwrap();
        if let Some(invoice) = invoice {
            state.invoices.insert(invoice.id.clone(), invoice);
        }
        state.subscriptions.insert(gateway_sub.id.clone(), gateway_sub);
    }

    pub fn gateway_subscription(&self, id: &str) -> Option<GatewaySubscription> {
        self.state.lock().unwrap().subscriptions.get(id).cloned()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_test{}", prefix, self.ids.fetch_add(1, Ordering::SeqCst))
    }

    /// Like [`Self::enter`], remembering the idempotency key the call carried
    async fn enter_keyed(&self, operation: &str, key: &str) -> GatewayResult<()> {
        self.state
            .lock()
            .unwrap()
            .keys
            .push((operation.to_string(), key.to_string()));
        self.enter(operation).await
    }

    async fn linger(&self, operation: &str) {
        let delay = self
            .state
            .lock()
            .unwrap()
            .lingers
            .get_mut(operation)
            .and_then(|queue| queue.pop_front());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn enter(&self, operation: &str) -> GatewayResult<()> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(operation.to_string());
            state.delays.get(operation).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(err) = state
            .next_failures
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        if let Some(err) = state.always_fail.get(operation) {
            return Err(err.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_customer(&self, request: &CreateCustomerRequest) -> GatewayResult<GatewayCustomer> {
        let key = &request.idempotency_key;
        self.enter_keyed("create_customer", key).await?;
        let customer = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.keyed_customers.get(key).filter(|_| !key.is_empty()) {
                return Ok(existing.clone());
            }
            let customer = GatewayCustomer {
                id: self.next_id("cus"),
                email: Some(request.email.clone()),
                deleted: false,
            };
            if !key.is_empty() {
                state.keyed_customers.insert(key.clone(), customer.clone());
            }
            customer
        };
        self.linger("create_customer").await;
        Ok(customer)
    }

    async fn retrieve_customer(&self, customer_id: &str) -> GatewayResult<GatewayCustomer> {
        self.enter("retrieve_customer").await?;
        Ok(GatewayCustomer {
            id: customer_id.to_string(),
            email: None,
            deleted: false,
        })
    }

    async fn attach_payment_method(&self, _customer_id: &str, _payment_method_id: &str) -> GatewayResult<()> {
        self.enter("attach_payment_method").await
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> GatewayResult<GatewaySubscription> {
        let key = &request.idempotency_key;
        self.enter_keyed("create_subscription", key).await?;
        {
            let state = self.state.lock().unwrap();
            let replay = state
                .keyed_subscriptions
                .get(key)
                .filter(|_| !key.is_empty())
                .and_then(|id| state.subscriptions.get(id));
            if let Some(existing) = replay {
                return Ok(existing.clone());
            }
        }

        let payment_state = self
            .state
            .lock()
            .unwrap()
            .payment_states
            .pop_front()
            .unwrap_or(PaymentState::Succeeded);
        let status = match payment_state {
            PaymentState::Succeeded => SubscriptionStatus::Active,
            PaymentState::NotRequired => SubscriptionStatus::Trialing,
            _ => SubscriptionStatus::Incomplete,
        };
        let paid = payment_state == PaymentState::Succeeded;
        let amount = self.prices.get(&request.price_id).copied().unwrap_or(0);
        let invoice_id = self.next_id("in");
        let invoice = GatewayInvoice {
            id: invoice_id.clone(),
            subscription_id: None,
            amount_paid_cents: if paid { amount } else { 0 },
            paid,
            charge_id: paid.then(|| format!("ch_{}", invoice_id)),
            payment_state,
        };

        let now = OffsetDateTime::now_utc();
        let mut sub = GatewaySubscription {
            id: self.next_id("sub"),
            customer_id: request.customer_id.clone(),
            status,
            price_id: Some(request.price_id.clone()),
            current_period_start: now,
            current_period_end: now + time::Duration::days(30),
            cancel_at_period_end: false,
            latest_invoice: None,
        };
        let mut invoice = invoice;
        invoice.subscription_id = Some(sub.id.clone());
        sub.latest_invoice = Some(invoice.clone());

        {
            let mut state = self.state.lock().unwrap();
            state.invoices.insert(invoice.id.clone(), invoice);
            state.subscriptions.insert(sub.id.clone(), sub.clone());
            if !key.is_empty() {
                state.keyed_subscriptions.insert(key.clone(), sub.id.clone());
            }
        }
        self.linger("create_subscription").await;
        Ok(sub)
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> GatewayResult<GatewaySubscription> {
        self.enter("retrieve_subscription").await?;
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("subscription", subscription_id))
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> GatewayResult<GatewaySubscription> {
        self.enter("update_subscription").await?;
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| GatewayError::not_found("subscription", subscription_id))?;

        if let Some(price) = &update.price_id {
            sub.price_id = Some(price.clone());
        }
        if let Some(flag) = update.cancel_at_period_end {
            sub.cancel_at_period_end = flag;
        }
        if update.cancel_now {
            sub.status = SubscriptionStatus::Canceled;
        }
        match update.collection {
            Some(CollectionChange::Pause) => sub.status = SubscriptionStatus::Paused,
            Some(CollectionChange::Resume) => sub.status = SubscriptionStatus::Active,
            None => {}
        }
        Ok(sub.clone())
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> GatewayResult<GatewayInvoice> {
        self.enter("retrieve_invoice").await?;
        self.state
            .lock()
            .unwrap()
            .invoices
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("invoice", invoice_id))
    }

    async fn create_refund(&self, request: &CreateRefundRequest) -> GatewayResult<GatewayRefund> {
        self.enter("create_refund").await?;
        let refund = GatewayRefund {
            id: self.next_id("re"),
            amount_cents: request.amount_cents,
            status: self
                .state
                .lock()
                .unwrap()
                .refund_status
                .unwrap_or(RefundStatus::Succeeded),
        };
        self.state
            .lock()
            .unwrap()
            .refunds
            .insert(refund.id.clone(), refund.clone());
        Ok(refund)
    }

    async fn cancel_refund(&self, refund_id: &str) -> GatewayResult<GatewayRefund> {
        self.enter("cancel_refund").await?;
        let mut state = self.state.lock().unwrap();
        let refund = state
            .refunds
            .get_mut(refund_id)
            .ok_or_else(|| GatewayError::not_found("refund", refund_id))?;
        refund.status = RefundStatus::Canceled;
        Ok(refund.clone())
    }

    async fn retrieve_refund(&self, refund_id: &str) -> GatewayResult<GatewayRefund> {
        self.enter("retrieve_refund").await?;
        self.state
            .lock()
            .unwrap()
            .refunds
            .get(refund_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("refund", refund_id))
    }
}

impl ScriptedGateway {
    /// Change a refund's status as if the gateway settled it asynchronously
    pub fn settle_refund(&self, refund_id: &str, status: RefundStatus) {
        if let Some(refund) = self.state.lock().unwrap().refunds.get_mut(refund_id) {
            refund.status = status;
        }
    }
}

/// Notifier that remembers what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, NotificationEvent)>>,
}

impl RecordingNotifier {
    pub fn events_for(&self, user_id: Uuid) -> Vec<NotificationEvent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, event)| *event)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, event: NotificationEvent, _payload: serde_json::Value) -> BillingResult<()> {
        self.sent.lock().unwrap().push((user_id, event));
        Ok(())
    }
}

/// A [`BillingService`] wired to in-memory adapters
pub struct Harness {
    pub service: BillingService,
    pub store: Arc<InMemoryBillingStore>,
    pub audit: Arc<InMemoryAuditSink>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BillingConfig) -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let idempotency = Arc::new(InMemoryIdempotencyGuard::new(
            config.idempotency_window,
            config.idempotency_cleanup,
        ));

        let deps = BillingDeps {
            store: store.clone(),
            gateway: gateway.clone(),
            audit: audit.clone(),
            notifier: notifier.clone(),
            idempotency,
            geo: Arc::new(NoopGeoResolver),
            webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        };

        Self {
            service: BillingService::new(config, PlanCatalog::standard(), deps),
            store,
            audit,
            gateway,
            notifier,
        }
    }

    /// Insert a user created `age` ago
    pub async fn seed_user(&self, email: &str, age: time::Duration) -> User {
        use crate::store::BillingStore;
        let mut user = User::new(email);
        user.created_at = OffsetDateTime::now_utc() - age;
        self.store.insert_user(&user).await.unwrap();
        user
    }

    /// Insert a subscription known to both the store and the gateway
    pub async fn seed_subscription(
        &self,
        user_id: Uuid,
        plan_id: &str,
        status: SubscriptionStatus,
    ) -> Subscription {
        use crate::store::BillingStore;
        let sub = subscription_fixture(user_id, plan_id, status);
        let price = PlanCatalog::standard()
            .get(plan_id)
            .map(|p| p.gateway_price_id.clone())
            .unwrap_or_default();
        self.store.insert_subscription(&sub).await.unwrap();
        self.gateway.seed(&sub, &price);
        sub
    }
}
