//! Stripe adapter for [`PaymentGateway`]

use async_trait::async_trait;
use carebill_shared::{RefundStatus, SubscriptionStatus};
use serde::Deserialize;
use stripe::{
    AttachPaymentMethod, CancelSubscription, CreateCustomer, CreateRefund, CreateSubscription,
    CreateSubscriptionItems, Customer, CustomerId, Expandable, Invoice, InvoiceId, PaymentIntentStatus,
    PaymentMethod, PaymentMethodId, Refund, RefundId, RefundReasonFilter, RequestStrategy, StripeError, Subscription,
    SubscriptionId, SubscriptionStatus as StripeSubStatus, UpdateSubscription,
    UpdateSubscriptionItems, UpdateSubscriptionPauseCollection,
    UpdateSubscriptionPauseCollectionBehavior,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::gateway::{
    CollectionChange, CreateCustomerRequest, CreateRefundRequest, CreateSubscriptionRequest,
    GatewayCustomer, GatewayError, GatewayErrorCategory, GatewayInvoice, GatewayRefund,
    GatewayResult, GatewaySubscription, PaymentGateway, PaymentState, SubscriptionUpdate,
};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
const EXPAND_PAYMENT: &[&str] = &["latest_invoice.payment_intent"];

/// [`PaymentGateway`] backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
    http: reqwest::Client,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self {
            stripe,
            http: reqwest::Client::new(),
        }
    }

    /// Form POST for endpoints the typed client does not cover
    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        form: &[(&str, &str)],
    ) -> GatewayResult<T> {
        let response = self
            .http
            .post(format!("{}{}", STRIPE_API_BASE, path))
            .bearer_auth(&self.stripe.config().secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| reqwest_error(e, operation))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(operation, status = %status, body = %body, "Stripe request failed");
            let mut err = GatewayError::new(category_for_status(status.as_u16()), body);
            err.http_status = Some(status.as_u16());
            return Err(err);
        }
        response.json().await.map_err(|e| reqwest_error(e, operation))
    }

    /// Client sending `Idempotency-Key`, so a retried create replays the first result
    fn idempotent_client(&self, key: &str) -> stripe::Client {
        let client = self.stripe.inner().clone();
        if key.is_empty() {
            return client;
        }
        client.with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RawRefund {
    id: String,
    amount: i64,
    status: Option<String>,
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, request: &CreateCustomerRequest) -> GatewayResult<GatewayCustomer> {
        let params = CreateCustomer {
            email: Some(&request.email),
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        };

        let client = self.idempotent_client(&request.idempotency_key);
        let customer = Customer::create(&client, params)
            .await
            .map_err(|e| stripe_error(e, "create_customer"))?;

        tracing::info!(customer_id = %customer.id, "Created Stripe customer");
        Ok(map_customer(customer))
    }

    async fn retrieve_customer(&self, customer_id: &str) -> GatewayResult<GatewayCustomer> {
        let id = parse_id::<CustomerId>(customer_id, "customer")?;
        let customer = Customer::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map_err(|e| stripe_error(e, "retrieve_customer"))?;
        Ok(map_customer(customer))
    }

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> GatewayResult<()> {
        let customer = parse_id::<CustomerId>(customer_id, "customer")?;
        let pm_id = parse_id::<PaymentMethodId>(payment_method_id, "payment method")?;

        PaymentMethod::attach(self.stripe.inner(), &pm_id, AttachPaymentMethod { customer })
            .await
            .map_err(|e| stripe_error(e, "attach_payment_method"))?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> GatewayResult<GatewaySubscription> {
        let customer = parse_id::<CustomerId>(&request.customer_id, "customer")?;

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.default_payment_method = request.payment_method_id.as_deref();
        params.metadata = Some(request.metadata.clone());
        params.expand = EXPAND_PAYMENT;

        let client = self.idempotent_client(&request.idempotency_key);
        let subscription = Subscription::create(&client, params)
            .await
            .map_err(|e| stripe_error(e, "create_subscription"))?;

        tracing::info!(
            subscription_id = %subscription.id,
            status = ?subscription.status,
            "Created Stripe subscription"
        );
        map_subscription(subscription)
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> GatewayResult<GatewaySubscription> {
        let id = parse_id::<SubscriptionId>(subscription_id, "subscription")?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &id, EXPAND_PAYMENT)
            .await
            .map_err(|e| stripe_error(e, "retrieve_subscription"))?;
        map_subscription(subscription)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> GatewayResult<GatewaySubscription> {
        let id = parse_id::<SubscriptionId>(subscription_id, "subscription")?;

        if update.cancel_now {
            let params = CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            let subscription = Subscription::cancel(self.stripe.inner(), &id, params)
                .await
                .map_err(|e| stripe_error(e, "cancel_subscription"))?;
            return map_subscription(subscription);
        }

        if update.collection == Some(CollectionChange::Resume) {
            // Clearing pause_collection needs an empty form value
            let _: serde_json::Value = self
                .post_form(
                    "resume_subscription",
                    &format!("/subscriptions/{}", subscription_id),
                    &[("pause_collection", "")],
                )
                .await?;
        }

        let mut params = UpdateSubscription::new();
        if let Some(price_id) = &update.price_id {
            let current = Subscription::retrieve(self.stripe.inner(), &id, &[])
                .await
                .map_err(|e| stripe_error(e, "retrieve_subscription"))?;
            let item_id = current
                .items
                .data
                .first()
                .map(|item| item.id.to_string())
                .ok_or_else(|| {
                    GatewayError::new(GatewayErrorCategory::InvalidRequest, "subscription has no items")
                })?;
            params.items = Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.clone()),
                ..Default::default()
            }]);
        }
        params.cancel_at_period_end = update.cancel_at_period_end;
        if update.collection == Some(CollectionChange::Pause) {
            params.pause_collection = Some(UpdateSubscriptionPauseCollection {
                behavior: UpdateSubscriptionPauseCollectionBehavior::Void,
                resumes_at: None,
            });
        }
        if !update.metadata.is_empty() {
            params.metadata = Some(update.metadata.clone());
        }
        params.expand = EXPAND_PAYMENT;

        let subscription = Subscription::update(self.stripe.inner(), &id, params)
            .await
            .map_err(|e| stripe_error(e, "update_subscription"))?;
        map_subscription(subscription)
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> GatewayResult<GatewayInvoice> {
        let id = parse_id::<InvoiceId>(invoice_id, "invoice")?;
        let invoice = Invoice::retrieve(self.stripe.inner(), &id, &["payment_intent"])
            .await
            .map_err(|e| stripe_error(e, "retrieve_invoice"))?;
        Ok(map_invoice(invoice))
    }

    async fn create_refund(&self, request: &CreateRefundRequest) -> GatewayResult<GatewayRefund> {
        let mut params = CreateRefund::new();
        params.charge = Some(parse_id(&request.charge_id, "charge")?);
        params.amount = Some(request.amount_cents);
        params.reason = Some(RefundReasonFilter::RequestedByCustomer);
        let mut metadata = request.metadata.clone();
        metadata.insert("reason".to_string(), request.reason.clone());
        params.metadata = Some(metadata);

        let refund = Refund::create(self.stripe.inner(), params)
            .await
            .map_err(|e| stripe_error(e, "create_refund"))?;

        tracing::info!(refund_id = %refund.id, amount = refund.amount, "Created Stripe refund");
        Ok(GatewayRefund {
            id: refund.id.to_string(),
            amount_cents: refund.amount,
            status: refund_status(refund.status.as_deref()),
        })
    }

    async fn cancel_refund(&self, refund_id: &str) -> GatewayResult<GatewayRefund> {
        let raw: RawRefund = self
            .post_form("cancel_refund", &format!("/refunds/{}/cancel", refund_id), &[])
            .await?;
        Ok(GatewayRefund {
            id: raw.id,
            amount_cents: raw.amount,
            status: refund_status(raw.status.as_deref()),
        })
    }

    async fn retrieve_refund(&self, refund_id: &str) -> GatewayResult<GatewayRefund> {
        let id = parse_id::<RefundId>(refund_id, "refund")?;
        let refund = Refund::retrieve(self.stripe.inner(), &id, &[])
            .await
            .map_err(|e| stripe_error(e, "retrieve_refund"))?;
        Ok(GatewayRefund {
            id: refund.id.to_string(),
            amount_cents: refund.amount,
            status: refund_status(refund.status.as_deref()),
        })
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> GatewayResult<T> {
    raw.parse::<T>().map_err(|_| {
        GatewayError::new(
            GatewayErrorCategory::InvalidRequest,
            format!("Invalid {} ID: {}", what, raw),
        )
    })
}

fn category_for_status(status: u16) -> GatewayErrorCategory {
    match status {
        402 => GatewayErrorCategory::Card,
        429 => GatewayErrorCategory::RateLimit,
        401 | 403 => GatewayErrorCategory::Authentication,
        400 | 404 | 409 => GatewayErrorCategory::InvalidRequest,
        500..=599 => GatewayErrorCategory::Processing,
        _ => GatewayErrorCategory::Unknown,
    }
}

fn stripe_error(error: StripeError, operation: &str) -> GatewayError {
    match error {
        StripeError::Stripe(request_error) => {
            let http_status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            tracing::warn!(
                operation,
                http_status,
                code = ?request_error.code,
                decline_code = ?request_error.decline_code,
                "Stripe API error"
            );
            GatewayError {
                category: category_for_status(http_status),
                message,
                decline_code: request_error.decline_code.clone(),
                http_status: Some(http_status),
            }
        }
        StripeError::Timeout => GatewayError::timeout(operation),
        StripeError::ClientError(msg) => GatewayError::new(
            GatewayErrorCategory::Network,
            format!("HTTP client error during {}: {}", operation, msg),
        ),
        other => GatewayError::new(
            GatewayErrorCategory::Unknown,
            format!("{} failed: {}", operation, other),
        ),
    }
}

fn reqwest_error(error: reqwest::Error, operation: &str) -> GatewayError {
    if error.is_timeout() || error.is_connect() {
        return GatewayError::new(
            GatewayErrorCategory::Network,
            format!("{} could not reach Stripe: {}", operation, error),
        );
    }
    GatewayError::new(
        GatewayErrorCategory::Unknown,
        format!("{} failed: {}", operation, error),
    )
}

fn timestamp(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn map_customer(customer: Customer) -> GatewayCustomer {
    GatewayCustomer {
        id: customer.id.to_string(),
        email: customer.email.clone(),
        deleted: customer.deleted,
    }
}

fn map_status(status: &StripeSubStatus, paused_collection: bool) -> SubscriptionStatus {
    if paused_collection {
        return SubscriptionStatus::Paused;
    }
    match status {
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue | StripeSubStatus::Unpaid => SubscriptionStatus::PastDue,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
        StripeSubStatus::Canceled | StripeSubStatus::IncompleteExpired => SubscriptionStatus::Canceled,
    }
}

fn refund_status(status: Option<&str>) -> RefundStatus {
    match status {
        Some("succeeded") => RefundStatus::Succeeded,
        Some("failed") => RefundStatus::Failed,
        Some("canceled") => RefundStatus::Canceled,
        _ => RefundStatus::Pending,
    }
}

fn map_subscription(sub: Subscription) -> GatewayResult<GatewaySubscription> {
    let customer_id = match &sub.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(customer) => customer.id.to_string(),
    };
    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());
    let latest_invoice = match sub.latest_invoice {
        Some(Expandable::Object(invoice)) => Some(map_invoice(*invoice)),
        Some(Expandable::Id(id)) => Some(GatewayInvoice {
            id: id.to_string(),
            subscription_id: Some(sub.id.to_string()),
            amount_paid_cents: 0,
            paid: false,
            charge_id: None,
            payment_state: PaymentState::Processing,
        }),
        None => None,
    };

    Ok(GatewaySubscription {
        id: sub.id.to_string(),
        customer_id,
        status: map_status(&sub.status, sub.pause_collection.is_some()),
        price_id,
        current_period_start: timestamp(sub.current_period_start),
        current_period_end: timestamp(sub.current_period_end),
        cancel_at_period_end: sub.cancel_at_period_end,
        latest_invoice,
    })
}

fn map_invoice(invoice: Invoice) -> GatewayInvoice {
    let paid = invoice.paid.unwrap_or(false);
    let charge_id = invoice.charge.as_ref().map(|c| match c {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(charge) => charge.id.to_string(),
    });
    let subscription_id = invoice.subscription.as_ref().map(|s| match s {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(sub) => sub.id.to_string(),
    });

    let payment_state = match invoice.payment_intent.as_ref() {
        Some(Expandable::Object(intent)) => match intent.status {
            PaymentIntentStatus::Succeeded => PaymentState::Succeeded,
            PaymentIntentStatus::RequiresAction | PaymentIntentStatus::RequiresConfirmation => {
                PaymentState::RequiresAction {
                    client_secret: intent.client_secret.clone(),
                }
            }
            PaymentIntentStatus::RequiresPaymentMethod | PaymentIntentStatus::Canceled => {
                let last_error = intent.last_payment_error.as_ref();
                PaymentState::RequiresPaymentMethod {
                    decline_code: last_error.and_then(|e| e.decline_code.clone()),
                    message: last_error.and_then(|e| e.message.clone()),
                }
            }
            PaymentIntentStatus::Processing | PaymentIntentStatus::RequiresCapture => {
                PaymentState::Processing
            }
        },
        Some(Expandable::Id(_)) if paid => PaymentState::Succeeded,
        Some(Expandable::Id(_)) => PaymentState::Processing,
        None if paid => PaymentState::Succeeded,
        None => PaymentState::NotRequired,
    };

    GatewayInvoice {
        id: invoice.id.to_string(),
        subscription_id,
        amount_paid_cents: invoice.amount_paid.unwrap_or(0),
        paid,
        charge_id,
        payment_state,
    }
}
