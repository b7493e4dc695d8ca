//! Payment Orchestrator
//!
//! Drives the gateway through customer → payment method → subscription and inspects the
//! first payment. Each gateway call is bounded by a per-call timeout and retried with
//! exponential backoff, but only for transient failures (rate limits, 5xx, network).
//! Card declines and `requires_action` outcomes are returned immediately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::catalog::PlanConfig;
use crate::classifier::{classify, classify_payment_state, ClassifiedError};
use crate::events::{ActorMeta, AuditAction, AuditEntry, AuditLog, AuditOutcome};
use crate::gateway::{
    CreateCustomerRequest, CreateSubscriptionRequest, GatewayError, GatewayResult,
    GatewaySubscription, PaymentGateway, PaymentState,
};
use crate::risk::RiskLevel;

/// Bounded retry for a single gateway call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each further retry
    pub base_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            call_timeout: Duration::from_secs(20),
        }
    }
}

/// One gateway call attempt
#[derive(Debug, Clone)]
pub struct AttemptLog {
    pub attempt: u32,
    pub error: Option<GatewayError>,
}

pub struct RetryOutcome<T> {
    pub result: GatewayResult<T>,
    pub attempts: Vec<AttemptLog>,
}

impl RetryPolicy {
    /// Delays between attempts: base, 2·base, 4·base, ...
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let half_base_ms = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(half_base_ms)
            .take(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt budget is spent.
    /// A call exceeding `call_timeout` counts as a network failure.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let counter = AtomicU32::new(0);
        let log: Mutex<Vec<AttemptLog>> = Mutex::new(Vec::new());
        let timeout = self.call_timeout;

        let result = Retry::start(self.delays(), || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = call();
            let log = &log;
            async move {
                let outcome = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::timeout(operation)),
                };

                log.lock().await.push(AttemptLog {
                    attempt,
                    error: outcome.as_ref().err().cloned(),
                });

                match outcome {
                    Ok(value) => Ok(Ok(value)),
                    Err(e) if classify(&e).retryable => {
                        tracing::warn!(
                            operation = operation,
                            attempt = attempt,
                            error = %e,
                            "Transient gateway error - will retry"
                        );
                        Err(Err(e)) // Return error to trigger retry
                    }
                    Err(e) => Ok(Err(e)), // Permanent error - stop retrying
                }
            }
        })
        .await
        .unwrap_or_else(|e| e);

        RetryOutcome {
            result,
            attempts: log.into_inner(),
        }
    }
}

/// Everything the orchestrator needs to charge for a plan
#[derive(Debug, Clone)]
pub struct PaymentRequest<'a> {
    pub user_id: Uuid,
    pub email: &'a str,
    pub plan: &'a PlanConfig,
    /// Gateway customer recorded on an earlier subscription, if any
    pub existing_customer_id: Option<&'a str>,
    pub payment_method_id: Option<&'a str>,
    pub risk_level: Option<RiskLevel>,
    pub actor: &'a ActorMeta,
    /// Fresh per purchase attempt; every retry inside the attempt reuses it
    pub attempt_id: Uuid,
}

impl PaymentRequest<'_> {
    /// Gateway idempotency key for one create call of this attempt
    pub fn idempotency_key(&self, operation: &str) -> String {
        format!(
            "carebill:{}:{}:{}:{}",
            operation, self.user_id, self.plan.id, self.attempt_id
        )
    }
}

#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    Succeeded {
        customer_id: String,
        subscription: GatewaySubscription,
    },
    /// The gateway created the subscription but needs the customer to authenticate
    RequiresAction {
        customer_id: String,
        subscription: GatewaySubscription,
        client_secret: Option<String>,
    },
    Failed {
        customer_id: Option<String>,
        error: ClassifiedError,
    },
}

pub struct PaymentOrchestrator {
    gateway: Arc<dyn PaymentGateway>,
    audit: AuditLog,
    policy: RetryPolicy,
}

impl PaymentOrchestrator {
    pub fn new(gateway: Arc<dyn PaymentGateway>, audit: AuditLog, policy: RetryPolicy) -> Self {
        Self {
            gateway,
            audit,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn purchase(&self, request: &PaymentRequest<'_>) -> PaymentOutcome {
        let customer_id = match self.ensure_customer(request).await {
            Ok(id) => id,
            Err(e) => {
                return PaymentOutcome::Failed {
                    customer_id: None,
                    error: classify(&e),
                }
            }
        };

        if let Some(pm) = request.payment_method_id {
            let outcome = self
                .policy
                .run("attach_payment_method", || {
                    self.gateway.attach_payment_method(&customer_id, pm)
                })
                .await;
            self.audit_attempts(request, "attach_payment_method", &outcome.attempts)
                .await;
            if let Err(e) = outcome.result {
                return PaymentOutcome::Failed {
                    customer_id: Some(customer_id),
                    error: classify(&e),
                };
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), request.user_id.to_string());
        metadata.insert("plan_id".to_string(), request.plan.id.clone());
        if let Some(level) = request.risk_level {
            metadata.insert("risk_level".to_string(), level.as_str().to_string());
        }
        let create = CreateSubscriptionRequest {
            customer_id: customer_id.clone(),
            price_id: request.plan.gateway_price_id.clone(),
            payment_method_id: request.payment_method_id.map(str::to_string),
            metadata,
            idempotency_key: request.idempotency_key("create_subscription"),
        };

        let outcome = self
            .policy
            .run("create_subscription", || self.gateway.create_subscription(&create))
            .await;
        self.audit_attempts(request, "create_subscription", &outcome.attempts)
            .await;

        let subscription = match outcome.result {
            Ok(sub) => sub,
            Err(e) => {
                let error = classify(&e);
                tracing::warn!(
                    user_id = %request.user_id,
                    plan_id = %request.plan.id,
                    attempts = outcome.attempts.len(),
                    code = %error.code,
                    "Subscription creation failed"
                );
                return PaymentOutcome::Failed {
                    customer_id: Some(customer_id),
                    error,
                };
            }
        };

        self.inspect(customer_id, subscription, request)
    }

    /// Reuse the stored gateway customer, or create one if it is missing or deleted
    async fn ensure_customer(&self, request: &PaymentRequest<'_>) -> GatewayResult<String> {
        if let Some(existing) = request.existing_customer_id {
            let outcome = self
                .policy
                .run("retrieve_customer", || self.gateway.retrieve_customer(existing))
                .await;
            self.audit_attempts(request, "retrieve_customer", &outcome.attempts)
                .await;

            match outcome.result {
                Ok(customer) if !customer.deleted => return Ok(customer.id),
                Ok(_) => {
                    tracing::info!(
                        user_id = %request.user_id,
                        customer_id = %existing,
                        "Stored gateway customer was deleted, creating a new one"
                    );
                }
                Err(e) if e.is_not_found() => {
                    tracing::info!(
                        user_id = %request.user_id,
                        customer_id = %existing,
                        "Stored gateway customer not found, creating a new one"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), request.user_id.to_string());
        metadata.insert("platform".to_string(), "carebill".to_string());
        let create = CreateCustomerRequest {
            email: request.email.to_string(),
            metadata,
            idempotency_key: request.idempotency_key("create_customer"),
        };

        let outcome = self
            .policy
            .run("create_customer", || self.gateway.create_customer(&create))
            .await;
        self.audit_attempts(request, "create_customer", &outcome.attempts)
            .await;

        let customer = outcome.result?;
        tracing::info!(
            user_id = %request.user_id,
            customer_id = %customer.id,
            "Created gateway customer"
        );
        Ok(customer.id)
    }

    fn inspect(
        &self,
        customer_id: String,
        subscription: GatewaySubscription,
        request: &PaymentRequest<'_>,
    ) -> PaymentOutcome {
        if subscription.status.is_entitled() {
            tracing::info!(
                user_id = %request.user_id,
                plan_id = %request.plan.id,
                subscription_id = %subscription.id,
                status = %subscription.status,
                "Payment confirmed"
            );
            return PaymentOutcome::Succeeded {
                customer_id,
                subscription,
            };
        }

        match subscription.payment_state() {
            PaymentState::RequiresAction { client_secret } => {
                tracing::info!(
                    user_id = %request.user_id,
                    subscription_id = %subscription.id,
                    "Payment requires customer action"
                );
                PaymentOutcome::RequiresAction {
                    customer_id,
                    subscription,
                    client_secret,
                }
            }
            state => {
                let error = classify_payment_state(&state).unwrap_or_else(|| {
                    ClassifiedError::verification_failed(format!(
                        "The subscription was created with status '{}' but no payment was confirmed.",
                        subscription.status
                    ))
                });
                tracing::warn!(
                    user_id = %request.user_id,
                    subscription_id = %subscription.id,
                    code = %error.code,
                    "First payment did not succeed"
                );
                PaymentOutcome::Failed {
                    customer_id: Some(customer_id),
                    error,
                }
            }
        }
    }

    async fn audit_attempts(&self, request: &PaymentRequest<'_>, step: &str, attempts: &[AttemptLog]) {
        for attempt in attempts {
            let (outcome, error) = match &attempt.error {
                None => (AuditOutcome::Success, None),
                Some(e) => (AuditOutcome::Failure, Some(e.to_string())),
            };
            self.audit
                .record(
                    AuditEntry::builder(AuditAction::PaymentAttempt)
                        .user(request.user_id)
                        .actor(request.actor)
                        .outcome(outcome)
                        .data(serde_json::json!({
                            "step": step,
                            "attempt": attempt.attempt,
                            "planId": request.plan.id,
                            "error": error,
                        })),
                )
                .await;
        }
    }
}
