//! Stripe Checkout sessions
//!
//! Creates gateway checkout sessions for the two purchase shapes (one report,
//! recurring subscription) and records each in the local session tracker.
//! Prices come from the plan catalog at request time, so plans created by an
//! admin are purchasable without gateway price configuration.

use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use veriport_shared::types::{BillingCycle, PaymentStatus, TargetType};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::plans::{Plan, PlanCatalog};
use crate::sessions::{NewSession, PaymentSession, SessionTracker};

/// Checkout service for creating gateway checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    plans: PlanCatalog,
    sessions: SessionTracker,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            stripe,
            plans: PlanCatalog::new(pool.clone()),
            sessions: SessionTracker::new(pool.clone()),
            pool,
        }
    }

    /// Create a payment-mode checkout for one background-check report.
    ///
    /// Rejects when the request is missing, already settled, owned by someone
    /// else, or already has a live checkout attempt.
    pub async fn create_report_checkout(
        &self,
        user_id: Uuid,
        request_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<CheckoutResponse> {
        let plan = self.plans.get_for_purchase(plan_id).await?;
        if plan.billing_cycle != BillingCycle::OneTime {
            return Err(BillingError::Validation(format!(
                "Plan {} is a subscription plan, not a report tier",
                plan_id
            )));
        }

        self.verify_request_payable(user_id, request_id).await?;

        self.reject_live_session(TargetType::PerReport, request_id).await?;

        let gateway_session = self
            .create_gateway_session(
                user_id,
                TargetType::PerReport,
                request_id,
                &plan,
                CheckoutSessionMode::Payment,
            )
            .await?;

        self.record_session(user_id, TargetType::PerReport, request_id, &plan, &gateway_session)
            .await
    }

    /// Create a subscription-mode checkout for a recurring plan.
    /// The target of a subscription purchase is the user themselves.
    pub async fn create_subscription_checkout(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<CheckoutResponse> {
        let plan = self.plans.get_for_purchase(plan_id).await?;
        if plan.billing_cycle != BillingCycle::Monthly {
            return Err(BillingError::Validation(format!(
                "Plan {} is a report tier, not a subscription plan",
                plan_id
            )));
        }

        let already_subscribed: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM entitlements \
             WHERE user_id = $1 AND status IN ('active', 'past_due', 'trialing')",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        if already_subscribed.is_some() {
            return Err(BillingError::Conflict(format!(
                "User {} already has a live subscription",
                user_id
            )));
        }

        self.reject_live_session(TargetType::Subscription, user_id).await?;

        let gateway_session = self
            .create_gateway_session(
                user_id,
                TargetType::Subscription,
                user_id,
                &plan,
                CheckoutSessionMode::Subscription,
            )
            .await?;

        self.record_session(user_id, TargetType::Subscription, user_id, &plan, &gateway_session)
            .await
    }

    /// Retrieve a checkout session from the gateway, with its payment intent
    /// expanded so callers can capture the payment reference.
    pub async fn get_gateway_session(&self, session_ref: &str) -> BillingResult<CheckoutSession> {
        let session_id = session_ref
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid session ID: {}", e)))?;

        let session =
            CheckoutSession::retrieve(self.stripe.inner(), &session_id, &["payment_intent"]).await?;
        Ok(session)
    }

    /// Conflict only while an open session for the target is still within
    /// its TTL. A lapsed attempt does not block; `SessionTracker::open`
    /// expires it before recording the new one.
    async fn reject_live_session(
        &self,
        target_type: TargetType,
        target_id: Uuid,
    ) -> BillingResult<()> {
        if let Some(existing) = self.sessions.find_open_for_target(target_type, target_id).await? {
            if existing.expires_at > OffsetDateTime::now_utc() {
                return Err(BillingError::Conflict(format!(
                    "Target {} already has open checkout session {}",
                    target_id, existing.session_ref
                )));
            }
        }
        Ok(())
    }

    async fn verify_request_payable(&self, user_id: Uuid, request_id: Uuid) -> BillingResult<()> {
        let row: Option<(Uuid, PaymentStatus)> =
            sqlx::query_as("SELECT owner_id, payment_status FROM check_requests WHERE id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            None => Err(BillingError::NotFound(format!(
                "Check request {} not found",
                request_id
            ))),
            Some((owner_id, _)) if owner_id != user_id => {
                tracing::warn!(
                    user_id = %user_id,
                    request_id = %request_id,
                    "Checkout attempt against another user's request"
                );
                Err(BillingError::NotFound(format!(
                    "Check request {} not found",
                    request_id
                )))
            }
            Some((_, PaymentStatus::Completed)) => Err(BillingError::Conflict(format!(
                "Check request {} is already paid",
                request_id
            ))),
            Some(_) => Ok(()),
        }
    }

    async fn create_gateway_session(
        &self,
        user_id: Uuid,
        target_type: TargetType,
        target_id: Uuid,
        plan: &Plan,
        mode: CheckoutSessionMode,
    ) -> BillingResult<CheckoutSession> {
        let currency = plan
            .currency
            .parse::<stripe::Currency>()
            .map_err(|e| BillingError::Validation(format!("Invalid currency: {}", e)))?;

        let product_name = match target_type {
            TargetType::PerReport => format!("Background check report ({})", plan.name),
            TargetType::Subscription => format!("{} subscription", plan.name),
        };

        let recurring = match mode {
            CheckoutSessionMode::Subscription => Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Month,
                ..Default::default()
            }),
            _ => None,
        };

        let line_item = CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(plan.price_minor_units),
                recurring,
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: product_name,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        };

        let success_url = self.stripe.config().success_url();
        let cancel_url = self.stripe.config().cancel_url();
        let client_reference_id = target_id.to_string();

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("target_type".to_string(), target_type.to_string());
        metadata.insert("target_id".to_string(), target_id.to_string());
        metadata.insert("plan_id".to_string(), plan.id.to_string());

        let params = CreateCheckoutSession {
            mode: Some(mode),
            line_items: Some(vec![line_item]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            client_reference_id: Some(&client_reference_id),
            metadata: Some(metadata),
            expires_at: Some(self.local_expiry().unix_timestamp()),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            session_ref = %session.id,
            target_type = %target_type,
            target_id = %target_id,
            plan_id = %plan.id,
            "Created gateway checkout session"
        );

        Ok(session)
    }

    async fn record_session(
        &self,
        user_id: Uuid,
        target_type: TargetType,
        target_id: Uuid,
        plan: &Plan,
        gateway_session: &CheckoutSession,
    ) -> BillingResult<CheckoutResponse> {
        let session = self
            .sessions
            .open(NewSession {
                session_ref: gateway_session.id.to_string(),
                target_type,
                target_id,
                user_id,
                plan_id: Some(plan.id),
                amount_minor: plan.price_minor_units,
                currency: plan.currency.clone(),
                expires_at: self.local_expiry(),
            })
            .await?;

        Ok(CheckoutResponse::new(&session, gateway_session.url.clone()))
    }

    fn local_expiry(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + Duration::hours(self.stripe.config().session_ttl_hours)
    }
}

/// Response for creating a checkout session
#[derive(Debug, serde::Serialize)]
pub struct CheckoutResponse {
    pub session_ref: String,
    pub url: Option<String>,
}

impl CheckoutResponse {
    pub fn new(session: &PaymentSession, url: Option<String>) -> Self {
        Self {
            session_ref: session.session_ref.clone(),
            url,
        }
    }
}
