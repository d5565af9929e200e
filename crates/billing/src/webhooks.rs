//! Stripe webhook handling
//!
//! Verifies incoming gateway events, claims each event id exactly once, and
//! routes checkout/subscription events into the reconciler. Verified events
//! we do not handle are acknowledged so the gateway stops retrying them.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use veriport_shared::types::EntitlementStatus;

use crate::client::StripeClient;
use crate::entitlement::EntitlementLedger;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::Reconciler;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed webhook timestamp, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// How long a claimed event may sit in 'processing' before another worker
/// may re-claim it
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Manually verify a Stripe signature header against the payload.
///
/// Works around async-stripe rejecting events from newer Stripe API versions.
/// The header format is `t=<unix>,v1=<hex hmac>,...`; the signed payload is
/// `<t>.<body>` keyed with the webhook secret minus its `whsec_` prefix.
/// `now_unix` is injected so tests can pin the clock.
fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    reconciler: Reconciler,
    entitlements: EntitlementLedger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, reconciler: Reconciler) -> Self {
        let entitlements = EntitlementLedger::new(pool.clone());
        Self {
            stripe,
            pool,
            reconciler,
            entitlements,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library verifier first and falls back to manual signature
    /// verification when the event's API version is newer than the library
    /// understands.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Library webhook verification failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse verified webhook payload");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::debug!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification passed"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The INSERT...ON CONFLICT...RETURNING claim gives exactly one concurrent
    /// delivery processing rights per event id; replays and concurrent
    /// retries acknowledge without reprocessing. Events stuck in 'processing'
    /// past the timeout may be re-claimed, and events whose last attempt
    /// errored are re-claimed immediately so gateway redelivery can retry
    /// them.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_ref = event.id.to_string();
        let event_type_str = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (event_ref, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (event_ref) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Re-claimed at ', NOW()::TEXT)
            WHERE gateway_webhook_events.processing_result = 'error'
               OR (gateway_webhook_events.processing_result = 'processing'
                   AND gateway_webhook_events.processing_started_at
                       < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(&event_ref)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_ref = %event_ref,
                event_type = %event_type_str,
                "Duplicate webhook event, acknowledging without reprocessing"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_ref = %event_ref,
            "Processing gateway webhook event"
        );

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE gateway_webhook_events \
             SET processing_result = $1, error_message = $2 \
             WHERE event_ref = $3",
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_ref)
        .execute(&self.pool)
        .await
        {
            // The claim row drives idempotency; a stuck 'processing' row
            // self-heals via the timeout re-claim above.
            tracing::error!(
                event_ref = %event_ref,
                processing_result = %processing_result,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventType::CheckoutSessionAsyncPaymentSucceeded => {
                self.handle_checkout_completed(event).await
            }
            EventType::CheckoutSessionAsyncPaymentFailed => {
                let session = extract_checkout_session(event)?;
                self.reconciler
                    .settle_failed(session.id.as_str(), "async payment failed")
                    .await
            }
            EventType::CheckoutSessionExpired => {
                let session = extract_checkout_session(event)?;
                self.reconciler.settle_expired(session.id.as_str()).await
            }
            EventType::CustomerSubscriptionUpdated => self.handle_subscription_updated(event).await,
            EventType::CustomerSubscriptionDeleted => self.handle_subscription_deleted(event).await,
            _ => {
                // Acknowledged so the gateway stops retrying; logged so new
                // event types that need handlers show up in the logs
                tracing::info!(
                    event_type = %event.type_,
                    event_ref = %event.id,
                    "Received unhandled gateway event type"
                );
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(&self, event: &Event) -> BillingResult<()> {
        let session = extract_checkout_session(event)?;

        // payment-mode sessions can complete with payment still pending
        // (async methods); the async_payment_succeeded event follows later
        if session.payment_status != stripe::CheckoutSessionPaymentStatus::Paid {
            tracing::info!(
                session_ref = %session.id,
                payment_status = ?session.payment_status,
                "Checkout completed but not yet paid, awaiting async payment event"
            );
            return Ok(());
        }

        let payment_ref = session
            .payment_intent
            .as_ref()
            .map(|pi| pi.id().to_string());
        let subscription_ref = session.subscription.as_ref().map(|s| s.id().to_string());

        self.reconciler
            .settle_paid(
                session.id.as_str(),
                payment_ref.as_deref(),
                subscription_ref.as_deref(),
            )
            .await
    }

    async fn handle_subscription_updated(&self, event: &Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;

        let status = match map_subscription_status(subscription.status) {
            Some(status) => status,
            None => {
                tracing::debug!(
                    subscription_ref = %subscription.id,
                    status = ?subscription.status,
                    "Ignoring transitional subscription status"
                );
                return Ok(());
            }
        };

        let updated = self
            .entitlements
            .set_status_by_subscription_ref(subscription.id.as_str(), status)
            .await?;

        if updated.is_none() {
            // A subscription we never sold, e.g. created directly in the
            // gateway dashboard
            tracing::warn!(
                subscription_ref = %subscription.id,
                "Subscription update for unknown subscription ref"
            );
        }

        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;

        self.entitlements
            .set_status_by_subscription_ref(subscription.id.as_str(), EntitlementStatus::Canceled)
            .await?;

        Ok(())
    }
}

fn extract_checkout_session(event: &Event) -> BillingResult<&stripe::CheckoutSession> {
    match &event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        other => Err(BillingError::WebhookEventNotSupported(format!(
            "expected checkout.session object, got {:?}",
            std::mem::discriminant(other)
        ))),
    }
}

fn extract_subscription(event: &Event) -> BillingResult<&stripe::Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        other => Err(BillingError::WebhookEventNotSupported(format!(
            "expected subscription object, got {:?}",
            std::mem::discriminant(other)
        ))),
    }
}

/// Map a gateway subscription status onto the entitlement ledger.
/// Transitional statuses (incomplete, paused) map to None and are ignored.
fn map_subscription_status(status: stripe::SubscriptionStatus) -> Option<EntitlementStatus> {
    use stripe::SubscriptionStatus as S;
    match status {
        S::Active => Some(EntitlementStatus::Active),
        S::Trialing => Some(EntitlementStatus::Trialing),
        S::PastDue => Some(EntitlementStatus::PastDue),
        S::Canceled | S::Unpaid | S::IncompleteExpired => Some(EntitlementStatus::Canceled),
        S::Incomplete | S::Paused => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_key";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(b"test_secret_key").unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let now = 1_700_000_000;
        let header = sign(PAYLOAD, now);
        assert!(verify_signature(PAYLOAD, &header, SECRET, now).is_ok());
        // Within tolerance on both sides
        assert!(verify_signature(PAYLOAD, &header, SECRET, now + 299).is_ok());
        assert!(verify_signature(PAYLOAD, &header, SECRET, now - 299).is_ok());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = 1_700_000_000;
        let header = sign(PAYLOAD, now);
        assert!(matches!(
            verify_signature(PAYLOAD, &header, SECRET, now + 301),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let header = sign(PAYLOAD, now);
        let tampered = PAYLOAD.replace("evt_1", "evt_2");
        assert!(matches!(
            verify_signature(&tampered, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_malformed_header_rejected() {
        let now = 1_700_000_000;
        for header in ["", "t=abc,v1=00", "v1=deadbeef", "t=1700000000"] {
            assert!(
                verify_signature(PAYLOAD, header, SECRET, now).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[test]
    fn test_subscription_status_mapping() {
        use stripe::SubscriptionStatus as S;
        assert_eq!(map_subscription_status(S::Active), Some(EntitlementStatus::Active));
        assert_eq!(map_subscription_status(S::PastDue), Some(EntitlementStatus::PastDue));
        assert_eq!(map_subscription_status(S::Unpaid), Some(EntitlementStatus::Canceled));
        assert_eq!(map_subscription_status(S::Incomplete), None);
    }
}
