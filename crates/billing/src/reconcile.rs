//! Payment reconciliation
//!
//! Drives checkout sessions from gateway reports into terminal local state.
//! Settlement is two steps with separate guards: the status CAS decides which
//! report wins the transition, and the `effects_applied` claim makes the
//! downstream effects (request completion, entitlement activation, ledger row)
//! commit in exactly one transaction. A crash between the two steps is
//! recovered on the next report or sweeper pass for the same session.

use sqlx::PgPool;

use veriport_shared::types::{PaymentEventStatus, SessionStatus, TargetType};

use crate::checkout::CheckoutService;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::entitlement::EntitlementLedger;
use crate::ledger::{NewPaymentEvent, PaymentLedger};
use crate::notify::NotificationDispatcher;
use crate::sessions::{PaymentSession, SessionTracker};

/// Reconciliation service
#[derive(Clone)]
pub struct Reconciler {
    pool: PgPool,
    checkout: CheckoutService,
    sessions: SessionTracker,
    ledger: PaymentLedger,
    notifier: NotificationDispatcher,
}

impl Reconciler {
    pub fn new(stripe: StripeClient, pool: PgPool, notifier: NotificationDispatcher) -> Self {
        Self {
            checkout: CheckoutService::new(stripe, pool.clone()),
            sessions: SessionTracker::new(pool.clone()),
            ledger: PaymentLedger::new(pool.clone()),
            notifier,
            pool,
        }
    }

    /// Settle a session the gateway reports as paid.
    ///
    /// Idempotent: replays of the same report find the status CAS already
    /// done and the effects claim already taken, and change nothing.
    pub async fn settle_paid(
        &self,
        session_ref: &str,
        external_payment_ref: Option<&str>,
        subscription_ref: Option<&str>,
    ) -> BillingResult<()> {
        let (session, transitioned) = match self
            .sessions
            .mark_paid(session_ref, external_payment_ref)
            .await
        {
            Ok(result) => result,
            Err(BillingError::Conflict(msg)) => {
                // Payment landed after we expired/canceled the session; there
                // is money to hand back and no session to settle it against
                tracing::error!(
                    session_ref = %session_ref,
                    detail = %msg,
                    "Paid report for a session already closed unpaid; manual refund required"
                );
                self.notifier
                    .dispatch_admins_best_effort(
                        "payment.refund_required",
                        None,
                        serde_json::json!({
                            "session_ref": session_ref,
                            "detail": msg,
                        }),
                    )
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !transitioned {
            tracing::debug!(
                session_ref = %session_ref,
                "Session already paid, checking for unapplied effects"
            );
        }

        // Runs regardless of who won the CAS: a crash after mark_paid but
        // before the effects transaction leaves effects_applied = FALSE, and
        // the next report for this session completes the work.
        let applied = self
            .apply_paid_effects(&session, external_payment_ref, subscription_ref)
            .await?;

        if applied {
            self.notify_settled(&session).await;
        }

        Ok(())
    }

    /// Settle a session the gateway reports as failed or canceled.
    /// A paid-then-failed ordering is resolved in favor of paid: the CAS
    /// finds the session already terminal and this becomes a no-op.
    pub async fn settle_failed(&self, session_ref: &str, reason: &str) -> BillingResult<()> {
        let (session, transitioned) = match self.sessions.mark_canceled(session_ref, reason).await {
            Ok(result) => result,
            Err(BillingError::Conflict(msg)) => {
                tracing::info!(
                    session_ref = %session_ref,
                    detail = %msg,
                    "Failure report for already-settled session, ignoring"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !transitioned {
            return Ok(());
        }

        // Exactly one failed ledger row per failed session, written by the
        // CAS winner
        self.ledger
            .record(NewPaymentEvent {
                user_id: session.user_id,
                subscription_ref: None,
                session_ref: Some(session.session_ref.clone()),
                amount_minor: session.amount_minor,
                currency: session.currency.clone(),
                status: PaymentEventStatus::Failed,
                external_payment_ref: session.external_payment_ref.clone(),
            })
            .await?;

        if session.target_type == TargetType::PerReport {
            sqlx::query(
                "UPDATE check_requests SET payment_status = 'failed', updated_at = NOW() \
                 WHERE id = $1 AND payment_status = 'pending'",
            )
            .bind(session.target_id)
            .execute(&self.pool)
            .await?;
        }

        self.notify_failed(&session, reason).await;
        Ok(())
    }

    /// Settle a session whose checkout lapsed without payment.
    /// Frees the one-open-session slot so the user can start a fresh attempt;
    /// no ledger row is written because no payment was attempted.
    pub async fn settle_expired(&self, session_ref: &str) -> BillingResult<()> {
        match self.sessions.mark_expired(session_ref).await {
            Ok((session, true)) => {
                self.notifier
                    .dispatch_best_effort(
                        session.user_id,
                        "checkout.expired",
                        Some(session.target_id),
                        serde_json::json!({ "session_ref": session.session_ref }),
                    )
                    .await;
                Ok(())
            }
            Ok((_, false)) => Ok(()),
            Err(BillingError::Conflict(msg)) => {
                tracing::info!(
                    session_ref = %session_ref,
                    detail = %msg,
                    "Expiry report for already-settled session, ignoring"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reconcile one session against the gateway's current view.
    ///
    /// Used by the success-redirect confirm endpoint and the stale-session
    /// sweeper. The gateway, not the redirect, is the authority: a forged
    /// confirm call settles nothing unless the gateway says paid.
    pub async fn reconcile_with_gateway(&self, session_ref: &str) -> BillingResult<PaymentSession> {
        let local = self.sessions.get(session_ref).await?;
        if local.status.is_terminal() && local.effects_applied {
            return Ok(local);
        }
        if local.status.is_terminal() && local.status != SessionStatus::Paid {
            return Ok(local);
        }

        let gateway = self.checkout.get_gateway_session(session_ref).await?;

        if gateway.payment_status == stripe::CheckoutSessionPaymentStatus::Paid {
            let payment_ref = gateway.payment_intent.as_ref().map(|pi| pi.id().to_string());
            let subscription_ref = gateway.subscription.as_ref().map(|s| s.id().to_string());
            self.settle_paid(session_ref, payment_ref.as_deref(), subscription_ref.as_deref())
                .await?;
        } else if gateway.status == Some(stripe::CheckoutSessionStatus::Expired) {
            self.settle_expired(session_ref).await?;
        } else if local.expires_at < time::OffsetDateTime::now_utc() {
            // Gateway still shows the session live but our TTL has lapsed
            // and no payment landed
            self.settle_expired(session_ref).await?;
        } else {
            tracing::debug!(
                session_ref = %session_ref,
                gateway_status = ?gateway.status,
                payment_status = ?gateway.payment_status,
                "Session still open at gateway, leaving untouched"
            );
        }

        self.sessions.get(session_ref).await
    }

    /// Apply downstream effects for a paid session in one transaction.
    /// Returns whether this call won the effects claim.
    async fn apply_paid_effects(
        &self,
        session: &PaymentSession,
        external_payment_ref: Option<&str>,
        subscription_ref: Option<&str>,
    ) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = SessionTracker::claim_effects_in_tx(&mut tx, &session.session_ref).await?;
        let Some(session) = claimed else {
            tx.rollback().await?;
            return Ok(false);
        };

        PaymentLedger::record_in_tx(
            &mut tx,
            NewPaymentEvent {
                user_id: session.user_id,
                subscription_ref: subscription_ref.map(str::to_string),
                session_ref: Some(session.session_ref.clone()),
                amount_minor: session.amount_minor,
                currency: session.currency.clone(),
                status: PaymentEventStatus::Succeeded,
                external_payment_ref: external_payment_ref
                    .map(str::to_string)
                    .or_else(|| session.external_payment_ref.clone()),
            },
        )
        .await?;

        match session.target_type {
            TargetType::PerReport => {
                sqlx::query(
                    "UPDATE check_requests \
                     SET payment_status = 'completed', report_tier = $2, amount_paid_minor = $3, \
                         external_checkout_ref = $4, external_payment_ref = $5, \
                         settled_at = NOW(), updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(session.target_id)
                .bind(session.plan_id)
                .bind(session.amount_minor)
                .bind(&session.session_ref)
                .bind(external_payment_ref.or(session.external_payment_ref.as_deref()))
                .execute(&mut *tx)
                .await?;
            }
            TargetType::Subscription => {
                let plan_id = session.plan_id.ok_or_else(|| {
                    BillingError::Internal(format!(
                        "Subscription session {} has no plan",
                        session.session_ref
                    ))
                })?;
                EntitlementLedger::activate_in_tx(
                    &mut tx,
                    session.user_id,
                    plan_id,
                    subscription_ref,
                )
                .await?;
            }
        }

        tx.commit().await?;

        tracing::info!(
            session_ref = %session.session_ref,
            target_type = %session.target_type,
            target_id = %session.target_id,
            amount_minor = session.amount_minor,
            "Applied paid-session effects"
        );

        Ok(true)
    }

    async fn notify_settled(&self, session: &PaymentSession) {
        let event_type = match session.target_type {
            TargetType::PerReport => "payment.succeeded",
            TargetType::Subscription => "subscription.activated",
        };
        self.notifier
            .dispatch_best_effort(
                session.user_id,
                event_type,
                Some(session.target_id),
                serde_json::json!({
                    "session_ref": session.session_ref,
                    "amount_minor": session.amount_minor,
                    "currency": session.currency,
                }),
            )
            .await;
    }

    async fn notify_failed(&self, session: &PaymentSession, reason: &str) {
        self.notifier
            .dispatch_best_effort(
                session.user_id,
                "payment.failed",
                Some(session.target_id),
                serde_json::json!({
                    "session_ref": session.session_ref,
                    "reason": reason,
                }),
            )
            .await;
    }
}
