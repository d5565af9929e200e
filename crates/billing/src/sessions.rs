//! Payment session tracker
//!
//! Local mirror of gateway checkout sessions. The row is authoritative for
//! whether downstream effects ran: every status change is a compare-and-swap
//! on `status = 'open'`, so each terminal transition happens exactly once no
//! matter how many webhooks, redirect confirms, and sweeper passes race.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use veriport_shared::types::{SessionStatus, TargetType};

use crate::error::{BillingError, BillingResult};

/// A tracked checkout session
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentSession {
    pub session_ref: String,
    pub target_type: TargetType,
    pub target_id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: SessionStatus,
    pub effects_applied: bool,
    pub external_payment_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub expires_at: OffsetDateTime,
    pub opened_at: OffsetDateTime,
    pub settled_at: Option<OffsetDateTime>,
}

/// Input for recording a newly created gateway session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_ref: String,
    pub target_type: TargetType,
    pub target_id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub amount_minor: i64,
    pub currency: String,
    pub expires_at: OffsetDateTime,
}

const SESSION_COLUMNS: &str = "session_ref, target_type, target_id, user_id, plan_id, \
     amount_minor, currency, status, effects_applied, external_payment_ref, \
     failure_reason, expires_at, opened_at, settled_at";

/// Payment session tracker service
#[derive(Clone)]
pub struct SessionTracker {
    pool: PgPool,
}

impl SessionTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a session the gateway just created. The partial unique index on
    /// open sessions rejects a second live attempt for the same target; that
    /// surfaces here as `Conflict`. A lapsed open attempt no longer holds the
    /// slot: it is expired here before the insert.
    pub async fn open(&self, new: NewSession) -> BillingResult<PaymentSession> {
        self.expire_lapsed_for_target(new.target_type, new.target_id).await?;

        let session: PaymentSession = sqlx::query_as(&format!(
            "INSERT INTO payment_sessions \
                 (session_ref, target_type, target_id, user_id, plan_id, \
                  amount_minor, currency, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(&new.session_ref)
        .bind(new.target_type)
        .bind(new.target_id)
        .bind(new.user_id)
        .bind(new.plan_id)
        .bind(new.amount_minor)
        .bind(&new.currency)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            session_ref = %session.session_ref,
            target_type = %session.target_type,
            target_id = %session.target_id,
            amount_minor = session.amount_minor,
            "Opened payment session"
        );

        Ok(session)
    }

    /// Expire an open session for the target whose TTL has lapsed. Same CAS
    /// as `mark_expired`, scoped to the target instead of a session ref.
    async fn expire_lapsed_for_target(
        &self,
        target_type: TargetType,
        target_id: Uuid,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE payment_sessions \
             SET status = 'expired', settled_at = NOW() \
             WHERE target_type = $1 AND target_id = $2 \
               AND status = 'open' AND expires_at < NOW()",
        )
        .bind(target_type)
        .bind(target_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(
                target_type = %target_type,
                target_id = %target_id,
                "Expired lapsed checkout attempt before opening a new one"
            );
        }
        Ok(())
    }

    pub async fn get(&self, session_ref: &str) -> BillingResult<PaymentSession> {
        let session: Option<PaymentSession> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions WHERE session_ref = $1"
        ))
        .bind(session_ref)
        .fetch_optional(&self.pool)
        .await?;

        session
            .ok_or_else(|| BillingError::NotFound(format!("Payment session {} not found", session_ref)))
    }

    /// The live checkout attempt for a target, if one exists
    pub async fn find_open_for_target(
        &self,
        target_type: TargetType,
        target_id: Uuid,
    ) -> BillingResult<Option<PaymentSession>> {
        let session: Option<PaymentSession> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions \
             WHERE target_type = $1 AND target_id = $2 AND status = 'open'"
        ))
        .bind(target_type)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    /// CAS open -> paid. Returns the row and whether this call performed the
    /// transition; `false` means the session was already settled and the
    /// caller must not re-apply effects.
    pub async fn mark_paid(
        &self,
        session_ref: &str,
        external_payment_ref: Option<&str>,
    ) -> BillingResult<(PaymentSession, bool)> {
        let updated: Option<PaymentSession> = sqlx::query_as(&format!(
            "UPDATE payment_sessions \
             SET status = 'paid', external_payment_ref = COALESCE($2, external_payment_ref), \
                 settled_at = NOW() \
             WHERE session_ref = $1 AND status = 'open' \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_ref)
        .bind(external_payment_ref)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(session) => Ok((session, true)),
            None => {
                let session = self.get(session_ref).await?;
                if session.status == SessionStatus::Paid {
                    Ok((session, false))
                } else {
                    // Paid report arrived after we expired/canceled the session
                    Err(BillingError::Conflict(format!(
                        "Session {} is {} and cannot be marked paid",
                        session_ref, session.status
                    )))
                }
            }
        }
    }

    /// CAS open -> canceled with a failure reason. Idempotent: a session
    /// already canceled for any reason reports `false`.
    pub async fn mark_canceled(
        &self,
        session_ref: &str,
        reason: &str,
    ) -> BillingResult<(PaymentSession, bool)> {
        self.settle_from_open(session_ref, SessionStatus::Canceled, Some(reason))
            .await
    }

    /// CAS open -> expired. Used by the stale-session sweeper.
    pub async fn mark_expired(&self, session_ref: &str) -> BillingResult<(PaymentSession, bool)> {
        self.settle_from_open(session_ref, SessionStatus::Expired, None).await
    }

    async fn settle_from_open(
        &self,
        session_ref: &str,
        to: SessionStatus,
        reason: Option<&str>,
    ) -> BillingResult<(PaymentSession, bool)> {
        let updated: Option<PaymentSession> = sqlx::query_as(&format!(
            "UPDATE payment_sessions \
             SET status = $2, failure_reason = COALESCE($3, failure_reason), settled_at = NOW() \
             WHERE session_ref = $1 AND status = 'open' \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_ref)
        .bind(to)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(session) => {
                tracing::info!(
                    session_ref = %session_ref,
                    status = %to,
                    reason = reason.unwrap_or("-"),
                    "Settled payment session"
                );
                Ok((session, true))
            }
            None => {
                let session = self.get(session_ref).await?;
                if session.status == to {
                    Ok((session, false))
                } else {
                    Err(BillingError::Conflict(format!(
                        "Session {} is {} and cannot move to {}",
                        session_ref, session.status, to
                    )))
                }
            }
        }
    }

    /// Claim the right to apply downstream effects for a paid session.
    /// Runs inside the reconciliation transaction; returns the session when
    /// this transaction won the claim, None when another already did.
    pub async fn claim_effects_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        session_ref: &str,
    ) -> BillingResult<Option<PaymentSession>> {
        let claimed: Option<PaymentSession> = sqlx::query_as(&format!(
            "UPDATE payment_sessions SET effects_applied = TRUE \
             WHERE session_ref = $1 AND status = 'paid' AND effects_applied = FALSE \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_ref)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(claimed)
    }

    /// Open sessions whose TTL has lapsed, oldest first. The sweeper
    /// re-checks each against the gateway before expiring it.
    pub async fn list_stale_open(&self, limit: i64) -> BillingResult<Vec<PaymentSession>> {
        let sessions: Vec<PaymentSession> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions \
             WHERE status = 'open' AND expires_at < NOW() \
             ORDER BY expires_at ASC \
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(sessions)
    }

    /// Session history for a user, newest first
    pub async fn list_for_user(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<PaymentSession>> {
        let sessions: Vec<PaymentSession> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions \
             WHERE user_id = $1 \
             ORDER BY opened_at DESC \
             LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(sessions)
    }
}
