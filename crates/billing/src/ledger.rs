//! Payment event ledger
//!
//! Append-only audit trail of money movement. Rows are written inside the
//! reconciliation transaction that produced them and are never updated.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use veriport_shared::types::PaymentEventStatus;

use crate::error::BillingResult;

/// One ledger row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_ref: Option<String>,
    pub session_ref: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PaymentEventStatus,
    pub external_payment_ref: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Input for appending a ledger row
#[derive(Debug, Clone)]
pub struct NewPaymentEvent {
    pub user_id: Uuid,
    pub subscription_ref: Option<String>,
    pub session_ref: Option<String>,
    pub amount_minor: i64,
    pub currency: String,
    pub status: PaymentEventStatus,
    pub external_payment_ref: Option<String>,
}

const EVENT_COLUMNS: &str = "id, user_id, subscription_ref, session_ref, amount_minor, \
     currency, status, external_payment_ref, created_at";

const INSERT_EVENT: &str = "INSERT INTO payment_events \
         (user_id, subscription_ref, session_ref, amount_minor, currency, status, external_payment_ref) \
     VALUES ($1, $2, $3, $4, $5, $6, $7) \
     RETURNING id, user_id, subscription_ref, session_ref, amount_minor, \
         currency, status, external_payment_ref, created_at";

/// Payment ledger service
#[derive(Clone)]
pub struct PaymentLedger {
    pool: PgPool,
}

impl PaymentLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a row outside any transaction (failure paths, refund records)
    pub async fn record(&self, new: NewPaymentEvent) -> BillingResult<PaymentEvent> {
        let event: PaymentEvent = sqlx::query_as(INSERT_EVENT)
            .bind(new.user_id)
            .bind(&new.subscription_ref)
            .bind(&new.session_ref)
            .bind(new.amount_minor)
            .bind(&new.currency)
            .bind(new.status)
            .bind(&new.external_payment_ref)
            .fetch_one(&self.pool)
            .await?;

        tracing::info!(
            event_id = %event.id,
            user_id = %event.user_id,
            status = %event.status,
            amount_minor = event.amount_minor,
            "Recorded payment event"
        );

        Ok(event)
    }

    /// Append a row inside the caller's reconciliation transaction so the
    /// ledger entry commits atomically with the effects it describes.
    pub async fn record_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        new: NewPaymentEvent,
    ) -> BillingResult<PaymentEvent> {
        let event: PaymentEvent = sqlx::query_as(INSERT_EVENT)
            .bind(new.user_id)
            .bind(&new.subscription_ref)
            .bind(&new.session_ref)
            .bind(new.amount_minor)
            .bind(&new.currency)
            .bind(new.status)
            .bind(&new.external_payment_ref)
            .fetch_one(&mut **tx)
            .await?;

        Ok(event)
    }

    /// Payment history for a user, newest first
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>> {
        let events: Vec<PaymentEvent> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM payment_events \
             WHERE user_id = $1 \
             ORDER BY created_at DESC \
             LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Rows recorded against one checkout session, oldest first
    pub async fn list_for_session(&self, session_ref: &str) -> BillingResult<Vec<PaymentEvent>> {
        let events: Vec<PaymentEvent> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM payment_events \
             WHERE session_ref = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(session_ref)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
