//! Notification dispatch
//!
//! Payment outcomes land here as in-app notification rows, with an optional
//! push fan-out to registered devices through an external push relay.
//! Dispatch is best-effort by design: settlement has already committed by the
//! time a notification is written, and a notification failure must never roll
//! a payment back.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Upper bound on one push relay round trip, in seconds. Dispatch runs on
/// settlement paths, so a hung relay must not stall them.
const PUSH_TIMEOUT_SECS: u64 = 10;

/// An in-app notification row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub target_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub read: bool,
    pub created_at: OffsetDateTime,
}

/// A registered push target
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub platform: String,
    pub created_at: OffsetDateTime,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    tokens: Vec<&'a str>,
    event_type: &'a str,
    payload: &'a serde_json::Value,
}

/// Notification dispatch service
#[derive(Clone)]
pub struct NotificationDispatcher {
    pool: PgPool,
    http: reqwest::Client,
    /// Push relay endpoint; when unset, dispatch is in-app only
    push_url: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(pool: PgPool, push_url: Option<String>) -> Self {
        // build() fails only when no TLS backend is compiled in
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PUSH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            pool,
            http,
            push_url,
        }
    }

    /// Read the push relay endpoint from `NOTIFY_PUSH_URL` (optional)
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(pool, std::env::var("NOTIFY_PUSH_URL").ok())
    }

    /// Record a notification and fan it out to the user's devices
    pub async fn dispatch(
        &self,
        user_id: Uuid,
        event_type: &str,
        target_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> BillingResult<Notification> {
        let notification: Notification = sqlx::query_as(
            "INSERT INTO notifications (user_id, event_type, target_id, payload) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, user_id, event_type, target_id, payload, read, created_at",
        )
        .bind(user_id)
        .bind(event_type)
        .bind(target_id)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            notification_id = %notification.id,
            user_id = %user_id,
            event_type = %event_type,
            "Dispatched notification"
        );

        if let Err(e) = self.push(user_id, event_type, &payload).await {
            tracing::warn!(
                user_id = %user_id,
                event_type = %event_type,
                error = %e,
                "Push fan-out failed, in-app notification stands"
            );
        }

        Ok(notification)
    }

    /// Dispatch, swallowing errors. Used on settlement paths where the
    /// payment outcome has already committed.
    pub async fn dispatch_best_effort(
        &self,
        user_id: Uuid,
        event_type: &str,
        target_id: Option<Uuid>,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self.dispatch(user_id, event_type, target_id, payload).await {
            tracing::warn!(
                user_id = %user_id,
                event_type = %event_type,
                error = %e,
                "Failed to dispatch notification"
            );
        }
    }

    /// Record the same notification for every admin. Used for events that
    /// need operator attention, e.g. a payment that landed on a session
    /// already closed unpaid.
    pub async fn dispatch_admins(
        &self,
        event_type: &str,
        target_id: Option<Uuid>,
        payload: serde_json::Value,
    ) -> BillingResult<usize> {
        let admins: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE role = 'admin'")
            .fetch_all(&self.pool)
            .await?;

        for (admin_id,) in &admins {
            self.dispatch(*admin_id, event_type, target_id, payload.clone()).await?;
        }

        Ok(admins.len())
    }

    /// Admin broadcast, swallowing errors
    pub async fn dispatch_admins_best_effort(
        &self,
        event_type: &str,
        target_id: Option<Uuid>,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self.dispatch_admins(event_type, target_id, payload).await {
            tracing::warn!(
                event_type = %event_type,
                error = %e,
                "Failed to dispatch admin notification"
            );
        }
    }

    /// Notifications for a user, newest first
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> BillingResult<Vec<Notification>> {
        let notifications: Vec<Notification> = sqlx::query_as(
            "SELECT id, user_id, event_type, target_id, payload, read, created_at \
             FROM notifications \
             WHERE user_id = $1 AND ($2 = FALSE OR read = FALSE) \
             ORDER BY created_at DESC \
             LIMIT $3",
        )
        .bind(user_id)
        .bind(unread_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    /// Mark one notification read. Scoped to the owner.
    pub async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> BillingResult<()> {
        let result =
            sqlx::query("UPDATE notifications SET read = TRUE WHERE id = $1 AND user_id = $2")
                .bind(notification_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Notification {} not found",
                notification_id
            )));
        }
        Ok(())
    }

    /// Mark all of a user's notifications read; returns how many changed
    pub async fn mark_all_read(&self, user_id: Uuid) -> BillingResult<u64> {
        let result =
            sqlx::query("UPDATE notifications SET read = TRUE WHERE user_id = $1 AND read = FALSE")
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    /// Register a push device. Re-registering the same token is a no-op.
    pub async fn register_device(
        &self,
        user_id: Uuid,
        token: &str,
        platform: &str,
    ) -> BillingResult<()> {
        if token.is_empty() || token.len() > 512 {
            return Err(BillingError::Validation(
                "device token must be 1-512 characters".to_string(),
            ));
        }

        sqlx::query(
            "INSERT INTO device_tokens (user_id, token, platform) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id, token) DO NOTHING",
        )
        .bind(user_id)
        .bind(token)
        .bind(platform)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a push device registration
    pub async fn remove_device(&self, user_id: Uuid, token: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM device_tokens WHERE user_id = $1 AND token = $2")
            .bind(user_id)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn push(
        &self,
        user_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let Some(push_url) = &self.push_url else {
            return Ok(());
        };

        let tokens: Vec<(String,)> =
            sqlx::query_as("SELECT token FROM device_tokens WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        if tokens.is_empty() {
            return Ok(());
        }

        let request = PushRequest {
            tokens: tokens.iter().map(|(t,)| t.as_str()).collect(),
            event_type,
            payload,
        };

        let response = self
            .http
            .post(push_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("push relay unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "push relay returned {}",
                response.status()
            )));
        }

        tracing::debug!(
            user_id = %user_id,
            device_count = request.tokens.len(),
            "Pushed notification to devices"
        );

        Ok(())
    }
}
