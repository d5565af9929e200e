//! Veriport Background Worker
//!
//! Handles scheduled jobs:
//! - Stale checkout session reconciliation (every 5 minutes)
//! - Webhook event record retention cleanup (daily)
//!
//! The sweeper is the safety net for lost webhooks: every open session past
//! its TTL is re-checked against the gateway before it is settled, so a
//! payment whose webhook never arrived still lands as paid.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

use veriport_billing::BillingService;

/// How many stale sessions one sweep pass picks up
const SWEEP_BATCH_SIZE: i64 = 50;

async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// One sweep pass: reconcile every open session past its TTL against the
/// gateway. Transient gateway failures are retried with backoff; a session
/// that still cannot be reconciled stays open for the next pass.
async fn sweep_stale_sessions(billing: &BillingService) {
    let stale = match billing.sessions.list_stale_open(SWEEP_BATCH_SIZE).await {
        Ok(sessions) => sessions,
        Err(e) => {
            error!(error = %e, "Failed to list stale sessions");
            return;
        }
    };

    if stale.is_empty() {
        return;
    }

    info!(count = stale.len(), "Sweeping stale checkout sessions");

    for session in stale {
        let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(3);
        let session_ref = session.session_ref.clone();

        let result = Retry::spawn(strategy, || async {
            billing.reconciler.reconcile_with_gateway(&session_ref).await
        })
        .await;

        match result {
            Ok(settled) => {
                info!(
                    session_ref = %settled.session_ref,
                    status = %settled.status,
                    "Reconciled stale session"
                );
            }
            Err(e) => {
                warn!(
                    session_ref = %session.session_ref,
                    error = %e,
                    "Could not reconcile stale session, leaving for next pass"
                );
            }
        }
    }
}

/// Drop webhook event records past the retention window. The idempotency
/// guarantee only needs recent event ids; old rows are audit noise.
async fn cleanup_webhook_events(pool: &sqlx::PgPool, retention_days: u64) {
    let result = sqlx::query(
        "DELETE FROM gateway_webhook_events \
         WHERE created_at < NOW() - ($1 || ' days')::INTERVAL",
    )
    .bind(retention_days as i64)
    .execute(pool)
    .await;

    match result {
        Ok(done) if done.rows_affected() > 0 => {
            info!(deleted = done.rows_affected(), "Cleaned up old webhook event records");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "Webhook event cleanup failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Veriport Worker");

    let pool = create_db_pool().await?;
    let billing = Arc::new(
        BillingService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("billing setup failed: {}", e))?,
    );

    let sweep_interval_secs = env_u64("SWEEP_INTERVAL_SECS", 300);
    let retention_days = env_u64("WEBHOOK_RETENTION_DAYS", 90);

    let sweeper = {
        let billing = billing.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                sweep_stale_sessions(&billing).await;
            }
        })
    };

    let cleaner = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cleanup_webhook_events(&pool, retention_days).await;
            }
        })
    };

    info!(
        sweep_interval_secs = sweep_interval_secs,
        retention_days = retention_days,
        "Worker running"
    );

    tokio::select! {
        result = sweeper => {
            error!("Session sweeper exited: {:?}", result);
        }
        result = cleaner => {
            error!("Webhook cleanup task exited: {:?}", result);
        }
    }

    Ok(())
}
