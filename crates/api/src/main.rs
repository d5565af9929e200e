//! Veriport API Server
//!
//! Serves the plan catalog, check requests, billing, and notification
//! endpoints, plus the gateway webhook receiver.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veriport_api::{routes::create_router, AppState, Config};
use veriport_billing::{BillingService, NotificationDispatcher, StripeClient, StripeConfig};
use veriport_shared::db::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,veriport_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Veriport API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connection established");

    // Migrations run on a separate pool with longer timeouts
    tracing::info!("Running database migrations...");
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Migrations complete");

    let stripe = StripeClient::new(StripeConfig {
        secret_key: config.stripe_secret_key.clone(),
        webhook_secret: config.stripe_webhook_secret.clone(),
        app_base_url: config.public_url.clone(),
        session_ttl_hours: config.checkout_session_ttl_hours,
    });
    let notifier = NotificationDispatcher::new(pool.clone(), config.notify_push_url.clone());
    let billing = BillingService::new(stripe, pool.clone(), notifier);

    let state = AppState::new(pool, config.clone(), billing);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(bind_address = %config.bind_address, "Listening");

    axum::serve(listener, router).await?;

    Ok(())
}
