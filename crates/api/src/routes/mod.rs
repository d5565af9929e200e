//! API routes

pub mod billing;
pub mod health;
pub mod notifications;
pub mod plans;
pub mod requests;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_routes = Router::new()
        // Plan catalog
        .route("/plans", get(plans::list_plans))
        .route("/plans/:id", get(plans::get_plan))
        .route("/admin/plans", post(plans::create_plan))
        .route("/admin/plans/:id/deactivate", post(plans::deactivate_plan))
        .route("/admin/plans/:id", delete(plans::delete_plan))
        // Check requests
        .route("/requests", post(requests::create_request).get(requests::list_requests))
        .route("/requests/:id", get(requests::get_request))
        .route("/requests/:id/checkout", post(requests::checkout_request))
        .route("/requests/:id/cover-with-quota", post(requests::cover_with_quota))
        // Billing
        .route("/billing/subscribe", post(billing::subscribe))
        .route("/billing/entitlement", get(billing::get_entitlement))
        .route("/billing/cancel", post(billing::cancel_subscription))
        .route("/billing/sessions", get(billing::list_sessions))
        .route("/billing/sessions/:ref", get(billing::get_session))
        .route("/billing/sessions/:ref/confirm", get(billing::confirm_session))
        .route("/billing/history", get(billing::payment_history))
        .route("/admin/entitlements", post(billing::grant_entitlement))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/devices", post(notifications::register_device))
        .route("/notifications/devices/:token", delete(notifications::remove_device));

    // Webhook receiver stays outside /api/v1; the gateway calls it directly
    let webhook_routes = Router::new().route("/webhooks/stripe", post(billing::stripe_webhook));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
