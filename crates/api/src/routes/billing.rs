//! Billing endpoints
//!
//! Subscription checkout and management, checkout session inspection, the
//! success-redirect confirm hook, payment history, and the gateway webhook
//! receiver.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use veriport_billing::{
    CheckoutResponse, Entitlement, EntitlementSummary, PaymentEvent, PaymentSession,
};

use crate::{
    auth::CurrentUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// POST /billing/subscribe - start a subscription checkout
pub async fn subscribe(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<SubscribeRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let response = state
        .billing
        .checkout
        .create_subscription_checkout(user.id, body.plan_id)
        .await?;

    Ok(Json(response))
}

/// GET /billing/entitlement - the caller's subscription state and remaining quota
pub async fn get_entitlement(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<EntitlementSummary>> {
    let summary = state.billing.entitlements.summary(user.id).await?;
    Ok(Json(summary))
}

/// POST /billing/cancel - cancel the caller's subscription locally
pub async fn cancel_subscription(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Entitlement>> {
    let entitlement = state.billing.entitlements.cancel(user.id).await?;
    Ok(Json(entitlement))
}

/// GET /billing/sessions - the caller's checkout session history
pub async fn list_sessions(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<PaymentSession>>> {
    let sessions = state
        .billing
        .sessions
        .list_for_user(user.id, query.limit.clamp(1, 200))
        .await?;
    Ok(Json(sessions))
}

/// GET /billing/sessions/:ref
pub async fn get_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_ref): Path<String>,
) -> ApiResult<Json<PaymentSession>> {
    let session = state.billing.sessions.get(&session_ref).await?;
    if session.user_id != user.id && !user.is_admin() {
        return Err(ApiError::NotFound);
    }
    Ok(Json(session))
}

/// GET /billing/sessions/:ref/confirm - success-redirect landing hook.
///
/// The redirect proves nothing by itself; this reconciles the session
/// against the gateway's current state and returns the settled row.
pub async fn confirm_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_ref): Path<String>,
) -> ApiResult<Json<PaymentSession>> {
    let session = state.billing.sessions.get(&session_ref).await?;
    if session.user_id != user.id {
        return Err(ApiError::NotFound);
    }

    let session = state.billing.reconciler.reconcile_with_gateway(&session_ref).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct GrantEntitlementRequest {
    pub user_id: Uuid,
    pub plan_id: Uuid,
}

/// POST /admin/entitlements - assign a plan to a user without payment
pub async fn grant_entitlement(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<GrantEntitlementRequest>,
) -> ApiResult<Json<Entitlement>> {
    user.require_admin()?;

    // Plan must exist and be purchasable
    state.billing.plans.get_for_purchase(body.plan_id).await?;

    let entitlement = state
        .billing
        .entitlements
        .activate(body.user_id, body.plan_id, None)
        .await?;

    tracing::info!(
        admin_id = %user.id,
        user_id = %body.user_id,
        plan_id = %body.plan_id,
        "Granted entitlement by admin action"
    );

    Ok(Json(entitlement))
}

/// GET /billing/history - the caller's payment ledger, newest first
pub async fn payment_history(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<PaymentEvent>>> {
    let events = state
        .billing
        .ledger
        .list_for_user(user.id, query.limit.clamp(1, 200))
        .await?;
    Ok(Json(events))
}

/// POST /webhooks/stripe - gateway webhook receiver.
///
/// Signature failures return 400; verified events are always acknowledged
/// with 200 once claimed, and processing errors return 500 so the gateway
/// redelivers.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;
    state.billing.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}
