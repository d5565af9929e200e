//! Background-check request endpoints
//!
//! A request starts unpaid and becomes actionable once settled, either
//! through a per-report checkout or by drawing one unit of subscription
//! quota. The two cover paths are parallel: a request settled by quota never
//! touches the payment gateway.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use veriport_billing::CheckoutResponse;
use veriport_shared::types::PaymentStatus;

use crate::{
    auth::CurrentUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// A background-check request
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CheckRequest {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub subject_name: String,
    pub subject_details: serde_json::Value,
    pub payment_status: PaymentStatus,
    pub report_tier: Option<Uuid>,
    pub amount_paid_minor: Option<i64>,
    pub settled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub subject_name: String,
    #[serde(default = "default_details")]
    pub subject_details: serde_json::Value,
}

fn default_details() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: Uuid,
}

const REQUEST_COLUMNS: &str = "id, owner_id, subject_name, subject_details, payment_status, \
     report_tier, amount_paid_minor, settled_at, created_at, updated_at";

/// POST /requests
pub async fn create_request(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<CheckRequest>)> {
    let subject_name = body.subject_name.trim();
    if subject_name.is_empty() || subject_name.len() > 255 {
        return Err(ApiError::Validation(
            "subject_name must be 1-255 characters".to_string(),
        ));
    }

    let request: CheckRequest = sqlx::query_as(&format!(
        "INSERT INTO check_requests (owner_id, subject_name, subject_details) \
         VALUES ($1, $2, $3) \
         RETURNING {REQUEST_COLUMNS}"
    ))
    .bind(user.id)
    .bind(subject_name)
    .bind(&body.subject_details)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        request_id = %request.id,
        owner_id = %user.id,
        "Created check request"
    );

    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /requests - the caller's requests, newest first
pub async fn list_requests(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<CheckRequest>>> {
    let requests: Vec<CheckRequest> = sqlx::query_as(&format!(
        "SELECT {REQUEST_COLUMNS} FROM check_requests \
         WHERE owner_id = $1 \
         ORDER BY created_at DESC \
         LIMIT $2"
    ))
    .bind(user.id)
    .bind(query.limit.clamp(1, 200))
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(requests))
}

/// GET /requests/:id - owner or admin only
pub async fn get_request(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Json<CheckRequest>> {
    let request: Option<CheckRequest> = sqlx::query_as(&format!(
        "SELECT {REQUEST_COLUMNS} FROM check_requests WHERE id = $1"
    ))
    .bind(request_id)
    .fetch_optional(&state.pool)
    .await?;

    let request = request.ok_or(ApiError::NotFound)?;
    if request.owner_id != user.id && !user.is_admin() {
        // Hide existence from non-owners
        return Err(ApiError::NotFound);
    }

    Ok(Json(request))
}

/// POST /requests/:id/checkout - start a per-report payment
pub async fn checkout_request(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(request_id): Path<Uuid>,
    Json(body): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let response = state
        .billing
        .checkout
        .create_report_checkout(user.id, request_id, body.plan_id)
        .await?;

    Ok(Json(response))
}

/// POST /requests/:id/cover-with-quota - settle a pending request from the
/// caller's subscription quota instead of a payment.
///
/// The consume and the request CAS are separate statements; when the request
/// turns out to be unsettleable the consumed unit is returned.
pub async fn cover_with_quota(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(request_id): Path<Uuid>,
) -> ApiResult<Json<CheckRequest>> {
    let owner: Option<(Uuid,)> = sqlx::query_as("SELECT owner_id FROM check_requests WHERE id = $1")
        .bind(request_id)
        .fetch_optional(&state.pool)
        .await?;
    match owner {
        Some((owner_id,)) if owner_id == user.id => {}
        _ => return Err(ApiError::NotFound),
    }

    state.billing.entitlements.consume(user.id).await?;

    let settled: Option<CheckRequest> = sqlx::query_as(&format!(
        "UPDATE check_requests \
         SET payment_status = 'completed', amount_paid_minor = 0, \
             settled_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND payment_status = 'pending' \
         RETURNING {REQUEST_COLUMNS}"
    ))
    .bind(request_id)
    .fetch_optional(&state.pool)
    .await?;

    match settled {
        Some(request) => {
            tracing::info!(
                request_id = %request_id,
                user_id = %user.id,
                "Covered check request with subscription quota"
            );
            Ok(Json(request))
        }
        None => {
            // Request settled concurrently; give the unit back
            state.billing.entitlements.release_one(user.id).await?;
            Err(ApiError::Conflict(format!(
                "Request {} is no longer pending",
                request_id
            )))
        }
    }
}
