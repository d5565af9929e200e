//! Notification endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use veriport_billing::Notification;

use crate::{auth::CurrentUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub token: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    "web".to_string()
}

/// GET /notifications
pub async fn list_notifications(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    let notifications = state
        .billing
        .notifier
        .list_for_user(user.id, query.unread_only, query.limit.clamp(1, 200))
        .await?;
    Ok(Json(notifications))
}

/// POST /notifications/:id/read
pub async fn mark_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.billing.notifier.mark_read(user.id, notification_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /notifications/read-all
pub async fn mark_all_read(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<serde_json::Value>> {
    let updated = state.billing.notifier.mark_all_read(user.id).await?;
    Ok(Json(json!({ "updated": updated })))
}

/// POST /notifications/devices
pub async fn register_device(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<RegisterDeviceRequest>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .notifier
        .register_device(user.id, &body.token, &body.platform)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /notifications/devices/:token
pub async fn remove_device(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(token): Path<String>,
) -> ApiResult<StatusCode> {
    state.billing.notifier.remove_device(user.id, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}
