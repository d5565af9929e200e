//! Plan catalog endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use veriport_billing::{NewPlan, Plan};

use crate::{auth::CurrentUser, error::ApiResult, state::AppState};

/// GET /plans - active plans, cheapest first. Public: the purchase page
/// renders before sign-in.
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    let plans = state.billing.plans.list_active().await?;
    Ok(Json(plans))
}

/// GET /plans/:id
pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<Plan>> {
    let plan = state.billing.plans.get(plan_id).await?;
    Ok(Json(plan))
}

/// POST /admin/plans
pub async fn create_plan(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(new_plan): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    user.require_admin()?;
    let plan = state.billing.plans.create(new_plan).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

/// POST /admin/plans/:id/deactivate
pub async fn deactivate_plan(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    user.require_admin()?;
    state.billing.plans.deactivate(plan_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /admin/plans/:id - refused while live entitlements reference the plan
pub async fn delete_plan(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    user.require_admin()?;
    state.billing.plans.hard_delete(plan_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
