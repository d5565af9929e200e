//! Request identity
//!
//! Authentication happens upstream; the identity gateway forwards the
//! authenticated user id in `x-user-id`. This module resolves that header to
//! a known user and exposes the role check for admin routes.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Header carrying the upstream-authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: Uuid,
    pub role: String,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let id = Uuid::parse_str(raw).map_err(|_| ApiError::Unauthorized)?;

        // The header is trusted but the user must still exist locally
        let row: Option<(String,)> = sqlx::query_as("SELECT role FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&state.pool)
            .await?;

        match row {
            Some((role,)) => Ok(CurrentUser { id, role }),
            None => {
                tracing::warn!(user_id = %id, "Identity header references unknown user");
                Err(ApiError::Unauthorized)
            }
        }
    }
}
