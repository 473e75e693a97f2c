//! Authentication endpoints: login, refresh rotation, password change.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::{hash_password, verify_password, CurrentUser, TokenPair};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub username: String,
    pub role: String,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let user = state
        .users
        .get_by_username(&body.username)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| ApiError::AuthRequired("invalid credentials".to_string()))?;

    if !verify_password(&body.password, &user.password_hash) {
        return Err(ApiError::AuthRequired("invalid credentials".to_string()));
    }

    let tokens = state.auth.create_token_pair(&user.username, user.role)?;
    info!("login: {}", user.username);
    Ok(Json(LoginResponse {
        tokens,
        username: user.username,
        role: user.role.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /auth/refresh — rotates the refresh token on each use.
pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    let claims = state.auth.verify_refresh_token(&body.refresh_token)?;
    let tokens = state.auth.create_token_pair(&claims.sub, claims.role)?;
    Ok(Json(tokens))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// POST /auth/change-password
pub async fn change_password(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<ChangePasswordRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.new_password.len() < 8 {
        return Err(ApiError::bad_request(
            "password must be at least 8 characters",
        ));
    }

    let record = state
        .users
        .get_by_username(&user.username)
        .await?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    if !verify_password(&body.current_password, &record.password_hash) {
        return Err(ApiError::AuthRequired("invalid credentials".to_string()));
    }

    let new_hash = hash_password(&body.new_password)?;
    state.users.update_password(&user.username, &new_hash).await?;
    info!("password changed: {}", user.username);
    Ok(Json(serde_json::json!({"ok": true})))
}
