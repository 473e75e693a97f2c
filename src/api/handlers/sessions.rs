//! Session endpoints: open, list, terminate, lock, unlock.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::session::{CreateSessionRequest, SessionRecord};

/// GET /api/v1/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Json<Vec<SessionRecord>>> {
    Ok(Json(state.sessions.list().await?))
}

/// GET /api/v1/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionRecord>> {
    let session = state
        .sessions
        .get(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("session {session_id} not found")))?;
    Ok(Json(session))
}

/// POST /api/v1/sessions
///
/// Per-asset dedup: an existing non-terminal session for the same
/// (analyst, asset) comes back with 200 instead of 201.
pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionRecord>)> {
    let asset = state
        .assets
        .get(&body.asset_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("asset {} not found", body.asset_id)))?;

    if asset.ip_address.is_none() && asset.hostname.trim().is_empty() {
        return Err(ApiError::bad_request("asset has no address configured"));
    }

    let (record, created) = state
        .manager
        .create_session(asset, &user.username, body.mode)
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(record)))
}

/// DELETE /api/v1/sessions/{session_id}
pub async fn terminate_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.ensure_writer_if_live(&session_id, &user.username)?;
    state.manager.close(&session_id, "analyst request").await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/{session_id}/lock
pub async fn lock_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.manager.lock(&session_id, &user.username).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// POST /api/v1/sessions/{session_id}/unlock
pub async fn unlock_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.manager.unlock(&session_id, &user.username).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}
