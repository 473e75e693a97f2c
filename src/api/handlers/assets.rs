//! Asset CRUD endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::api::{ApiError, ApiResult, AppState};
use crate::assets::{Asset, CreateAssetRequest, PatchAssetRequest};
use crate::auth::CurrentUser;

/// GET /api/v1/assets
pub async fn list_assets(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Json<Vec<Asset>>> {
    Ok(Json(state.assets.list().await?))
}

/// GET /api/v1/assets/{asset_id}
pub async fn get_asset(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<Asset>> {
    let asset = state
        .assets
        .get(&asset_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("asset {asset_id} not found")))?;
    Ok(Json(asset))
}

/// POST /api/v1/assets
pub async fn create_asset(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(body): Json<CreateAssetRequest>,
) -> ApiResult<(StatusCode, Json<Asset>)> {
    if body.hostname.trim().is_empty() {
        return Err(ApiError::bad_request("hostname is required"));
    }
    let asset = state.assets.create(body).await?;
    Ok((StatusCode::CREATED, Json(asset)))
}

/// PATCH /api/v1/assets/{asset_id}
pub async fn patch_asset(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(asset_id): Path<String>,
    Json(body): Json<PatchAssetRequest>,
) -> ApiResult<Json<Asset>> {
    let asset = state
        .assets
        .patch(&asset_id, body)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("asset {asset_id} not found")))?;
    Ok(Json(asset))
}

/// DELETE /api/v1/assets/{asset_id}
pub async fn delete_asset(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(asset_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.assets.delete(&asset_id).await? {
        return Err(ApiError::not_found(format!("asset {asset_id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}
