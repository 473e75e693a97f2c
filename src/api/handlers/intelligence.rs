//! Intelligence endpoints: findings and the per-asset timeline.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::intelligence::{Finding, FindingStatus, TimelineEvent};

#[derive(Debug, Default, Deserialize)]
pub struct FindingsQuery {
    pub asset_id: Option<String>,
    pub session_id: Option<String>,
}

/// GET /api/v1/intelligence/findings
pub async fn list_findings(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<FindingsQuery>,
) -> ApiResult<Json<Vec<Finding>>> {
    let findings = state
        .findings
        .list(query.asset_id.as_deref(), query.session_id.as_deref())
        .await?;
    Ok(Json(findings))
}

/// GET /api/v1/intelligence/findings/{finding_id}
pub async fn get_finding(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(finding_id): Path<String>,
) -> ApiResult<Json<Finding>> {
    let finding = state
        .findings
        .get(&finding_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("finding {finding_id} not found")))?;
    Ok(Json(finding))
}

/// GET /api/v1/intelligence/findings/{finding_id}/stix
pub async fn get_stix(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(finding_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let finding = state
        .findings
        .get(&finding_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("finding {finding_id} not found")))?;
    let bundle = finding
        .stix_bundle
        .ok_or_else(|| ApiError::not_found("no STIX bundle available"))?;
    Ok(Json(bundle.0))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: FindingStatus,
}

/// PATCH /api/v1/intelligence/findings/{finding_id}/status
pub async fn update_status(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(finding_id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.findings.update_status(&finding_id, body.status).await? {
        return Err(ApiError::not_found(format!(
            "finding {finding_id} not found"
        )));
    }
    Ok(Json(
        serde_json::json!({"ok": true, "status": body.status.to_string()}),
    ))
}

/// DELETE /api/v1/intelligence/findings/{finding_id}
pub async fn delete_finding(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(finding_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.findings.delete(&finding_id).await? {
        return Err(ApiError::not_found(format!(
            "finding {finding_id} not found"
        )));
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    200
}

/// GET /api/v1/intelligence/timeline/{asset_id}
pub async fn get_timeline(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(asset_id): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<Vec<TimelineEvent>>> {
    Ok(Json(state.timeline.list(&asset_id, query.limit).await?))
}

/// DELETE /api/v1/intelligence/timeline/{asset_id}
pub async fn clear_timeline(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let removed = state.timeline.clear(&asset_id).await?;
    Ok(Json(serde_json::json!({"ok": true, "removed": removed})))
}
