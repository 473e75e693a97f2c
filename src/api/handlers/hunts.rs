//! Hunt endpoints: module CRUD, start/cancel, AI reports.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{ApiError, ApiResult, AppState};
use crate::assets::OsType;
use crate::auth::CurrentUser;
use crate::hunt::{HuntModule, HuntRecord, HuntStep, StartHuntRequest, StepExecutor};
use crate::session::SessionState;

static SAFE_MODULE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("module id pattern"));

// ── Module CRUD ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ModuleSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub os_types: Vec<OsType>,
    pub tags: Vec<String>,
    pub severity_hint: String,
    pub step_count: usize,
}

impl From<&HuntModule> for ModuleSummary {
    fn from(module: &HuntModule) -> Self {
        Self {
            id: module.id.clone(),
            name: module.name.clone(),
            description: module.description.clone(),
            os_types: module.os_types.clone(),
            tags: module.tags.clone(),
            severity_hint: module.severity_hint.clone(),
            step_count: module.steps.len(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SaveModuleRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_os_types")]
    pub os_types: Vec<OsType>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_severity_hint")]
    pub severity_hint: String,
    #[serde(default)]
    pub steps: Vec<HuntStep>,
}

fn default_os_types() -> Vec<OsType> {
    vec![OsType::Linux]
}

fn default_severity_hint() -> String {
    "medium".to_string()
}

impl From<SaveModuleRequest> for HuntModule {
    fn from(body: SaveModuleRequest) -> Self {
        HuntModule {
            id: body.id,
            name: body.name,
            description: body.description,
            os_types: body.os_types,
            tags: body.tags,
            severity_hint: body.severity_hint,
            steps: body.steps,
        }
    }
}

/// GET /api/v1/hunts/modules
pub async fn list_modules(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Json<Vec<ModuleSummary>>> {
    let modules = state.modules.list();
    Ok(Json(modules.iter().map(ModuleSummary::from).collect()))
}

/// GET /api/v1/hunts/modules/{module_id}
pub async fn get_module(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(module_id): Path<String>,
) -> ApiResult<Json<HuntModule>> {
    let module = state
        .modules
        .get(&module_id)
        .ok_or_else(|| ApiError::not_found(format!("module {module_id} not found")))?;
    Ok(Json(module))
}

/// POST /api/v1/hunts/modules
pub async fn create_module(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(body): Json<SaveModuleRequest>,
) -> ApiResult<(StatusCode, Json<HuntModule>)> {
    if !SAFE_MODULE_ID.is_match(&body.id) {
        return Err(ApiError::bad_request(
            "module id must be lowercase alphanumeric/underscores, start with a letter, max 64 chars",
        ));
    }
    if state.modules.get(&body.id).is_some() {
        return Err(ApiError::conflict(format!(
            "module '{}' already exists",
            body.id
        )));
    }

    let module: HuntModule = body.into();
    state
        .modules
        .save(&module)
        .map_err(|e| ApiError::internal(format!("saving module: {e}")))?;
    Ok((StatusCode::CREATED, Json(module)))
}

/// PUT /api/v1/hunts/modules/{module_id}
pub async fn update_module(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(module_id): Path<String>,
    Json(body): Json<SaveModuleRequest>,
) -> ApiResult<Json<HuntModule>> {
    if state.modules.get(&module_id).is_none() {
        return Err(ApiError::not_found(format!("module {module_id} not found")));
    }
    if !SAFE_MODULE_ID.is_match(&body.id) {
        return Err(ApiError::bad_request("invalid module id"));
    }

    let module: HuntModule = body.into();
    if module.id != module_id {
        state
            .modules
            .delete(&module_id)
            .map_err(|e| ApiError::internal(format!("removing renamed module: {e}")))?;
    }
    state
        .modules
        .save(&module)
        .map_err(|e| ApiError::internal(format!("saving module: {e}")))?;
    Ok(Json(module))
}

/// DELETE /api/v1/hunts/modules/{module_id}
pub async fn delete_module(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(module_id): Path<String>,
) -> ApiResult<StatusCode> {
    let removed = state
        .modules
        .delete(&module_id)
        .map_err(|e| ApiError::internal(format!("deleting module: {e}")))?;
    if !removed {
        return Err(ApiError::not_found(format!("module {module_id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Hunt execution ───────────────────────────────────────────────────────────

/// POST /api/v1/hunts
pub async fn start_hunt(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<StartHuntRequest>,
) -> ApiResult<(StatusCode, Json<HuntRecord>)> {
    let handle = state
        .manager
        .get(&body.session_id)
        .ok_or_else(|| ApiError::not_found(format!("session {} not found", body.session_id)))?;

    handle.check_writer(&user.username)?;

    let meta = handle.meta();
    if !matches!(meta.state, SessionState::Running | SessionState::Locked) {
        return Err(ApiError::conflict(format!(
            "session is not running (state {})",
            meta.state
        )));
    }

    let asset = state
        .assets
        .get(&meta.asset_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("asset {} not found", meta.asset_id)))?;

    let executor: Arc<dyn StepExecutor> = Arc::new(handle);
    let record = state
        .scheduler
        .start(
            executor,
            &body.session_id,
            asset,
            &body.module_id,
            body.run_ai,
            &user.username,
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(record)))
}

/// GET /api/v1/hunts/{hunt_id}
pub async fn get_hunt(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(hunt_id): Path<String>,
) -> ApiResult<Json<HuntRecord>> {
    let hunt = state
        .hunts
        .get(&hunt_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("hunt {hunt_id} not found")))?;
    Ok(Json(hunt))
}

/// POST /api/v1/hunts/{hunt_id}/cancel
pub async fn cancel_hunt(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(hunt_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let hunt = state
        .hunts
        .get(&hunt_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("hunt {hunt_id} not found")))?;
    state
        .manager
        .ensure_writer_if_live(&hunt.session_id, &user.username)?;
    state.scheduler.cancel(&hunt_id)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ── AI reports ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AiReportResponse {
    pub hunt_id: String,
    pub session_id: String,
    pub ai_report_text: Option<String>,
    pub started_at: String,
}

impl From<HuntRecord> for AiReportResponse {
    fn from(hunt: HuntRecord) -> Self {
        Self {
            hunt_id: hunt.id,
            session_id: hunt.session_id,
            ai_report_text: hunt.ai_report_text,
            started_at: hunt.started_at,
        }
    }
}

/// GET /api/v1/hunts/session/{session_id}/reports
pub async fn session_reports(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<AiReportResponse>>> {
    let hunts = state.hunts.reports_for_session(&session_id).await?;
    Ok(Json(hunts.into_iter().map(AiReportResponse::from).collect()))
}

/// GET /api/v1/hunts/asset/{asset_id}/reports
pub async fn asset_reports(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<Vec<AiReportResponse>>> {
    let hunts = state.hunts.reports_for_asset(&asset_id).await?;
    Ok(Json(hunts.into_iter().map(AiReportResponse::from).collect()))
}

/// DELETE /api/v1/hunts/{hunt_id}/report
pub async fn delete_report(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(hunt_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.hunts.get(&hunt_id).await?.is_none() {
        return Err(ApiError::not_found(format!("hunt {hunt_id} not found")));
    }
    state.hunts.delete_report(&hunt_id).await?;
    Ok(Json(serde_json::json!({"ok": true})))
}
