//! API route definitions.

use axum::http::header;
use axum::http::Method;
use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers::{self, assets, auth, hunts, intelligence, sessions};
use super::state::AppState;
use crate::ws;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_v1 = Router::new()
        // Assets
        .route("/assets", get(assets::list_assets).post(assets::create_asset))
        .route(
            "/assets/{asset_id}",
            get(assets::get_asset)
                .patch(assets::patch_asset)
                .delete(assets::delete_asset),
        )
        // Sessions
        .route(
            "/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/sessions/{session_id}",
            get(sessions::get_session).delete(sessions::terminate_session),
        )
        .route("/sessions/{session_id}/lock", post(sessions::lock_session))
        .route(
            "/sessions/{session_id}/unlock",
            post(sessions::unlock_session),
        )
        // Hunt modules
        .route(
            "/hunts/modules",
            get(hunts::list_modules).post(hunts::create_module),
        )
        .route(
            "/hunts/modules/{module_id}",
            get(hunts::get_module)
                .put(hunts::update_module)
                .delete(hunts::delete_module),
        )
        // Hunt execution
        .route("/hunts", post(hunts::start_hunt))
        .route("/hunts/{hunt_id}", get(hunts::get_hunt))
        .route("/hunts/{hunt_id}/cancel", post(hunts::cancel_hunt))
        .route("/hunts/{hunt_id}/report", delete(hunts::delete_report))
        .route(
            "/hunts/session/{session_id}/reports",
            get(hunts::session_reports),
        )
        .route("/hunts/asset/{asset_id}/reports", get(hunts::asset_reports))
        // Intelligence
        .route(
            "/intelligence/findings",
            get(intelligence::list_findings),
        )
        .route(
            "/intelligence/findings/{finding_id}",
            get(intelligence::get_finding).delete(intelligence::delete_finding),
        )
        .route(
            "/intelligence/findings/{finding_id}/stix",
            get(intelligence::get_stix),
        )
        .route(
            "/intelligence/findings/{finding_id}/status",
            patch(intelligence::update_status),
        )
        .route(
            "/intelligence/timeline/{asset_id}",
            get(intelligence::get_timeline).delete(intelligence::clear_timeline),
        )
        // Real-time gateway
        .route("/ws", get(ws::ws_handler));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/change-password", post(auth::change_password))
        .nest("/api/v1", api_v1)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}
