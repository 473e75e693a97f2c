//! Application state shared across handlers.

use axum::extract::FromRef;
use std::sync::Arc;

use crate::assets::AssetRepository;
use crate::auth::AuthState;
use crate::events::EventBus;
use crate::hunt::{HuntRepository, HuntScheduler, ModuleRegistry};
use crate::intelligence::{FindingStore, TimelineRecorder};
use crate::session::{SessionManager, SessionRepository};
use crate::users::UserRepository;

/// Per-connection gateway limits.
#[derive(Debug, Clone)]
pub struct GatewayLimits {
    /// Sustained terminal input rate, bytes per second.
    pub terminal_rate: u64,
    /// Terminal input burst allowance, bytes.
    pub terminal_burst: u64,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            terminal_rate: 64 * 1024,
            terminal_burst: 256 * 1024,
        }
    }
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub auth: AuthState,
    pub users: UserRepository,
    pub assets: AssetRepository,
    pub sessions: SessionRepository,
    pub manager: Arc<SessionManager>,
    pub modules: Arc<ModuleRegistry>,
    pub scheduler: Arc<HuntScheduler>,
    pub hunts: HuntRepository,
    pub findings: FindingStore,
    pub timeline: TimelineRecorder,
    pub limits: GatewayLimits,
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
