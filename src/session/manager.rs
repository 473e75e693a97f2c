//! Session registry: admission, dedup, locking, shutdown.

use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::assets::{Asset, AssetRepository};
use crate::events::{EventBus, EventKind};
use crate::intelligence::TimelineRecorder;
use crate::ssh::SshSettings;

use super::models::{SessionMeta, SessionMode, SessionRecord};
use super::repository::SessionRepository;
use super::runtime::{spawn_owner, OwnerDeps, SessionCommand, SessionError, SessionHandle};
use super::state::SessionState;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session limit reached ({0})")]
    Capacity(usize),
    #[error("session {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_sessions: usize,
    pub ssh: SshSettings,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            ssh: SshSettings::default(),
        }
    }
}

/// Owns the set of live sessions. One owner task per session; the manager
/// only ever reads the shared meta snapshots the owners maintain.
pub struct SessionManager {
    bus: Arc<EventBus>,
    sessions: SessionRepository,
    assets: AssetRepository,
    timeline: TimelineRecorder,
    config: SessionManagerConfig,
    registry: Arc<DashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        bus: Arc<EventBus>,
        sessions: SessionRepository,
        assets: AssetRepository,
        timeline: TimelineRecorder,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            bus,
            sessions,
            assets,
            timeline,
            config,
            registry: Arc::new(DashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.registry.get(session_id).map(|entry| entry.clone())
    }

    /// Per-asset dedup: an existing non-terminal session for the same
    /// (analyst, asset) pair is returned instead of creating a second.
    fn find_existing(&self, analyst: &str, asset_id: &str) -> Option<SessionHandle> {
        self.registry.iter().find_map(|entry| {
            let meta = entry.value().meta();
            (meta.analyst_id == analyst
                && meta.asset_id == asset_id
                && !meta.state.is_terminal())
            .then(|| entry.value().clone())
        })
    }

    /// Open a session on an asset. Returns the record and whether a new
    /// session was actually created (false on dedup hit).
    pub async fn create_session(
        &self,
        asset: Asset,
        analyst: &str,
        mode: SessionMode,
    ) -> Result<(SessionRecord, bool), ManagerError> {
        if let Some(existing) = self.find_existing(analyst, &asset.id) {
            info!(
                "session dedup hit: analyst={analyst} asset={} session={}",
                asset.id, existing.id
            );
            let record = self
                .sessions
                .get(&existing.id)
                .await
                .map_err(ManagerError::Internal)?
                .unwrap_or_else(|| meta_to_record(&existing.meta()));
            return Ok((record, false));
        }

        if self.registry.len() >= self.config.max_sessions {
            return Err(ManagerError::Capacity(self.config.max_sessions));
        }

        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord {
            id: session_id.clone(),
            asset_id: asset.id.clone(),
            analyst_id: analyst.to_string(),
            state: SessionState::Initializing,
            mode,
            locked_by: None,
            created_at: Utc::now().to_rfc3339(),
            terminated_at: None,
        };
        self.sessions.create(&record).await.map_err(ManagerError::Internal)?;

        let meta = SessionMeta {
            session_id: session_id.clone(),
            asset_id: asset.id.clone(),
            analyst_id: analyst.to_string(),
            state: SessionState::Initializing,
            mode,
            locked_by: None,
        };

        let handle = spawn_owner(
            meta,
            asset.clone(),
            OwnerDeps {
                bus: self.bus.clone(),
                sessions: self.sessions.clone(),
                assets: self.assets.clone(),
                timeline: self.timeline.clone(),
                ssh: self.config.ssh.clone(),
            },
            self.registry.clone(),
        );
        self.registry.insert(session_id.clone(), handle.clone());

        self.bus.publish(EventKind::SessionCreated {
            session_id: session_id.clone(),
            asset_id: asset.id.clone(),
            analyst_id: analyst.to_string(),
        });
        if let Err(err) = self
            .timeline
            .record(
                &asset.id,
                "session.created",
                analyst,
                serde_json::json!({"session_id": session_id}),
                Some(&session_id),
            )
            .await
        {
            warn!("timeline record failed for session.created: {err}");
        }

        // Kick off the SSH connect; state events follow on the bus.
        let _ = handle.send(SessionCommand::Connect).await;

        info!("session created: {session_id} (asset={})", asset.id);
        Ok((record, true))
    }

    /// Writer-gate check for gateway operations.
    pub fn ensure_writer(&self, session_id: &str, analyst: &str) -> Result<(), ManagerError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        handle.check_writer(analyst)?;
        Ok(())
    }

    /// Writer-gate check that passes for sessions no longer in the
    /// registry (their rows can still be cleaned up).
    pub fn ensure_writer_if_live(
        &self,
        session_id: &str,
        analyst: &str,
    ) -> Result<(), ManagerError> {
        if let Some(handle) = self.get(session_id) {
            handle.check_writer(analyst)?;
        }
        Ok(())
    }

    pub async fn lock(&self, session_id: &str, analyst: &str) -> Result<(), ManagerError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        handle.lock(analyst).await?;
        Ok(())
    }

    pub async fn unlock(&self, session_id: &str, analyst: &str) -> Result<(), ManagerError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        handle.unlock(analyst).await?;
        Ok(())
    }

    /// Terminate a session. Falls back to updating the DB row directly for
    /// sessions that are no longer in the registry (e.g. after a restart).
    pub async fn close(&self, session_id: &str, reason: &str) -> Result<(), ManagerError> {
        if let Some(handle) = self.get(session_id) {
            handle.close(reason).await;
            return Ok(());
        }

        let record = self
            .sessions
            .get(session_id)
            .await
            .map_err(ManagerError::Internal)?
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        if !record.is_terminal() {
            self.sessions
                .update_state(session_id, SessionState::Terminated)
                .await
                .map_err(ManagerError::Internal)?;
            info!("terminated orphaned session row {session_id}");
        }
        Ok(())
    }

    /// Graceful shutdown: every owner receives close and the call returns
    /// when all of them have reported terminal.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("shutting down {} active session(s)", handles.len());
        for handle in handles {
            handle.close("server shutdown").await;
        }
    }
}

fn meta_to_record(meta: &SessionMeta) -> SessionRecord {
    SessionRecord {
        id: meta.session_id.clone(),
        asset_id: meta.asset_id.clone(),
        analyst_id: meta.analyst_id.clone(),
        state: meta.state,
        mode: meta.mode,
        locked_by: meta.locked_by.clone(),
        created_at: String::new(),
        terminated_at: None,
    }
}
