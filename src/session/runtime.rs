//! Per-session owner task.
//!
//! Exactly one task owns each session: it processes inbox messages in FIFO
//! order and is the only writer to session state and the only issuer of
//! SSH operations. Hunt execs, terminal input and mode toggles all flow
//! through the inbox, which is what serializes the SSH channel and applies
//! mode toggles at step boundaries.

use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::assets::{Asset, AssetRepository};
use crate::events::{EventBus, EventKind};
use crate::hunt::StepExecutor;
use crate::intelligence::TimelineRecorder;
use crate::security::{classify_command, CommandClass};
use crate::ssh::{
    pty::pump_terminal_output, ConnectParams, ExecOutcome, ExecRequest, PtyHandle, SshClient,
    SshError, SshSettings,
};

use super::models::{SessionMeta, SessionMode};
use super::repository::SessionRepository;
use super::state::{validate_transition, SessionState};

/// Output chunk size on `ssh.command_output` events.
const OUTPUT_CHUNK_BYTES: usize = 16 * 1024;

/// Reconnect backoff schedule; each delay gets up to 250 ms of jitter.
const RECONNECT_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("session is locked by {locked_by}")]
    Locked { locked_by: String },
    #[error("operation invalid in state {state}")]
    InvalidState { state: SessionState },
    #[error("session terminated")]
    Terminated,
    #[error(transparent)]
    Ssh(#[from] SshError),
}

pub(crate) enum SessionCommand {
    Connect,
    EnterMode {
        mode: SessionMode,
        analyst: String,
        reply: oneshot::Sender<Result<SessionMode, SessionError>>,
    },
    TerminalInput {
        analyst: String,
        data: Vec<u8>,
    },
    TerminalResize {
        cols: u32,
        rows: u32,
    },
    Exec {
        request: ExecRequest,
        analyst: String,
        reply: oneshot::Sender<Result<ExecOutcome, SessionError>>,
    },
    Lock {
        analyst: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Unlock {
        analyst: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Pause {
        analyst: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Resume {
        analyst: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    PtyClosed {
        reason: String,
    },
    Close {
        reason: String,
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Cloneable handle on a session's owner task.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    meta: Arc<RwLock<SessionMeta>>,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Snapshot of the live session view.
    pub fn meta(&self) -> SessionMeta {
        self.meta.read().expect("session meta poisoned").clone()
    }

    /// Writer-gate check without going through the inbox: fails when the
    /// session is locked by someone else.
    pub fn check_writer(&self, analyst: &str) -> Result<(), SessionError> {
        let meta = self.meta();
        match meta.locked_by {
            Some(locked_by) if locked_by != analyst => Err(SessionError::Locked { locked_by }),
            _ => Ok(()),
        }
    }

    pub(crate) async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SessionError::Terminated)
    }

    pub async fn exec(
        &self,
        request: ExecRequest,
        analyst: &str,
    ) -> Result<ExecOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Exec {
            request,
            analyst: analyst.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    pub async fn enter_mode(
        &self,
        mode: SessionMode,
        analyst: &str,
    ) -> Result<SessionMode, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::EnterMode {
            mode,
            analyst: analyst.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    pub async fn terminal_input(&self, analyst: &str, data: Vec<u8>) -> Result<(), SessionError> {
        self.check_writer(analyst)?;
        self.send(SessionCommand::TerminalInput {
            analyst: analyst.to_string(),
            data,
        })
        .await
    }

    pub async fn terminal_resize(&self, cols: u32, rows: u32) -> Result<(), SessionError> {
        self.send(SessionCommand::TerminalResize { cols, rows }).await
    }

    pub async fn lock(&self, analyst: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Lock {
            analyst: analyst.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    pub async fn unlock(&self, analyst: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Unlock {
            analyst: analyst.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    pub async fn pause(&self, analyst: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Pause {
            analyst: analyst.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    pub async fn resume(&self, analyst: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Resume {
            analyst: analyst.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Terminated)?
    }

    /// Request termination and wait for the owner to acknowledge.
    pub async fn close(&self, reason: &str) {
        let (reply, rx) = oneshot::channel();
        if self
            .send(SessionCommand::Close {
                reason: reason.to_string(),
                reply: Some(reply),
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl StepExecutor for SessionHandle {
    async fn execute(&self, request: ExecRequest, analyst: &str) -> Result<ExecOutcome, SshError> {
        match self.exec(request, analyst).await {
            Ok(outcome) => Ok(outcome),
            Err(SessionError::Ssh(err)) => Err(err),
            // Lock loss or termination mid-hunt kills the hunt.
            Err(other) => Err(SshError::ChannelClosed(other.to_string())),
        }
    }
}

pub(crate) struct OwnerDeps {
    pub bus: Arc<EventBus>,
    pub sessions: SessionRepository,
    pub assets: AssetRepository,
    pub timeline: TimelineRecorder,
    pub ssh: SshSettings,
}

/// Spawn the owner task for a new session. Returns the handle; the owner
/// removes itself from `registry` when it exits.
pub(crate) fn spawn_owner(
    meta: SessionMeta,
    asset: Asset,
    deps: OwnerDeps,
    registry: Arc<dashmap::DashMap<String, SessionHandle>>,
) -> SessionHandle {
    let (tx, inbox) = mpsc::channel(64);
    let meta = Arc::new(RwLock::new(meta));
    let handle = SessionHandle {
        id: asset_session_id(&meta),
        meta: meta.clone(),
        tx: tx.clone(),
    };

    let bus = deps.bus.clone();
    let sessions = deps.sessions.clone();
    let owner = SessionOwner {
        session_id: handle.id.clone(),
        analyst_id: handle.meta().analyst_id,
        asset,
        meta: meta.clone(),
        deps,
        inbox_tx: tx,
        client: None,
        pty: None,
    };

    let session_id = handle.id.clone();
    let registry_handle = handle.clone();
    tokio::spawn(async move {
        // Panic boundary: a crashed owner is reported and drives the
        // session to FAILED rather than silently vanishing.
        let run = tokio::spawn(async move { owner.run(inbox).await });
        if let Err(join_err) = run.await {
            if join_err.is_panic() {
                warn!("session owner panicked: {session_id}");
                bus.publish(EventKind::SystemError {
                    session_id: Some(session_id.clone()),
                    component: "session_runtime".to_string(),
                    error: format!("session owner panicked: {join_err}"),
                    severity: "fatal".to_string(),
                });
                meta.write().expect("session meta poisoned").state = SessionState::Failed;
                if let Err(err) = sessions.update_state(&session_id, SessionState::Failed).await {
                    warn!("failed to persist FAILED after panic: {err}");
                }
            }
        }
        registry.remove(&registry_handle.id);
    });

    handle
}

fn asset_session_id(meta: &Arc<RwLock<SessionMeta>>) -> String {
    meta.read().expect("session meta poisoned").session_id.clone()
}

struct SessionOwner {
    session_id: String,
    analyst_id: String,
    asset: Asset,
    meta: Arc<RwLock<SessionMeta>>,
    deps: OwnerDeps,
    inbox_tx: mpsc::Sender<SessionCommand>,
    client: Option<SshClient>,
    pty: Option<PtyHandle>,
}

impl SessionOwner {
    async fn run(mut self, mut inbox: mpsc::Receiver<SessionCommand>) {
        while let Some(command) = inbox.recv().await {
            match command {
                SessionCommand::Connect => {
                    if !self.handle_connect().await {
                        break;
                    }
                }
                SessionCommand::EnterMode {
                    mode,
                    analyst,
                    reply,
                } => {
                    let result = self.handle_enter_mode(mode, &analyst).await;
                    let _ = reply.send(result);
                }
                SessionCommand::TerminalInput { analyst, data } => {
                    self.handle_terminal_input(&analyst, data).await;
                }
                SessionCommand::TerminalResize { cols, rows } => {
                    self.handle_terminal_resize(cols, rows).await;
                }
                SessionCommand::Exec {
                    request,
                    analyst,
                    reply,
                } => {
                    let result = self.handle_exec(request, &analyst).await;
                    let fatal = matches!(
                        &result,
                        Err(SessionError::Ssh(err)) if err.is_fatal_to_client()
                    );
                    let _ = reply.send(result);
                    if fatal && !self.handle_connection_lost("exec channel died").await {
                        break;
                    }
                }
                SessionCommand::Lock { analyst, reply } => {
                    let _ = reply.send(self.handle_lock(&analyst).await);
                }
                SessionCommand::Unlock { analyst, reply } => {
                    let _ = reply.send(self.handle_unlock(&analyst).await);
                }
                SessionCommand::Pause { analyst, reply } => {
                    let _ = reply.send(self.handle_pause(&analyst).await);
                }
                SessionCommand::Resume { analyst, reply } => {
                    let _ = reply.send(self.handle_resume(&analyst).await);
                }
                SessionCommand::PtyClosed { reason } => {
                    self.handle_pty_closed(&reason).await;
                }
                SessionCommand::Close { reason, reply } => {
                    self.handle_close(&reason).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }

        if let Some(mut client) = self.client.take() {
            client.close("session ended").await;
        }
        info!("session owner exited: {}", self.session_id);
    }

    fn snapshot(&self) -> SessionMeta {
        self.meta.read().expect("session meta poisoned").clone()
    }

    fn check_writer(&self, analyst: &str) -> Result<(), SessionError> {
        match &self.snapshot().locked_by {
            Some(locked_by) if locked_by != analyst => Err(SessionError::Locked {
                locked_by: locked_by.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Apply a state transition: validate, persist, publish. A transition
    /// to the current state is a no-op. Invalid transitions publish a
    /// `system.error` and leave the state untouched.
    async fn transition(&mut self, to: SessionState, reason: &str) -> bool {
        let from = self.snapshot().state;
        if from == to {
            return true;
        }
        if let Err(err) = validate_transition(from, to) {
            self.deps.bus.publish(EventKind::SystemError {
                session_id: Some(self.session_id.clone()),
                component: "session_runtime".to_string(),
                error: err.to_string(),
                severity: "high".to_string(),
            });
            return false;
        }

        self.meta.write().expect("session meta poisoned").state = to;
        if let Err(err) = self.deps.sessions.update_state(&self.session_id, to).await {
            warn!("failed to persist state for {}: {err}", self.session_id);
        }

        info!("session {}: {from} → {to} ({reason})", self.session_id);
        self.deps.bus.publish(EventKind::SessionStateChanged {
            session_id: self.session_id.clone(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            reason: reason.to_string(),
        });
        if to == SessionState::Terminated {
            self.deps.bus.publish(EventKind::SessionTerminated {
                session_id: self.session_id.clone(),
                reason: reason.to_string(),
            });
        }
        true
    }

    fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self
                .asset
                .ip_address
                .clone()
                .unwrap_or_else(|| self.asset.hostname.clone()),
            port: self.asset.ssh_port as u16,
            username: self
                .asset
                .ssh_username
                .clone()
                .unwrap_or_else(|| "root".to_string()),
            password: self.asset.ssh_password.clone(),
            private_key: self.asset.ssh_key.clone(),
            pinned_fingerprint: self.asset.pinned_fingerprint.clone(),
        }
    }

    async fn dial(&mut self) -> Result<(), SshError> {
        let params = self.connect_params();
        self.deps.bus.publish(EventKind::SshConnecting {
            session_id: self.session_id.clone(),
            target_host: params.host.clone(),
        });

        let client = SshClient::connect(&self.deps.ssh, &params).await?;
        self.deps.bus.publish(EventKind::SshConnected {
            session_id: self.session_id.clone(),
            server_fingerprint: client.server_fingerprint().to_string(),
        });

        // Trust-on-first-use: record the fingerprint seen on first contact.
        if self.asset.pinned_fingerprint.is_none() {
            let fingerprint = client.server_fingerprint().to_string();
            if let Err(err) = self.deps.assets.pin_fingerprint(&self.asset.id, &fingerprint).await {
                warn!("failed to pin fingerprint for {}: {err}", self.asset.id);
            }
            self.asset.pinned_fingerprint = Some(fingerprint);
        }

        self.client = Some(client);
        Ok(())
    }

    /// Initial connect: CONNECTING → CONNECTED → RUNNING, with OS
    /// detection along the way. Returns false when the session is dead.
    async fn handle_connect(&mut self) -> bool {
        if !self.transition(SessionState::Connecting, "opening ssh connection").await {
            return true;
        }

        match self.dial().await {
            Ok(()) => {}
            Err(err) => {
                self.publish_ssh_error(&err);
                self.transition(SessionState::Failed, &err.to_string()).await;
                return false;
            }
        }

        self.transition(SessionState::Connected, "ssh established").await;

        if let Some(client) = &mut self.client {
            match crate::ssh::os_detect::detect_os(client).await {
                Ok(os_info) => {
                    self.asset.os_type = os_info.os_type;
                    if let Err(err) = self
                        .deps
                        .assets
                        .update_os_info(&self.asset.id, os_info.os_type, os_info.os_version.as_deref())
                        .await
                    {
                        warn!("failed to record os info for {}: {err}", self.asset.id);
                    }
                }
                Err(err) => warn!("os detection failed for {}: {err}", self.session_id),
            }
        }

        let initial_mode = self.snapshot().mode;
        if initial_mode == SessionMode::Interactive {
            if let Err(err) = self.open_pty().await {
                warn!("initial pty open failed for {}: {err}", self.session_id);
            }
        }

        self.transition(SessionState::Running, "ssh connected").await;

        if let Err(err) = self
            .deps
            .timeline
            .record(
                &self.asset.id,
                "ssh.connected",
                &self.analyst_id,
                serde_json::json!({
                    "host": self.connect_params().host,
                    "port": self.asset.ssh_port,
                    "os_type": self.asset.os_type.to_string(),
                }),
                Some(&self.session_id),
            )
            .await
        {
            warn!("timeline record failed for ssh.connected: {err}");
        }

        true
    }

    fn publish_ssh_error(&self, err: &SshError) {
        let code = match err {
            SshError::Unreachable(_) => "UNREACHABLE",
            SshError::AuthFailed => "AUTH_FAILED",
            SshError::HostKeyMismatch { .. } => "HOST_KEY_MISMATCH",
            SshError::Timeout => "TIMEOUT",
            SshError::ChannelClosed(_) => "CHANNEL_CLOSED",
            SshError::ExecTimeout(_) => "EXEC_TIMEOUT",
            SshError::CommandBlocked(_) => "COMMAND_BLOCKED",
            SshError::CommandSuspect(_) => "COMMAND_SUSPECT",
            SshError::Cancelled => "CANCELLED",
            SshError::Protocol(_) => "PROTOCOL",
        };
        self.deps.bus.publish(EventKind::SshError {
            session_id: self.session_id.clone(),
            error_code: code.to_string(),
            message: err.to_string(),
        });
    }

    async fn handle_exec(
        &mut self,
        request: ExecRequest,
        analyst: &str,
    ) -> Result<ExecOutcome, SessionError> {
        self.check_writer(analyst)?;

        let state = self.snapshot().state;
        if !matches!(state, SessionState::Running | SessionState::Locked) {
            return Err(SessionError::InvalidState { state });
        }

        let (class, reason) = classify_command(&request.command);
        match class {
            CommandClass::Blocked => {
                let err = SshError::CommandBlocked(reason);
                self.publish_ssh_error(&err);
                return Err(err.into());
            }
            CommandClass::Suspect if !request.allow_suspect => {
                return Err(SshError::CommandSuspect(reason).into());
            }
            _ => {}
        }

        let Some(client) = self.client.as_mut() else {
            return Err(SshError::ChannelClosed("ssh not connected".to_string()).into());
        };

        let command_id = Uuid::new_v4().to_string();
        let bus = self.deps.bus.clone();
        let session_id = self.session_id.clone();

        bus.publish(EventKind::SshCommandStarted {
            session_id: session_id.clone(),
            command_id: command_id.clone(),
            command: request.command.clone(),
        });

        let chunk_session = session_id.clone();
        let chunk_command = command_id.clone();
        let chunk_bus = bus.clone();
        let result = client
            .exec(&request, |stream, data| {
                for chunk in data.chunks(OUTPUT_CHUNK_BYTES) {
                    chunk_bus.publish(EventKind::SshCommandOutput {
                        session_id: chunk_session.clone(),
                        command_id: chunk_command.clone(),
                        chunk: String::from_utf8_lossy(chunk).into_owned(),
                        stream: stream.to_string(),
                    });
                }
            })
            .await;

        match result {
            Ok(outcome) => {
                bus.publish(EventKind::SshCommandCompleted {
                    session_id,
                    command_id,
                    exit_code: outcome.exit.as_code(),
                    duration_ms: outcome.duration_ms,
                });
                Ok(outcome)
            }
            Err(err) => {
                self.publish_ssh_error(&err);
                Err(err.into())
            }
        }
    }

    async fn open_pty(&mut self) -> Result<(), SessionError> {
        let Some(client) = self.client.as_mut() else {
            return Err(SshError::ChannelClosed("ssh not connected".to_string()).into());
        };

        let streams = client.open_pty(80, 24).await.map_err(SessionError::Ssh)?;
        self.pty = Some(streams.handle);

        tokio::spawn(pump_terminal_output(
            self.deps.bus.clone(),
            self.session_id.clone(),
            streams.output,
        ));

        let inbox = self.inbox_tx.clone();
        let closed = streams.closed;
        tokio::spawn(async move {
            let reason = closed.await.unwrap_or_else(|_| "pty task gone".to_string());
            let _ = inbox.send(SessionCommand::PtyClosed { reason }).await;
        });

        self.deps.bus.publish(EventKind::TerminalStarted {
            session_id: self.session_id.clone(),
            cols: 80,
            rows: 24,
        });
        Ok(())
    }

    async fn handle_enter_mode(
        &mut self,
        mode: SessionMode,
        analyst: &str,
    ) -> Result<SessionMode, SessionError> {
        self.check_writer(analyst)?;

        let snapshot = self.snapshot();
        if !matches!(
            snapshot.state,
            SessionState::Running | SessionState::Locked
        ) {
            return Err(SessionError::InvalidState {
                state: snapshot.state,
            });
        }
        if snapshot.mode == mode {
            return Ok(mode);
        }

        match mode {
            SessionMode::Interactive => {
                self.open_pty().await?;
            }
            SessionMode::Ai => {
                if let Some(pty) = self.pty.take() {
                    pty.close().await;
                }
                self.deps.bus.publish(EventKind::TerminalClosed {
                    session_id: self.session_id.clone(),
                    reason: "mode toggled to ai".to_string(),
                });
            }
        }

        self.meta.write().expect("session meta poisoned").mode = mode;
        if let Err(err) = self.deps.sessions.update_mode(&self.session_id, mode).await {
            warn!("failed to persist mode for {}: {err}", self.session_id);
        }
        self.deps.bus.publish(EventKind::SessionModeChanged {
            session_id: self.session_id.clone(),
            from_mode: snapshot.mode.to_string(),
            to_mode: mode.to_string(),
        });
        Ok(mode)
    }

    async fn handle_terminal_input(&mut self, analyst: &str, data: Vec<u8>) {
        if self.check_writer(analyst).is_err() {
            return;
        }
        if self.snapshot().mode != SessionMode::Interactive {
            return;
        }
        if let Some(pty) = &self.pty {
            if let Err(err) = pty.write(data).await {
                warn!("pty write failed for {}: {err}", self.session_id);
            }
        }
    }

    async fn handle_terminal_resize(&mut self, cols: u32, rows: u32) {
        if let Some(pty) = &self.pty {
            if pty.resize(cols, rows).await.is_ok() {
                self.deps.bus.publish(EventKind::TerminalResize {
                    session_id: self.session_id.clone(),
                    cols,
                    rows,
                });
            }
        }
    }

    async fn handle_pty_closed(&mut self, reason: &str) {
        // A deliberate toggle back to ai mode already cleared the handle.
        if self.pty.take().is_none() {
            return;
        }
        self.deps.bus.publish(EventKind::TerminalClosed {
            session_id: self.session_id.clone(),
            reason: reason.to_string(),
        });

        let from_mode = self.snapshot().mode;
        if from_mode == SessionMode::Interactive {
            self.meta.write().expect("session meta poisoned").mode = SessionMode::Ai;
            if let Err(err) = self
                .deps
                .sessions
                .update_mode(&self.session_id, SessionMode::Ai)
                .await
            {
                warn!("failed to persist mode for {}: {err}", self.session_id);
            }
            self.deps.bus.publish(EventKind::SessionModeChanged {
                session_id: self.session_id.clone(),
                from_mode: from_mode.to_string(),
                to_mode: SessionMode::Ai.to_string(),
            });
        }
    }

    async fn handle_lock(&mut self, analyst: &str) -> Result<(), SessionError> {
        let snapshot = self.snapshot();
        match &snapshot.locked_by {
            Some(locked_by) if locked_by == analyst => return Ok(()),
            Some(locked_by) => {
                return Err(SessionError::Locked {
                    locked_by: locked_by.clone(),
                })
            }
            None => {}
        }
        if snapshot.state != SessionState::Running {
            return Err(SessionError::InvalidState {
                state: snapshot.state,
            });
        }

        self.transition(SessionState::Locked, &format!("locked by {analyst}")).await;
        self.meta.write().expect("session meta poisoned").locked_by = Some(analyst.to_string());
        if let Err(err) = self
            .deps
            .sessions
            .update_lock(&self.session_id, Some(analyst))
            .await
        {
            warn!("failed to persist lock for {}: {err}", self.session_id);
        }
        self.deps.bus.publish(EventKind::SessionLocked {
            session_id: self.session_id.clone(),
            locked_by: analyst.to_string(),
        });
        Ok(())
    }

    async fn handle_unlock(&mut self, analyst: &str) -> Result<(), SessionError> {
        let snapshot = self.snapshot();
        match &snapshot.locked_by {
            None => return Ok(()), // idempotent
            Some(locked_by) if locked_by != analyst => {
                return Err(SessionError::Locked {
                    locked_by: locked_by.clone(),
                })
            }
            Some(_) => {}
        }

        self.transition(SessionState::Running, &format!("unlocked by {analyst}")).await;
        self.meta.write().expect("session meta poisoned").locked_by = None;
        if let Err(err) = self.deps.sessions.update_lock(&self.session_id, None).await {
            warn!("failed to persist unlock for {}: {err}", self.session_id);
        }
        self.deps.bus.publish(EventKind::SessionUnlocked {
            session_id: self.session_id.clone(),
            unlocked_by: analyst.to_string(),
        });
        Ok(())
    }

    async fn handle_pause(&mut self, analyst: &str) -> Result<(), SessionError> {
        self.check_writer(analyst)?;
        let state = self.snapshot().state;
        if state != SessionState::Running {
            return Err(SessionError::InvalidState { state });
        }
        self.transition(SessionState::Paused, &format!("paused by {analyst}")).await;
        Ok(())
    }

    async fn handle_resume(&mut self, analyst: &str) -> Result<(), SessionError> {
        self.check_writer(analyst)?;
        let state = self.snapshot().state;
        if state != SessionState::Paused {
            return Err(SessionError::InvalidState { state });
        }
        self.transition(SessionState::Running, &format!("resumed by {analyst}")).await;
        Ok(())
    }

    /// Connection drop handling: DISCONNECTED, then up to three jittered
    /// reconnect attempts, then FAILED. Returns false when the session died.
    async fn handle_connection_lost(&mut self, reason: &str) -> bool {
        self.deps.bus.publish(EventKind::SshDisconnected {
            session_id: self.session_id.clone(),
            reason: reason.to_string(),
        });
        if let Some(pty) = self.pty.take() {
            pty.close().await;
            self.deps.bus.publish(EventKind::TerminalClosed {
                session_id: self.session_id.clone(),
                reason: "connection lost".to_string(),
            });
            let from_mode = self.snapshot().mode;
            if from_mode == SessionMode::Interactive {
                self.meta.write().expect("session meta poisoned").mode = SessionMode::Ai;
                self.deps.bus.publish(EventKind::SessionModeChanged {
                    session_id: self.session_id.clone(),
                    from_mode: from_mode.to_string(),
                    to_mode: SessionMode::Ai.to_string(),
                });
            }
        }
        if let Some(mut client) = self.client.take() {
            client.close("connection lost").await;
        }

        if !self.transition(SessionState::Disconnected, reason).await {
            return false;
        }

        for (attempt, base_delay) in RECONNECT_BACKOFF.iter().enumerate() {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
            tokio::time::sleep(*base_delay + jitter).await;

            info!(
                "ssh reconnect attempt {}/{} for session {}",
                attempt + 1,
                RECONNECT_BACKOFF.len(),
                self.session_id
            );
            self.transition(SessionState::Connecting, "reconnecting").await;

            match self.dial().await {
                Ok(()) => {
                    self.transition(SessionState::Connected, "reconnected").await;
                    self.transition(SessionState::Running, "reconnected").await;
                    return true;
                }
                Err(err) => {
                    self.publish_ssh_error(&err);
                }
            }
        }

        self.transition(SessionState::Failed, "reconnect attempts exhausted").await;
        false
    }

    async fn handle_close(&mut self, reason: &str) {
        if let Some(pty) = self.pty.take() {
            pty.close().await;
        }
        if let Some(mut client) = self.client.take() {
            client.close(reason).await;
            self.deps.bus.publish(EventKind::SshDisconnected {
                session_id: self.session_id.clone(),
                reason: reason.to_string(),
            });
        }
        self.transition(SessionState::Terminated, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::OsType;
    use crate::db::Database;
    use crate::events::Room;
    use crate::intelligence::TimelineRecorder;
    use crate::session::repository::SessionRepository;
    use sqlx::types::Json;

    struct Fixture {
        owner: SessionOwner,
        bus: Arc<EventBus>,
        // keeps the inbox open so owner-internal sends don't error
        _inbox: mpsc::Receiver<SessionCommand>,
    }

    async fn fixture(state: SessionState) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        for sql in [
            "INSERT INTO assets (id, hostname, created_at, updated_at) VALUES ('a1', 'host', '', '')",
            "INSERT INTO sessions (id, asset_id, analyst_id, state, created_at) VALUES ('s1', 'a1', 'alice', 'RUNNING', '')",
        ] {
            sqlx::query(sql).execute(db.pool()).await.unwrap();
        }

        let bus = Arc::new(EventBus::new());
        let (tx, rx) = mpsc::channel(8);

        let asset = Asset {
            id: "a1".into(),
            hostname: "host".into(),
            ip_address: Some("192.0.2.1".into()),
            os_type: OsType::Linux,
            os_version: None,
            ssh_port: 22,
            ssh_username: Some("root".into()),
            ssh_password: Some("pw".into()),
            ssh_key: None,
            pinned_fingerprint: None,
            sudo_method: None,
            sudo_password: None,
            tags: Json(vec![]),
            created_at: String::new(),
            updated_at: String::new(),
            last_seen: None,
        };

        let meta = SessionMeta {
            session_id: "s1".into(),
            asset_id: "a1".into(),
            analyst_id: "alice".into(),
            state,
            mode: SessionMode::Ai,
            locked_by: None,
        };

        let owner = SessionOwner {
            session_id: "s1".into(),
            analyst_id: "alice".into(),
            asset,
            meta: Arc::new(RwLock::new(meta)),
            deps: OwnerDeps {
                bus: bus.clone(),
                sessions: SessionRepository::new(db.pool().clone()),
                assets: AssetRepository::new(db.pool().clone()),
                timeline: TimelineRecorder::new(db.pool().clone(), bus.clone()),
                ssh: SshSettings::default(),
            },
            inbox_tx: tx,
            client: None,
            pty: None,
        };

        Fixture {
            owner,
            bus,
            _inbox: rx,
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_to_the_locker() {
        let mut f = fixture(SessionState::Running).await;

        f.owner.handle_lock("alice").await.unwrap();
        assert_eq!(f.owner.snapshot().state, SessionState::Locked);
        assert_eq!(f.owner.snapshot().locked_by.as_deref(), Some("alice"));

        // Another analyst's writer ops are rejected until unlock.
        assert!(matches!(
            f.owner.handle_lock("bob").await,
            Err(SessionError::Locked { .. })
        ));
        let request = ExecRequest::new("ls /tmp", Duration::from_secs(5));
        assert!(matches!(
            f.owner.handle_exec(request, "bob").await,
            Err(SessionError::Locked { .. })
        ));
        assert!(matches!(
            f.owner.handle_unlock("bob").await,
            Err(SessionError::Locked { .. })
        ));

        // Re-locking by the locker is a no-op; unlock is idempotent.
        f.owner.handle_lock("alice").await.unwrap();
        f.owner.handle_unlock("alice").await.unwrap();
        assert_eq!(f.owner.snapshot().state, SessionState::Running);
        f.owner.handle_unlock("alice").await.unwrap();
    }

    #[tokio::test]
    async fn lock_events_are_published() {
        let mut f = fixture(SessionState::Running).await;
        let sub = f.bus.subscribe_default(Room::Session("s1".into()), "test");

        f.owner.handle_lock("alice").await.unwrap();

        let mut saw_state_change = false;
        let mut saw_locked = false;
        while let Some(event) = sub.try_recv() {
            match event.kind {
                EventKind::SessionStateChanged { to_state, .. } => {
                    assert_eq!(to_state, "LOCKED");
                    saw_state_change = true;
                }
                EventKind::SessionLocked { locked_by, .. } => {
                    assert_eq!(locked_by, "alice");
                    saw_locked = true;
                }
                _ => {}
            }
        }
        assert!(saw_state_change && saw_locked);
    }

    #[tokio::test]
    async fn pause_resume_cycle() {
        let mut f = fixture(SessionState::Running).await;

        f.owner.handle_pause("alice").await.unwrap();
        assert_eq!(f.owner.snapshot().state, SessionState::Paused);

        // Exec is rejected while paused.
        let request = ExecRequest::new("ls", Duration::from_secs(5));
        assert!(matches!(
            f.owner.handle_exec(request, "alice").await,
            Err(SessionError::InvalidState { .. })
        ));

        f.owner.handle_resume("alice").await.unwrap();
        assert_eq!(f.owner.snapshot().state, SessionState::Running);

        assert!(matches!(
            f.owner.handle_resume("alice").await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn blocked_commands_never_reach_the_channel() {
        let mut f = fixture(SessionState::Running).await;
        let sub = f.bus.subscribe_default(Room::Session("s1".into()), "test");

        let request = ExecRequest::new("rm -rf /", Duration::from_secs(5));
        let result = f.owner.handle_exec(request, "alice").await;
        assert!(matches!(
            result,
            Err(SessionError::Ssh(SshError::CommandBlocked(_)))
        ));

        let event = sub.try_recv().expect("expected ssh.error event");
        assert!(matches!(
            event.kind,
            EventKind::SshError { error_code, .. } if error_code == "COMMAND_BLOCKED"
        ));
    }

    #[tokio::test]
    async fn suspect_commands_require_approval() {
        let mut f = fixture(SessionState::Running).await;

        let request = ExecRequest::new("systemctl stop auditd", Duration::from_secs(5));
        assert!(matches!(
            f.owner.handle_exec(request, "alice").await,
            Err(SessionError::Ssh(SshError::CommandSuspect(_)))
        ));

        // With approval the command passes classification; without a live
        // client it then fails on the channel.
        let mut request = ExecRequest::new("systemctl stop auditd", Duration::from_secs(5));
        request.allow_suspect = true;
        assert!(matches!(
            f.owner.handle_exec(request, "alice").await,
            Err(SessionError::Ssh(SshError::ChannelClosed(_)))
        ));
    }

    #[tokio::test]
    async fn invalid_transitions_publish_system_error() {
        let mut f = fixture(SessionState::Running).await;
        let sub = f.bus.subscribe_default(Room::Session("s1".into()), "test");

        assert!(!f.owner.transition(SessionState::Connected, "bogus").await);
        assert_eq!(f.owner.snapshot().state, SessionState::Running);

        let event = sub.try_recv().expect("expected system.error event");
        assert!(matches!(event.kind, EventKind::SystemError { .. }));
    }

    #[tokio::test]
    async fn transitions_persist_to_the_repository() {
        let mut f = fixture(SessionState::Running).await;

        assert!(f.owner.transition(SessionState::Paused, "test").await);
        let record = f.owner.deps.sessions.get("s1").await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Paused);
    }
}
