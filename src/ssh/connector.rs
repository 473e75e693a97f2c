//! SSH client lifecycle: dial, authenticate, exec channels, PTY channels.
//!
//! One `SshClient` exists per active session, owned exclusively by the
//! session's owner task. Exec and PTY use distinct channels over the same
//! client connection.

use async_trait::async_trait;
use log::{debug, info, warn};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use super::{ExecOutcome, ExecRequest, ExitStatus, OutputStream, SshError};

/// SSH connector configuration.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub dial_timeout: Duration,
    pub keepalive: Duration,
    pub reconnect_attempts: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(30),
            reconnect_attempts: 3,
        }
    }
}

/// Connection parameters resolved from an asset and its credentials.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    /// Trust-on-first-use pin. `None` means first contact: trust and record.
    pub pinned_fingerprint: Option<String>,
}

struct ClientHandler {
    pinned: Option<String>,
    seen: Arc<StdMutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        *self.seen.lock().expect("fingerprint slot poisoned") = Some(fingerprint.clone());
        match &self.pinned {
            Some(pinned) if *pinned != fingerprint => {
                warn!("host key mismatch: pinned={pinned} presented={fingerprint}");
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

/// A live SSH client for one session.
pub struct SshClient {
    handle: client::Handle<ClientHandler>,
    server_fingerprint: String,
}

impl SshClient {
    /// Dial and authenticate. The dial is bounded by `settings.dial_timeout`.
    pub async fn connect(settings: &SshSettings, params: &ConnectParams) -> Result<Self, SshError> {
        let mut config = client::Config::default();
        config.keepalive_interval = Some(settings.keepalive);
        let config = Arc::new(config);

        let seen = Arc::new(StdMutex::new(None));
        let handler = ClientHandler {
            pinned: params.pinned_fingerprint.clone(),
            seen: seen.clone(),
        };

        let addr = (params.host.as_str(), params.port);
        let connect = client::connect(config, addr, handler);
        let mut handle = match tokio::time::timeout(settings.dial_timeout, connect).await {
            Err(_) => return Err(SshError::Timeout),
            Ok(Err(err)) => {
                let presented = seen.lock().expect("fingerprint slot poisoned").clone();
                if let (Some(pinned), Some(presented)) = (&params.pinned_fingerprint, presented) {
                    if *pinned != presented {
                        return Err(SshError::HostKeyMismatch {
                            pinned: pinned.clone(),
                            presented,
                        });
                    }
                }
                return Err(SshError::Unreachable(err.to_string()));
            }
            Ok(Ok(handle)) => handle,
        };

        let authenticated = if let Some(pem) = &params.private_key {
            let keypair = russh_keys::decode_secret_key(pem, None)
                .map_err(|e| SshError::Protocol(format!("invalid private key: {e}")))?;
            handle
                .authenticate_publickey(params.username.as_str(), Arc::new(keypair))
                .await
                .map_err(|e| SshError::Protocol(e.to_string()))?
        } else if let Some(password) = &params.password {
            handle
                .authenticate_password(params.username.as_str(), password.as_str())
                .await
                .map_err(|e| SshError::Protocol(e.to_string()))?
        } else {
            return Err(SshError::AuthFailed);
        };

        if !authenticated {
            return Err(SshError::AuthFailed);
        }

        let server_fingerprint = seen
            .lock()
            .expect("fingerprint slot poisoned")
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        info!(
            "ssh connected: host={} user={} fp={}",
            params.host, params.username, server_fingerprint
        );

        Ok(Self {
            handle,
            server_fingerprint,
        })
    }

    pub fn server_fingerprint(&self) -> &str {
        &self.server_fingerprint
    }

    pub fn is_open(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Execute a command over a fresh channel, streaming chunks to
    /// `on_chunk` as they arrive and capturing bounded stdout/stderr.
    ///
    /// On timeout the channel is closed and the outcome records
    /// `ExitStatus::Timeout` with whatever output was captured.
    pub async fn exec(
        &mut self,
        request: &ExecRequest,
        mut on_chunk: impl FnMut(OutputStream, &[u8]),
    ) -> Result<ExecOutcome, SshError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelClosed(e.to_string()))?;

        channel
            .exec(true, request.command.as_bytes())
            .await
            .map_err(|e| SshError::ChannelClosed(e.to_string()))?;

        if let Some(input) = &request.stdin {
            channel
                .data(input.as_bytes())
                .await
                .map_err(|e| SshError::ChannelClosed(e.to_string()))?;
            channel
                .eof()
                .await
                .map_err(|e| SshError::ChannelClosed(e.to_string()))?;
        }

        let started = Instant::now();
        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        let mut cancel = request.cancel.clone();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_truncated = false;
        let mut stderr_truncated = false;
        let mut exit: Option<ExitStatus> = None;

        enum ExecEvent {
            Deadline,
            Cancelled,
            Msg(Option<ChannelMsg>),
        }

        loop {
            // Arm bodies only produce a tag; the channel is borrowed again
            // after the select completes.
            let event = tokio::select! {
                () = &mut deadline => ExecEvent::Deadline,
                changed = watch_cancel(&mut cancel) => {
                    if changed {
                        ExecEvent::Cancelled
                    } else {
                        continue;
                    }
                }
                msg = channel.wait() => ExecEvent::Msg(msg),
            };

            match event {
                ExecEvent::Deadline => {
                    let _ = channel.close().await;
                    exit = Some(ExitStatus::Timeout);
                    break;
                }
                ExecEvent::Cancelled => {
                    let _ = channel.close().await;
                    return Err(SshError::Cancelled);
                }
                ExecEvent::Msg(msg) => match msg {
                    Some(ChannelMsg::Data { ref data }) => {
                        on_chunk(OutputStream::Stdout, data);
                        append_capped(&mut stdout, data, request.max_capture, &mut stdout_truncated);
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        on_chunk(OutputStream::Stderr, data);
                        append_capped(&mut stderr, data, request.max_capture, &mut stderr_truncated);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit.get_or_insert(ExitStatus::Code(exit_status as i32));
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        exit = Some(ExitStatus::Signal(format!("{signal_name:?}")));
                    }
                    Some(ChannelMsg::Eof) => {}
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        let outcome = ExecOutcome {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit: exit.unwrap_or(ExitStatus::Code(-1)),
            duration_ms: started.elapsed().as_millis() as u64,
            stdout_truncated,
            stderr_truncated,
        };
        debug!(
            "exec finished: exit={} wall={}ms bytes={}+{}",
            outcome.exit,
            outcome.duration_ms,
            outcome.stdout.len(),
            outcome.stderr.len()
        );
        Ok(outcome)
    }

    /// Open an interactive PTY channel.
    ///
    /// Returns a command handle plus the raw output stream and a close
    /// notification; the caller pumps output into the event bus.
    pub async fn open_pty(&mut self, cols: u32, rows: u32) -> Result<PtyStreams, SshError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelClosed(e.to_string()))?;

        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelClosed(e.to_string()))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| SshError::ChannelClosed(e.to_string()))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<PtyCommand>(64);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (closed_tx, closed_rx) = oneshot::channel::<String>();

        tokio::spawn(async move {
            enum PtyEvent {
                Cmd(Option<PtyCommand>),
                Msg(Option<ChannelMsg>),
            }

            let reason;
            loop {
                let event = tokio::select! {
                    cmd = cmd_rx.recv() => PtyEvent::Cmd(cmd),
                    msg = channel.wait() => PtyEvent::Msg(msg),
                };

                match event {
                    PtyEvent::Cmd(Some(PtyCommand::Write(bytes))) => {
                        if channel.data(&bytes[..]).await.is_err() {
                            reason = "write failed".to_string();
                            break;
                        }
                    }
                    PtyEvent::Cmd(Some(PtyCommand::Resize(cols, rows))) => {
                        let _ = channel.window_change(cols, rows, 0, 0).await;
                    }
                    PtyEvent::Cmd(Some(PtyCommand::Close)) | PtyEvent::Cmd(None) => {
                        let _ = channel.close().await;
                        reason = "closed".to_string();
                        break;
                    }
                    PtyEvent::Msg(Some(ChannelMsg::Data { ref data })) => {
                        if out_tx.send(data.to_vec()).await.is_err() {
                            reason = "reader gone".to_string();
                            break;
                        }
                    }
                    PtyEvent::Msg(Some(ChannelMsg::ExtendedData { ref data, .. })) => {
                        if out_tx.send(data.to_vec()).await.is_err() {
                            reason = "reader gone".to_string();
                            break;
                        }
                    }
                    PtyEvent::Msg(Some(ChannelMsg::Close))
                    | PtyEvent::Msg(Some(ChannelMsg::Eof))
                    | PtyEvent::Msg(None) => {
                        reason = "remote closed".to_string();
                        break;
                    }
                    PtyEvent::Msg(Some(_)) => {}
                }
            }
            let _ = closed_tx.send(reason);
        });

        Ok(PtyStreams {
            handle: PtyHandle { cmd_tx },
            output: out_rx,
            closed: closed_rx,
        })
    }

    /// Shut down the client.
    pub async fn close(&mut self, reason: &str) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, reason, "en")
            .await;
    }
}

enum PtyCommand {
    Write(Vec<u8>),
    Resize(u32, u32),
    Close,
}

/// Write/resize/close handle on an open PTY.
#[derive(Clone)]
pub struct PtyHandle {
    cmd_tx: mpsc::Sender<PtyCommand>,
}

impl PtyHandle {
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), SshError> {
        self.cmd_tx
            .send(PtyCommand::Write(bytes))
            .await
            .map_err(|_| SshError::ChannelClosed("pty task gone".to_string()))
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        self.cmd_tx
            .send(PtyCommand::Resize(cols, rows))
            .await
            .map_err(|_| SshError::ChannelClosed("pty task gone".to_string()))
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(PtyCommand::Close).await;
    }
}

/// Everything the caller needs to drive a PTY.
pub struct PtyStreams {
    pub handle: PtyHandle,
    /// Raw output bytes as read from the channel.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Fires once when the channel dies, with a reason.
    pub closed: oneshot::Receiver<String>,
}

fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize, truncated: &mut bool) {
    if buffer.len() >= cap {
        *truncated = true;
        return;
    }
    let room = cap - buffer.len();
    if chunk.len() > room {
        buffer.extend_from_slice(&chunk[..room]);
        *truncated = true;
    } else {
        buffer.extend_from_slice(chunk);
    }
}

/// Await a cancellation edge; pending forever when no signal is attached.
async fn watch_cancel(cancel: &mut Option<tokio::sync::watch::Receiver<bool>>) -> bool {
    match cancel {
        Some(rx) => {
            if *rx.borrow() {
                return true;
            }
            rx.changed().await.is_ok() && *rx.borrow()
        }
        None => std::future::pending().await,
    }
}
