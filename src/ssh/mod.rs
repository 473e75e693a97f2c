//! SSH connectivity: one client per active session, exec and PTY channels.

pub mod connector;
pub mod os_detect;
pub mod pty;

pub use connector::{ConnectParams, PtyHandle, PtyStreams, SshClient, SshSettings};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// SSH error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum SshError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("host key mismatch: pinned {pinned}, presented {presented}")]
    HostKeyMismatch { pinned: String, presented: String },
    #[error("connection timed out")]
    Timeout,
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("command timed out after {0}s")]
    ExecTimeout(u64),
    #[error("command blocked by safety classifier: {0}")]
    CommandBlocked(String),
    #[error("command requires analyst approval: {0}")]
    CommandSuspect(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("ssh protocol error: {0}")]
    Protocol(String),
}

impl SshError {
    /// Errors that kill the whole client, not just one channel.
    pub fn is_fatal_to_client(&self) -> bool {
        matches!(
            self,
            SshError::Unreachable(_) | SshError::Timeout | SshError::ChannelClosed(_)
        )
    }
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// How a command finished. Serialized as the numeric exit code, or as
/// `"timeout"`, `"signal"`, `"skipped:<reason>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Timeout,
    Signal(String),
    Skipped(String),
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// Numeric form for events that carry an integer exit code.
    pub fn as_code(&self) -> i64 {
        match self {
            ExitStatus::Code(c) => *c as i64,
            _ => -1,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "{c}"),
            ExitStatus::Timeout => write!(f, "timeout"),
            ExitStatus::Signal(_) => write!(f, "signal"),
            ExitStatus::Skipped(reason) => write!(f, "skipped:{reason}"),
        }
    }
}

impl Serialize for ExitStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ExitStatus::Code(c) => serializer.serialize_i32(*c),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ExitStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Number(n) => {
                let code = n
                    .as_i64()
                    .ok_or_else(|| D::Error::custom("exit code out of range"))?;
                Ok(ExitStatus::Code(code as i32))
            }
            serde_json::Value::String(s) => {
                if s == "timeout" {
                    Ok(ExitStatus::Timeout)
                } else if s == "signal" {
                    Ok(ExitStatus::Signal(String::new()))
                } else if let Some(reason) = s.strip_prefix("skipped:") {
                    Ok(ExitStatus::Skipped(reason.to_string()))
                } else {
                    Err(D::Error::custom(format!("unknown exit status: {s}")))
                }
            }
            other => Err(D::Error::custom(format!(
                "unexpected exit status value: {other}"
            ))),
        }
    }
}

/// A single command execution request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub timeout: Duration,
    /// Data piped to the remote stdin (sudo password), followed by EOF.
    pub stdin: Option<String>,
    /// Whether SUSPECT-classified commands may run.
    pub allow_suspect: bool,
    /// Per-stream capture cap in bytes.
    pub max_capture: usize,
    /// Cooperative cancellation signal.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            stdin: None,
            allow_suspect: false,
            max_capture: 256 * 1024,
            cancel: None,
        }
    }
}

/// Captured result of one command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitStatus,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}
