//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::state::SessionState;

/// How the analyst is driving the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Scripted hunts over exec channels.
    #[default]
    Ai,
    /// Interactive PTY.
    Interactive,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Ai => write!(f, "ai"),
            SessionMode::Interactive => write!(f, "interactive"),
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ai" => Ok(SessionMode::Ai),
            "interactive" => Ok(SessionMode::Interactive),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

impl TryFrom<String> for SessionMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A persisted session row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub asset_id: String,
    pub analyst_id: String,
    #[sqlx(try_from = "String")]
    pub state: SessionState,
    #[sqlx(try_from = "String")]
    pub mode: SessionMode,
    pub locked_by: Option<String>,
    pub created_at: String,
    pub terminated_at: Option<String>,
}

impl SessionRecord {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Request body for creating a session.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub asset_id: String,
    #[serde(default)]
    pub mode: SessionMode,
}

/// Live view of a session held by the manager; updated only by the owner task.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub asset_id: String,
    pub analyst_id: String,
    pub state: SessionState,
    pub mode: SessionMode,
    pub locked_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips() {
        assert_eq!("ai".parse::<SessionMode>().unwrap(), SessionMode::Ai);
        assert_eq!(
            "interactive".parse::<SessionMode>().unwrap(),
            SessionMode::Interactive
        );
        assert!("pty".parse::<SessionMode>().is_err());
    }
}
