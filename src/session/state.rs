//! Session state machine.
//!
//! INITIALIZING → CONNECTING → CONNECTED → RUNNING ↔ PAUSED ↔ LOCKED,
//! terminal states DISCONNECTED → (retry) | FAILED | TERMINATED.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Initializing,
    Connecting,
    Connected,
    Running,
    Paused,
    Locked,
    Disconnected,
    Failed,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Terminated)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Initializing => "INITIALIZING",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Running => "RUNNING",
            SessionState::Paused => "PAUSED",
            SessionState::Locked => "LOCKED",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Failed => "FAILED",
            SessionState::Terminated => "TERMINATED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INITIALIZING" => Ok(SessionState::Initializing),
            "CONNECTING" => Ok(SessionState::Connecting),
            "CONNECTED" => Ok(SessionState::Connected),
            "RUNNING" => Ok(SessionState::Running),
            "PAUSED" => Ok(SessionState::Paused),
            "LOCKED" => Ok(SessionState::Locked),
            "DISCONNECTED" => Ok(SessionState::Disconnected),
            "FAILED" => Ok(SessionState::Failed),
            "TERMINATED" => Ok(SessionState::Terminated),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

impl TryFrom<String> for SessionState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session state transition: {from} → {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Validate a state transition against the session FSM.
///
/// `close` may move any non-terminal state to TERMINATED; every other edge
/// must appear in the transition table.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), InvalidTransition> {
    use SessionState::*;

    if to == Terminated && !from.is_terminal() {
        return Ok(());
    }

    let allowed: &[SessionState] = match from {
        Initializing => &[Connecting],
        Connecting => &[Connected, Failed],
        Connected => &[Running],
        Running => &[Paused, Locked, Disconnected],
        Paused => &[Running, Disconnected],
        Locked => &[Running, Disconnected],
        Disconnected => &[Connecting, Failed],
        Failed | Terminated => &[],
    };

    if allowed.contains(&to) {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn happy_path_walk_is_valid() {
        let walk = [Initializing, Connecting, Connected, Running, Terminated];
        for pair in walk.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{pair:?}");
        }
    }

    #[test]
    fn lock_and_pause_cycle() {
        assert!(validate_transition(Running, Locked).is_ok());
        assert!(validate_transition(Locked, Running).is_ok());
        assert!(validate_transition(Running, Paused).is_ok());
        assert!(validate_transition(Paused, Running).is_ok());
    }

    #[test]
    fn disconnect_retry_loop() {
        assert!(validate_transition(Running, Disconnected).is_ok());
        assert!(validate_transition(Disconnected, Connecting).is_ok());
        assert!(validate_transition(Disconnected, Failed).is_ok());
    }

    #[test]
    fn no_jumps() {
        assert!(validate_transition(Initializing, Running).is_err());
        assert!(validate_transition(Connected, Locked).is_err());
        assert!(validate_transition(Paused, Locked).is_err());
        assert!(validate_transition(Connecting, Running).is_err());
    }

    #[test]
    fn close_from_any_non_terminal() {
        for from in [
            Initializing,
            Connecting,
            Connected,
            Running,
            Paused,
            Locked,
            Disconnected,
        ] {
            assert!(validate_transition(from, Terminated).is_ok(), "{from}");
        }
    }

    #[test]
    fn terminal_states_are_sinks() {
        for to in [Connecting, Running, Terminated] {
            assert!(validate_transition(Failed, to).is_err());
            assert!(validate_transition(Terminated, to).is_err());
        }
    }

    #[test]
    fn string_round_trip() {
        for state in [Initializing, Running, Locked, Terminated] {
            assert_eq!(state.to_string().parse::<SessionState>().unwrap(), state);
        }
    }
}
