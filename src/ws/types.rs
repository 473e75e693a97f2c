//! Client → server frames on the real-time gateway.
//!
//! Server → client frames are bus events in their wire form
//! (`{"event_type": ..., ...}`), serialized straight from [`crate::events::Event`].

use serde::Deserialize;

use crate::session::SessionMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinSession {
        session_id: String,
    },
    LeaveSession {
        session_id: String,
    },
    TerminalInput {
        session_id: String,
        /// base64-encoded keystrokes
        data: String,
    },
    TerminalResize {
        session_id: String,
        cols: u32,
        rows: u32,
    },
    ToggleMode {
        session_id: String,
        mode: SessionMode,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type": "join_session", "session_id": "s1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::JoinSession { session_id } if session_id == "s1"));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type": "terminal_input", "session_id": "s1", "data": "bHMK"}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::TerminalInput { .. }));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type": "toggle_mode", "session_id": "s1", "mode": "interactive"}"#,
        )
        .unwrap();
        assert!(
            matches!(frame, ClientFrame::ToggleMode { mode, .. } if mode == SessionMode::Interactive)
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type": "subscribe"}"#).is_err());
    }
}
