//! Typed events broadcast over the room-scoped bus.
//!
//! The set of event kinds is closed. Every kind is a distinct variant with
//! typed fields; the wire form is `{"event_type": "...", ...payload}` so
//! browsers can dispatch on a single string key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A subscription scope on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Global,
    Session(String),
    Asset(String),
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Room::Global => write!(f, "global"),
            Room::Session(id) => write!(f, "session:{id}"),
            Room::Asset(id) => write!(f, "asset:{id}"),
        }
    }
}

/// Reasoning phase reported alongside AI chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningPhase {
    Analyzing,
    Concluding,
    Generating,
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventKind {
    // ── Session lifecycle ────────────────────────────────────────────────
    #[serde(rename = "session.created")]
    SessionCreated {
        session_id: String,
        asset_id: String,
        analyst_id: String,
    },
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        session_id: String,
        from_state: String,
        to_state: String,
        reason: String,
    },
    #[serde(rename = "session.mode_changed")]
    SessionModeChanged {
        session_id: String,
        from_mode: String,
        to_mode: String,
    },
    #[serde(rename = "session.locked")]
    SessionLocked {
        session_id: String,
        locked_by: String,
    },
    #[serde(rename = "session.unlocked")]
    SessionUnlocked {
        session_id: String,
        unlocked_by: String,
    },
    #[serde(rename = "session.terminated")]
    SessionTerminated { session_id: String, reason: String },

    // ── SSH ──────────────────────────────────────────────────────────────
    #[serde(rename = "ssh.connecting")]
    SshConnecting {
        session_id: String,
        target_host: String,
    },
    #[serde(rename = "ssh.connected")]
    SshConnected {
        session_id: String,
        server_fingerprint: String,
    },
    #[serde(rename = "ssh.disconnected")]
    SshDisconnected { session_id: String, reason: String },
    #[serde(rename = "ssh.error")]
    SshError {
        session_id: String,
        error_code: String,
        message: String,
    },
    #[serde(rename = "ssh.command_started")]
    SshCommandStarted {
        session_id: String,
        command_id: String,
        command: String,
    },
    #[serde(rename = "ssh.command_output")]
    SshCommandOutput {
        session_id: String,
        command_id: String,
        chunk: String,
        stream: String,
    },
    #[serde(rename = "ssh.command_completed")]
    SshCommandCompleted {
        session_id: String,
        command_id: String,
        exit_code: i64,
        duration_ms: u64,
    },

    // ── Terminal (PTY) ───────────────────────────────────────────────────
    #[serde(rename = "terminal.started")]
    TerminalStarted {
        session_id: String,
        cols: u32,
        rows: u32,
    },
    #[serde(rename = "terminal.data")]
    TerminalData {
        session_id: String,
        /// base64-encoded raw ANSI bytes
        data: String,
    },
    #[serde(rename = "terminal.resize")]
    TerminalResize {
        session_id: String,
        cols: u32,
        rows: u32,
    },
    #[serde(rename = "terminal.closed")]
    TerminalClosed { session_id: String, reason: String },

    // ── Hunt ─────────────────────────────────────────────────────────────
    #[serde(rename = "hunt.started")]
    HuntStarted {
        session_id: String,
        hunt_id: String,
        module_id: String,
    },
    #[serde(rename = "hunt.step_started")]
    HuntStepStarted {
        session_id: String,
        hunt_id: String,
        step_id: String,
        description: String,
    },
    #[serde(rename = "hunt.observation")]
    HuntObservation {
        session_id: String,
        hunt_id: String,
        observation_id: String,
        data: Value,
    },
    #[serde(rename = "hunt.step_completed")]
    HuntStepCompleted {
        session_id: String,
        hunt_id: String,
        step_id: String,
    },
    #[serde(rename = "hunt.completed")]
    HuntCompleted {
        session_id: String,
        hunt_id: String,
        findings_count: u32,
    },
    #[serde(rename = "hunt.failed")]
    HuntFailed {
        session_id: String,
        hunt_id: String,
        error: String,
    },
    #[serde(rename = "hunt.cancelled")]
    HuntCancelled { session_id: String, hunt_id: String },

    // ── AI ───────────────────────────────────────────────────────────────
    #[serde(rename = "ai.reasoning_started")]
    AiReasoningStarted {
        session_id: String,
        hunt_id: String,
        context_summary: String,
    },
    #[serde(rename = "ai.reasoning_chunk")]
    AiReasoningChunk {
        session_id: String,
        hunt_id: String,
        chunk: String,
        state: ReasoningPhase,
    },
    #[serde(rename = "ai.reasoning_completed")]
    AiReasoningCompleted {
        session_id: String,
        hunt_id: String,
        summary: String,
    },
    #[serde(rename = "ai.finding_generated")]
    AiFindingGenerated {
        session_id: String,
        hunt_id: String,
        finding_id: String,
        severity: String,
        title: String,
    },
    #[serde(rename = "ai.error")]
    AiError {
        session_id: String,
        error: String,
        retryable: bool,
    },

    // ── Timeline ─────────────────────────────────────────────────────────
    #[serde(rename = "timeline.event_recorded")]
    TimelineEventRecorded {
        asset_id: String,
        event_id: String,
        event_type_name: String,
    },

    // ── System ───────────────────────────────────────────────────────────
    #[serde(rename = "system.error")]
    SystemError {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        component: String,
        error: String,
        severity: String,
    },
    #[serde(rename = "system.backpressure")]
    SystemBackpressure {
        subscriber: String,
        room: String,
        dropped: u64,
    },
}

impl EventKind {
    /// The session this event is scoped to, if any.
    pub fn session_id(&self) -> Option<&str> {
        use EventKind::*;
        match self {
            SessionCreated { session_id, .. }
            | SessionStateChanged { session_id, .. }
            | SessionModeChanged { session_id, .. }
            | SessionLocked { session_id, .. }
            | SessionUnlocked { session_id, .. }
            | SessionTerminated { session_id, .. }
            | SshConnecting { session_id, .. }
            | SshConnected { session_id, .. }
            | SshDisconnected { session_id, .. }
            | SshError { session_id, .. }
            | SshCommandStarted { session_id, .. }
            | SshCommandOutput { session_id, .. }
            | SshCommandCompleted { session_id, .. }
            | TerminalStarted { session_id, .. }
            | TerminalData { session_id, .. }
            | TerminalResize { session_id, .. }
            | TerminalClosed { session_id, .. }
            | HuntStarted { session_id, .. }
            | HuntStepStarted { session_id, .. }
            | HuntObservation { session_id, .. }
            | HuntStepCompleted { session_id, .. }
            | HuntCompleted { session_id, .. }
            | HuntFailed { session_id, .. }
            | HuntCancelled { session_id, .. }
            | AiReasoningStarted { session_id, .. }
            | AiReasoningChunk { session_id, .. }
            | AiReasoningCompleted { session_id, .. }
            | AiFindingGenerated { session_id, .. }
            | AiError { session_id, .. } => Some(session_id.as_str()),
            SystemError { session_id, .. } => session_id.as_deref(),
            TimelineEventRecorded { .. } | SystemBackpressure { .. } => None,
        }
    }

    /// The wire name of this event kind.
    pub fn name(&self) -> &'static str {
        use EventKind::*;
        match self {
            SessionCreated { .. } => "session.created",
            SessionStateChanged { .. } => "session.state_changed",
            SessionModeChanged { .. } => "session.mode_changed",
            SessionLocked { .. } => "session.locked",
            SessionUnlocked { .. } => "session.unlocked",
            SessionTerminated { .. } => "session.terminated",
            SshConnecting { .. } => "ssh.connecting",
            SshConnected { .. } => "ssh.connected",
            SshDisconnected { .. } => "ssh.disconnected",
            SshError { .. } => "ssh.error",
            SshCommandStarted { .. } => "ssh.command_started",
            SshCommandOutput { .. } => "ssh.command_output",
            SshCommandCompleted { .. } => "ssh.command_completed",
            TerminalStarted { .. } => "terminal.started",
            TerminalData { .. } => "terminal.data",
            TerminalResize { .. } => "terminal.resize",
            TerminalClosed { .. } => "terminal.closed",
            HuntStarted { .. } => "hunt.started",
            HuntStepStarted { .. } => "hunt.step_started",
            HuntObservation { .. } => "hunt.observation",
            HuntStepCompleted { .. } => "hunt.step_completed",
            HuntCompleted { .. } => "hunt.completed",
            HuntFailed { .. } => "hunt.failed",
            HuntCancelled { .. } => "hunt.cancelled",
            AiReasoningStarted { .. } => "ai.reasoning_started",
            AiReasoningChunk { .. } => "ai.reasoning_chunk",
            AiReasoningCompleted { .. } => "ai.reasoning_completed",
            AiFindingGenerated { .. } => "ai.finding_generated",
            AiError { .. } => "ai.error",
            TimelineEventRecorded { .. } => "timeline.event_recorded",
            SystemError { .. } => "system.error",
            SystemBackpressure { .. } => "system.backpressure",
        }
    }

    /// Rooms this event is delivered to.
    pub fn rooms(&self) -> Vec<Room> {
        use EventKind::*;
        match self {
            TimelineEventRecorded { asset_id, .. } => vec![Room::Asset(asset_id.clone())],
            SystemBackpressure { .. } => vec![Room::Global],
            SystemError { session_id, .. } => match session_id {
                Some(id) => vec![Room::Session(id.clone()), Room::Global],
                None => vec![Room::Global],
            },
            other => match other.session_id() {
                Some(id) => vec![Room::Session(id.to_string())],
                None => vec![Room::Global],
            },
        }
    }
}

/// An event as carried on the bus: kind plus wall-clock and monotonic stamps.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Bus-assigned publish sequence. Monotonic across the process.
    #[serde(skip)]
    pub seq: u64,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            seq: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_uses_dotted_event_type() {
        let ev = Event::new(EventKind::HuntCompleted {
            session_id: "s1".into(),
            hunt_id: "h1".into(),
            findings_count: 3,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "hunt.completed");
        assert_eq!(json["findings_count"], 3);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn session_events_route_to_session_room() {
        let kind = EventKind::TerminalData {
            session_id: "abc".into(),
            data: "aGk=".into(),
        };
        assert_eq!(kind.rooms(), vec![Room::Session("abc".into())]);
    }

    #[test]
    fn backpressure_routes_to_global() {
        let kind = EventKind::SystemBackpressure {
            subscriber: "ws-1".into(),
            room: "session:abc".into(),
            dropped: 12,
        };
        assert_eq!(kind.rooms(), vec![Room::Global]);
    }

    #[test]
    fn system_error_with_session_also_hits_global() {
        let kind = EventKind::SystemError {
            session_id: Some("s1".into()),
            component: "gateway".into(),
            error: "boom".into(),
            severity: "high".into(),
        };
        let rooms = kind.rooms();
        assert!(rooms.contains(&Room::Session("s1".into())));
        assert!(rooms.contains(&Room::Global));
    }

    #[test]
    fn timeline_routes_to_asset_room() {
        let kind = EventKind::TimelineEventRecorded {
            asset_id: "a1".into(),
            event_id: "e1".into(),
            event_type_name: "hunt.started".into(),
        };
        assert_eq!(kind.rooms(), vec![Room::Asset("a1".into())]);
    }
}
