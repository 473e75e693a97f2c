//! Hunt data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::assets::OsType;
use crate::ssh::ExitStatus;

/// One command in a hunt module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntStep {
    pub id: String,
    pub description: String,
    pub command: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub requires_sudo: bool,
}

fn default_timeout() -> u64 {
    30
}

/// A static hunt module: metadata plus an ordered step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntModule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub os_types: Vec<OsType>,
    pub tags: Vec<String>,
    pub severity_hint: String,
    pub steps: Vec<HuntStep>,
}

impl HuntModule {
    pub fn supports_os(&self, os: OsType) -> bool {
        self.os_types.contains(&os)
    }
}

/// Hunt execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HuntStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for HuntStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HuntStatus::Pending => "PENDING",
            HuntStatus::Running => "RUNNING",
            HuntStatus::Completed => "COMPLETED",
            HuntStatus::Failed => "FAILED",
            HuntStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for HuntStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(HuntStatus::Pending),
            "RUNNING" => Ok(HuntStatus::Running),
            "COMPLETED" => Ok(HuntStatus::Completed),
            "FAILED" => Ok(HuntStatus::Failed),
            "CANCELLED" => Ok(HuntStatus::Cancelled),
            other => Err(format!("unknown hunt status: {other}")),
        }
    }
}

impl TryFrom<String> for HuntStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Captured result of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub hunt_id: String,
    pub step_id: String,
    /// The command as actually sent, after sudo wrapping.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitStatus,
    pub wall_ms: u64,
    #[serde(default)]
    pub truncated: bool,
}

/// A persisted hunt row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HuntRecord {
    pub id: String,
    pub session_id: String,
    pub asset_id: String,
    pub module_id: String,
    pub run_ai: bool,
    #[sqlx(try_from = "String")]
    pub status: HuntStatus,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub findings_count: i64,
    pub error: Option<String>,
    pub ai_report_text: Option<String>,
}

/// Request body for starting a hunt.
#[derive(Debug, Clone, Deserialize)]
pub struct StartHuntRequest {
    pub session_id: String,
    pub module_id: String,
    #[serde(default)]
    pub run_ai: bool,
}
