//! Intelligence data models.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Finding severity. Ordered so dedup can promote monotonically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Workflow status of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    #[default]
    Open,
    Acknowledged,
    Resolved,
}

impl std::fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingStatus::Open => write!(f, "open"),
            FindingStatus::Acknowledged => write!(f, "acknowledged"),
            FindingStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl std::str::FromStr for FindingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(FindingStatus::Open),
            "acknowledged" => Ok(FindingStatus::Acknowledged),
            "resolved" => Ok(FindingStatus::Resolved),
            other => Err(format!("unknown finding status: {other}")),
        }
    }
}

impl TryFrom<String> for FindingStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Kind of intelligence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    AiReport,
    #[default]
    Detection,
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingKind::AiReport => write!(f, "ai_report"),
            FindingKind::Detection => write!(f, "detection"),
        }
    }
}

impl std::str::FromStr for FindingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_report" => Ok(FindingKind::AiReport),
            "detection" => Ok(FindingKind::Detection),
            other => Err(format!("unknown finding kind: {other}")),
        }
    }
}

impl TryFrom<String> for FindingKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Structured remediation guidance: three ordered action lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Remediation {
    pub immediate_actions: Vec<String>,
    pub short_term_actions: Vec<String>,
    pub long_term_actions: Vec<String>,
}

/// A persisted intelligence record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Finding {
    pub id: String,
    pub asset_id: String,
    pub session_id: String,
    pub hunt_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub kind: FindingKind,
    pub title: String,
    #[sqlx(try_from = "String")]
    pub severity: Severity,
    pub confidence: f64,
    #[sqlx(try_from = "String")]
    pub status: FindingStatus,
    pub fingerprint: String,
    pub sighting_count: i64,
    pub first_seen: String,
    pub last_seen: String,
    pub tags: Json<Vec<String>>,
    pub technique_ids: Json<Vec<String>>,
    pub stix_bundle: Option<Json<serde_json::Value>>,
    pub remediation: Option<Json<Remediation>>,
    pub evidence: String,
}

/// Input to the upsert operation.
#[derive(Debug, Clone)]
pub struct NewFinding {
    pub asset_id: String,
    pub session_id: String,
    pub hunt_id: Option<String>,
    pub kind: FindingKind,
    pub title: String,
    pub severity: Severity,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub technique_ids: Vec<String>,
    pub stix_bundle: Option<serde_json::Value>,
    pub remediation: Option<Remediation>,
    pub evidence: String,
}

/// An append-only timeline entry for an asset.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TimelineEvent {
    pub id: String,
    pub asset_id: String,
    pub session_id: Option<String>,
    pub event_type: String,
    pub payload: Json<serde_json::Value>,
    pub occurred_at: String,
    pub analyst_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_supports_promotion() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
        assert_eq!(Severity::High.max(Severity::Low), Severity::High);
    }

    #[test]
    fn enums_round_trip() {
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!(
            "acknowledged".parse::<FindingStatus>().unwrap(),
            FindingStatus::Acknowledged
        );
        assert_eq!(
            "ai_report".parse::<FindingKind>().unwrap(),
            FindingKind::AiReport
        );
        assert!("severe".parse::<Severity>().is_err());
    }
}
