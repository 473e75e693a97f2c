//! Intelligence store: findings, timeline, STIX, remediation.

pub mod fingerprint;
mod models;
pub mod remediation;
pub mod stix;
mod store;
mod timeline;

pub use models::{
    Finding, FindingKind, FindingStatus, NewFinding, Remediation, Severity, TimelineEvent,
};
pub use store::{FindingStore, UpsertOutcome};
pub use timeline::TimelineRecorder;
