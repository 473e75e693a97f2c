//! Structuring of AI remediation guidance.

use super::models::Remediation;
use crate::ai::schema::AiFinding;

const IMMEDIATE_KEYWORDS: &[&str] = &[
    "remove", "delete", "kill", "disable", "revoke", "block", "stop", "isolate",
];
const LONG_TERM_KEYWORDS: &[&str] = &[
    "implement", "deploy", "configure", "monitor", "review policy", "audit", "harden",
];

/// Classify remediation steps into immediate / short-term / long-term
/// buckets by keyword. Steps matching neither set land in short-term.
pub fn structure_remediation(finding: &AiFinding) -> Remediation {
    let mut remediation = Remediation::default();

    for step in &finding.remediation_steps {
        let lower = step.to_lowercase();
        if IMMEDIATE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            remediation.immediate_actions.push(step.clone());
        } else if LONG_TERM_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            remediation.long_term_actions.push(step.clone());
        } else {
            remediation.short_term_actions.push(step.clone());
        }
    }

    remediation
}
