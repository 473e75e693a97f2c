//! Finding fingerprints for deduplication.
//!
//! The fingerprint hashes the stable identity of a finding: its kind, a
//! normalized title, and the sorted MITRE technique ids. The asset id is
//! deliberately excluded; dedup queries on `(asset_id, fingerprint)` so the
//! same finding on two assets stays two records.

use sha2::{Digest, Sha256};

use super::models::FindingKind;

/// Compute the deduplication fingerprint for a finding.
pub fn compute(kind: FindingKind, title: &str, technique_ids: &[String]) -> String {
    let mut techniques: Vec<&str> = technique_ids.iter().map(String::as_str).collect();
    techniques.sort_unstable();

    let normalized_title = title.trim().to_lowercase();
    let input = format!("{kind}|{normalized_title}|{}", techniques.join(","));

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
