//! STIX 2.1 bundle construction for findings.

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ai::schema::AiFinding;

fn stix_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Build a STIX 2.1 bundle from a finding: one indicator, one
/// attack-pattern per MITRE technique, `indicates` relationships, and a
/// report referencing everything.
pub fn build_bundle(finding: &AiFinding) -> Value {
    let bundle_id = format!("bundle--{}", Uuid::new_v4());
    let indicator_id = format!("indicator--{}", Uuid::new_v4());
    let now = stix_now();

    let mut objects: Vec<Value> = Vec::new();

    let mut patterns: Vec<String> = Vec::new();
    for ioc in &finding.indicators {
        match ioc.indicator_type.as_str() {
            "ip" => patterns.push(format!("[ipv4-addr:value = '{}']", ioc.value)),
            "domain" => patterns.push(format!("[domain-name:value = '{}']", ioc.value)),
            "hash" => match ioc.value.len() {
                32 => patterns.push(format!("[file:hashes.MD5 = '{}']", ioc.value)),
                40 => patterns.push(format!("[file:hashes.SHA-1 = '{}']", ioc.value)),
                64 => patterns.push(format!("[file:hashes.SHA-256 = '{}']", ioc.value)),
                _ => {}
            },
            "file_path" => patterns.push(format!("[file:name = '{}']", ioc.value)),
            _ => {}
        }
    }
    let pattern = if patterns.is_empty() {
        "[ipv4-addr:value = '0.0.0.0']".to_string()
    } else {
        patterns.join(" OR ")
    };

    objects.push(json!({
        "type": "indicator",
        "spec_version": "2.1",
        "id": indicator_id,
        "created": now,
        "modified": now,
        "name": finding.title,
        "description": finding.description,
        "indicator_types": ["malicious-activity"],
        "pattern": pattern,
        "pattern_type": "stix",
        "valid_from": now,
        "confidence": (finding.confidence * 100.0) as i64,
        "labels": finding.technique_ids,
    }));

    let mut attack_pattern_ids = Vec::new();
    for technique_id in &finding.technique_ids {
        let ap_id = format!("attack-pattern--{}", Uuid::new_v4());
        objects.push(json!({
            "type": "attack-pattern",
            "spec_version": "2.1",
            "id": ap_id,
            "created": now,
            "modified": now,
            "name": technique_id,
            "external_references": [{
                "source_name": "mitre-attack",
                "external_id": technique_id,
                "url": format!(
                    "https://attack.mitre.org/techniques/{}",
                    technique_id.replace('.', "/")
                ),
            }],
        }));
        attack_pattern_ids.push(ap_id);
    }

    for ap_id in &attack_pattern_ids {
        objects.push(json!({
            "type": "relationship",
            "spec_version": "2.1",
            "id": format!("relationship--{}", Uuid::new_v4()),
            "created": now,
            "modified": now,
            "relationship_type": "indicates",
            "source_ref": indicator_id,
            "target_ref": ap_id,
        }));
    }

    let object_refs: Vec<Value> = objects
        .iter()
        .map(|o| o["id"].clone())
        .collect();
    objects.push(json!({
        "type": "report",
        "spec_version": "2.1",
        "id": format!("report--{}", Uuid::new_v4()),
        "created": now,
        "modified": now,
        "name": finding.title,
        "description": finding.description,
        "published": now,
        "report_types": ["threat-report"],
        "object_refs": object_refs,
        "confidence": (finding.confidence * 100.0) as i64,
        "labels": [finding.severity],
    }));

    json!({
        "type": "bundle",
        "id": bundle_id,
        "spec_version": "2.1",
        "objects": objects,
    })
}

/// Minimal structural validation of a produced bundle.
pub fn validate_bundle(bundle: &Value) -> Result<(), String> {
    if bundle["type"] != "bundle" {
        return Err("missing bundle type".to_string());
    }
    let Some(id) = bundle["id"].as_str() else {
        return Err("missing bundle id".to_string());
    };
    if !id.starts_with("bundle--") {
        return Err(format!("malformed bundle id: {id}"));
    }
    let Some(objects) = bundle["objects"].as_array() else {
        return Err("missing objects array".to_string());
    };
    for object in objects {
        for field in ["type", "id", "created", "modified"] {
            if object[field].is_null() {
                return Err(format!("object missing required field {field}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::schema::ThreatIndicator;

    fn finding() -> AiFinding {
        AiFinding {
            title: "Persistence via cron".into(),
            severity: "high".into(),
            confidence: 0.85,
            description: "Hidden reverse shell in crontab".into(),
            technique_ids: vec!["T1053.003".into()],
            indicators: vec![
                ThreatIndicator {
                    indicator_type: "ip".into(),
                    value: "203.0.113.9".into(),
                    context: String::new(),
                },
                ThreatIndicator {
                    indicator_type: "file_path".into(),
                    value: "/tmp/.hidden.sh".into(),
                    context: String::new(),
                },
            ],
            remediation_steps: vec![],
            raw_evidence: String::new(),
        }
    }

    #[test]
    fn bundle_is_valid_and_patterned() {
        let bundle = build_bundle(&finding());
        validate_bundle(&bundle).unwrap();

        let indicator = &bundle["objects"][0];
        assert_eq!(indicator["type"], "indicator");
        let pattern = indicator["pattern"].as_str().unwrap();
        assert!(pattern.contains("ipv4-addr:value = '203.0.113.9'"));
        assert!(pattern.contains("file:name = '/tmp/.hidden.sh'"));
        assert_eq!(indicator["confidence"], 85);
    }

    #[test]
    fn techniques_produce_attack_patterns_and_relationships() {
        let bundle = build_bundle(&finding());
        let objects = bundle["objects"].as_array().unwrap();
        let types: Vec<&str> = objects
            .iter()
            .map(|o| o["type"].as_str().unwrap())
            .collect();
        assert!(types.contains(&"attack-pattern"));
        assert!(types.contains(&"relationship"));
        assert_eq!(types.last(), Some(&"report"));
    }

    #[test]
    fn empty_indicators_fall_back_to_placeholder_pattern() {
        let mut f = finding();
        f.indicators.clear();
        let bundle = build_bundle(&f);
        assert_eq!(
            bundle["objects"][0]["pattern"],
            "[ipv4-addr:value = '0.0.0.0']"
        );
    }

    #[test]
    fn validator_rejects_malformed() {
        assert!(validate_bundle(&json!({"type": "bundle"})).is_err());
        assert!(validate_bundle(&json!({
            "type": "bundle",
            "id": "bundle--x",
            "objects": [{"type": "indicator"}],
        }))
        .is_err());
    }
}
