//! Structured output schema for AI analysis.

use serde::{Deserialize, Serialize};

/// An indicator of compromise surfaced by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIndicator {
    /// ip, domain, hash, file_path, user, process
    #[serde(rename = "type")]
    pub indicator_type: String,
    pub value: String,
    #[serde(default)]
    pub context: String,
}

/// One finding from the model's trailing JSON block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiFinding {
    pub title: String,
    /// critical, high, medium, low, info
    pub severity: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
    /// MITRE ATT&CK technique ids.
    #[serde(default)]
    pub technique_ids: Vec<String>,
    #[serde(default)]
    pub indicators: Vec<ThreatIndicator>,
    #[serde(default)]
    pub remediation_steps: Vec<String>,
    #[serde(default)]
    pub raw_evidence: String,
}

fn default_confidence() -> f64 {
    0.5
}

/// The full structured analysis result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiAnalysisResult {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<AiFinding>,
    #[serde(default)]
    pub overall_risk: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_model_json() {
        let json = r#"{
            "summary": "one issue",
            "overall_risk": "high",
            "findings": [{
                "title": "Reverse shell in cron",
                "severity": "high",
                "confidence": 0.9,
                "description": "d",
                "technique_ids": ["T1053.003"],
                "indicators": [{"type": "ip", "value": "203.0.113.9", "context": "c"}],
                "remediation_steps": ["Remove the cron entry"],
                "raw_evidence": "* * * * * bash -i"
            }]
        }"#;
        let result: AiAnalysisResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].indicators[0].indicator_type, "ip");
    }

    #[test]
    fn missing_optionals_default() {
        let json = r#"{"findings": [{"title": "t", "severity": "low"}]}"#;
        let result: AiAnalysisResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.findings[0].confidence, 0.5);
        assert!(result.findings[0].technique_ids.is_empty());
    }
}
