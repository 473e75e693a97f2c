//! Streaming report assembly and structured-output extraction.

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::events::ReasoningPhase;

use super::schema::{AiFinding, ThreatIndicator};

/// Accumulates streamed chunks into a coherent report and tracks the
/// reasoning phase by content heuristics: `analyzing` until a concluding
/// marker, `concluding` until the first JSON fence, then `generating`.
#[derive(Debug, Default)]
pub struct ReasoningAssembler {
    text: String,
    phase: Option<ReasoningPhase>,
}

const CONCLUDING_MARKERS: &[&str] = &[
    "## remediation",
    "remediation summary",
    "in conclusion",
    "to summarize",
    "based on the evidence",
    "## findings",
    "## key findings",
    "## risk assessment",
    "\n---",
];

impl ReasoningAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a streamed chunk and return the current phase.
    ///
    /// A driver-reported phase wins; otherwise the heuristic applies.
    pub fn add_chunk(&mut self, chunk: &str, reported: Option<ReasoningPhase>) -> ReasoningPhase {
        self.text.push_str(chunk);

        if let Some(phase) = reported {
            self.phase = Some(phase);
            return phase;
        }

        let current = self.phase.unwrap_or(ReasoningPhase::Analyzing);
        let lower = self.text.to_lowercase();
        let next = match current {
            ReasoningPhase::Analyzing => {
                if CONCLUDING_MARKERS.iter().any(|m| lower.contains(m)) {
                    ReasoningPhase::Concluding
                } else {
                    ReasoningPhase::Analyzing
                }
            }
            ReasoningPhase::Concluding => {
                if lower.contains("```json") || lower.contains("\"findings\"") {
                    ReasoningPhase::Generating
                } else {
                    ReasoningPhase::Concluding
                }
            }
            ReasoningPhase::Generating => ReasoningPhase::Generating,
        };
        self.phase = Some(next);
        next
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// First `limit` characters of the assembled text, on a char boundary.
    pub fn summary(&self, limit: usize) -> String {
        self.text.chars().take(limit).collect()
    }
}

/// Extract the last ```json fence from a report.
///
/// The *last* fence is used so code blocks inside the markdown report are
/// not picked up by mistake. An unclosed fence (truncation by token limit)
/// gets a best-effort repair.
pub fn extract_json_block(text: &str) -> Option<String> {
    if let Some(start) = text.rfind("```json") {
        let body = &text[start + 7..];
        return match body.find("```") {
            Some(end) => Some(body[..end].trim().to_string()),
            None => Some(repair_truncated_json(body.trim())),
        };
    }

    // Bare JSON: last top-level object.
    let start = text.rfind("{\"").or_else(|| text.rfind("{\n"))?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}

/// Best-effort repair of JSON cut off mid-stream: close the open string,
/// strip a trailing comma, and balance brackets.
fn repair_truncated_json(raw: &str) -> String {
    let mut repaired = raw.to_string();
    if repaired.matches('"').count() % 2 != 0 {
        repaired.push('"');
    }
    let open_braces = repaired.matches('{').count() as i64 - repaired.matches('}').count() as i64;
    let open_brackets = repaired.matches('[').count() as i64 - repaired.matches(']').count() as i64;
    repaired = repaired.trim_end().trim_end_matches(',').to_string();
    for _ in 0..open_brackets.max(0) {
        repaired.push(']');
    }
    for _ in 0..open_braces.max(0) {
        repaired.push('}');
    }
    repaired
}

static FIELD_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\*\*([a-z &/]+)\*\*\s*:\s*(.+)").expect("field pattern"));
static TECHNIQUE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"T\d{4}(?:\.\d{3})?").expect("technique pattern"));

const SEVERITIES: &[&str] = &["critical", "high", "medium", "low", "info"];
const NON_FINDING_HEADINGS: &[&str] =
    &["remediation summary", "risk assessment", "executive summary"];

/// Fallback parser: recover findings from the markdown report when the JSON
/// block is missing or malformed. Looks for `### Title` sections with
/// labelled `**Severity**:` style fields.
pub fn extract_findings_from_markdown(text: &str) -> Vec<AiFinding> {
    let mut findings = Vec::new();

    for section in text.split("\n### ").skip(1) {
        let mut lines = section.lines();
        let Some(heading) = lines.next() else {
            continue;
        };
        let title = heading.trim().trim_matches('#').trim().to_string();
        if title.is_empty() || NON_FINDING_HEADINGS.contains(&title.to_lowercase().as_str()) {
            continue;
        }

        let body: String = lines.collect::<Vec<_>>().join("\n");
        let mut severity = String::new();
        let mut confidence = 0.5;
        let mut description = String::new();
        let mut technique_ids = Vec::new();
        let mut remediation_raw = String::new();

        for capture in FIELD_LINE.captures_iter(&body) {
            let label = capture[1].to_lowercase();
            let value = capture[2].trim().to_string();
            match label.as_str() {
                "severity" => severity = value.to_lowercase(),
                "confidence" => confidence = parse_confidence(&value),
                "description" => description = value,
                "mitre att&ck" => {
                    technique_ids = TECHNIQUE_ID
                        .find_iter(&value)
                        .map(|m| m.as_str().to_string())
                        .collect();
                }
                "remediation" => remediation_raw = value,
                _ => {}
            }
        }

        if !SEVERITIES.contains(&severity.as_str()) {
            severity = "medium".to_string();
        }
        if description.is_empty() {
            description = title.clone();
        }

        let remediation_steps: Vec<String> = remediation_raw
            .split(';')
            .map(|s| s.trim().trim_start_matches(['-', '*', ' ']).to_string())
            .filter(|s| !s.is_empty())
            .collect();

        findings.push(AiFinding {
            title,
            severity,
            confidence,
            description,
            technique_ids,
            indicators: Vec::<ThreatIndicator>::new(),
            remediation_steps,
            raw_evidence: String::new(),
        });
    }

    if !findings.is_empty() {
        warn!(
            "markdown fallback extracted {} finding(s) from report",
            findings.len()
        );
    }
    findings
}

/// Convert a confidence string like "85%" or "0.85" to a float in [0, 1].
fn parse_confidence(raw: &str) -> f64 {
    let trimmed = raw.trim().trim_end_matches('%');
    match trimmed.parse::<f64>() {
        Ok(v) if v > 1.0 => (v / 100.0).clamp(0.0, 1.0),
        Ok(v) => v.clamp(0.0, 1.0),
        Err(_) => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transitions_follow_content() {
        let mut assembler = ReasoningAssembler::new();
        assert_eq!(
            assembler.add_chunk("Looking at the output of ss -tlnpu, ", None),
            ReasoningPhase::Analyzing
        );
        assert_eq!(
            assembler.add_chunk("\n## Key Findings\n", None),
            ReasoningPhase::Concluding
        );
        assert_eq!(
            assembler.add_chunk("```json\n{", None),
            ReasoningPhase::Generating
        );
        // Phase never regresses.
        assert_eq!(
            assembler.add_chunk("more text", None),
            ReasoningPhase::Generating
        );
    }

    #[test]
    fn driver_reported_phase_wins() {
        let mut assembler = ReasoningAssembler::new();
        assert_eq!(
            assembler.add_chunk("anything", Some(ReasoningPhase::Concluding)),
            ReasoningPhase::Concluding
        );
    }

    #[test]
    fn separator_triggers_concluding() {
        let mut assembler = ReasoningAssembler::new();
        assembler.add_chunk("report body", None);
        assert_eq!(
            assembler.add_chunk("\n---\n", None),
            ReasoningPhase::Concluding
        );
    }

    #[test]
    fn json_block_extraction_prefers_last_fence() {
        let text = "evidence:\n```json\n{\"not\": \"this\"}\n```\nmore\n```json\n{\"findings\": []}\n```";
        assert_eq!(
            extract_json_block(text).unwrap(),
            "{\"findings\": []}"
        );
    }

    #[test]
    fn unclosed_fence_is_repaired() {
        let text = "report\n```json\n{\"findings\": [{\"title\": \"x\", \"severity\": \"low";
        let block = extract_json_block(text).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&block).unwrap();
        assert_eq!(parsed["findings"][0]["title"], "x");
    }

    #[test]
    fn bare_json_is_found() {
        let text = "no fences here\n{\"findings\": [], \"summary\": \"s\"}";
        let block = extract_json_block(text).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&block).is_ok());
    }

    #[test]
    fn markdown_fallback_parses_sections() {
        let report = r#"# Executive Summary
All quiet except one issue.

## Key Findings

### Hidden SSH authorized key
- **Severity**: high
- **Confidence**: 85%
- **MITRE ATT&CK**: T1098.004
- **Description**: An unexpected key was appended to authorized_keys
- **Remediation**: Remove the key; rotate credentials

### Risk Assessment
- **Severity**: none
"#;
        let findings = extract_findings_from_markdown(report);
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.title, "Hidden SSH authorized key");
        assert_eq!(f.severity, "high");
        assert_eq!(f.confidence, 0.85);
        assert_eq!(f.technique_ids, vec!["T1098.004"]);
        assert_eq!(f.remediation_steps.len(), 2);
    }

    #[test]
    fn markdown_fallback_defaults_bad_severity() {
        let report = "### Odd finding\n- **Severity**: catastrophic\n";
        let findings = extract_findings_from_markdown(&format!("\n{report}"));
        assert_eq!(findings[0].severity, "medium");
        assert_eq!(findings[0].description, "Odd finding");
    }

    #[test]
    fn summary_respects_char_boundary() {
        let mut assembler = ReasoningAssembler::new();
        assembler.add_chunk("héllo wörld", None);
        assert_eq!(assembler.summary(5), "héllo");
    }
}
