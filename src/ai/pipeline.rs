//! Streaming AI analysis of completed hunts.
//!
//! Builds a deterministic context from the hunt's observations, streams the
//! driver's report as `ai.reasoning_chunk` events, persists the report text
//! on the hunt row, and upserts extracted findings into the store.

use futures::StreamExt;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::events::{EventBus, EventKind, ReasoningPhase};
use crate::hunt::{HuntModule, HuntRepository, Observation};
use crate::intelligence::{
    remediation, stix, FindingKind, FindingStore, NewFinding, Severity, TimelineRecorder,
};

use super::confidence::{normalize_confidence, severity_confidence_floor};
use super::driver::{AiDriver, AiDriverError};
use super::reasoning::ReasoningAssembler;
use super::AiSettings;

/// Responses longer than this are truncated before parsing.
const MAX_REPORT_LENGTH: usize = 64 * 1024;

/// Chunks are batched on the bus at this interval.
const CHUNK_BATCH_INTERVAL: Duration = Duration::from_millis(150);

const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(2)];

/// What the pipeline produced for one hunt.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub findings_count: u32,
    /// Whether the stream ran to completion. A false value with a
    /// non-empty report means a preserved partial report.
    pub completed: bool,
    pub error: Option<String>,
}

/// The AI analysis pipeline.
pub struct AiPipeline {
    driver: Arc<dyn AiDriver>,
    bus: Arc<EventBus>,
    hunts: HuntRepository,
    store: FindingStore,
    timeline: TimelineRecorder,
    settings: AiSettings,
}

impl AiPipeline {
    pub fn new(
        driver: Arc<dyn AiDriver>,
        bus: Arc<EventBus>,
        hunts: HuntRepository,
        store: FindingStore,
        timeline: TimelineRecorder,
        settings: AiSettings,
    ) -> Self {
        Self {
            driver,
            bus,
            hunts,
            store,
            timeline,
            settings,
        }
    }

    /// Analyze a completed hunt's observations.
    pub async fn analyze(
        &self,
        session_id: &str,
        hunt_id: &str,
        asset_id: &str,
        analyst_id: &str,
        module: &HuntModule,
        observations: &[Observation],
    ) -> PipelineOutcome {
        let context = build_context(
            module,
            observations,
            self.settings.per_step_budget,
            self.settings.context_budget,
        );

        self.bus.publish(EventKind::AiReasoningStarted {
            session_id: session_id.to_string(),
            hunt_id: hunt_id.to_string(),
            context_summary: context.chars().take(256).collect(),
        });

        let (report, stream_error) = self.stream_with_retry(session_id, hunt_id, &context).await;

        // Preserve whatever was produced, partial or complete.
        if !report.is_empty() {
            if let Err(err) = self.hunts.save_report(hunt_id, &report).await {
                warn!("failed to persist ai report for hunt {hunt_id}: {err}");
            } else {
                info!(
                    "persisted ai report ({} bytes) for hunt {}",
                    report.len(),
                    hunt_id
                );
            }
        }

        if let Some(error) = stream_error {
            self.bus.publish(EventKind::AiError {
                session_id: session_id.to_string(),
                error: error.to_string(),
                retryable: false,
            });
            return PipelineOutcome {
                findings_count: 0,
                completed: false,
                error: Some(error.to_string()),
            };
        }

        self.bus.publish(EventKind::AiReasoningCompleted {
            session_id: session_id.to_string(),
            hunt_id: hunt_id.to_string(),
            summary: self.driver.summarize(&report),
        });

        let result = self.driver.extract_findings(&report);
        let mut findings_count = 0;

        for ai_finding in &result.findings {
            let severity: Severity = ai_finding.severity.parse().unwrap_or_default();
            let confidence = normalize_confidence(ai_finding.confidence)
                .max(severity_confidence_floor(&ai_finding.severity));

            let bundle = stix::build_bundle(ai_finding);
            let stix_bundle = match stix::validate_bundle(&bundle) {
                Ok(()) => Some(bundle),
                Err(err) => {
                    warn!("stix bundle invalid for '{}': {err}", ai_finding.title);
                    None
                }
            };

            let upsert = self
                .store
                .upsert(NewFinding {
                    asset_id: asset_id.to_string(),
                    session_id: session_id.to_string(),
                    hunt_id: Some(hunt_id.to_string()),
                    kind: FindingKind::Detection,
                    title: ai_finding.title.clone(),
                    severity,
                    confidence,
                    tags: module.tags.clone(),
                    technique_ids: ai_finding.technique_ids.clone(),
                    stix_bundle,
                    remediation: Some(remediation::structure_remediation(ai_finding)),
                    evidence: ai_finding.raw_evidence.clone(),
                })
                .await;

            let outcome = match upsert {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("failed to persist finding '{}': {err}", ai_finding.title);
                    continue;
                }
            };

            findings_count += 1;
            self.bus.publish(EventKind::AiFindingGenerated {
                session_id: session_id.to_string(),
                hunt_id: hunt_id.to_string(),
                finding_id: outcome.finding.id.clone(),
                severity: outcome.finding.severity.to_string(),
                title: outcome.finding.title.clone(),
            });

            if let Err(err) = self
                .timeline
                .record(
                    asset_id,
                    "ai.finding_generated",
                    analyst_id,
                    serde_json::json!({
                        "finding_id": outcome.finding.id,
                        "title": outcome.finding.title,
                        "severity": outcome.finding.severity.to_string(),
                        "new": outcome.created,
                    }),
                    Some(session_id),
                )
                .await
            {
                warn!("timeline record failed for finding: {err}");
            }
        }

        PipelineOutcome {
            findings_count,
            completed: true,
            error: None,
        }
    }

    /// Run the stream, retrying only while nothing has been emitted yet.
    /// Returns the assembled report and the terminal error, if any.
    async fn stream_with_retry(
        &self,
        session_id: &str,
        hunt_id: &str,
        context: &str,
    ) -> (String, Option<AiDriverError>) {
        let mut attempt = 0;
        loop {
            let mut assembler = ReasoningAssembler::new();
            let result = self
                .consume_stream(session_id, hunt_id, context, &mut assembler)
                .await;

            let mut report = assembler.text().to_string();
            if report.len() > MAX_REPORT_LENGTH {
                warn!(
                    "ai report too long ({} bytes) for hunt {hunt_id}, truncating",
                    report.len()
                );
                report = truncate_on_boundary(&report, MAX_REPORT_LENGTH);
            }

            match result {
                Ok(()) => return (report, None),
                Err(err) if report.is_empty() && err.is_retryable() && attempt < RETRY_BACKOFF.len() => {
                    warn!(
                        "ai stream attempt {} failed ({err}), retrying",
                        attempt + 1
                    );
                    tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return (report, Some(err)),
            }
        }
    }

    async fn consume_stream(
        &self,
        session_id: &str,
        hunt_id: &str,
        context: &str,
        assembler: &mut ReasoningAssembler,
    ) -> Result<(), AiDriverError> {
        let idle = Duration::from_secs(self.settings.idle_timeout_secs);
        let mut stream = self
            .driver
            .stream_report(system_prompt(), context, self.settings.max_tokens)
            .await?;

        let mut batch = String::new();
        let mut phase = ReasoningPhase::Analyzing;
        let mut last_flush = Instant::now();

        let flush = |batch: &mut String, phase: ReasoningPhase| {
            if batch.is_empty() {
                return;
            }
            self.bus.publish(EventKind::AiReasoningChunk {
                session_id: session_id.to_string(),
                hunt_id: hunt_id.to_string(),
                chunk: std::mem::take(batch),
                state: phase,
            });
        };

        loop {
            let next = tokio::time::timeout(idle, stream.next())
                .await
                .map_err(|_| {
                    flush(&mut batch, phase);
                    AiDriverError::IdleTimeout
                });
            let next = match next {
                Ok(next) => next,
                Err(err) => return Err(err),
            };

            match next {
                Some(Ok(chunk)) => {
                    phase = assembler.add_chunk(&chunk.text, chunk.phase);
                    batch.push_str(&chunk.text);
                    if last_flush.elapsed() >= CHUNK_BATCH_INTERVAL {
                        flush(&mut batch, phase);
                        last_flush = Instant::now();
                    }
                }
                Some(Err(err)) => {
                    flush(&mut batch, phase);
                    return Err(err);
                }
                None => {
                    flush(&mut batch, phase);
                    return Ok(());
                }
            }
        }
    }
}

fn system_prompt() -> &'static str {
    r#"You are an expert threat hunter analyzing command output captured over SSH from a remote host.

Your task:
1. Analyze the provided command outputs for signs of compromise, persistence, lateral movement, or other threats
2. Identify specific indicators of compromise
3. Produce a clear Markdown executive report
4. Provide actionable remediation steps

Structure the report as: # Executive Summary, ## Risk Assessment, ## Key Findings (one `### Title` subsection per finding with **Severity**, **Confidence**, **MITRE ATT&CK**, **Description**, **Indicators**, **Evidence**, **Remediation** fields), ## Remediation Summary.

After the report, append a machine-readable block wrapped in ```json fences:

{"summary": "...", "overall_risk": "critical|high|medium|low|info", "findings": [{"title": "...", "severity": "...", "confidence": 0.0, "description": "...", "technique_ids": ["T1053.005"], "indicators": [{"type": "ip|domain|hash|file_path|user|process", "value": "...", "context": "..."}], "remediation_steps": ["..."], "raw_evidence": "..."}]}

If nothing suspicious is found, state that clearly and return an empty findings array with overall_risk "info"."#
}

/// Deterministic serialization of module metadata and per-step results.
///
/// Outputs are clipped to `per_step_budget` bytes each, then the whole
/// context is brought under `context_budget` by trimming the largest step
/// outputs first.
pub fn build_context(
    module: &HuntModule,
    observations: &[Observation],
    per_step_budget: usize,
    context_budget: usize,
) -> String {
    let mut outputs: Vec<String> = observations
        .iter()
        .map(|obs| truncate_on_boundary(&obs.stdout, per_step_budget))
        .collect();

    // Global budget: shrink the largest outputs first until it fits.
    let header_cost = 256 * observations.len().max(1);
    loop {
        let total: usize = outputs.iter().map(String::len).sum();
        if total + header_cost <= context_budget {
            break;
        }
        let Some(largest) = (0..outputs.len()).max_by_key(|&i| outputs[i].len()) else {
            break;
        };
        if outputs[largest].is_empty() {
            break;
        }
        let new_len = outputs[largest].len() / 2;
        outputs[largest] = truncate_on_boundary(&outputs[largest], new_len);
    }

    let mut parts = vec![format!("# Hunt Module: {}\n{}", module.name, module.description)];
    for (obs, output) in observations.iter().zip(outputs.iter()) {
        let step_description = module
            .steps
            .iter()
            .find(|s| s.id == obs.step_id)
            .map(|s| s.description.as_str())
            .unwrap_or("");
        let mut section = format!(
            "\n## Step: {}\n{}\n**Command**: `{}`\n**Exit**: {}",
            obs.step_id, step_description, obs.command, obs.exit
        );
        if !output.is_empty() {
            section.push_str(&format!("\n**stdout**:\n```\n{output}\n```"));
        }
        if !obs.stderr.is_empty() {
            let stderr = truncate_on_boundary(&obs.stderr, 512);
            section.push_str(&format!("\n**stderr**:\n```\n{stderr}\n```"));
        }
        parts.push(section);
    }

    parts.join("\n")
}

fn truncate_on_boundary(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
