//! AI drivers: the streaming/extraction contract and its three backends.
//!
//! All backends speak the same three-method contract; the runtime picks one
//! by configuration at start-up. Anthropic uses its native messages API,
//! OpenAI-compatible servers use `/chat/completions`, and Ollama is the
//! OpenAI-compatible driver pointed at the local `/v1` endpoint.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use serde_json::{json, Value};
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::events::ReasoningPhase;

use super::reasoning;
use super::schema::AiAnalysisResult;
use super::{AiSettings, ProviderSettings};

/// One streamed chunk of the report.
#[derive(Debug, Clone)]
pub struct ReportChunk {
    pub text: String,
    /// Driver-reported phase; `None` means the heuristic decides.
    pub phase: Option<ReasoningPhase>,
}

#[derive(Debug, Clone, Error)]
pub enum AiDriverError {
    #[error("ai provider rate limited")]
    RateLimited,
    #[error("ai provider unavailable: {0}")]
    Unavailable(String),
    #[error("ai transport error: {0}")]
    Transport(String),
    #[error("ai stream idle timeout")]
    IdleTimeout,
    #[error("ai protocol error: {0}")]
    Protocol(String),
}

impl AiDriverError {
    /// Whether a retry might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiDriverError::RateLimited
                | AiDriverError::Unavailable(_)
                | AiDriverError::Transport(_)
                | AiDriverError::IdleTimeout
        )
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ReportChunk, AiDriverError>> + Send>>;

/// Pluggable AI backend.
#[async_trait]
pub trait AiDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a streaming completion and return the chunk stream.
    async fn stream_report(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
    ) -> Result<ChunkStream, AiDriverError>;

    /// Parse findings out of a finished (possibly partial) report.
    /// Default: trailing JSON block, then markdown heuristics.
    fn extract_findings(&self, report_text: &str) -> AiAnalysisResult {
        if let Some(block) = reasoning::extract_json_block(report_text) {
            match serde_json::from_str::<AiAnalysisResult>(&block) {
                Ok(result) if !result.findings.is_empty() => return result,
                Ok(result) => {
                    debug!("structured block parsed but empty, trying markdown fallback");
                    let fallback = reasoning::extract_findings_from_markdown(report_text);
                    if fallback.is_empty() {
                        return result;
                    }
                    return AiAnalysisResult {
                        summary: result.summary,
                        overall_risk: result.overall_risk,
                        findings: fallback,
                    };
                }
                Err(err) => {
                    warn!("failed to parse structured AI output: {err}");
                }
            }
        }
        let findings = reasoning::extract_findings_from_markdown(report_text);
        AiAnalysisResult {
            summary: String::new(),
            overall_risk: findings
                .first()
                .map(|f| f.severity.clone())
                .unwrap_or_else(|| "info".to_string()),
            findings,
        }
    }

    /// Short executive summary of a report. Default: leading text.
    fn summarize(&self, report_text: &str) -> String {
        report_text.chars().take(500).collect()
    }
}

/// Select and build the configured driver. Returns `None` when AI analysis
/// is disabled.
pub fn build_driver(settings: &AiSettings) -> anyhow::Result<Option<std::sync::Arc<dyn AiDriver>>> {
    let driver: std::sync::Arc<dyn AiDriver> = match settings.provider.as_str() {
        "" | "none" | "disabled" => return Ok(None),
        "anthropic" => std::sync::Arc::new(AnthropicDriver::new(&settings.anthropic)),
        "openai" => std::sync::Arc::new(OpenAiDriver::new(
            "openai",
            settings.openai.base_url(),
            settings.openai.api_key.clone(),
            settings.openai.model.clone(),
        )),
        "ollama" => std::sync::Arc::new(OpenAiDriver::new(
            "ollama",
            format!("{}/v1", settings.ollama.host.trim_end_matches('/')),
            "ollama".to_string(),
            settings.ollama.model.clone(),
        )),
        other => anyhow::bail!("unknown ai provider '{other}' (anthropic, openai, ollama)"),
    };
    Ok(Some(driver))
}

fn classify_status(status: reqwest::StatusCode, body: String) -> AiDriverError {
    if status.as_u16() == 429 {
        AiDriverError::RateLimited
    } else if status.is_server_error() {
        AiDriverError::Unavailable(format!("{status}: {body}"))
    } else {
        AiDriverError::Protocol(format!("{status}: {body}"))
    }
}

/// Incremental server-sent-events line parser. Yields `data:` payloads.
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

// ── Anthropic ────────────────────────────────────────────────────────────────

pub struct AnthropicDriver {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicDriver {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl AiDriver for AnthropicDriver {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn stream_report(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
    ) -> Result<ChunkStream, AiDriverError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": max_tokens,
                "stream": true,
                "system": system_prompt,
                "messages": [{"role": "user", "content": user_message}],
            }))
            .send()
            .await
            .map_err(|e| AiDriverError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let (tx, rx) = mpsc::channel::<Result<ReportChunk, AiDriverError>>(64);
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut bytes = response.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(AiDriverError::Transport(err.to_string()))).await;
                        return;
                    }
                };
                for payload in parser.feed(&chunk) {
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    match value["type"].as_str() {
                        Some("content_block_delta") => {
                            if let Some(text) = value["delta"]["text"].as_str() {
                                if tx
                                    .send(Ok(ReportChunk {
                                        text: text.to_string(),
                                        phase: None,
                                    }))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        Some("error") => {
                            let message = value["error"]["message"]
                                .as_str()
                                .unwrap_or("unknown stream error")
                                .to_string();
                            let _ = tx.send(Err(AiDriverError::Protocol(message))).await;
                            return;
                        }
                        Some("message_stop") => return,
                        _ => {}
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ── OpenAI-compatible (also serves Ollama) ───────────────────────────────────

pub struct OpenAiDriver {
    name: &'static str,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiDriver {
    pub fn new(name: &'static str, base_url: String, api_key: String, model: String) -> Self {
        Self {
            name,
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl AiDriver for OpenAiDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stream_report(
        &self,
        system_prompt: &str,
        user_message: &str,
        max_tokens: u32,
    ) -> Result<ChunkStream, AiDriverError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "max_tokens": max_tokens,
                "stream": true,
                "messages": [
                    {"role": "system", "content": system_prompt},
                    {"role": "user", "content": user_message},
                ],
            }))
            .send()
            .await
            .map_err(|e| AiDriverError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let (tx, rx) = mpsc::channel::<Result<ReportChunk, AiDriverError>>(64);
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut bytes = response.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(AiDriverError::Transport(err.to_string()))).await;
                        return;
                    }
                };
                for payload in parser.feed(&chunk) {
                    if payload == "[DONE]" {
                        return;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    if let Some(text) = value["choices"][0]["delta"]["content"].as_str() {
                        if !text.is_empty()
                            && tx
                                .send(Ok(ReportChunk {
                                    text: text.to_string(),
                                    phase: None,
                                }))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_handles_split_lines() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\":").is_empty());
        let payloads = parser.feed(b" 1}\n\ndata: [DONE]\n");
        assert_eq!(payloads, vec!["{\"a\": 1}", "[DONE]"]);
    }

    #[test]
    fn sse_parser_ignores_event_lines() {
        let mut parser = SseParser::new();
        let payloads = parser.feed(b"event: message_start\ndata: {}\n");
        assert_eq!(payloads, vec!["{}"]);
    }

    #[test]
    fn retryable_classification() {
        assert!(AiDriverError::RateLimited.is_retryable());
        assert!(AiDriverError::Transport("reset".into()).is_retryable());
        assert!(AiDriverError::Unavailable("503".into()).is_retryable());
        assert!(!AiDriverError::Protocol("bad json".into()).is_retryable());
    }

    struct NullDriver;

    #[async_trait]
    impl AiDriver for NullDriver {
        fn name(&self) -> &'static str {
            "null"
        }
        async fn stream_report(
            &self,
            _: &str,
            _: &str,
            _: u32,
        ) -> Result<ChunkStream, AiDriverError> {
            Err(AiDriverError::Unavailable("null".into()))
        }
    }

    #[test]
    fn default_extraction_prefers_json_block() {
        let report = "analysis\n```json\n{\"summary\": \"s\", \"overall_risk\": \"high\", \"findings\": [{\"title\": \"t\", \"severity\": \"high\"}]}\n```";
        let result = NullDriver.extract_findings(report);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.overall_risk, "high");
    }

    #[test]
    fn default_extraction_falls_back_to_markdown() {
        let report = "\n### Lone finding\n- **Severity**: low\n";
        let result = NullDriver.extract_findings(report);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].severity, "low");
    }

    #[test]
    fn summarize_truncates() {
        let text = "x".repeat(2000);
        assert_eq!(NullDriver.summarize(&text).len(), 500);
    }
}
