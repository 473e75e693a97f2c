//! AI analysis: driver contract, streaming pipeline, report parsing.

pub mod confidence;
pub mod driver;
pub mod pipeline;
pub mod reasoning;
pub mod schema;

pub use driver::{build_driver, AiDriver, AiDriverError, ChunkStream, ReportChunk};
pub use pipeline::{AiPipeline, PipelineOutcome};

use serde::{Deserialize, Serialize};

/// Settings for one HTTP provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            base_url: String::new(),
        }
    }
}

impl ProviderSettings {
    pub fn base_url(&self) -> String {
        self.base_url.trim_end_matches('/').to_string()
    }
}

/// Ollama connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub host: String,
    pub model: String,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
        }
    }
}

/// AI pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// "anthropic" | "openai" | "ollama" | "" (disabled)
    pub provider: String,
    pub anthropic: ProviderSettings,
    pub openai: ProviderSettings,
    pub ollama: OllamaSettings,
    pub max_tokens: u32,
    /// Per-step output budget in the model context, bytes.
    pub per_step_budget: usize,
    /// Global context budget, bytes.
    pub context_budget: usize,
    /// Seconds without a chunk before the stream is abandoned.
    pub idle_timeout_secs: u64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            provider: String::new(),
            anthropic: ProviderSettings {
                api_key: String::new(),
                model: "claude-sonnet-4-20250514".to_string(),
                base_url: "https://api.anthropic.com".to_string(),
            },
            openai: ProviderSettings {
                api_key: String::new(),
                model: "gpt-4o".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
            },
            ollama: OllamaSettings::default(),
            max_tokens: 16384,
            per_step_budget: 8 * 1024,
            context_budget: 64 * 1024,
            idle_timeout_secs: 60,
        }
    }
}
