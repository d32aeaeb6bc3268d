use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which LLM provider the gateway talks to by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAiCompatible,
    AnthropicClaude,
    GoogleGemini,
    AzureOpenAi,
    OllamaLocal,
    Mock,
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::OpenAiCompatible
    }
}

/// Gateway configuration: provider selection, model, and the retry/
/// concurrency knobs the LLM Gateway reads at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub context_window: usize,
    pub generation_max_tokens: usize,
    pub retry_max_attempts: u32,
    pub per_provider_concurrency: usize,
    /// Base URL override, used by the Ollama-local and OpenAI-compatible
    /// providers. Overridden at runtime by `QUILL_LLM_BASE_URL` when set.
    pub base_url: String,
    /// API key, left empty for providers that don't need one (Mock,
    /// Ollama-local). Overridden at runtime by `QUILL_LLM_API_KEY`.
    pub api_key: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: String::new(),
            context_window: 8192,
            generation_max_tokens: 3500,
            retry_max_attempts: 3,
            per_provider_concurrency: 8,
            base_url: String::new(),
            api_key: String::new(),
        }
    }
}

/// Memory/retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub retrieval_k: usize,
    pub session_turn_cap: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retrieval_k: 8,
            session_turn_cap: 50,
        }
    }
}

/// Thresholds the Conversational Agent's creation decision and the
/// Consistency Checker read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub completion_threshold: f32,
    pub consistency_threshold: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            completion_threshold: 0.7,
            consistency_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Process-wide configuration, loaded once at init.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub thresholds: ThresholdConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("QUILL_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("QUILL_LLM_API_KEY") {
            if !value.is_empty() {
                config.llm.api_key = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.llm.context_window, 8192);
        assert_eq!(config.memory.session_turn_cap, 50);
        assert_eq!(config.thresholds.completion_threshold, 0.7);
        assert_eq!(config.thresholds.consistency_threshold, 0.5);
        assert_eq!(config.memory.retrieval_k, 8);
        assert_eq!(config.llm.generation_max_tokens, 3500);
        assert_eq!(config.llm.retry_max_attempts, 3);
        assert_eq!(config.llm.per_provider_concurrency, 8);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = AppConfig::default();
        let dir = std::env::temp_dir().join("quill-config-test.toml");
        config.save_to(&dir).unwrap();
        let loaded = AppConfig::load_from(&dir).unwrap();
        assert_eq!(loaded.llm.model, config.llm.model);
        let _ = std::fs::remove_file(&dir);
    }
}
