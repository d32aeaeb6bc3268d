//! Builds one process-wide `AgentContext` from an `AppConfig`: selects and
//! constructs the configured `LlmProvider`, wraps it in a retrying
//! `LlmGateway`, and chooses an in-memory or JSONL-backed `MemoryRepository`.
//! Every other repository stays in-memory — nothing here needs the
//! project/chapter/session state to outlive a process.

use std::path::Path;
use std::sync::Arc;

use quill_agent::AgentContext;
use quill_config::{AppConfig, LlmConfig, ProviderKind};
use quill_llm::{
    AnthropicClaudeProvider, AzureOpenAiProvider, GoogleGeminiProvider, LlmGateway, LlmProvider,
    MockProvider, OllamaLocalProvider, OpenAiCompatibleProvider, RetryPolicy,
};
use quill_memory::{
    InMemoryChapterRepository, InMemoryMemoryRepository, InMemoryProjectRepository,
    InMemorySessionRepository, InMemoryVectorStore, JsonlMemoryRepository, MemoryRepository,
};
use tracing_subscriber::EnvFilter;

/// `tracing-subscriber`'s env-filter + fmt layer, read from `RUST_LOG` (or
/// `AppConfig.telemetry.log_level` when the caller sets it as a fallback via
/// `RUST_LOG` itself — this crate doesn't second-guess what the operator set).
pub fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
}

fn build_provider(config: &LlmConfig) -> Box<dyn LlmProvider> {
    match config.provider {
        ProviderKind::OpenAiCompatible => {
            Box::new(OpenAiCompatibleProvider::new(config.base_url.clone(), config.api_key.clone(), config.model.clone()))
        }
        ProviderKind::AnthropicClaude => Box::new(AnthropicClaudeProvider::new(config.api_key.clone(), config.model.clone())),
        ProviderKind::GoogleGemini => Box::new(GoogleGeminiProvider::new(config.api_key.clone(), config.model.clone())),
        ProviderKind::AzureOpenAi => {
            Box::new(AzureOpenAiProvider::new(config.base_url.clone(), config.api_key.clone(), config.model.clone()))
        }
        ProviderKind::OllamaLocal => Box::new(OllamaLocalProvider::new(config.base_url.clone(), config.model.clone())),
        ProviderKind::Mock => Box::new(MockProvider::echo()),
    }
}

/// One configured provider behind a gateway whose retry policy's attempt
/// count follows `AppConfig.llm.retry_max_attempts`.
pub fn build_gateway(config: &AppConfig) -> LlmGateway {
    let provider = build_provider(&config.llm);
    let retry = RetryPolicy { max_attempts: config.llm.retry_max_attempts, ..RetryPolicy::default() };
    LlmGateway::new(provider).with_retry_policy(retry)
}

/// Builds the process-wide `AgentContext`. `memory_log_path` is the
/// composition choice the repository interface leaves open:
/// `None` keeps every memory write in process memory only; `Some(path)`
/// replays and persists through a crash-safe JSONL log instead, so a
/// restarted process picks up where the last one left off.
pub async fn build_context(config: AppConfig, memory_log_path: Option<&Path>) -> anyhow::Result<Arc<AgentContext>> {
    let gateway = build_gateway(&config);

    let memory: Arc<dyn MemoryRepository> = match memory_log_path {
        Some(path) => Arc::new(JsonlMemoryRepository::open(path).await?),
        None => Arc::new(InMemoryMemoryRepository::default()),
    };

    Ok(Arc::new(AgentContext::new(
        memory,
        Arc::new(InMemoryProjectRepository::default()),
        Arc::new(InMemoryChapterRepository::default()),
        Arc::new(InMemorySessionRepository::default()),
        Arc::new(InMemoryVectorStore::default()),
        Arc::new(gateway),
        config,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.llm.provider = ProviderKind::Mock;
        config
    }

    #[tokio::test]
    async fn build_context_with_mock_provider_answers_a_chat_turn() {
        let context = build_context(mock_config(), None).await.unwrap();
        let reply = quill_agent::chat(
            &context,
            quill_agent::ChatRequest { session_id: None, message: "hello there".to_string(), project_id: None },
        )
        .await;
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn jsonl_backed_context_survives_a_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("memory.jsonl");

        let context = build_context(mock_config(), Some(&log_path)).await.unwrap();
        let item = quill_memory::MemoryItem::new(quill_memory::MemoryTier::Global, "a persisted fact".to_string());
        context.memory.add(item).await.unwrap();

        let reopened = build_context(mock_config(), Some(&log_path)).await.unwrap();
        let items = reopened.memory.all().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "a persisted fact");
    }
}
