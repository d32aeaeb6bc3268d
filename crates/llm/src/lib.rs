//! The LLM Gateway: a uniform request/response surface over any supported
//! provider, with retries, timeouts, and token accounting. The gateway never
//! touches memory — it only talks to a provider and normalizes the result.

mod cancellation;
mod providers;

pub use cancellation::CancellationToken;
pub use providers::{
    AnthropicClaudeProvider, AzureOpenAiProvider, GoogleGeminiProvider, MockProvider,
    OllamaLocalProvider, OpenAiCompatibleProvider,
};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// A single message in a chat-style prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// A uniform request, independent of provider wire format.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: usize,
    pub top_p: f32,
    pub stop: Vec<String>,
    pub timeout: Duration,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            temperature: 0.8,
            max_tokens: 1024,
            top_p: 1.0,
            stop: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// A chunk of a streamed response: incremental text, or the terminal frame
/// carrying final usage.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Token(String),
    Done { usage: TokenUsage, finish_reason: FinishReason },
}

/// The closed set of failure kinds an LLM call can raise, per the gateway's
/// failure model. Providers normalize their own error shapes into one of
/// these before returning to the caller.
#[derive(Debug, Error, Clone)]
pub enum LlmError {
    #[error("llm request timed out")]
    Timeout,
    #[error("llm provider rate-limited the request")]
    RateLimit,
    #[error("llm provider rejected credentials")]
    Auth,
    #[error("prompt exceeds the model's context window")]
    ContextOverflow,
    #[error("llm provider returned an error: {0}")]
    ProviderError(String),
    #[error("network error talking to llm provider: {0}")]
    Network(String),
}

impl LlmError {
    /// Whether this failure kind is eligible for the gateway's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::RateLimit | LlmError::Network(_) | LlmError::ProviderError(_)
        )
    }
}

/// Implemented once per provider variant. The gateway is polymorphic over
/// this trait rather than over a closed enum of clients, so new providers
/// (or a `Mock` for tests) can be added without touching the gateway.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Streams incremental chunks into `sender`. Implementations must check
    /// `cancel` between chunks and stop (without treating it as an error)
    /// once it is set.
    async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError>;

    /// Token count for `text` under this provider's tokenizer, or a
    /// heuristic fallback when the provider has none.
    fn count_tokens(&self, text: &str) -> usize {
        heuristic_token_count(text)
    }

    fn name(&self) -> &'static str;
}

/// ≈4 chars/token for Latin scripts, ≈2 chars/token for CJK scripts, used by
/// any provider without its own tokenizer.
pub fn heuristic_token_count(text: &str) -> usize {
    let mut latin_chars = 0usize;
    let mut cjk_chars = 0usize;
    for ch in text.chars() {
        if is_cjk(ch) {
            cjk_chars += 1;
        } else if !ch.is_whitespace() {
            latin_chars += 1;
        }
    }
    (latin_chars as f64 / 4.0).ceil() as usize + (cjk_chars as f64 / 2.0).ceil() as usize
}

pub fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0xAC00..=0xD7A3 | 0x3400..=0x4DBF
    )
}

/// Retry policy: exponential backoff with jitter, eligible kinds only.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-indexed), jittered to avoid a
    /// thundering herd of simultaneous retries.
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.cap.as_secs_f64());
        // Deterministic jitter derived from the attempt count rather than a
        // new RNG dependency: only needed to desynchronize retries, not to
        // be unpredictable.
        let jitter_fraction = 0.5 + (((attempt as u64).wrapping_mul(2654435761) % 1000) as f64 / 2000.0);
        Duration::from_secs_f64(capped * jitter_fraction)
    }
}

/// Wraps one configured provider with the retry/backoff policy. The gateway
/// is the only thing callers hold; it never mutates memory.
pub struct LlmGateway {
    provider: Box<dyn LlmProvider>,
    retry: RetryPolicy,
}

impl LlmGateway {
    pub fn new(provider: Box<dyn LlmProvider>) -> Self {
        Self { provider, retry: RetryPolicy::default() }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    #[tracing::instrument(skip(self, request), fields(provider = self.provider.name()))]
    pub async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(request.timeout, self.provider.generate(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => {
                    if !err.is_retryable() || attempt + 1 >= self.retry.max_attempts {
                        return Err(err);
                    }
                    tracing::warn!(attempt, error = %err, "llm call failed, retrying");
                }
                Err(_elapsed) => {
                    if attempt + 1 >= self.retry.max_attempts {
                        return Err(LlmError::Timeout);
                    }
                    tracing::warn!(attempt, "llm call timed out, retrying");
                }
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    pub async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        self.provider.generate_stream(request, sender, cancel).await
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.provider.count_tokens(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_counts_latin_and_cjk_separately() {
        assert_eq!(heuristic_token_count("abcd"), 1);
        assert_eq!(heuristic_token_count("ab cd"), 1);
        assert_eq!(heuristic_token_count("你好"), 1);
    }

    #[test]
    fn auth_and_context_overflow_are_not_retryable() {
        assert!(!LlmError::Auth.is_retryable());
        assert!(!LlmError::ContextOverflow.is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::RateLimit.is_retryable());
    }

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for(10);
        assert!(delay <= Duration::from_secs_f64(policy.cap.as_secs_f64() * 1.0001));
    }

    #[tokio::test]
    async fn gateway_succeeds_on_first_try_with_mock() {
        let gateway = LlmGateway::new(Box::new(MockProvider::echo()));
        let request = LlmRequest { messages: vec![ChatMessage::user("hello")], ..Default::default() };
        let response = gateway.generate(&request).await.unwrap();
        assert!(response.content.contains("hello"));
    }

    #[tokio::test]
    async fn gateway_retries_retryable_failures_then_succeeds() {
        let gateway = LlmGateway::new(Box::new(MockProvider::fail_then_succeed(2)))
            .with_retry_policy(RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                multiplier: 1.0,
                cap: Duration::from_millis(5),
            });
        let request = LlmRequest::default();
        let response = gateway.generate(&request).await.unwrap();
        assert_eq!(response.content, "recovered");
    }

    #[tokio::test]
    async fn gateway_does_not_retry_auth_failures() {
        let gateway = LlmGateway::new(Box::new(MockProvider::always_fail(LlmError::Auth)));
        let request = LlmRequest::default();
        let result = gateway.generate(&request).await;
        assert!(matches!(result, Err(LlmError::Auth)));
    }
}
