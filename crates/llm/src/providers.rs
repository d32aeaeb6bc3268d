use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    CancellationToken, ChatRole, FinishReason, LlmError, LlmProvider, LlmRequest, LlmResponse,
    StreamChunk, TokenUsage,
};

fn messages_to_openai_json(messages: &[crate::ChatMessage]) -> serde_json::Value {
    serde_json::Value::Array(
        messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect(),
    )
}

fn classify_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        401 | 403 => LlmError::Auth,
        429 => LlmError::RateLimit,
        413 => LlmError::ContextOverflow,
        s if s >= 500 => LlmError::ProviderError(format!("{status}: {body}")),
        _ => LlmError::ProviderError(format!("{status}: {body}")),
    }
}

fn network_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(err.to_string())
    }
}

/// Any provider that speaks the OpenAI `/v1/chat/completions` wire shape:
/// OpenAI itself, and any self-hosted endpoint that mirrors it.
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": messages_to_openai_json(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "top_p": request.top_p,
            "stop": request.stop,
        });

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(classify_http_error(status, &body.to_string()));
        }

        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
        let finish = body["choices"][0]["finish_reason"].as_str().unwrap_or("stop");
        let usage = TokenUsage {
            prompt: body["usage"]["prompt_tokens"].as_u64().unwrap_or_default() as u32,
            completion: body["usage"]["completion_tokens"].as_u64().unwrap_or_default() as u32,
            total: body["usage"]["total_tokens"].as_u64().unwrap_or_default() as u32,
        };

        Ok(LlmResponse { content, usage, finish_reason: parse_finish_reason(finish) })
    }

    async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": messages_to_openai_json(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        let mut response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }

        let mut accumulated = String::new();
        while let Some(chunk) = response.chunk().await.map_err(network_error)? {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    let _ = sender
                        .send(StreamChunk::Done {
                            usage: TokenUsage {
                                total: crate::heuristic_token_count(&accumulated) as u32,
                                ..Default::default()
                            },
                            finish_reason: FinishReason::Stop,
                        })
                        .await;
                    return Ok(());
                }
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) {
                    if let Some(delta) = parsed["choices"][0]["delta"]["content"].as_str() {
                        if !delta.is_empty() {
                            accumulated.push_str(delta);
                            let _ = sender.send(StreamChunk::Token(delta.to_string())).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "openai_compatible"
    }
}

fn parse_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "stop" => FinishReason::Stop,
        _ => FinishReason::Stop,
    }
}

/// Anthropic's `/v1/messages` wire shape.
pub struct AnthropicClaudeProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl AnthropicClaudeProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicClaudeProvider {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let (system, turns): (Vec<_>, Vec<_>) =
            request.messages.iter().partition(|m| m.role == ChatRole::System);
        let system_prompt = system.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n");

        let payload = json!({
            "model": self.model,
            "system": system_prompt,
            "messages": messages_to_openai_json(&turns.into_iter().cloned().collect::<Vec<_>>()),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(classify_http_error(status, &body.to_string()));
        }

        let content = body["content"][0]["text"].as_str().unwrap_or_default().to_string();
        let finish = body["stop_reason"].as_str().unwrap_or("end_turn");
        let usage = TokenUsage {
            prompt: body["usage"]["input_tokens"].as_u64().unwrap_or_default() as u32,
            completion: body["usage"]["output_tokens"].as_u64().unwrap_or_default() as u32,
            total: (body["usage"]["input_tokens"].as_u64().unwrap_or_default()
                + body["usage"]["output_tokens"].as_u64().unwrap_or_default()) as u32,
        };
        let finish_reason = if finish == "max_tokens" { FinishReason::Length } else { FinishReason::Stop };

        Ok(LlmResponse { content, usage, finish_reason })
    }

    async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        // Claude's event-stream framing differs from OpenAI's; rather than
        // re-parse SSE here, issue one call and deliver it as a single
        // chunk followed by the done frame.
        if cancel.is_cancelled() {
            return Ok(());
        }
        let response = self.generate(request).await?;
        let _ = sender.send(StreamChunk::Token(response.content)).await;
        let _ = sender.send(StreamChunk::Done { usage: response.usage, finish_reason: response.finish_reason }).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "anthropic_claude"
    }
}

/// Google Gemini's `generateContent` wire shape.
pub struct GoogleGeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GoogleGeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), api_key: api_key.into(), model: model.into() }
    }
}

#[async_trait]
impl LlmProvider for GoogleGeminiProvider {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let contents: Vec<_> = request
            .messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                json!({
                    "role": if m.role == ChatRole::Assistant { "model" } else { "user" },
                    "parts": [{"text": m.content}],
                })
            })
            .collect();

        let payload = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
                "topP": request.top_p,
            },
        });

        let endpoint = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let response = self.client.post(endpoint).json(&payload).send().await.map_err(network_error)?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(classify_http_error(status, &body.to_string()));
        }

        let content = body["candidates"][0]["content"]["parts"][0]["text"].as_str().unwrap_or_default().to_string();
        let finish = body["candidates"][0]["finishReason"].as_str().unwrap_or("STOP");
        let usage = TokenUsage {
            prompt: body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or_default() as u32,
            completion: body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or_default() as u32,
            total: body["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or_default() as u32,
        };
        let finish_reason = if finish == "MAX_TOKENS" { FinishReason::Length } else { FinishReason::Stop };

        Ok(LlmResponse { content, usage, finish_reason })
    }

    async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let response = self.generate(request).await?;
        let _ = sender.send(StreamChunk::Token(response.content)).await;
        let _ = sender.send(StreamChunk::Done { usage: response.usage, finish_reason: response.finish_reason }).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "google_gemini"
    }
}

/// Azure OpenAI: same wire shape as `OpenAiCompatibleProvider` but with a
/// deployment-scoped endpoint and an `api-key` header instead of a bearer
/// token.
pub struct AzureOpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    deployment: String,
    api_version: String,
}

impl AzureOpenAiProvider {
    pub fn new(
        resource_endpoint: impl Into<String>,
        api_key: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: resource_endpoint.into(),
            api_key: api_key.into(),
            deployment: deployment.into(),
            api_version: "2024-06-01".to_string(),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint.trim_end_matches('/'),
            self.deployment,
            self.api_version
        )
    }
}

#[async_trait]
impl LlmProvider for AzureOpenAiProvider {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let payload = json!({
            "messages": messages_to_openai_json(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "top_p": request.top_p,
        });

        let response = self
            .client
            .post(self.url())
            .header("api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(classify_http_error(status, &body.to_string()));
        }

        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
        let finish = body["choices"][0]["finish_reason"].as_str().unwrap_or("stop");
        let usage = TokenUsage {
            prompt: body["usage"]["prompt_tokens"].as_u64().unwrap_or_default() as u32,
            completion: body["usage"]["completion_tokens"].as_u64().unwrap_or_default() as u32,
            total: body["usage"]["total_tokens"].as_u64().unwrap_or_default() as u32,
        };

        Ok(LlmResponse { content, usage, finish_reason: parse_finish_reason(finish) })
    }

    async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let response = self.generate(request).await?;
        let _ = sender.send(StreamChunk::Token(response.content)).await;
        let _ = sender.send(StreamChunk::Done { usage: response.usage, finish_reason: response.finish_reason }).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "azure_openai"
    }
}

/// Ollama's `/api/generate` native streaming endpoint: newline-delimited
/// JSON objects, each carrying an incremental `response` field.
pub struct OllamaLocalProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaLocalProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into(), model: model.into() }
    }

    fn prompt_text(messages: &[crate::ChatMessage]) -> String {
        messages
            .iter()
            .map(|m| {
                let prefix = match m.role {
                    ChatRole::System => "System",
                    ChatRole::User => "User",
                    ChatRole::Assistant => "Assistant",
                };
                format!("{prefix}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
impl LlmProvider for OllamaLocalProvider {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": Self::prompt_text(&request.messages),
            "stream": false,
            "options": { "temperature": request.temperature, "top_p": request.top_p },
        });

        let response = self.client.post(endpoint).json(&payload).send().await.map_err(network_error)?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(network_error)?;
        if !status.is_success() {
            return Err(classify_http_error(status, &body.to_string()));
        }

        let content = body["response"].as_str().unwrap_or_default().to_string();
        let usage = TokenUsage {
            prompt: body["prompt_eval_count"].as_u64().unwrap_or_default() as u32,
            completion: body["eval_count"].as_u64().unwrap_or_default() as u32,
            total: (body["prompt_eval_count"].as_u64().unwrap_or_default()
                + body["eval_count"].as_u64().unwrap_or_default()) as u32,
        };

        Ok(LlmResponse { content, usage, finish_reason: FinishReason::Stop })
    }

    async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": Self::prompt_text(&request.messages),
            "stream": true,
        });

        let mut response = self.client.post(endpoint).json(&payload).send().await.map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.map_err(network_error)?;
            return Err(classify_http_error(status, &body.to_string()));
        }

        let mut completion_tokens = 0u32;
        while let Some(chunk) = response.chunk().await.map_err(network_error)? {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(line) else { continue };
                if let Some(content) = parsed["response"].as_str() {
                    if !content.is_empty() {
                        completion_tokens += 1;
                        let _ = sender.send(StreamChunk::Token(content.to_string())).await;
                    }
                }
                if parsed["done"].as_bool().unwrap_or(false) {
                    let _ = sender
                        .send(StreamChunk::Done {
                            usage: TokenUsage { completion: completion_tokens, ..Default::default() },
                            finish_reason: FinishReason::Stop,
                        })
                        .await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ollama_local"
    }
}

/// A provider that never calls out: deterministic, for tests. Each mode is
/// constructed via an explicit factory rather than a public enum so test
/// intent reads at the call site.
pub struct MockProvider {
    behavior: MockBehavior,
}

enum MockBehavior {
    Echo,
    FailThenSucceed { remaining_failures: std::sync::atomic::AtomicU32 },
    AlwaysFail(LlmError),
    Slow(Duration),
}

impl MockProvider {
    pub fn echo() -> Self {
        Self { behavior: MockBehavior::Echo }
    }

    pub fn fail_then_succeed(failures: u32) -> Self {
        Self {
            behavior: MockBehavior::FailThenSucceed {
                remaining_failures: std::sync::atomic::AtomicU32::new(failures),
            },
        }
    }

    pub fn always_fail(error: LlmError) -> Self {
        Self { behavior: MockBehavior::AlwaysFail(error) }
    }

    /// Echoes like `echo()` but sleeps `delay` first, standing in for a
    /// provider whose call is still in flight when a caller cancels.
    pub fn slow(delay: Duration) -> Self {
        Self { behavior: MockBehavior::Slow(delay) }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        match &self.behavior {
            MockBehavior::Echo => {
                let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
                Ok(LlmResponse {
                    content: format!("echo: {last}"),
                    usage: TokenUsage::default(),
                    finish_reason: FinishReason::Stop,
                })
            }
            MockBehavior::FailThenSucceed { remaining_failures } => {
                let remaining = remaining_failures.load(std::sync::atomic::Ordering::SeqCst);
                if remaining > 0 {
                    remaining_failures.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    Err(LlmError::ProviderError("mock transient failure".to_string()))
                } else {
                    Ok(LlmResponse {
                        content: "recovered".to_string(),
                        usage: TokenUsage::default(),
                        finish_reason: FinishReason::Stop,
                    })
                }
            }
            MockBehavior::AlwaysFail(err) => Err(err.clone()),
            MockBehavior::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
                Ok(LlmResponse {
                    content: format!("echo: {last}"),
                    usage: TokenUsage::default(),
                    finish_reason: FinishReason::Stop,
                })
            }
        }
    }

    async fn generate_stream(
        &self,
        request: &LlmRequest,
        sender: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        let response = self.generate(request).await?;
        for word in response.content.split_whitespace() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let _ = sender.send(StreamChunk::Token(format!("{word} "))).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let _ = sender.send(StreamChunk::Done { usage: response.usage, finish_reason: response.finish_reason }).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
