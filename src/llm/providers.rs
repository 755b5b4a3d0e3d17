//! Concrete chat-completion backends
//!
//! Three wire dialects cover the configured providers: OpenAI-compatible
//! HTTP (OpenAI itself, Groq, OpenRouter, llama.cpp servers, any custom
//! endpoint), Ollama's native API, and the Anthropic messages API. All
//! requests carry a per-provider timeout and race a cancellation token.

use crate::config::ProviderSettings;
use crate::llm::{ChatMessage, ChatParams, ChatProvider, ProviderError, ProviderHealth};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// OpenAI-compatible request/response shapes
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

// Anthropic messages API shapes
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

/// Build a provider from configuration.
pub fn build_provider(
    name: &str,
    settings: &ProviderSettings,
) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let timeout = Duration::from_secs(settings.request_timeout_secs);
    match settings.kind.as_str() {
        "openai-compatible" => Ok(Arc::new(OpenAiCompatProvider::new(
            name,
            settings
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            settings.api_key.clone(),
            settings.model.clone(),
            timeout,
        ))),
        "ollama" => Ok(Arc::new(OllamaProvider::new(
            name,
            settings
                .endpoint
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            settings.model.clone(),
            timeout,
        ))),
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(
            name,
            settings
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            settings.api_key.clone().unwrap_or_default(),
            settings.model.clone(),
            timeout,
        ))),
        other => Err(ProviderError::Other(format!(
            "unknown provider kind: {}",
            other
        ))),
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if e.is_connect() {
        ProviderError::ConnectionRefused(e.to_string())
    } else {
        ProviderError::Other(e.to_string())
    }
}

fn status_error(status: StatusCode, body: String, model: &str) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(body),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            ProviderError::ServiceUnavailable(body)
        }
        StatusCode::NOT_FOUND if body.contains(model) || body.contains("model") => {
            ProviderError::ModelNotLoaded(body)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::UNAUTHORIZED => {
            ProviderError::InvalidRequest(body)
        }
        _ => ProviderError::Other(format!("{}: {}", status, body)),
    }
}

/// Race a request future against cancellation.
macro_rules! with_cancel {
    ($cancel:expr, $fut:expr) => {
        tokio::select! {
            result = $fut => result,
            _ = $cancel.cancelled() => return Err(ProviderError::Cancelled),
        }
    };
}

/// OpenAI-compatible `/chat/completions` backend
pub struct OpenAiCompatProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: &str,
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> ProviderHealth {
        let started = Instant::now();
        let request = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .timeout(Duration::from_secs(5))
            .send();
        match request.await {
            Ok(response) if response.status().is_success() => ProviderHealth::Healthy {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(response) => ProviderHealth::Unhealthy {
                reason: format!("status {}", response.status()),
            },
            Err(e) => ProviderHealth::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::SchemaViolation(e.to_string()))?;
        Ok(value
            .get("data")
            .and_then(|d| d.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        };

        debug!(provider = %self.name, model = %self.model, "chat request");
        let request = self
            .authorized(
                self.client
                    .post(format!("{}/chat/completions", self.base_url)),
            )
            .json(&body)
            .timeout(self.timeout)
            .send();
        let response =
            with_cancel!(cancel, request).map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body, &self.model));
        }

        let parsed: ChatResponse = with_cancel!(cancel, response.json())
            .map_err(|e| ProviderError::SchemaViolation(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| ProviderError::SchemaViolation("no choices in response".to_string()))
    }
}

/// Ollama local backend (native API for health/models, OpenAI-compatible
/// endpoint for chat)
pub struct OllamaProvider {
    name: String,
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaProvider {
    pub fn new(name: &str, base_url: String, model: String, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
        }
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> ProviderHealth {
        let started = Instant::now();
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ProviderHealth::Healthy {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(response) => ProviderHealth::Unhealthy {
                reason: format!("status {}", response.status()),
            },
            Err(e) => ProviderHealth::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::SchemaViolation(e.to_string()))?;
        Ok(value
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        };

        let request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .timeout(self.timeout)
            .send();
        let response =
            with_cancel!(cancel, request).map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Ollama reports a missing model as 404 with the model name
            return Err(status_error(status, body, &self.model));
        }

        let parsed: ChatResponse = with_cancel!(cancel, response.json())
            .map_err(|e| ProviderError::SchemaViolation(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| ProviderError::SchemaViolation("no choices in response".to_string()))
    }
}

/// Anthropic messages API backend
pub struct AnthropicProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(
        name: &str,
        base_url: String,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> ProviderHealth {
        // No unauthenticated health endpoint; a HEAD on the API root
        // distinguishes "reachable" from "down".
        let started = Instant::now();
        match self
            .client
            .head(format!("{}/v1/messages", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(_) => ProviderHealth::Healthy {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => ProviderHealth::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![self.model.clone()])
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        // The messages API takes system text out-of-band
        let system = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");
        let turns: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.role != "system")
            .cloned()
            .collect();

        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: params.max_tokens.unwrap_or(2048),
            system,
            messages: turns,
        };

        let request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .timeout(self.timeout)
            .send();
        let response =
            with_cancel!(cancel, request).map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body, &self.model));
        }

        let parsed: AnthropicResponse = with_cancel!(cancel, response.json())
            .map_err(|e| ProviderError::SchemaViolation(e.to_string()))?;
        parsed
            .content
            .into_iter()
            .next()
            .map(|c| c.text.trim().to_string())
            .ok_or_else(|| ProviderError::SchemaViolation("no content in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_provider_rejects_unknown_kind() {
        let settings = ProviderSettings {
            kind: "telepathic".to_string(),
            endpoint: None,
            model: "any".to_string(),
            api_key: None,
            request_timeout_secs: 60,
        };
        assert!(build_provider("weird", &settings).is_err());
    }

    #[test]
    fn build_provider_defaults_endpoints() {
        let settings = ProviderSettings {
            kind: "ollama".to_string(),
            endpoint: None,
            model: "llama3.2:3b".to_string(),
            api_key: None,
            request_timeout_secs: 60,
        };
        let provider = build_provider("local", &settings).unwrap();
        assert_eq!(provider.name(), "local");
    }

    #[tokio::test]
    async fn connection_refused_maps_to_failover_error() {
        // Nothing listens on this port
        let provider = OpenAiCompatProvider::new(
            "dead",
            "http://127.0.0.1:9".to_string(),
            None,
            "any".to_string(),
            Duration::from_secs(2),
        );
        match provider
            .chat_simple("hello", &CancellationToken::new())
            .await
        {
            Err(e) => assert!(e.should_fail_over(), "got non-failover error: {}", e),
            Ok(_) => panic!("expected connection failure"),
        }
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_before_transport() {
        let provider = OpenAiCompatProvider::new(
            "dead",
            "http://127.0.0.1:9".to_string(),
            None,
            "any".to_string(),
            Duration::from_secs(2),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        match provider.chat_simple("hello", &cancel).await {
            Err(ProviderError::Cancelled) | Err(ProviderError::ConnectionRefused(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
