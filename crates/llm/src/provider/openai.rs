//! Upstream dispatch: issuing OpenAI chat-completions requests and exposing
//! the reply as a parsed chunk stream.

use std::{pin::Pin, time::Duration};

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::{Client, header::AUTHORIZATION};
use secrecy::ExposeSecret;

use crate::{
    error::{LlmError, LlmResult},
    messages::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse},
    provider::{ProviderDescriptor, ProviderKind},
};

pub(crate) type ChunkStream = Pin<Box<dyn Stream<Item = LlmResult<ChatCompletionChunk>> + Send>>;

/// HTTP client shared across requests and health probes.
pub(crate) struct UpstreamClient {
    client: Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            client: default_http_client(),
        }
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    fn request_builder(&self, provider: &ProviderDescriptor) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(provider.chat_url())
            .header("Content-Type", "application/json");

        if let Some(key) = provider.api_key() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }

        if provider.kind == ProviderKind::Hosted {
            // OpenRouter attribution headers.
            builder = builder
                .header("HTTP-Referer", "https://github.com/blackfuel-ai/claudish")
                .header("X-Title", "claudish");
        }

        builder
    }

    /// Non-streaming completion.
    pub async fn chat(
        &self,
        provider: &ProviderDescriptor,
        model: &str,
        payload: &ChatCompletionRequest,
    ) -> LlmResult<ChatCompletionResponse> {
        let response = self
            .request_builder(provider)
            .json(payload)
            .send()
            .await
            .map_err(|e| map_send_error(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(provider, model, status.as_u16(), body));
        }

        let body = response.text().await.map_err(|e| {
            log::error!("failed to read {} response body: {e}", provider.name);
            LlmError::Internal(None)
        })?;

        serde_json::from_str(&body).map_err(|e| {
            log::error!("failed to parse {} completion response: {e}", provider.name);
            log::debug!("unparseable response body ({} bytes)", body.len());
            LlmError::Internal(None)
        })
    }

    /// Streaming completion: the response body parsed into chunk values,
    /// terminated by the `[DONE]` sentinel.
    pub async fn chat_stream(
        &self,
        provider: &ProviderDescriptor,
        model: &str,
        payload: &ChatCompletionRequest,
    ) -> LlmResult<ChunkStream> {
        let response = self
            .request_builder(provider)
            .json(payload)
            .send()
            .await
            .map_err(|e| map_send_error(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(provider, model, status.as_u16(), body));
        }

        let provider_name = provider.name.clone();

        let chunk_stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(move |event| {
                let provider_name = provider_name.clone();

                async move {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            log::warn!("SSE parse error in {provider_name} stream: {e}");
                            return Some(Err(LlmError::Internal(Some(format!(
                                "invalid event stream from {provider_name}"
                            )))));
                        }
                    };

                    if event.data.trim() == "[DONE]" {
                        return None;
                    }

                    match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                        Ok(chunk) => Some(Ok(chunk)),
                        Err(e) => {
                            // Heterogeneous providers slip odd frames into
                            // their streams; skip rather than kill the turn.
                            log::warn!("skipping unparseable {provider_name} chunk: {e}");
                            None
                        }
                    }
                }
            });

        Ok(Box::pin(chunk_stream))
    }
}

fn default_http_client() -> Client {
    Client::builder()
        // No overall timeout: the client owns stream-duration policy, and
        // pings keep the connection alive during long generations.
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .unwrap_or_default()
}

fn map_send_error(provider: &ProviderDescriptor, error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        return LlmError::Timeout(format!("request to {} timed out", provider.name));
    }

    if error.is_connect() {
        let mut message = format!(
            "could not connect to {} at {}",
            provider.name, provider.base_url
        );
        if let Some(start) = provider.start_command {
            message.push_str(&format!(" (start it with `{start}`)"));
        }
        return LlmError::ConnectionError(message);
    }

    LlmError::ConnectionError(format!("request to {} failed: {error}", provider.name))
}

/// Translate an upstream error status and body into the client-facing
/// taxonomy. Text sniffing covers the divergent error shapes of local
/// servers.
pub(crate) fn map_status_error(
    provider: &ProviderDescriptor,
    model: &str,
    status: u16,
    body: String,
) -> LlmError {
    log::error!("{} API error ({status}): {body}", provider.name);

    let lowered = body.to_lowercase();

    if lowered.contains("does not support tools") || lowered.contains("tool use is not supported") {
        return LlmError::CapabilityError(format!(
            "model '{model}' on {} does not support tool calls; \
             choose a tool-capable model or disable tools",
            provider.name
        ));
    }

    if status == 404 || lowered.contains("model not found") || lowered.contains("does not exist") {
        let mut message = format!("model '{model}' was not found on {}", provider.name);
        if provider.name == "ollama" {
            message.push_str(&format!("; pull it with `ollama pull {model}`"));
        }
        return LlmError::ModelNotFound(message);
    }

    match status {
        401 | 403 => LlmError::AuthenticationFailed(body),
        429 => LlmError::RateLimitExceeded(body),
        500..=599 if lowered.contains("overloaded") => LlmError::Overloaded(body),
        _ => LlmError::ProviderApiError { status, message: body },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::resolve_model;

    fn ollama() -> ProviderDescriptor {
        resolve_model("ollama/qwen3:8b").unwrap().provider
    }

    #[test]
    fn model_not_found_includes_pull_hint() {
        let error = map_status_error(
            &ollama(),
            "qwen3:8b",
            404,
            r#"{"error":"model 'qwen3:8b' not found"}"#.to_string(),
        );

        let LlmError::ModelNotFound(message) = error else {
            unreachable!("expected model not found");
        };
        assert!(message.contains("ollama pull qwen3:8b"));
    }

    #[test]
    fn tool_support_errors_become_capability_errors() {
        let error = map_status_error(
            &ollama(),
            "gemma3:4b",
            400,
            r#"{"error":"registry.ollama.ai/library/gemma3:4b does not support tools"}"#.to_string(),
        );

        assert!(matches!(error, LlmError::CapabilityError(_)));
        assert_eq!(error.error_type(), "capability_error");
    }

    #[test]
    fn auth_and_rate_limit_statuses_map_directly() {
        let error = map_status_error(&ollama(), "m", 401, "bad key".to_string());
        assert!(matches!(error, LlmError::AuthenticationFailed(_)));

        let error = map_status_error(&ollama(), "m", 429, "slow down".to_string());
        assert!(matches!(error, LlmError::RateLimitExceeded(_)));
    }

    #[test]
    fn unknown_statuses_keep_the_upstream_code() {
        let error = map_status_error(&ollama(), "m", 502, "bad gateway".to_string());
        let LlmError::ProviderApiError { status, .. } = error else {
            unreachable!("expected provider api error");
        };
        assert_eq!(status, 502);
    }
}
