//! The dispatcher: per-request entry point tying resolution, gating,
//! transformation, upstream dispatch and stream translation together.
//!
//! Each request runs on its own task. The streaming path writes into a small
//! bounded channel the HTTP layer drains; because the driver serializes
//! read-then-write, a slow client naturally pauses upstream reading.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    adapter::{self, ModelAdapter},
    error::LlmResult,
    messages::{
        anthropic::{
            AnthropicChatRequest, AnthropicChatResponse, AnthropicContent, AnthropicRole,
            AnthropicStreamEvent, AnthropicUsage,
        },
        openai::{ChatCompletionChunk, ChatCompletionResponse, ChunkChoice},
        unified::UnifiedRequest,
    },
    provider::{
        self, Resolution,
        health::{self, DEFAULT_CONTEXT_WINDOW},
        openai::{ChunkStream, UpstreamClient},
    },
    request::RequestContext,
    stream::{ReasoningPolicy, StreamTranslator, map_stop_reason},
    token_counter,
    usage::{self, CacheSplit, ConversationCache, SessionTotals},
};

const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Channel depth for the event writer; small so backpressure reaches the
/// upstream read loop quickly.
const EVENT_CHANNEL_CAPACITY: usize = 16;

pub(crate) struct ServerConfig {
    pub port: u16,
    pub model: String,
    pub reasoning_policy: ReasoningPolicy,
}

/// Reply from the dispatcher: a complete message body or an event stream.
pub(crate) enum MessagesReply {
    Complete(Box<AnthropicChatResponse>),
    Stream(mpsc::Receiver<AnthropicStreamEvent>),
}

struct ProviderRuntime {
    context_window: u32,
}

pub(crate) struct LlmServer {
    model: String,
    policy: ReasoningPolicy,
    client: UpstreamClient,
    cache: ConversationCache,
    totals: Arc<SessionTotals>,
    /// Health-checked backends with their discovered context windows, keyed
    /// by endpoint and model.
    provider_state: Mutex<HashMap<String, ProviderRuntime>>,
}

impl LlmServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            model: config.model,
            policy: config.reasoning_policy,
            client: UpstreamClient::new(),
            cache: ConversationCache::new(),
            totals: Arc::new(SessionTotals::new(config.port)),
            provider_state: Mutex::new(HashMap::new()),
        }
    }

    /// The model identifier this proxy session is routed to.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn cache(&self) -> &ConversationCache {
        &self.cache
    }

    pub fn totals(&self) -> &SessionTotals {
        &self.totals
    }

    /// Handle a messages request end to end.
    pub async fn handle_messages(
        &self,
        context: &RequestContext,
        request: AnthropicChatRequest,
    ) -> LlmResult<MessagesReply> {
        if context.anthropic_version.is_some() || context.beta.is_some() {
            log::debug!(
                "client headers: anthropic-version={:?}, anthropic-beta={:?}",
                context.anthropic_version,
                context.beta
            );
        }

        let original_model = request.model.clone();
        let mut unified = UnifiedRequest::try_from(request)?;

        if !unified.dropped_params.is_empty() {
            log::debug!(
                "dropping parameters with no backend counterpart: {:?}",
                unified.dropped_params
            );
        }

        let resolution = provider::resolve_model(&unified.model)?;
        let provider = &resolution.provider;

        let context_window = self.ensure_provider_ready(&resolution).await?;
        self.totals.set_context_window(context_window);

        let caps = provider.capabilities;
        log::debug!(
            "provider '{}': tools={}, vision={}, streaming={}, json_mode={}",
            provider.name,
            caps.supports_tools,
            caps.supports_vision,
            caps.supports_streaming,
            caps.supports_json_mode
        );

        if unified.stream && !caps.supports_streaming {
            return Err(crate::error::LlmError::CapabilityError(format!(
                "backend '{}' does not support streaming responses",
                provider.name
            )));
        }

        let tools_requested = unified.tools.is_some();
        if tools_requested && !caps.supports_tools {
            log::warn!(
                "backend '{}' has no native tool support; tool declarations move into the prompt",
                provider.name
            );
        }

        if !caps.supports_vision {
            strip_image_blocks(&mut unified, &provider.name);
        }

        // Cache accounting happens on the client's view of the request, keyed
        // by the full model id so a provider swap never reads a stale entry.
        let cacheable_tokens = token_counter::estimate_chars(unified.cacheable_chars());
        let conversation_key = usage::conversation_key(
            &original_model,
            unified.session_id.as_deref(),
            unified.first_user_message(),
        );
        let cache_split = self.cache.begin_turn(&conversation_key, cacheable_tokens);

        unified.model = resolution.model.clone();
        let stream = unified.stream;

        let mut payload = crate::messages::unified::to_openai::to_chat_request(unified);
        let mut model_adapter =
            adapter::select_adapter(&resolution.model, &provider.capabilities, tools_requested);
        model_adapter.prepare_request(&mut payload);

        let input_estimate = token_counter::estimate_str(
            &serde_json::to_string(&payload).unwrap_or_default(),
        );

        if !stream {
            let response = self
                .client
                .chat(provider, &resolution.model, &payload)
                .await?;

            let reply = build_complete_response(
                original_model,
                response,
                self.policy,
                cache_split,
                input_estimate,
            );

            self.totals.record(crate::stream::StreamTotals {
                input_tokens: reply.usage.input_tokens,
                output_tokens: reply.usage.output_tokens,
                cost: 0.0,
            });
            if let Err(e) = self.totals.write_status_file() {
                log::debug!("status file write failed: {e}");
            }

            return Ok(MessagesReply::Complete(Box::new(reply)));
        }

        let upstream = self
            .client
            .chat_stream(provider, &resolution.model, &payload)
            .await?;

        let translator =
            StreamTranslator::new(original_model, self.policy, input_estimate, cache_split);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let totals = Arc::clone(&self.totals);

        tokio::spawn(run_stream(upstream, translator, model_adapter, tx, totals));

        Ok(MessagesReply::Stream(rx))
    }

    /// First-use gate: probe local backends and discover the model's context
    /// window. Successful probes are remembered; failures are retried on the
    /// next request.
    async fn ensure_provider_ready(&self, resolution: &Resolution) -> LlmResult<u32> {
        let provider = &resolution.provider;
        let key = format!("{}|{}|{}", provider.name, provider.base_url, resolution.model);

        if let Ok(state) = self.provider_state.lock()
            && let Some(runtime) = state.get(&key)
        {
            return Ok(runtime.context_window);
        }

        let context_window = if provider.needs_health_check() {
            health::check_health(self.client.http(), provider).await?;
            health::discover_context_window(self.client.http(), provider, &resolution.model).await
        } else {
            DEFAULT_CONTEXT_WINDOW
        };

        if let Ok(mut state) = self.provider_state.lock() {
            state.insert(key, ProviderRuntime { context_window });
        }

        Ok(context_window)
    }
}

/// Drive one streaming request: pull backend chunks, push translated events,
/// interleave pings. Runs until the stream terminates or the client goes
/// away; both writers live on this one task, so event order is program order.
async fn run_stream(
    mut upstream: ChunkStream,
    mut translator: StreamTranslator,
    mut model_adapter: Box<dyn ModelAdapter>,
    tx: mpsc::Sender<AnthropicStreamEvent>,
    totals: Arc<SessionTotals>,
) {
    let message_id = translator.message_id().to_string();

    if tx.send(translator.start()).await.is_err() {
        log::debug!("client disconnected before message_start");
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            chunk = upstream.next() => match chunk {
                Some(Ok(mut chunk)) => {
                    if let Some(choice) = chunk.choices.first_mut() {
                        model_adapter.transform_delta(&mut choice.delta);

                        // A terminal chunk also flushes whatever the adapter
                        // was still holding back.
                        if choice.finish_reason.is_some()
                            && let Some(extra) = model_adapter.finish()
                            && let Some(text) = extra.content
                        {
                            match &mut choice.delta.content {
                                Some(content) => content.push_str(&text),
                                None => choice.delta.content = Some(text),
                            }
                        }
                    }

                    if !send_all(&tx, translator.step(chunk)).await {
                        log::debug!("client disconnected, aborting backend stream for {message_id}");
                        return;
                    }
                    if translator.is_closed() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::error!("backend stream error for {message_id}: {e}");
                    send_all(&tx, translator.error_events(&e)).await;
                    break;
                }
                None => {
                    // Stream ended without a finish reason ([DONE] or EOF).
                    if let Some(extra) = model_adapter.finish() {
                        let flush = ChatCompletionChunk {
                            choices: vec![ChunkChoice {
                                index: Some(0),
                                delta: extra,
                                finish_reason: None,
                            }],
                            ..ChatCompletionChunk::default()
                        };
                        if !send_all(&tx, translator.step(flush)).await {
                            return;
                        }
                    }
                    send_all(&tx, translator.finish()).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if tx.send(AnthropicStreamEvent::Ping).await.is_err() {
                    log::debug!("client disconnected during ping for {message_id}");
                    return;
                }
            }
        }
    }

    totals.record(translator.totals());
    if let Err(e) = totals.write_status_file() {
        log::debug!("status file write failed: {e}");
    }

    log::debug!("stream {message_id} complete");
}

async fn send_all(
    tx: &mpsc::Sender<AnthropicStreamEvent>,
    events: Vec<AnthropicStreamEvent>,
) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

/// Assemble a complete (non-streaming) Anthropic response body.
fn build_complete_response(
    model: String,
    response: ChatCompletionResponse,
    policy: ReasoningPolicy,
    cache: CacheSplit,
    input_estimate: u32,
) -> AnthropicChatResponse {
    let mut content = Vec::new();
    let mut finish_reason = None;
    let mut output_chars = 0usize;

    if let Some(choice) = response.choices.into_iter().next() {
        finish_reason = choice.finish_reason;
        let message = choice.message;

        let reasoning = message
            .reasoning
            .or(message.reasoning_content)
            .filter(|r| !r.is_empty());
        if let Some(reasoning) = reasoning {
            output_chars += reasoning.chars().count();
            match policy {
                ReasoningPolicy::AsThinking => {
                    content.push(AnthropicContent::Thinking { thinking: reasoning });
                }
                ReasoningPolicy::AsText => {
                    content.push(AnthropicContent::Text { text: reasoning });
                }
                ReasoningPolicy::Suppress => {}
            }
        }

        if let Some(text) = message.content.filter(|t| !t.is_empty()) {
            output_chars += text.chars().count();
            content.push(AnthropicContent::Text { text });
        }

        for call in message.tool_calls.unwrap_or_default() {
            output_chars += call.function.arguments.chars().count();
            content.push(AnthropicContent::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_tool_arguments(&call.function.arguments),
            });
        }
    }

    let usage = response.usage.unwrap_or_default();
    let output_tokens = usage
        .completion_tokens
        .unwrap_or_else(|| token_counter::estimate_chars(output_chars));

    AnthropicChatResponse {
        id: response
            .id
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        r#type: "message".to_string(),
        role: AnthropicRole::Assistant,
        content,
        model,
        stop_reason: Some(map_stop_reason(finish_reason.as_deref())),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: usage.prompt_tokens.unwrap_or(input_estimate),
            output_tokens,
            cache_creation_input_tokens: cache.creation,
            cache_read_input_tokens: cache.read,
            cache_creation: None,
        },
    }
}

/// Drop image blocks the backend cannot see, replacing them with a short
/// placeholder so block positions in the conversation stay meaningful.
fn strip_image_blocks(unified: &mut UnifiedRequest, provider_name: &str) {
    let mut stripped = 0usize;

    for message in &mut unified.messages {
        for block in &mut message.blocks {
            if matches!(block, crate::messages::unified::UnifiedBlock::Image { .. }) {
                *block = crate::messages::unified::UnifiedBlock::Text(
                    "[image omitted: backend has no vision support]".to_string(),
                );
                stripped += 1;
            }
        }
    }

    if stripped > 0 {
        log::warn!("backend '{provider_name}' has no vision support; {stripped} image block(s) omitted");
    }
}

/// Parse an assembled arguments string, preserving unparseable input as a
/// string rather than failing the response.
fn parse_tool_arguments(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::anthropic::AnthropicStopReason;
    use serde_json::json;

    fn response_from(value: serde_json::Value) -> ChatCompletionResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn complete_response_with_text_and_tools() {
        let response = response_from(json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": {
                    "content": "Let me read that.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "Read", "arguments": "{\"file_path\":\"x.ts\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 42, "completion_tokens": 17}
        }));

        let reply = build_complete_response(
            "ollama/qwen3:8b".to_string(),
            response,
            ReasoningPolicy::AsText,
            CacheSplit { creation: 100, read: 0 },
            1,
        );

        assert_eq!(reply.model, "ollama/qwen3:8b");
        assert_eq!(reply.stop_reason, Some(AnthropicStopReason::ToolUse));
        assert_eq!(reply.usage.input_tokens, 42);
        assert_eq!(reply.usage.output_tokens, 17);
        assert_eq!(reply.usage.cache_creation_input_tokens, 100);
        assert_eq!(reply.content.len(), 2);

        let AnthropicContent::ToolUse { input, .. } = &reply.content[1] else {
            unreachable!("expected tool_use block");
        };
        assert_eq!(input["file_path"], "x.ts");
    }

    #[test]
    fn complete_response_estimates_missing_usage() {
        let response = response_from(json!({
            "choices": [{
                "index": 0,
                "message": {"content": "xxxxxxxx"},
                "finish_reason": "stop"
            }]
        }));

        let reply = build_complete_response(
            "m".to_string(),
            response,
            ReasoningPolicy::AsText,
            CacheSplit::default(),
            55,
        );

        assert_eq!(reply.usage.input_tokens, 55);
        assert_eq!(reply.usage.output_tokens, 2);
        assert!(reply.id.starts_with("msg_"));
    }

    #[test]
    fn complete_response_reasoning_as_thinking() {
        let response = response_from(json!({
            "choices": [{
                "index": 0,
                "message": {"reasoning": "planning", "content": "Done."},
                "finish_reason": "stop"
            }]
        }));

        let reply = build_complete_response(
            "m".to_string(),
            response,
            ReasoningPolicy::AsThinking,
            CacheSplit::default(),
            1,
        );

        assert!(matches!(reply.content[0], AnthropicContent::Thinking { .. }));
        assert!(matches!(reply.content[1], AnthropicContent::Text { .. }));
    }

    #[test]
    fn unparseable_tool_arguments_are_preserved_as_strings() {
        assert_eq!(parse_tool_arguments(""), json!({}));
        assert_eq!(parse_tool_arguments("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(
            parse_tool_arguments("{\"broken"),
            Value::String("{\"broken".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pings_cover_a_stalled_backend() {
        // A backend that produces one chunk and then stalls forever.
        let upstream: ChunkStream = Box::pin(futures::stream::unfold(0u32, |state| async move {
            match state {
                0 => Some((
                    Ok(serde_json::from_value(json!({
                        "choices": [{"index": 0, "delta": {"content": "thinking"}}]
                    }))
                    .unwrap()),
                    1,
                )),
                _ => {
                    futures::future::pending::<()>().await;
                    None
                }
            }
        }));

        let translator = StreamTranslator::new(
            "m".to_string(),
            ReasoningPolicy::AsText,
            1,
            CacheSplit::default(),
        );
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let totals = Arc::new(SessionTotals::new(1));

        let driver = tokio::spawn(run_stream(
            upstream,
            translator,
            Box::new(crate::adapter::PassthroughAdapter),
            tx,
            totals,
        ));

        // message_start, content_block_start, content_block_delta.
        for expected in ["message_start", "content_block_start", "content_block_delta"] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_name(), expected);
        }

        // 45 simulated seconds of silence: a ping at each 15 s mark.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(15)).await;
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_name(), "ping");
        }

        driver.abort();
    }

    #[tokio::test]
    async fn client_disconnect_stops_the_driver() {
        let upstream: ChunkStream = Box::pin(futures::stream::iter(
            std::iter::repeat_with(|| {
                Ok(serde_json::from_value::<ChatCompletionChunk>(json!({
                    "choices": [{"index": 0, "delta": {"content": "x"}}]
                }))
                .unwrap())
            })
            .take(10_000),
        ));

        let translator = StreamTranslator::new(
            "m".to_string(),
            ReasoningPolicy::AsText,
            1,
            CacheSplit::default(),
        );
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let totals = Arc::new(SessionTotals::new(2));

        let driver = tokio::spawn(run_stream(
            upstream,
            translator,
            Box::new(crate::adapter::PassthroughAdapter),
            tx,
            totals,
        ));

        // Read a couple of events, then hang up.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        drop(rx);

        driver.await.unwrap();
    }
}
