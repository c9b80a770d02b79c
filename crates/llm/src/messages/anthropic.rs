use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request body for the Anthropic Messages API as the coding-agent client
/// sends it.
///
/// The format differs from OpenAI's in several key ways:
/// - Message content is an array of typed blocks (or a bare string)
/// - The system prompt lives outside the messages array
/// - Tool interactions use tool_use/tool_result blocks instead of
///   function-call messages
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicChatRequest {
    /// The model to route the completion to. May carry a provider prefix
    /// ("ollama/qwen3:8b") or be a full URL to a local server.
    pub model: String,

    /// Conversation messages, alternating between "user" and "assistant".
    pub messages: Vec<AnthropicMessage>,

    /// Maximum number of tokens to generate. Required by the protocol.
    pub max_tokens: u32,

    /// System prompt; either a plain string or an array of text parts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<AnthropicSystem>,

    /// Sampling temperature, 0.0 to 1.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k sampling. Not representable on OpenAI backends; recorded as a
    /// dropped parameter during transformation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Sequences that stop generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// Whether to stream the response as server-sent events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Request metadata; `user_id` doubles as the conversation key for
    /// cache-metric accounting when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnthropicMetadata>,

    /// Tools the model may call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,

    /// Controls how the model uses tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<AnthropicToolChoice>,

    /// Top-level fields this proxy does not understand. Preserved so the
    /// transformer can report them as dropped instead of failing the request.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// System prompt: a bare string or an array of text parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicSystemBlock>),
}

/// A single text part of a structured system prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicSystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

/// A conversation message with role and content.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicMessage {
    pub role: AnthropicRole,
    pub content: AnthropicMessageContent,
}

/// Message content: a bare string or an array of typed blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AnthropicMessageContent {
    Text(String),
    Blocks(Vec<AnthropicContent>),
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnthropicRole {
    User,
    Assistant,
}

/// Content block in a message or a streamed response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum AnthropicContent {
    /// Plain text.
    #[serde(rename = "text")]
    Text { text: String },

    /// Base64 image content.
    #[serde(rename = "image")]
    Image { source: AnthropicImageSource },

    /// Tool invocation requested by the assistant.
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result of a tool execution, sent back by the client.
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: AnthropicToolResultContent,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Chain-of-thought content surfaced as its own block.
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
}

/// Tool result payload: a bare string or nested text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AnthropicToolResultContent {
    Text(String),
    Blocks(Vec<AnthropicToolResultBlock>),
}

impl Default for AnthropicToolResultContent {
    fn default() -> Self {
        AnthropicToolResultContent::Text(String::new())
    }
}

/// A nested block inside a tool result. Only text survives translation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum AnthropicToolResultBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

/// Image source for image content blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicImageSource {
    /// Always "base64" from the client.
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

/// Request metadata.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Tool declaration in Anthropic format.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: Value,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicToolChoice {
    /// Let the model decide.
    Auto,
    /// Force the model to use some tool.
    Any,
    /// Disable tool use for this turn.
    None,
    /// Force a specific tool.
    Tool { name: String },
}

/// Non-streaming response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicChatResponse {
    pub id: String,
    /// Always "message".
    pub r#type: String,
    pub role: AnthropicRole,
    pub content: Vec<AnthropicContent>,
    pub model: String,
    pub stop_reason: Option<AnthropicStopReason>,
    pub stop_sequence: Option<String>,
    pub usage: AnthropicUsage,
}

/// The reason why the model stopped generating tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnthropicStopReason {
    /// Natural stopping point.
    EndTurn,
    /// The max_tokens limit was hit.
    MaxTokens,
    /// A stop sequence (or upstream content filter) ended generation.
    StopSequence,
    /// The model invoked a tool.
    ToolUse,
}

impl fmt::Display for AnthropicStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnthropicStopReason::EndTurn => write!(f, "end_turn"),
            AnthropicStopReason::MaxTokens => write!(f, "max_tokens"),
            AnthropicStopReason::StopSequence => write!(f, "stop_sequence"),
            AnthropicStopReason::ToolUse => write!(f, "tool_use"),
        }
    }
}

/// Token usage in Anthropic format, including the cache split the client
/// renders in its status line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_input_tokens: u32,
    pub cache_read_input_tokens: u32,
    /// Mirrors `cache_creation_input_tokens` on cache-create turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<AnthropicCacheCreation>,
}

/// Breakdown of cache-creation tokens by TTL bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicCacheCreation {
    pub ephemeral_5m_input_tokens: u32,
}

/// Error details carried in an error body or an `error` stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicErrorDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Top-level error body: `{"type":"error","error":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicErrorBody {
    #[serde(rename = "type")]
    pub body_type: String,
    pub error: AnthropicErrorDetails,
}

impl AnthropicErrorBody {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            body_type: "error".to_string(),
            error: AnthropicErrorDetails {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }
}

/// Streaming event surface emitted to the client.
///
/// Streams begin with `message_start`, contain one or more content block
/// lifecycles (`content_block_start` → `content_block_delta*` →
/// `content_block_stop`) with strictly increasing indices, and finish with
/// `message_delta` followed by a terminal `message_stop`. `ping` may appear
/// anywhere in between.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: AnthropicStreamMessageStart },

    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: AnthropicContent,
    },

    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        index: u32,
        delta: AnthropicContentDelta,
    },

    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },

    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: AnthropicMessageDelta,
        usage: AnthropicUsage,
    },

    #[serde(rename = "message_stop")]
    MessageStop,

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "error")]
    Error { error: AnthropicErrorDetails },
}

impl AnthropicStreamEvent {
    /// The SSE `event:` name for this payload.
    pub fn event_name(&self) -> &'static str {
        match self {
            AnthropicStreamEvent::MessageStart { .. } => "message_start",
            AnthropicStreamEvent::ContentBlockStart { .. } => "content_block_start",
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            AnthropicStreamEvent::MessageDelta { .. } => "message_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
            AnthropicStreamEvent::Ping => "ping",
            AnthropicStreamEvent::Error { .. } => "error",
        }
    }
}

/// Metadata carried by the initial `message_start` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicStreamMessageStart {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: AnthropicRole,
    pub content: Vec<AnthropicContent>,
    pub model: String,
    pub stop_reason: Option<AnthropicStopReason>,
    pub stop_sequence: Option<String>,
    pub usage: AnthropicUsage,
}

/// Incremental update for a content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AnthropicContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },

    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
}

/// Top-level message changes delivered just before `message_stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessageDelta {
    pub stop_reason: Option<AnthropicStopReason>,
    pub stop_sequence: Option<String>,
}

/// Body for `POST /v1/messages/count_tokens`. The shape is a subset of the
/// chat request; `max_tokens` is absent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CountTokensRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<AnthropicSystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensResponse {
    pub input_tokens: u32,
}

/// Model entry for `GET /v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicModel {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub display_name: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicModelsResponse {
    pub data: Vec<AnthropicModel>,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_request_with_block_content() {
        let json = json!({
            "model": "ollama/qwen3:8b",
            "max_tokens": 1024,
            "stream": true,
            "system": "You are a coding assistant.",
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "Read the file."},
                        {
                            "type": "image",
                            "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}
                        }
                    ]
                }
            ]
        });

        let request: AnthropicChatRequest = serde_json::from_value(json).unwrap();

        assert_eq!(request.model, "ollama/qwen3:8b");
        assert_eq!(request.max_tokens, 1024);
        assert_eq!(request.stream, Some(true));
        assert!(matches!(request.system, Some(AnthropicSystem::Text(_))));

        let AnthropicMessageContent::Blocks(blocks) = &request.messages[0].content else {
            unreachable!("expected block content");
        };
        assert_eq!(blocks.len(), 2);
        assert!(request.extra.is_empty());
    }

    #[test]
    fn deserialize_request_with_string_content_and_unknown_fields() {
        let json = json!({
            "model": "m",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "What is 2+2?"}],
            "some_future_field": {"nested": true}
        });

        let request: AnthropicChatRequest = serde_json::from_value(json).unwrap();

        assert!(matches!(
            request.messages[0].content,
            AnthropicMessageContent::Text(_)
        ));
        assert!(request.extra.contains_key("some_future_field"));
    }

    #[test]
    fn deserialize_tool_result_variants() {
        let bare: AnthropicContent = serde_json::from_value(json!({
            "type": "tool_result",
            "tool_use_id": "toolu_1",
            "content": "file contents"
        }))
        .unwrap();

        let AnthropicContent::ToolResult { content, is_error, .. } = bare else {
            unreachable!("expected tool result");
        };
        assert!(matches!(content, AnthropicToolResultContent::Text(t) if t == "file contents"));
        assert_eq!(is_error, None);

        let nested: AnthropicContent = serde_json::from_value(json!({
            "type": "tool_result",
            "tool_use_id": "toolu_2",
            "content": [{"type": "text", "text": "line 1"}, {"type": "text", "text": "line 2"}],
            "is_error": true
        }))
        .unwrap();

        let AnthropicContent::ToolResult { content, is_error, .. } = nested else {
            unreachable!("expected tool result");
        };
        assert!(matches!(content, AnthropicToolResultContent::Blocks(b) if b.len() == 2));
        assert_eq!(is_error, Some(true));
    }

    #[test]
    fn serialize_stream_events() {
        let start = AnthropicStreamEvent::MessageStart {
            message: AnthropicStreamMessageStart {
                id: "msg_123".to_string(),
                message_type: "message".to_string(),
                role: AnthropicRole::Assistant,
                content: vec![],
                model: "qwen3:8b".to_string(),
                stop_reason: None,
                stop_sequence: None,
                usage: AnthropicUsage::default(),
            },
        };

        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["type"], "message_start");
        assert_eq!(json["message"]["usage"]["input_tokens"], 0);
        assert_eq!(json["message"]["usage"]["cache_read_input_tokens"], 0);
        assert_eq!(start.event_name(), "message_start");

        let delta = AnthropicStreamEvent::ContentBlockDelta {
            index: 2,
            delta: AnthropicContentDelta::InputJsonDelta {
                partial_json: "{\"file".to_string(),
            },
        };

        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["index"], 2);
        assert_eq!(json["delta"]["type"], "input_json_delta");
        assert_eq!(delta.event_name(), "content_block_delta");
    }

    #[test]
    fn usage_cache_creation_is_omitted_when_absent() {
        let usage = AnthropicUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 120,
            cache_creation: None,
        };

        let json = serde_json::to_value(&usage).unwrap();
        assert_eq!(json["cache_read_input_tokens"], 120);
        assert!(json.get("cache_creation").is_none());
    }

    #[test]
    fn tool_choice_round_trip() {
        let choice: AnthropicToolChoice =
            serde_json::from_value(json!({"type": "tool", "name": "Read"})).unwrap();
        assert!(matches!(choice, AnthropicToolChoice::Tool { ref name } if name == "Read"));

        let auto: AnthropicToolChoice = serde_json::from_value(json!({"type": "auto"})).unwrap();
        assert!(matches!(auto, AnthropicToolChoice::Auto));
    }
}
