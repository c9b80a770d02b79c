//! Protocol-agnostic intermediate request form.
//!
//! Incoming Anthropic requests are validated into [`UnifiedRequest`] at the
//! boundary; the outbound OpenAI payload is derived from it. Working in a
//! statically typed neutral form keeps both conversions honest: every block
//! kind is a tagged variant, and anything the proxy cannot represent is
//! reported as a dropped parameter instead of silently vanishing.
//!
//! Conversion flow:
//!
//! ```text
//! AnthropicChatRequest → UnifiedRequest → (ChatCompletionRequest, dropped)
//! ```

use serde_json::Value;

pub(crate) mod from_anthropic;
pub(crate) mod to_openai;

/// Unified request representation.
#[derive(Debug, Clone)]
pub struct UnifiedRequest {
    /// Model identifier as the client sent it, including any provider prefix.
    pub model: String,

    /// System prompt, already folded into a single string.
    pub system: Option<String>,

    /// Conversation messages. Never empty once validated.
    pub messages: Vec<UnifiedMessage>,

    pub tools: Option<Vec<UnifiedTool>>,
    pub tool_choice: Option<UnifiedToolChoice>,

    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: u32,
    pub stop_sequences: Option<Vec<String>>,
    pub stream: bool,

    /// Conversation key provided by the client, when present.
    pub session_id: Option<String>,

    /// Top-level request fields with no OpenAI counterpart. Logged by the
    /// dispatcher so a model swap never silently changes semantics.
    pub dropped_params: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UnifiedMessage {
    pub role: UnifiedRole,
    pub blocks: Vec<UnifiedBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedRole {
    User,
    Assistant,
}

/// A single content block, normalized for translation.
#[derive(Debug, Clone)]
pub enum UnifiedBlock {
    Text(String),

    Image {
        media_type: String,
        data: String,
    },

    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Tool result with its content already stringified.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone)]
pub struct UnifiedTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnifiedToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

impl UnifiedRequest {
    /// First user message, used to fingerprint the conversation when the
    /// client did not provide a session id.
    pub fn first_user_message(&self) -> Option<&UnifiedMessage> {
        self.messages.iter().find(|m| m.role == UnifiedRole::User)
    }

    /// Character length of the cacheable request prefix: the system prompt
    /// plus the serialized tool declarations.
    pub fn cacheable_chars(&self) -> usize {
        let system_len = self.system.as_deref().map_or(0, str::len);

        let tools_len = self
            .tools
            .as_deref()
            .map_or(0, |tools| {
                tools
                    .iter()
                    .map(|t| {
                        t.name.len()
                            + t.description.len()
                            + serde_json::to_string(&t.input_schema).map_or(0, |s| s.len())
                    })
                    .sum()
            });

        system_len + tools_len
    }
}
