//! Conversion from the unified intermediate form to an OpenAI
//! chat-completions payload.
//!
//! This is a pure function of its input: the same unified request always
//! produces the same payload.

use std::sync::LazyLock;

use regex::Regex;

use crate::messages::{openai, unified};

/// Longest tool name OpenAI-compatible backends accept.
const MAX_TOOL_NAME_LEN: usize = 64;

/// Assistant messages that are nothing but an identity disclosure are removed
/// from the history, so a swapped-in model is not prompted to impersonate the
/// original vendor's.
static IDENTITY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*i(?:'|’)?m claude\b",
        r"(?i)^\s*i am claude\b",
        r"(?i)^\s*(?:i(?:'|’)?m|i am) an ai (?:assistant|model) (?:made|created|developed) by anthropic\b",
        r"(?i)^\s*this is claude\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("identity patterns are static"))
    .collect()
});

static TOOL_NAME_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("tool name pattern is static"));

/// Build the outbound OpenAI payload.
pub(crate) fn to_chat_request(req: unified::UnifiedRequest) -> openai::ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = req.system.filter(|s| !s.is_empty()) {
        messages.push(openai::ChatMessage::text(openai::ChatRole::System, system));
    }

    for message in req.messages {
        match message.role {
            unified::UnifiedRole::User => flatten_user_message(message.blocks, &mut messages),
            unified::UnifiedRole::Assistant => flatten_assistant_message(message.blocks, &mut messages),
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| openai::ToolDefinition {
                tool_type: "function".to_string(),
                function: openai::FunctionDefinition {
                    name: sanitize_tool_name(&tool.name),
                    description: (!tool.description.is_empty()).then_some(tool.description),
                    parameters: tool.input_schema,
                },
            })
            .collect::<Vec<_>>()
    });

    let stream = req.stream;

    openai::ChatCompletionRequest {
        model: req.model,
        messages,
        tools,
        tool_choice: req.tool_choice.map(convert_tool_choice),
        temperature: Some(req.temperature.unwrap_or(1.0)),
        top_p: req.top_p,
        max_tokens: Some(req.max_tokens),
        max_completion_tokens: None,
        stop: req.stop_sequences,
        stream,
        stream_options: stream.then_some(openai::StreamOptions { include_usage: true }),
    }
}

/// A user message fans out into tool-role messages (one per tool result,
/// emitted first so they follow the assistant tool calls they answer) and at
/// most one user message carrying the remaining text and images.
fn flatten_user_message(blocks: Vec<unified::UnifiedBlock>, out: &mut Vec<openai::ChatMessage>) {
    let mut parts: Vec<openai::ContentPart> = Vec::new();
    let mut has_image = false;

    for block in blocks {
        match block {
            unified::UnifiedBlock::Text(text) => {
                push_text_part(&mut parts, text);
            }
            unified::UnifiedBlock::Image { media_type, data } => {
                has_image = true;
                parts.push(openai::ContentPart::ImageUrl {
                    image_url: openai::ImageUrl {
                        url: format!("data:{media_type};base64,{data}"),
                    },
                });
            }
            unified::UnifiedBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let content = if is_error {
                    format!("Error: {content}")
                } else {
                    content
                };
                out.push(openai::ChatMessage {
                    role: openai::ChatRole::Tool,
                    content: Some(openai::ChatMessageContent::Text(content)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                });
            }
            unified::UnifiedBlock::ToolUse { .. } => {
                // Rejected during validation; unreachable by construction.
            }
        }
    }

    if parts.is_empty() {
        return;
    }

    // Keep the simple string shape unless an image forces multimodal parts.
    let content = if has_image {
        openai::ChatMessageContent::Parts(parts)
    } else {
        let text = parts
            .into_iter()
            .map(|part| match part {
                openai::ContentPart::Text { text } => text,
                openai::ContentPart::ImageUrl { .. } => String::new(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        openai::ChatMessageContent::Text(text)
    };

    out.push(openai::ChatMessage {
        role: openai::ChatRole::User,
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    });
}

/// Merge adjacent text into the preceding text part so block boundaries do
/// not introduce spurious part splits.
fn push_text_part(parts: &mut Vec<openai::ContentPart>, text: String) {
    if let Some(openai::ContentPart::Text { text: last }) = parts.last_mut() {
        last.push('\n');
        last.push_str(&text);
    } else {
        parts.push(openai::ContentPart::Text { text });
    }
}

/// An assistant message becomes one OpenAI assistant message carrying the
/// concatenated text and a tool_calls array for its tool_use blocks.
fn flatten_assistant_message(blocks: Vec<unified::UnifiedBlock>, out: &mut Vec<openai::ChatMessage>) {
    let mut text_segments: Vec<String> = Vec::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();

    for block in blocks {
        match block {
            unified::UnifiedBlock::Text(text) => text_segments.push(text),
            unified::UnifiedBlock::ToolUse { id, name, input } => {
                tool_calls.push(openai::ToolCall {
                    id,
                    call_type: "function".to_string(),
                    function: openai::FunctionCall {
                        name: sanitize_tool_name(&name),
                        arguments: serde_json::to_string(&input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            // Images and tool results do not occur on assistant messages.
            _ => {}
        }
    }

    let text = text_segments.join("\n");

    if tool_calls.is_empty() && is_identity_disclosure(&text) {
        log::debug!("removing identity-disclosure message from history");
        return;
    }

    if text.is_empty() && tool_calls.is_empty() {
        return;
    }

    out.push(openai::ChatMessage {
        role: openai::ChatRole::Assistant,
        content: (!text.is_empty()).then_some(openai::ChatMessageContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    });
}

fn is_identity_disclosure(text: &str) -> bool {
    !text.is_empty() && IDENTITY_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Replace characters the backend's function-name pattern rejects and clamp
/// the length.
pub(crate) fn sanitize_tool_name(name: &str) -> String {
    let mut sanitized = TOOL_NAME_INVALID.replace_all(name, "_").into_owned();

    if sanitized.len() > MAX_TOOL_NAME_LEN {
        sanitized.truncate(MAX_TOOL_NAME_LEN);
    }

    if sanitized != name {
        log::warn!("tool name '{name}' rewritten to '{sanitized}' for backend compatibility");
    }

    sanitized
}

fn convert_tool_choice(choice: unified::UnifiedToolChoice) -> openai::ToolChoice {
    match choice {
        unified::UnifiedToolChoice::Auto => openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto),
        unified::UnifiedToolChoice::None => openai::ToolChoice::Mode(openai::ToolChoiceMode::None),
        unified::UnifiedToolChoice::Required => {
            openai::ToolChoice::Mode(openai::ToolChoiceMode::Required)
        }
        unified::UnifiedToolChoice::Tool(name) => openai::ToolChoice::Function {
            choice_type: "function".to_string(),
            function: openai::FunctionChoice {
                name: sanitize_tool_name(&name),
            },
        },
    }
}
