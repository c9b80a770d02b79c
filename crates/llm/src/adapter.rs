//! Per-model-family adapters.
//!
//! Adapters sit between the transformer and the wire: they get a last look
//! at the outbound payload and a first look at every inbound delta. Each
//! request gets its own adapter instance, selected by model family and
//! provider capabilities, so adapters may carry per-stream state.

use serde_json::Value;

use crate::{
    messages::openai::{
        ChatCompletionRequest, ChatMessage, ChatMessageContent, ChatRole, ChunkDelta,
        FunctionDelta, ToolCallDelta,
    },
    provider::ProviderCapabilities,
};

pub(crate) trait ModelAdapter: Send {
    /// Mutate the outbound payload before dispatch.
    fn prepare_request(&self, _request: &mut ChatCompletionRequest) {}

    /// Inspect and rewrite an inbound delta.
    fn transform_delta(&mut self, _delta: &mut ChunkDelta) {}

    /// Release buffered state at stream end. Returns a final synthetic delta
    /// when the adapter was holding content back.
    fn finish(&mut self) -> Option<ChunkDelta> {
        None
    }

    /// Clear per-stream state.
    fn reset(&mut self) {}
}

/// Select the adapter for a resolved model.
pub(crate) fn select_adapter(
    model: &str,
    capabilities: &ProviderCapabilities,
    tools_requested: bool,
) -> Box<dyn ModelAdapter> {
    let family = model.rsplit('/').next().unwrap_or(model);

    if ["o1", "o3", "o4", "gpt-5"]
        .iter()
        .any(|prefix| family.starts_with(prefix))
    {
        log::debug!("using reasoning-model adapter for '{model}'");
        return Box::new(ReasoningModelAdapter);
    }

    if tools_requested && !capabilities.supports_tools {
        log::debug!("using text tool-call adapter for '{model}'");
        return Box::new(TextToolCallAdapter::new());
    }

    Box::new(PassthroughAdapter)
}

/// No-op adapter for well-behaved backends.
pub(crate) struct PassthroughAdapter;

impl ModelAdapter for PassthroughAdapter {}

/// OpenAI reasoning families reject `max_tokens` and non-default sampling
/// parameters; remap instead of letting the backend 400.
pub(crate) struct ReasoningModelAdapter;

impl ModelAdapter for ReasoningModelAdapter {
    fn prepare_request(&self, request: &mut ChatCompletionRequest) {
        if let Some(max_tokens) = request.max_tokens.take() {
            request.max_completion_tokens = Some(max_tokens);
        }
        request.temperature = None;
        request.top_p = None;
    }
}

/// Tool support for backends without native tool calling.
///
/// Outbound, the tool declarations move into the system prompt with an
/// instruction to answer in `<tool_call>` tags. Inbound, tagged spans are
/// parsed out of the text stream and replayed as synthetic tool-call deltas,
/// invisible to the text block.
#[derive(Default)]
pub(crate) struct TextToolCallAdapter {
    scanner: TagScanner,
    next_slot: u32,
}

impl TextToolCallAdapter {
    pub fn new() -> Self {
        Self {
            scanner: TagScanner::default(),
            next_slot: 0,
        }
    }
}

const OPEN_TAG: &str = "<tool_call>";
const CLOSE_TAG: &str = "</tool_call>";

impl ModelAdapter for TextToolCallAdapter {
    fn prepare_request(&self, request: &mut ChatCompletionRequest) {
        let Some(tools) = request.tools.take() else {
            return;
        };
        request.tool_choice = None;

        let mut instructions = String::from(
            "You have access to the following tools. To call one, reply with \
             a single line of the form \
             <tool_call>{\"name\": \"...\", \"arguments\": {...}}</tool_call> \
             and nothing else on that line.\n\nTools:\n",
        );
        for tool in &tools {
            instructions.push_str(&format!(
                "- {}: {}\n  parameters: {}\n",
                tool.function.name,
                tool.function.description.as_deref().unwrap_or(""),
                serde_json::to_string(&tool.function.parameters).unwrap_or_default(),
            ));
        }

        match request.messages.first_mut() {
            Some(message) if message.role == ChatRole::System => {
                if let Some(ChatMessageContent::Text(text)) = message.content.as_mut() {
                    text.push_str("\n\n");
                    text.push_str(&instructions);
                } else {
                    message.content = Some(ChatMessageContent::Text(instructions));
                }
            }
            _ => {
                request
                    .messages
                    .insert(0, ChatMessage::text(ChatRole::System, instructions));
            }
        }
    }

    fn transform_delta(&mut self, delta: &mut ChunkDelta) {
        let Some(content) = delta.content.take() else {
            return;
        };

        let (visible, calls) = self.scanner.push(&content);

        if !visible.is_empty() {
            delta.content = Some(visible);
        }

        for call in calls {
            let slot = self.next_slot;
            self.next_slot += 1;

            delta.tool_calls.get_or_insert_with(Vec::new).push(ToolCallDelta {
                index: Some(slot),
                id: None,
                call_type: Some("function".to_string()),
                function: Some(FunctionDelta {
                    name: Some(call.name),
                    arguments: Some(call.arguments),
                }),
            });
        }
    }

    fn finish(&mut self) -> Option<ChunkDelta> {
        let leftover = self.scanner.flush();
        if leftover.is_empty() {
            return None;
        }

        Some(ChunkDelta {
            content: Some(leftover),
            ..ChunkDelta::default()
        })
    }

    fn reset(&mut self) {
        self.scanner = TagScanner::default();
        self.next_slot = 0;
    }
}

struct ParsedToolCall {
    name: String,
    /// Arguments as a JSON-encoded string, matching the wire convention.
    arguments: String,
}

/// Incremental scanner for `<tool_call>` spans.
///
/// Text that could be the start of a tag is held back until the next
/// fragment disambiguates it, so tags split across deltas are still caught.
#[derive(Default)]
struct TagScanner {
    buf: String,
    in_tool: bool,
}

impl TagScanner {
    fn push(&mut self, fragment: &str) -> (String, Vec<ParsedToolCall>) {
        self.buf.push_str(fragment);

        let mut visible = String::new();
        let mut calls = Vec::new();

        loop {
            if self.in_tool {
                let Some(pos) = self.buf.find(CLOSE_TAG) else {
                    break;
                };

                let inner: String = self.buf.drain(..pos + CLOSE_TAG.len()).collect();
                let inner = &inner[..pos];
                self.in_tool = false;

                match parse_tool_call(inner) {
                    Some(call) => calls.push(call),
                    None => {
                        log::warn!("unparseable tool_call span: {inner}");
                        visible.push_str(inner);
                    }
                }
            } else if let Some(pos) = self.buf.find(OPEN_TAG) {
                let prefix: String = self.buf.drain(..pos + OPEN_TAG.len()).collect();
                visible.push_str(&prefix[..pos]);
                self.in_tool = true;
            } else {
                let keep = partial_tag_len(&self.buf, OPEN_TAG);
                let emit: String = self.buf.drain(..self.buf.len() - keep).collect();
                visible.push_str(&emit);
                break;
            }
        }

        (visible, calls)
    }

    /// Release held-back content at stream end.
    fn flush(&mut self) -> String {
        if self.in_tool && !self.buf.is_empty() {
            log::warn!("stream ended inside an unterminated tool_call tag");
        }
        self.in_tool = false;
        std::mem::take(&mut self.buf)
    }
}

/// Longest strict prefix of `tag` that the buffer ends with.
fn partial_tag_len(buf: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buf.len());

    (1..=max)
        .rev()
        .find(|&len| buf.ends_with(&tag[..len]))
        .unwrap_or(0)
}

fn parse_tool_call(inner: &str) -> Option<ParsedToolCall> {
    let value: Value = serde_json::from_str(inner.trim()).ok()?;
    let name = value.get("name")?.as_str()?.to_string();

    let arguments = match value.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => serde_json::to_string(other).ok()?,
        None => "{}".to_string(),
    };

    Some(ParsedToolCall { name, arguments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::openai::{FunctionDefinition, StreamOptions, ToolDefinition};
    use serde_json::json;

    fn tools_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "mlx-community/llama-3.2".to_string(),
            messages: vec![
                ChatMessage::text(ChatRole::System, "Be terse."),
                ChatMessage::text(ChatRole::User, "read x.ts"),
            ],
            tools: Some(vec![ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: "Read".to_string(),
                    description: Some("Read a file".to_string()),
                    parameters: json!({"type": "object"}),
                },
            }]),
            tool_choice: None,
            temperature: Some(1.0),
            top_p: None,
            max_tokens: Some(512),
            max_completion_tokens: None,
            stop: None,
            stream: true,
            stream_options: Some(StreamOptions { include_usage: true }),
        }
    }

    #[test]
    fn reasoning_adapter_remaps_parameters() {
        let mut request = tools_request();
        request.model = "gpt-5-mini".to_string();

        ReasoningModelAdapter.prepare_request(&mut request);

        assert_eq!(request.max_tokens, None);
        assert_eq!(request.max_completion_tokens, Some(512));
        assert_eq!(request.temperature, None);
    }

    #[test]
    fn selection_by_family_and_capabilities() {
        let full = ProviderCapabilities {
            supports_tools: true,
            supports_vision: true,
            supports_streaming: true,
            supports_json_mode: true,
        };
        let no_tools = ProviderCapabilities {
            supports_tools: false,
            ..full
        };

        // Exercised through prepare_request behavior since trait objects
        // cannot be downcast.
        let mut request = tools_request();
        select_adapter("openai/gpt-5", &full, true).prepare_request(&mut request);
        assert!(request.max_completion_tokens.is_some());

        let mut request = tools_request();
        select_adapter("llama-3.2", &no_tools, true).prepare_request(&mut request);
        assert!(request.tools.is_none());

        let mut request = tools_request();
        select_adapter("qwen3:8b", &full, true).prepare_request(&mut request);
        assert!(request.tools.is_some());
    }

    #[test]
    fn tool_instructions_move_into_system_prompt() {
        let mut request = tools_request();
        TextToolCallAdapter::new().prepare_request(&mut request);

        assert!(request.tools.is_none());
        let Some(ChatMessageContent::Text(system)) = &request.messages[0].content else {
            unreachable!("expected system text");
        };
        assert!(system.starts_with("Be terse."));
        assert!(system.contains("<tool_call>"));
        assert!(system.contains("- Read: Read a file"));
    }

    #[test]
    fn scanner_extracts_calls_split_across_fragments() {
        let mut adapter = TextToolCallAdapter::new();

        let mut first = ChunkDelta {
            content: Some("Let me check. <tool_".to_string()),
            ..ChunkDelta::default()
        };
        adapter.transform_delta(&mut first);
        assert_eq!(first.content.as_deref(), Some("Let me check. "));
        assert!(first.tool_calls.is_none());

        let mut second = ChunkDelta {
            content: Some(r#"call>{"name": "Read", "arguments": {"file_path": "x.ts"}}</tool_"#.to_string()),
            ..ChunkDelta::default()
        };
        adapter.transform_delta(&mut second);
        assert!(second.content.is_none());
        assert!(second.tool_calls.is_none());

        let mut third = ChunkDelta {
            content: Some("call> done".to_string()),
            ..ChunkDelta::default()
        };
        adapter.transform_delta(&mut third);

        let calls = third.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].index, Some(0));
        let function = calls[0].function.as_ref().unwrap();
        assert_eq!(function.name.as_deref(), Some("Read"));
        assert_eq!(
            function.arguments.as_deref(),
            Some(r#"{"file_path":"x.ts"}"#)
        );
        assert_eq!(third.content.as_deref(), Some(" done"));
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let mut adapter = TextToolCallAdapter::new();

        let mut delta = ChunkDelta {
            content: Some("just an answer with < angle brackets".to_string()),
            ..ChunkDelta::default()
        };
        adapter.transform_delta(&mut delta);

        // "< angle brackets" ends without a tag prefix, so nothing is held.
        assert_eq!(
            delta.content.as_deref(),
            Some("just an answer with < angle brackets")
        );
        assert!(adapter.finish().is_none());
    }

    #[test]
    fn unterminated_tag_is_flushed_as_text() {
        let mut adapter = TextToolCallAdapter::new();

        let mut delta = ChunkDelta {
            content: Some(r#"<tool_call>{"name": "Read""#.to_string()),
            ..ChunkDelta::default()
        };
        adapter.transform_delta(&mut delta);
        assert!(delta.content.is_none());

        let flushed = adapter.finish().unwrap();
        assert_eq!(flushed.content.as_deref(), Some(r#"{"name": "Read""#));
    }

    #[test]
    fn partial_tag_len_finds_longest_prefix() {
        assert_eq!(partial_tag_len("hello <tool_", OPEN_TAG), 6);
        assert_eq!(partial_tag_len("hello <", OPEN_TAG), 1);
        assert_eq!(partial_tag_len("hello", OPEN_TAG), 0);
        assert_eq!(partial_tag_len("<tool_call", OPEN_TAG), 10);
    }
}
