//! Validation and conversion from Anthropic protocol types to the unified
//! intermediate form.

use serde_json::Value;

use crate::{
    error::LlmError,
    messages::{anthropic, unified},
};

impl TryFrom<anthropic::AnthropicChatRequest> for unified::UnifiedRequest {
    type Error = LlmError;

    fn try_from(req: anthropic::AnthropicChatRequest) -> Result<Self, Self::Error> {
        if req.messages.is_empty() {
            return Err(LlmError::InvalidRequest(
                "messages must contain at least one entry".to_string(),
            ));
        }

        let messages = req
            .messages
            .into_iter()
            .map(unified::UnifiedMessage::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let dropped_params: Vec<String> = req
            .extra
            .keys()
            .cloned()
            .chain(req.top_k.is_some().then(|| "top_k".to_string()))
            .collect();

        Ok(Self {
            model: req.model,
            system: req.system.map(fold_system),
            messages,
            tools: req
                .tools
                .map(|tools| tools.into_iter().map(unified::UnifiedTool::from).collect()),
            tool_choice: req.tool_choice.map(unified::UnifiedToolChoice::from),
            temperature: req.temperature,
            top_p: req.top_p,
            max_tokens: req.max_tokens,
            stop_sequences: req.stop_sequences,
            stream: req.stream.unwrap_or(false),
            session_id: req.metadata.and_then(|m| m.user_id),
            dropped_params,
        })
    }
}

/// Fold a system prompt into a single string; text parts are joined with
/// blank lines.
fn fold_system(system: anthropic::AnthropicSystem) -> String {
    match system {
        anthropic::AnthropicSystem::Text(text) => text,
        anthropic::AnthropicSystem::Blocks(blocks) => blocks
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

impl TryFrom<anthropic::AnthropicMessage> for unified::UnifiedMessage {
    type Error = LlmError;

    fn try_from(msg: anthropic::AnthropicMessage) -> Result<Self, Self::Error> {
        let role = match msg.role {
            anthropic::AnthropicRole::User => unified::UnifiedRole::User,
            anthropic::AnthropicRole::Assistant => unified::UnifiedRole::Assistant,
        };

        let blocks = match msg.content {
            anthropic::AnthropicMessageContent::Text(text) => vec![unified::UnifiedBlock::Text(text)],
            anthropic::AnthropicMessageContent::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|block| convert_block(role, block).transpose())
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(Self { role, blocks })
    }
}

fn convert_block(
    role: unified::UnifiedRole,
    block: anthropic::AnthropicContent,
) -> Result<Option<unified::UnifiedBlock>, LlmError> {
    let block = match block {
        anthropic::AnthropicContent::Text { text } => Some(unified::UnifiedBlock::Text(text)),
        anthropic::AnthropicContent::Image { source } => Some(unified::UnifiedBlock::Image {
            media_type: source.media_type,
            data: source.data,
        }),
        anthropic::AnthropicContent::ToolUse { id, name, input } => {
            if role != unified::UnifiedRole::Assistant {
                return Err(LlmError::InvalidRequest(format!(
                    "tool_use block '{id}' is only valid on assistant messages"
                )));
            }
            Some(unified::UnifiedBlock::ToolUse { id, name, input })
        }
        anthropic::AnthropicContent::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            if role != unified::UnifiedRole::User {
                return Err(LlmError::InvalidRequest(format!(
                    "tool_result block for '{tool_use_id}' is only valid on user messages"
                )));
            }
            Some(unified::UnifiedBlock::ToolResult {
                tool_use_id,
                content: stringify_tool_result(content),
                is_error: is_error.unwrap_or(false),
            })
        }
        // Prior-turn thinking blocks have no OpenAI counterpart and are not
        // replayed to the backend.
        anthropic::AnthropicContent::Thinking { .. } => {
            log::debug!("dropping thinking block from conversation history");
            None
        }
    };

    Ok(block)
}

/// Flatten a tool result into the single string OpenAI's tool role expects.
fn stringify_tool_result(content: anthropic::AnthropicToolResultContent) -> String {
    match content {
        anthropic::AnthropicToolResultContent::Text(text) => text,
        anthropic::AnthropicToolResultContent::Blocks(blocks) => blocks
            .into_iter()
            .map(|anthropic::AnthropicToolResultBlock::Text { text }| text)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

impl From<anthropic::AnthropicTool> for unified::UnifiedTool {
    fn from(tool: anthropic::AnthropicTool) -> Self {
        let input_schema = if tool.input_schema.is_object() {
            tool.input_schema
        } else {
            // Some clients send null schemas for parameterless tools.
            Value::Object(serde_json::Map::new())
        };

        Self {
            name: tool.name,
            description: tool.description,
            input_schema,
        }
    }
}

impl From<anthropic::AnthropicToolChoice> for unified::UnifiedToolChoice {
    fn from(choice: anthropic::AnthropicToolChoice) -> Self {
        match choice {
            anthropic::AnthropicToolChoice::Auto => unified::UnifiedToolChoice::Auto,
            anthropic::AnthropicToolChoice::Any => unified::UnifiedToolChoice::Required,
            anthropic::AnthropicToolChoice::None => unified::UnifiedToolChoice::None,
            anthropic::AnthropicToolChoice::Tool { name } => unified::UnifiedToolChoice::Tool(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedBlock, UnifiedRequest, UnifiedRole};
    use serde_json::json;

    fn request_from(json: serde_json::Value) -> Result<UnifiedRequest, LlmError> {
        let request: anthropic::AnthropicChatRequest = serde_json::from_value(json).unwrap();
        UnifiedRequest::try_from(request)
    }

    #[test]
    fn rejects_empty_messages() {
        let err = request_from(json!({
            "model": "m",
            "max_tokens": 100,
            "messages": []
        }))
        .unwrap_err();

        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[test]
    fn folds_system_parts_with_blank_lines() {
        let unified = request_from(json!({
            "model": "m",
            "max_tokens": 100,
            "system": [
                {"type": "text", "text": "You are a coding assistant."},
                {"type": "text", "text": "Be terse."}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(
            unified.system.as_deref(),
            Some("You are a coding assistant.\n\nBe terse.")
        );
    }

    #[test]
    fn stringifies_nested_tool_results() {
        let unified = request_from(json!({
            "model": "m",
            "max_tokens": 100,
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_1",
                    "content": [
                        {"type": "text", "text": "line 1"},
                        {"type": "text", "text": "line 2"}
                    ]
                }]
            }]
        }))
        .unwrap();

        let UnifiedBlock::ToolResult { content, is_error, .. } = &unified.messages[0].blocks[0]
        else {
            unreachable!("expected tool result");
        };
        assert_eq!(content, "line 1\nline 2");
        assert!(!is_error);
    }

    #[test]
    fn rejects_tool_use_on_user_messages() {
        let err = request_from(json!({
            "model": "m",
            "max_tokens": 100,
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_use", "id": "t1", "name": "Read", "input": {}}]
            }]
        }))
        .unwrap_err();

        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[test]
    fn drops_thinking_blocks_and_records_unknown_fields() {
        let unified = request_from(json!({
            "model": "m",
            "max_tokens": 100,
            "top_k": 40,
            "mystery": true,
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "Answer."}
                ]
            }, {"role": "user", "content": "ok"}]
        }))
        .unwrap();

        assert_eq!(unified.messages[0].blocks.len(), 1);
        assert!(unified.dropped_params.contains(&"top_k".to_string()));
        assert!(unified.dropped_params.contains(&"mystery".to_string()));
    }

    #[test]
    fn session_id_comes_from_metadata() {
        let unified = request_from(json!({
            "model": "m",
            "max_tokens": 100,
            "metadata": {"user_id": "session-abc"},
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(unified.session_id.as_deref(), Some("session-abc"));
        assert_eq!(unified.first_user_message().unwrap().role, UnifiedRole::User);
    }
}
