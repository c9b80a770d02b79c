//! The streaming state machine.
//!
//! [`StreamTranslator`] consumes OpenAI-style chunks and produces the
//! block-oriented Anthropic event sequence the client validates. It is a pure
//! step function owned by a single task: `step` takes one chunk and returns
//! the events to write, in order. The HTTP layer is a thin loop around it.
//!
//! Sequencing contract, enforced here and nowhere else:
//!
//! - exactly one `message_start`, exactly one terminal `message_stop`
//! - block indices are `0, 1, …` with no gaps, strictly increasing
//! - every started block is stopped exactly once; deltas only in between
//! - deltas for two blocks never interleave: an open text block closes
//!   before a tool block starts, and vice versa
//! - nothing is emitted after the stream closes (the `closed` flag guards
//!   every emission site)

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::LlmError,
    messages::{
        anthropic::{
            AnthropicCacheCreation, AnthropicContent, AnthropicContentDelta,
            AnthropicMessageDelta, AnthropicRole, AnthropicStopReason, AnthropicStreamEvent,
            AnthropicStreamMessageStart, AnthropicUsage,
        },
        openai::{ChatCompletionChunk, ToolCallDelta},
    },
    token_counter,
    usage::CacheSplit,
};

/// How chain-of-thought fragments in `delta.reasoning` are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReasoningPolicy {
    /// Route reasoning through the text block; visible to the user.
    #[default]
    AsText,
    /// Emit a dedicated thinking block.
    AsThinking,
    /// Drop reasoning fragments entirely.
    Suppress,
}

impl std::str::FromStr for ReasoningPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "as_text" => Ok(Self::AsText),
            "as_thinking" => Ok(Self::AsThinking),
            "suppress" => Ok(Self::Suppress),
            other => Err(format!(
                "unknown reasoning policy '{other}' (expected as_text, as_thinking or suppress)"
            )),
        }
    }
}

impl ReasoningPolicy {
    /// Read `CLAUDISH_REASONING_POLICY`, defaulting to `as_text`.
    pub fn from_env() -> Self {
        std::env::var("CLAUDISH_REASONING_POLICY")
            .ok()
            .and_then(|value| {
                value
                    .parse()
                    .map_err(|e: String| log::warn!("{e}, using as_text"))
                    .ok()
            })
            .unwrap_or_default()
    }
}

/// Final token totals for session accounting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamTotals {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
}

struct ToolBlock {
    index: u32,
    id: String,
    name: String,
    arguments: String,
    closed: bool,
}

pub(crate) struct StreamTranslator {
    message_id: String,
    model: String,
    policy: ReasoningPolicy,
    cache: CacheSplit,
    /// Fallback input count when the backend never reports usage.
    input_estimate: u32,

    next_block_index: u32,
    text_block: Option<u32>,
    thinking_block: Option<u32>,
    /// Backend tool-call slot → block state.
    tool_blocks: BTreeMap<u32, ToolBlock>,

    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    output_chars: usize,
    cost: f64,

    closed: bool,
}

impl StreamTranslator {
    pub fn new(
        model: String,
        policy: ReasoningPolicy,
        input_estimate: u32,
        cache: CacheSplit,
    ) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model,
            policy,
            cache,
            input_estimate,
            next_block_index: 0,
            text_block: None,
            thinking_block: None,
            tool_blocks: BTreeMap::new(),
            input_tokens: None,
            output_tokens: None,
            output_chars: 0,
            cost: 0.0,
            closed: false,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The initial `message_start`, with a zeroed usage record.
    pub fn start(&self) -> AnthropicStreamEvent {
        AnthropicStreamEvent::MessageStart {
            message: AnthropicStreamMessageStart {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: AnthropicRole::Assistant,
                content: vec![],
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: AnthropicUsage::default(),
            },
        }
    }

    /// Translate one backend chunk into zero or more client events.
    pub fn step(&mut self, chunk: ChatCompletionChunk) -> Vec<AnthropicStreamEvent> {
        if self.closed {
            return Vec::new();
        }

        let mut events = Vec::new();

        if let Some(usage) = chunk.usage {
            if let Some(prompt) = usage.prompt_tokens {
                self.input_tokens = Some(prompt);
            }
            if let Some(completion) = usage.completion_tokens {
                self.output_tokens = Some(completion);
            }
            if let Some(cost) = usage.cost {
                self.cost = cost;
            }
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            // Usage-only keep-alive frame.
            return events;
        };

        let delta = choice.delta;

        // Content wins when a backend puts both it and reasoning in one
        // delta; the reasoning policy only applies when content is absent.
        if let Some(text) = delta.content.clone().filter(|t| !t.is_empty()) {
            self.emit_text(&mut events, text);
        } else if let Some(reasoning) = delta.reasoning_fragment().map(str::to_owned) {
            self.emit_reasoning(&mut events, reasoning);
        }

        if let Some(tool_calls) = delta.tool_calls {
            for entry in tool_calls {
                self.handle_tool_delta(&mut events, entry);
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            let reason = reason.to_string();
            events.extend(self.terminal_events(Some(&reason)));
        }

        events
    }

    /// Terminal events for a stream that ended (`[DONE]` or EOF) without a
    /// finish reason. A no-op when termination already happened.
    pub fn finish(&mut self) -> Vec<AnthropicStreamEvent> {
        self.terminal_events(None)
    }

    /// Error surfaced after `message_start`: a single error event, then the
    /// terminal `message_stop`.
    pub fn error_events(&mut self, error: &LlmError) -> Vec<AnthropicStreamEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        vec![
            AnthropicStreamEvent::Error {
                error: error.stream_details(),
            },
            AnthropicStreamEvent::MessageStop,
        ]
    }

    pub fn totals(&self) -> StreamTotals {
        StreamTotals {
            input_tokens: self.input_tokens.unwrap_or(self.input_estimate),
            output_tokens: self
                .output_tokens
                .unwrap_or_else(|| token_counter::estimate_chars(self.output_chars)),
            cost: self.cost,
        }
    }

    fn alloc_block(&mut self) -> u32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    fn emit_text(&mut self, events: &mut Vec<AnthropicStreamEvent>, text: String) {
        self.output_chars += text.chars().count();

        let index = match self.text_block {
            Some(index) => index,
            None => {
                self.close_thinking(events);
                self.close_open_tools(events);

                let index = self.alloc_block();
                events.push(AnthropicStreamEvent::ContentBlockStart {
                    index,
                    content_block: AnthropicContent::Text { text: String::new() },
                });
                self.text_block = Some(index);
                index
            }
        };

        events.push(AnthropicStreamEvent::ContentBlockDelta {
            index,
            delta: AnthropicContentDelta::TextDelta { text },
        });
    }

    fn emit_reasoning(&mut self, events: &mut Vec<AnthropicStreamEvent>, reasoning: String) {
        match self.policy {
            ReasoningPolicy::AsText => self.emit_text(events, reasoning),
            ReasoningPolicy::Suppress => {
                self.output_chars += reasoning.chars().count();
            }
            ReasoningPolicy::AsThinking => {
                self.output_chars += reasoning.chars().count();

                let index = match self.thinking_block {
                    Some(index) => index,
                    None => {
                        self.close_text(events);
                        self.close_open_tools(events);

                        let index = self.alloc_block();
                        events.push(AnthropicStreamEvent::ContentBlockStart {
                            index,
                            content_block: AnthropicContent::Thinking {
                                thinking: String::new(),
                            },
                        });
                        self.thinking_block = Some(index);
                        index
                    }
                };

                events.push(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: AnthropicContentDelta::ThinkingDelta { thinking: reasoning },
                });
            }
        }
    }

    fn handle_tool_delta(&mut self, events: &mut Vec<AnthropicStreamEvent>, entry: ToolCallDelta) {
        let slot = entry.index.unwrap_or(0);

        if !self.tool_blocks.contains_key(&slot) {
            self.close_text(events);
            self.close_thinking(events);

            let index = self.alloc_block();
            let id = entry
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()));
            let name = entry
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_default();

            log::debug!("tool call started: slot {slot}, block {index}, name '{name}'");

            events.push(AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: AnthropicContent::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: Value::Object(serde_json::Map::new()),
                },
            });

            self.tool_blocks.insert(
                slot,
                ToolBlock {
                    index,
                    id,
                    name,
                    arguments: String::new(),
                    closed: false,
                },
            );
        } else if let Some(fragment) = entry
            .function
            .as_ref()
            .and_then(|f| f.name.as_deref())
            .filter(|n| !n.is_empty())
        {
            // Fragmented names: the start event already carried the first
            // fragment; later pieces extend the recorded name.
            if let Some(block) = self.tool_blocks.get_mut(&slot) {
                block.name.push_str(fragment);
                log::debug!("tool name for slot {slot} extended to '{}'", block.name);
            }
        }

        let arguments = entry
            .function
            .and_then(|f| f.arguments)
            .filter(|a| !a.is_empty());

        if let (Some(fragment), Some(block)) = (arguments, self.tool_blocks.get_mut(&slot)) {
            if block.closed {
                return;
            }

            self.output_chars += fragment.chars().count();
            block.arguments.push_str(&fragment);

            events.push(AnthropicStreamEvent::ContentBlockDelta {
                index: block.index,
                delta: AnthropicContentDelta::InputJsonDelta {
                    partial_json: fragment,
                },
            });
        }
    }

    fn close_text(&mut self, events: &mut Vec<AnthropicStreamEvent>) {
        if let Some(index) = self.text_block.take() {
            events.push(AnthropicStreamEvent::ContentBlockStop { index });
        }
    }

    fn close_thinking(&mut self, events: &mut Vec<AnthropicStreamEvent>) {
        if let Some(index) = self.thinking_block.take() {
            events.push(AnthropicStreamEvent::ContentBlockStop { index });
        }
    }

    /// Close unclosed tool blocks in block order, validating the assembled
    /// argument JSON. Invalid JSON is logged, never fatal.
    fn close_open_tools(&mut self, events: &mut Vec<AnthropicStreamEvent>) {
        let mut open: Vec<&mut ToolBlock> = self
            .tool_blocks
            .values_mut()
            .filter(|block| !block.closed)
            .collect();
        open.sort_by_key(|block| block.index);

        for block in open {
            if !block.arguments.is_empty()
                && serde_json::from_str::<Value>(&block.arguments).is_err()
            {
                log::warn!(
                    "tool call '{}' ({}) assembled invalid JSON: {}",
                    block.name,
                    block.id,
                    block.arguments
                );
            }

            block.closed = true;
            events.push(AnthropicStreamEvent::ContentBlockStop { index: block.index });
        }
    }

    fn terminal_events(&mut self, finish_reason: Option<&str>) -> Vec<AnthropicStreamEvent> {
        if self.closed {
            return Vec::new();
        }

        let mut events = Vec::new();

        self.close_open_tools(&mut events);
        self.close_text(&mut events);
        self.close_thinking(&mut events);

        let stop_reason = map_stop_reason(finish_reason);

        let totals = self.totals();
        let usage = AnthropicUsage {
            input_tokens: totals.input_tokens,
            output_tokens: totals.output_tokens,
            cache_creation_input_tokens: self.cache.creation,
            cache_read_input_tokens: self.cache.read,
            cache_creation: (self.cache.creation > 0).then(|| AnthropicCacheCreation {
                ephemeral_5m_input_tokens: self.cache.creation,
            }),
        };

        events.push(AnthropicStreamEvent::MessageDelta {
            delta: AnthropicMessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage,
        });
        events.push(AnthropicStreamEvent::MessageStop);

        self.closed = true;
        events
    }
}

/// Map a backend finish reason onto the client's stop reasons. Unknown or
/// missing reasons read as a natural end of turn.
pub(crate) fn map_stop_reason(finish_reason: Option<&str>) -> AnthropicStopReason {
    match finish_reason {
        Some("length") => AnthropicStopReason::MaxTokens,
        Some("tool_calls" | "function_call") => AnthropicStopReason::ToolUse,
        Some("content_filter") => AnthropicStopReason::StopSequence,
        _ => AnthropicStopReason::EndTurn,
    }
}
