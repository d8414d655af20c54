//! Streaming re-encoder: upstream chat chunks → Anthropic stream events
//!
//! One `StreamTranslator` per client connection, fed chunks in arrival
//! order. At most one content block is open at a time. Opening a new block
//! closes the open one first, and block indices only ever increase: a
//! closed block is never addressed again.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;
use upstream::ChatCompletionChunk;

use crate::anthropic::{AnthropicRole, AnthropicUsage, StopReason};
use crate::response::map_stop_reason;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart { message: StreamMessage },
    ContentBlockStart { index: u32, content_block: BlockStart },
    ContentBlockDelta { index: u32, delta: BlockDelta },
    ContentBlockStop { index: u32 },
    MessageDelta { delta: MessageDelta, usage: DeltaUsage },
    MessageStop,
    Error { error: ErrorBody },
}

impl StreamEvent {
    /// Value of the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// A standalone error event, for failures before any chunk arrived.
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: AnthropicRole,
    pub content: Vec<Value>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: AnthropicUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDelta {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeltaUsage {
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Tool { position: u32 },
}

#[derive(Debug)]
struct ToolBlock {
    index: u32,
}

#[derive(Debug)]
pub struct StreamTranslator {
    /// Used when the upstream leaves `model` empty
    model: String,
    message_started: bool,
    finished: bool,
    /// Index of the open block, or of the next block to open
    block_index: u32,
    open: Option<OpenBlock>,
    tools: HashMap<u32, ToolBlock>,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_started: false,
            finished: false,
            block_index: 0,
            open: None,
            tools: HashMap::new(),
        }
    }

    /// True once a terminal event (`message_stop` or `error`) was emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Translate one upstream chunk.
    pub fn push(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        if !self.message_started {
            self.message_started = true;
            events.push(self.message_start(chunk));
        }

        let mut finish_reason = None;
        for choice in &chunk.choices {
            if let Some(text) = &choice.delta.content
                && !text.is_empty()
            {
                self.text_delta(text, &mut events);
            }
            for call in choice.delta.tool_calls.iter().flatten() {
                let function = call.function.as_ref();
                if let Some(id) = &call.id
                    && let Some(name) = function.and_then(|f| f.name.as_ref())
                    && !self.tools.contains_key(&call.index)
                {
                    self.open_tool(call.index, id, name, &mut events);
                }
                if let Some(arguments) = function.and_then(|f| f.arguments.as_ref())
                    && !arguments.is_empty()
                {
                    self.tool_delta(call.index, arguments, &mut events);
                }
            }
            if finish_reason.is_none() {
                finish_reason = choice.finish_reason.as_deref();
            }
        }

        if let Some(reason) = finish_reason {
            let output_tokens = chunk.usage.map(|u| u.completion_tokens).unwrap_or(0);
            self.complete(map_stop_reason(reason), output_tokens, &mut events);
        }
        events
    }

    /// The upstream stream ended. Completes the message normally if the
    /// last chunk carried no finish reason.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if !self.message_started {
            return self.fail();
        }
        let mut events = Vec::new();
        self.complete(StopReason::EndTurn, 0, &mut events);
        events
    }

    /// The upstream broke mid-stream. Emits a single error event; open
    /// blocks are left as they are.
    pub fn fail(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![StreamEvent::error(
            "api_error",
            "upstream stream terminated unexpectedly",
        )]
    }

    fn message_start(&self, chunk: &ChatCompletionChunk) -> StreamEvent {
        let id = if chunk.id.is_empty() {
            format!("msg_{}", uuid::Uuid::new_v4().simple())
        } else {
            chunk.id.clone()
        };
        let model = if chunk.model.is_empty() {
            self.model.clone()
        } else {
            chunk.model.clone()
        };
        let mut usage = chunk
            .usage
            .as_ref()
            .map(AnthropicUsage::from_upstream)
            .unwrap_or_default();
        usage.output_tokens = 0;

        StreamEvent::MessageStart {
            message: StreamMessage {
                id,
                kind: "message",
                role: AnthropicRole::Assistant,
                content: Vec::new(),
                model,
                stop_reason: None,
                stop_sequence: None,
                usage,
            },
        }
    }

    fn text_delta(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if self.open != Some(OpenBlock::Text) {
            self.close_block(events);
            self.open = Some(OpenBlock::Text);
            events.push(StreamEvent::ContentBlockStart {
                index: self.block_index,
                content_block: BlockStart::Text {
                    text: String::new(),
                },
            });
        }
        events.push(StreamEvent::ContentBlockDelta {
            index: self.block_index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn open_tool(&mut self, position: u32, id: &str, name: &str, events: &mut Vec<StreamEvent>) {
        self.close_block(events);
        self.open = Some(OpenBlock::Tool { position });
        self.tools.insert(
            position,
            ToolBlock {
                index: self.block_index,
            },
        );
        events.push(StreamEvent::ContentBlockStart {
            index: self.block_index,
            content_block: BlockStart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: Value::Object(Map::new()),
            },
        });
    }

    fn tool_delta(&mut self, position: u32, arguments: &str, events: &mut Vec<StreamEvent>) {
        let Some(tool) = self.tools.get(&position) else {
            debug!(position, "arguments for unknown tool call position dropped");
            return;
        };
        if self.open != Some(OpenBlock::Tool { position }) {
            debug!(position, index = tool.index, "arguments for closed tool block dropped");
            return;
        }
        events.push(StreamEvent::ContentBlockDelta {
            index: tool.index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: arguments.to_string(),
            },
        });
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open.take().is_some() {
            events.push(StreamEvent::ContentBlockStop {
                index: self.block_index,
            });
            self.block_index += 1;
        }
    }

    fn complete(&mut self, stop_reason: StopReason, output_tokens: u64, events: &mut Vec<StreamEvent>) {
        self.close_block(events);
        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: DeltaUsage { output_tokens },
        });
        events.push(StreamEvent::MessageStop);
        self.finished = true;
    }
}
