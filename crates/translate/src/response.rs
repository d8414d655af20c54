//! Upstream completion → Anthropic message

use serde_json::{Map, Value};
use tracing::warn;
use upstream::ChatCompletionResponse;

use crate::anthropic::{AnthropicRole, AnthropicUsage, MessagesResponse, ResponseBlock, StopReason};

/// Map an upstream `finish_reason` onto the Anthropic stop-reason
/// vocabulary. Content filtering has no Anthropic equivalent and ends the
/// turn normally.
pub fn map_stop_reason(finish_reason: &str) -> StopReason {
    match finish_reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

/// Parse tool arguments, falling back to an empty object when the model
/// produced invalid JSON.
pub(crate) fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|e| {
        warn!(error = %e, "tool call arguments are not valid JSON");
        Value::Object(Map::new())
    })
}

/// Translate a complete upstream response. Text and tool calls from every
/// choice are merged into one message.
pub fn to_messages_response(response: &ChatCompletionResponse) -> MessagesResponse {
    let mut content = Vec::new();
    for choice in &response.choices {
        if let Some(text) = &choice.message.content
            && !text.is_empty()
        {
            content.push(ResponseBlock::Text { text: text.clone() });
        }
        for call in choice.message.tool_calls.iter().flatten() {
            content.push(ResponseBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input: parse_arguments(&call.function.arguments),
            });
        }
    }

    let has_tool_use = content
        .iter()
        .any(|b| matches!(b, ResponseBlock::ToolUse { .. }));
    let stop_reason = if has_tool_use {
        StopReason::ToolUse
    } else {
        response
            .choices
            .iter()
            .find_map(|c| c.finish_reason.as_deref())
            .map(map_stop_reason)
            .unwrap_or(StopReason::EndTurn)
    };

    MessagesResponse {
        id: response.id.clone(),
        kind: "message".into(),
        role: AnthropicRole::Assistant,
        model: response.model.clone(),
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: response
            .usage
            .as_ref()
            .map(AnthropicUsage::from_upstream)
            .unwrap_or_default(),
    }
}
