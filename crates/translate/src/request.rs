//! Anthropic request → upstream chat request

use serde_json::{Value, json};
use upstream::types::{
    ChatMessage, ContentPart, FunctionCall, FunctionDef, ImageUrl, MessageContent, Role, Stop,
    StreamOptions, Tool, ToolCall,
};
use upstream::ChatCompletionRequest;

use crate::anthropic::{
    AnthropicRole, ContentBlock, Message, MessagesRequest, MessageContent as AnthropicContent,
    ToolChoice, ToolDefinition,
};
use crate::error::{Error, Result};

/// Translate an Anthropic Messages request into the upstream chat schema.
///
/// `tool_result` blocks become `tool` messages placed ahead of the rest of
/// the user turn, `tool_use` blocks become assistant `tool_calls`, and
/// thinking is folded into assistant text.
pub fn to_chat_request(request: &MessagesRequest) -> Result<ChatCompletionRequest> {
    if request.messages.is_empty() {
        return Err(Error::InvalidRequest("messages must not be empty".into()));
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(ChatMessage::text(Role::System, system.text()));
    }
    for message in &request.messages {
        match message.role {
            AnthropicRole::User => map_user(message, &mut messages),
            AnthropicRole::Assistant => messages.push(map_assistant(message)?),
        }
    }

    Ok(ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone().map(Stop::Many),
        user: request.metadata.as_ref().and_then(|m| m.user_id.clone()),
        tools: request
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(map_tool).collect()),
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice),
        stream: request.stream,
        stream_options: request
            .stream
            .then_some(StreamOptions { include_usage: true }),
        ..Default::default()
    })
}

fn map_user(message: &Message, out: &mut Vec<ChatMessage>) {
    let blocks = match &message.content {
        AnthropicContent::Text(text) => {
            out.push(ChatMessage::text(Role::User, text.clone()));
            return;
        }
        AnthropicContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(ChatMessage {
                role: Role::Tool,
                content: Some(MessageContent::Text(
                    content.as_ref().map(|c| c.text()).unwrap_or_default(),
                )),
                name: None,
                tool_calls: None,
                tool_call_id: Some(tool_use_id.clone()),
            }),
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: source.to_url(),
                    detail: None,
                },
            }),
            ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } | ContentBlock::Other => {}
        }
    }

    if parts.is_empty() {
        return;
    }
    let content = if parts.iter().all(|p| matches!(p, ContentPart::Text { .. })) {
        MessageContent::Text(
            parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    } else {
        MessageContent::Parts(parts)
    };
    out.push(ChatMessage {
        role: Role::User,
        content: Some(content),
        name: None,
        tool_calls: None,
        tool_call_id: None,
    });
}

fn map_assistant(message: &Message) -> Result<ChatMessage> {
    let blocks = match &message.content {
        AnthropicContent::Text(text) => return Ok(ChatMessage::text(Role::Assistant, text.clone())),
        AnthropicContent::Blocks(blocks) => blocks,
    };

    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push(t.as_str()),
            ContentBlock::Thinking { thinking, .. } => text.push(thinking.as_str()),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".into(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: serde_json::to_string(input)?,
                },
            }),
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    let text = text.join("\n\n");
    Ok(ChatMessage {
        role: Role::Assistant,
        content: (!text.is_empty() || tool_calls.is_empty()).then_some(MessageContent::Text(text)),
        name: None,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    })
}

fn map_tool(tool: &ToolDefinition) -> Tool {
    Tool {
        kind: "function".into(),
        function: FunctionDef {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(tool.input_schema.clone()),
        },
    }
}

fn map_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn system_and_sampling_options_carry_over() {
        let request = parse(json!({
            "model": "claude-sonnet-4",
            "max_tokens": 512,
            "system": "be brief",
            "stop_sequences": ["END"],
            "temperature": 0.3,
            "top_p": 0.9,
            "metadata": {"user_id": "u-1"},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let chat = to_chat_request(&request).unwrap();

        assert_eq!(chat.model, "claude-sonnet-4");
        assert_eq!(chat.messages[0], ChatMessage::text(Role::System, "be brief"));
        assert_eq!(chat.messages[1], ChatMessage::text(Role::User, "hi"));
        assert_eq!(chat.max_tokens, Some(512));
        assert_eq!(chat.stop, Some(Stop::Many(vec!["END".into()])));
        assert_eq!(chat.temperature, Some(0.3));
        assert_eq!(chat.user.as_deref(), Some("u-1"));
        assert!(!chat.stream);
        assert!(chat.stream_options.is_none());
    }

    #[test]
    fn streaming_requests_ask_for_usage() {
        let request = parse(json!({
            "model": "m", "max_tokens": 1, "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let chat = to_chat_request(&request).unwrap();
        assert!(chat.stream);
        assert_eq!(chat.stream_options, Some(StreamOptions { include_usage: true }));
    }

    #[test]
    fn tool_round_trip_turns() {
        let request = parse(json!({
            "model": "m",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "find x"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "need search"},
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "text", "text": "here you go"},
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "result"}]}
                ]}
            ]
        }));
        let chat = to_chat_request(&request).unwrap();
        assert_eq!(chat.messages.len(), 4);

        let assistant = &chat.messages[1];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(
            assistant.content,
            Some(MessageContent::Text("need search".into()))
        );
        let call = &assistant.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.function.name, "search");
        assert_eq!(call.function.arguments, r#"{"q":"x"}"#);

        // tool result comes before the remaining user text
        let tool = &chat.messages[2];
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(tool.content, Some(MessageContent::Text("result".into())));
        assert_eq!(chat.messages[3], ChatMessage::text(Role::User, "here you go"));
        assert!(chat.is_agent_turn());
    }

    #[test]
    fn assistant_with_only_tool_calls_has_no_content() {
        let request = parse(json!({
            "model": "m", "max_tokens": 1,
            "messages": [
                {"role": "user", "content": "go"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t", "name": "run", "input": {}}
                ]}
            ]
        }));
        let chat = to_chat_request(&request).unwrap();
        assert!(chat.messages[1].content.is_none());
    }

    #[test]
    fn images_produce_content_parts() {
        let request = parse(json!({
            "model": "m", "max_tokens": 1,
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
            ]}]
        }));
        let chat = to_chat_request(&request).unwrap();
        let Some(MessageContent::Parts(parts)) = &chat.messages[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(
            &parts[1],
            ContentPart::ImageUrl { image_url } if image_url.url == "data:image/png;base64,AAAA"
        ));
    }

    #[test]
    fn tools_and_tool_choice_map_to_functions() {
        let request = parse(json!({
            "model": "m", "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "search", "description": "web", "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "any"}
        }));
        let chat = to_chat_request(&request).unwrap();
        let tool = &chat.tools.as_ref().unwrap()[0];
        assert_eq!(tool.kind, "function");
        assert_eq!(tool.function.name, "search");
        assert_eq!(tool.function.parameters, Some(json!({"type": "object"})));
        assert_eq!(chat.tool_choice, Some(json!("required")));

        assert_eq!(
            map_tool_choice(&ToolChoice::Tool { name: "search".into() }),
            json!({"type": "function", "function": {"name": "search"}})
        );
        assert_eq!(map_tool_choice(&ToolChoice::Auto), json!("auto"));
        assert_eq!(map_tool_choice(&ToolChoice::None), json!("none"));
    }

    #[test]
    fn empty_messages_are_rejected() {
        let request = parse(json!({"model": "m", "max_tokens": 1, "messages": []}));
        assert!(matches!(
            to_chat_request(&request),
            Err(Error::InvalidRequest(_))
        ));
    }
}
