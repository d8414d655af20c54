//! Canonical cache keys
//!
//! The key is the SHA-256 of a fixed-shape JSON projection of the request,
//! hex-encoded and truncated to 32 characters. Field order is the struct
//! declaration order below, and `serde_json::Value` objects serialize with
//! sorted keys, so equal requests always produce equal bytes. Bump
//! `KEY_VERSION` whenever the projection changes so old entries stop
//! matching.
//!
//! The `stream` flag is deliberately absent: it changes how an answer is
//! delivered, not what it says.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use upstream::ChatCompletionRequest;
use upstream::types::{MessageContent, Role, Stop, Tool, ToolCall};

pub const KEY_VERSION: u32 = 1;

/// Hex characters kept from the digest.
const KEY_WIDTH: usize = 32;

#[derive(Serialize)]
struct KeyMessage<'a> {
    role: Role,
    content: String,
    name: Option<&'a str>,
    tool_calls: Option<&'a [ToolCall]>,
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct KeyInput<'a> {
    version: u32,
    model: &'a str,
    messages: Vec<KeyMessage<'a>>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    n: Option<u32>,
    stop: Option<&'a Stop>,
    frequency_penalty: Option<f64>,
    presence_penalty: Option<f64>,
    seed: Option<i64>,
    response_format: Option<&'a Value>,
    tools: Option<&'a [Tool]>,
    tool_choice: Option<&'a Value>,
    account_id: Option<&'a str>,
}

/// Plain text content is used as-is; structured content is its compact
/// JSON serialization.
fn normalize_content(content: Option<&MessageContent>) -> serde_json::Result<String> {
    match content {
        None => Ok(String::new()),
        Some(MessageContent::Text(text)) => Ok(text.clone()),
        Some(MessageContent::Parts(parts)) => serde_json::to_string(parts),
    }
}

/// Compute the cache key for a chat request.
///
/// `account_id` scopes the entry to one credential when set.
pub fn cache_key(
    request: &ChatCompletionRequest,
    account_id: Option<&str>,
) -> serde_json::Result<String> {
    let messages = request
        .messages
        .iter()
        .map(|m| {
            Ok(KeyMessage {
                role: m.role,
                content: normalize_content(m.content.as_ref())?,
                name: m.name.as_deref(),
                tool_calls: m.tool_calls.as_deref(),
                tool_call_id: m.tool_call_id.as_deref(),
            })
        })
        .collect::<serde_json::Result<Vec<_>>>()?;

    let input = KeyInput {
        version: KEY_VERSION,
        model: &request.model,
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        n: request.n,
        stop: request.stop.as_ref(),
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
        seed: request.seed,
        response_format: request.response_format.as_ref(),
        tools: request.tools.as_deref(),
        tool_choice: request.tool_choice.as_ref(),
        account_id,
    };

    let digest = Sha256::digest(serde_json::to_vec(&input)?);
    Ok(hex::encode(&digest[..KEY_WIDTH / 2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use upstream::types::{ChatMessage, ContentPart};

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![
                ChatMessage::text(Role::System, "be brief"),
                ChatMessage::text(Role::User, "hello"),
            ],
            temperature: Some(0.2),
            ..Default::default()
        }
    }

    fn key(request: &ChatCompletionRequest) -> String {
        cache_key(request, None).unwrap()
    }

    #[test]
    fn key_is_deterministic_and_fixed_width() {
        let a = key(&request());
        assert_eq!(a, key(&request()));
        assert_eq!(a.len(), 32);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)),
            "{a}"
        );
    }

    #[test]
    fn stream_flag_does_not_change_key() {
        let mut streamed = request();
        streamed.stream = true;
        assert_eq!(key(&request()), key(&streamed));
    }

    #[test]
    fn answer_shaping_options_change_key() {
        let base = key(&request());

        let mut r = request();
        r.temperature = Some(0.9);
        assert_ne!(key(&r), base);

        let mut r = request();
        r.model = "claude-sonnet-4".into();
        assert_ne!(key(&r), base);

        let mut r = request();
        r.tool_choice = Some(json!("required"));
        assert_ne!(key(&r), base);

        let mut r = request();
        r.messages[1] = ChatMessage::text(Role::User, "hello!");
        assert_ne!(key(&r), base);
    }

    #[test]
    fn account_scope_changes_key() {
        let r = request();
        assert_ne!(
            cache_key(&r, Some("work")).unwrap(),
            cache_key(&r, None).unwrap()
        );
    }

    #[test]
    fn structured_content_is_stringified() {
        let mut structured = request();
        structured.messages[1].content = Some(MessageContent::Parts(vec![ContentPart::Text {
            text: "hello".into(),
        }]));
        assert_ne!(key(&structured), key(&request()));
        assert_eq!(
            normalize_content(structured.messages[1].content.as_ref()).unwrap(),
            r#"[{"type":"text","text":"hello"}]"#
        );
    }

    #[test]
    fn tool_schema_key_order_is_irrelevant() {
        let tool = |params: Value| Tool {
            kind: "function".into(),
            function: upstream::types::FunctionDef {
                name: "search".into(),
                description: None,
                parameters: Some(params),
            },
        };
        let mut a = request();
        a.tools = Some(vec![tool(
            serde_json::from_str(r#"{"type":"object","required":["q"]}"#).unwrap(),
        )]);
        let mut b = request();
        b.tools = Some(vec![tool(
            serde_json::from_str(r#"{"required":["q"],"type":"object"}"#).unwrap(),
        )]);
        assert_eq!(key(&a), key(&b));
    }
}
