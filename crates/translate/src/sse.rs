//! Server-Sent-Events framing for both client protocols

use serde_json::json;
use upstream::ChatCompletionChunk;

use crate::error::Result;
use crate::stream::StreamEvent;

/// Terminator of an OpenAI-protocol stream.
pub const OPENAI_DONE: &str = "data: [DONE]\n\n";

/// `event: <type>\ndata: <json>\n\n`
pub fn anthropic_frame(event: &StreamEvent) -> Result<String> {
    Ok(format!(
        "event: {}\ndata: {}\n\n",
        event.event_type(),
        serde_json::to_string(event)?
    ))
}

/// `data: <json>\n\n`
pub fn openai_frame(chunk: &ChatCompletionChunk) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(chunk)?))
}

/// Error frame for an OpenAI-protocol stream that broke mid-way.
pub fn openai_error_frame(message: &str) -> String {
    let body = json!({"error": {"message": message, "type": "api_error", "code": null}});
    format!("data: {body}\n\n")
}
