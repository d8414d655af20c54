//! reqwest-based Copilot chat client
//!
//! Injects the headers Copilot expects from an editor integration and maps
//! transport failures and non-2xx statuses into `UpstreamError`. The client
//! carries one deadline for every call it makes; the token exchange uses its
//! own shorter-deadline client.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{debug, warn};

use crate::sse::chunk_stream;
use crate::types::{
    ChatCompletionRequest, ChatCompletionResponse, ContentPart, EmbeddingsRequest,
    EmbeddingsResponse, MessageContent,
};
use crate::{BoxFuture, ChatBackend, ChunkStream, Result, TransportKind, UpstreamError};

pub const COPILOT_API_URL: &str = "https://api.githubcopilot.com";
pub const DEFAULT_VSCODE_VERSION: &str = "1.99.3";
pub const COPILOT_CHAT_VERSION: &str = "0.26.7";
pub const GITHUB_API_VERSION: &str = "2025-04-01";

/// `editor-plugin-version` header value.
pub fn editor_plugin_version() -> String {
    format!("copilot-chat/{COPILOT_CHAT_VERSION}")
}

/// `user-agent` header value sent to GitHub and Copilot.
pub fn user_agent() -> String {
    format!("GitHubCopilotChat/{COPILOT_CHAT_VERSION}")
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub vscode_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: COPILOT_API_URL.to_string(),
            timeout: Duration::from_secs(300),
            vscode_version: DEFAULT_VSCODE_VERSION.to_string(),
        }
    }
}

/// Production `ChatBackend` talking to the Copilot API.
pub struct CopilotClient {
    http: reqwest::Client,
    base_url: String,
    vscode_version: String,
}

impl CopilotClient {
    pub fn new(config: ClientConfig) -> std::result::Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vscode_version: config.vscode_version,
        })
    }

    fn headers(&self, token: &str, initiator: &str, vision: bool, stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        // A token that cannot be sent is as unusable as a revoked one.
        let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            UpstreamError::Rejected {
                status: 401,
                body: "access token contains invalid header characters".into(),
                retry_after: None,
            }
        })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(if stream {
                "text/event-stream"
            } else {
                "application/json"
            }),
        );
        headers.insert(
            "copilot-integration-id",
            HeaderValue::from_static("vscode-chat"),
        );
        headers.insert(
            "openai-intent",
            HeaderValue::from_static("conversation-panel"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(GITHUB_API_VERSION),
        );
        if let Ok(v) = HeaderValue::from_str(&format!("vscode/{}", self.vscode_version)) {
            headers.insert("editor-version", v);
        }
        if let Ok(v) = HeaderValue::from_str(&editor_plugin_version()) {
            headers.insert("editor-plugin-version", v);
        }
        if let Ok(v) = HeaderValue::from_str(&user_agent()) {
            headers.insert(USER_AGENT, v);
        }
        if let Ok(v) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert("x-request-id", v);
        }
        if let Ok(v) = HeaderValue::from_str(initiator) {
            headers.insert("x-initiator", v);
        }
        if vision {
            headers.insert("copilot-vision-request", HeaderValue::from_static("true"));
        }
        Ok(headers)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        headers: HeaderMap,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let response = self.http.post(&url).headers(headers).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(status = status.as_u16(), path, "upstream rejected request");
            return Err(UpstreamError::Rejected {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }
        debug!(status = status.as_u16(), path, "upstream accepted request");
        Ok(response)
    }

    fn chat_headers(&self, token: &str, request: &ChatCompletionRequest) -> Result<HeaderMap> {
        let initiator = if request.is_agent_turn() { "agent" } else { "user" };
        self.headers(token, initiator, has_images(request), request.stream)
    }
}

impl ChatBackend for CopilotClient {
    fn chat<'a>(
        &'a self,
        token: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse>> {
        Box::pin(async move {
            let headers = self.chat_headers(token, request)?;
            let response = self.post("/chat/completions", headers, request).await?;
            Ok(response.json::<ChatCompletionResponse>().await?)
        })
    }

    fn chat_stream<'a>(
        &'a self,
        token: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChunkStream>> {
        Box::pin(async move {
            let headers = self.chat_headers(token, request)?;
            let response = self.post("/chat/completions", headers, request).await?;
            Ok(chunk_stream(response.bytes_stream()))
        })
    }

    fn embeddings<'a>(
        &'a self,
        token: &'a str,
        request: &'a EmbeddingsRequest,
    ) -> BoxFuture<'a, Result<EmbeddingsResponse>> {
        Box::pin(async move {
            let headers = self.headers(token, "user", false, false)?;
            let response = self.post("/embeddings", headers, request).await?;
            Ok(response.json::<EmbeddingsResponse>().await?)
        })
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return UpstreamError::InvalidResponse(e.to_string());
        }
        let kind = if e.is_timeout() {
            TransportKind::Timeout
        } else if e.is_connect() {
            TransportKind::Connect
        } else {
            TransportKind::Other
        };
        UpstreamError::Unavailable {
            kind,
            message: e.to_string(),
        }
    }
}

/// `retry-after` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    raw.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn has_images(request: &ChatCompletionRequest) -> bool {
    request.messages.iter().any(|m| match &m.content {
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, Role};
    use axum::http::StatusCode;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    fn request(stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![ChatMessage::text(Role::User, "hi")],
            stream,
            ..Default::default()
        }
    }

    fn client(url: &str) -> CopilotClient {
        CopilotClient::new(ClientConfig {
            base_url: url.to_string(),
            timeout: Duration::from_secs(5),
            vscode_version: "1.99.3".into(),
        })
        .unwrap()
    }

    /// Mock upstream that echoes request headers inside a chat completion.
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(
                |request: axum::http::Request<axum::body::Body>| async move {
                    let mut headers = serde_json::Map::new();
                    for (name, value) in request.headers() {
                        headers.insert(
                            name.to_string(),
                            value.to_str().unwrap_or("").into(),
                        );
                    }
                    let echoed = serde_json::Value::Object(headers).to_string();
                    axum::Json(serde_json::json!({
                        "id": "chatcmpl-1",
                        "model": "gpt-4o",
                        "choices": [{
                            "index": 0,
                            "message": {"role": "assistant", "content": echoed},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
                    }))
                },
            );
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn chat_sends_copilot_headers() {
        let url = start_echo_server().await;
        let response = client(&url).chat("tid_abc", &request(false)).await.unwrap();

        let content = response.choices[0].message.content.clone().unwrap();
        let headers: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(headers["authorization"], "Bearer tid_abc");
        assert_eq!(headers["copilot-integration-id"], "vscode-chat");
        assert_eq!(headers["editor-version"], "vscode/1.99.3");
        assert_eq!(headers["editor-plugin-version"], "copilot-chat/0.26.7");
        assert_eq!(headers["openai-intent"], "conversation-panel");
        assert_eq!(headers["x-github-api-version"], GITHUB_API_VERSION);
        assert_eq!(headers["x-initiator"], "user");
        assert!(headers["x-request-id"].as_str().unwrap().len() >= 32);
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[tokio::test]
    async fn agent_initiator_when_conversation_has_assistant_turns() {
        let url = start_echo_server().await;
        let mut req = request(false);
        req.messages.push(ChatMessage::text(Role::Assistant, "hello"));
        req.messages.push(ChatMessage::text(Role::User, "again"));

        let response = client(&url).chat("tid", &req).await.unwrap();
        let content = response.choices[0].message.content.clone().unwrap();
        assert!(content.contains("\"x-initiator\":\"agent\""), "got: {content}");
    }

    #[tokio::test]
    async fn rejection_preserves_status_body_and_retry_after() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "7")],
                    r#"{"error":{"message":"rate limited"}}"#,
                )
            });
            axum::serve(listener, app).await.unwrap();
        });

        let err = client(&format!("http://{addr}"))
            .chat("tid", &request(false))
            .await
            .unwrap_err();
        match err {
            UpstreamError::Rejected {
                status,
                body,
                retry_after,
            } => {
                assert_eq!(status, 429);
                assert!(body.contains("rate limited"));
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_yields_parsed_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                let body = concat!(
                    "data: {\"id\":\"c\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                    "data: {\"id\":\"c\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n",
                );
                ([(CONTENT_TYPE, "text/event-stream")], body)
            });
            axum::serve(listener, app).await.unwrap();
        });

        let stream = client(&format!("http://{addr}"))
            .chat_stream("tid", &request(true))
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 2);
        let last = chunks[1].as_ref().unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{addr}"))
            .chat("tid", &request(false))
            .await
            .unwrap_err();
        assert!(
            matches!(err, UpstreamError::Unavailable { .. }),
            "got {err:?}"
        );
        assert!(err.is_retryable(&[]));
    }

    #[test]
    fn retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("2.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(2500)));
        headers.insert(
            "retry-after",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }
}
