//! Client-facing API handlers
//!
//! Both client protocols funnel into the same [`Dispatcher`]; only request
//! parsing and response encoding differ:
//!
//! - `POST /v1/messages`: Anthropic Messages, translated to and from the
//!   OpenAI-shaped upstream
//! - `POST /v1/chat/completions`: OpenAI chat, passed through
//! - `POST /v1/embeddings`: OpenAI embeddings, passed through
//!
//! Complete responses carry `x-cache: HIT|MISS`; every response carries
//! `x-request-id`.

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use serde::Serialize;
use std::convert::Infallible;
use tracing::{debug, error, info, instrument};
use translate::anthropic::MessagesRequest;
use upstream::{ChatCompletionRequest, EmbeddingsRequest};

use crate::dispatch::{ChatOutcome, Dispatcher, anthropic_event_stream, openai_event_stream};
use crate::error::{DispatchError, Protocol, error_response};
use crate::metrics;

pub const CACHE_HEADER: &str = "x-cache";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// POST /v1/messages
#[instrument(skip_all, fields(request_id = %request_id, protocol = "anthropic"))]
pub async fn messages(dispatcher: Arc<Dispatcher>, body: Bytes, request_id: String) -> Response {
    let started = Instant::now();
    let response = handle_messages(dispatcher, &body, &request_id).await;
    finish(Protocol::Anthropic, response, started, &request_id)
}

async fn handle_messages(dispatcher: Arc<Dispatcher>, body: &[u8], request_id: &str) -> Response {
    let protocol = Protocol::Anthropic;
    let request: MessagesRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                protocol,
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };
    let chat = match translate::to_chat_request(&request) {
        Ok(chat) => chat,
        Err(e) => return DispatchError::from(e).into_response(protocol, request_id),
    };
    debug!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "messages request"
    );

    match spawn_chat(dispatcher, chat).await {
        Ok(ChatOutcome::Complete { response, cached }) => json_response(
            &translate::to_messages_response(&response),
            Some(cached),
            protocol,
            request_id,
        ),
        Ok(ChatOutcome::Stream(chunks)) => {
            sse_response(anthropic_event_stream(chunks, &request.model))
        }
        Err(e) => e.into_response(protocol, request_id),
    }
}

/// POST /v1/chat/completions
#[instrument(skip_all, fields(request_id = %request_id, protocol = "openai"))]
pub async fn chat_completions(
    dispatcher: Arc<Dispatcher>,
    body: Bytes,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let response = handle_chat_completions(dispatcher, &body, &request_id).await;
    finish(Protocol::OpenAi, response, started, &request_id)
}

async fn handle_chat_completions(
    dispatcher: Arc<Dispatcher>,
    body: &[u8],
    request_id: &str,
) -> Response {
    let protocol = Protocol::OpenAi;
    let request: ChatCompletionRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                protocol,
                &format!("invalid request body: {e}"),
                request_id,
            );
        }
    };
    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            protocol,
            "messages must not be empty",
            request_id,
        );
    }
    debug!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "chat completions request"
    );

    match spawn_chat(dispatcher, request).await {
        Ok(ChatOutcome::Complete { response, cached }) => {
            json_response(&response, Some(cached), protocol, request_id)
        }
        Ok(ChatOutcome::Stream(chunks)) => sse_response(openai_event_stream(chunks)),
        Err(e) => e.into_response(protocol, request_id),
    }
}

/// POST /v1/embeddings
#[instrument(skip_all, fields(request_id = %request_id, protocol = "openai"))]
pub async fn embeddings(dispatcher: Arc<Dispatcher>, body: Bytes, request_id: String) -> Response {
    let started = Instant::now();
    let protocol = Protocol::OpenAi;
    let response = match serde_json::from_slice::<EmbeddingsRequest>(&body) {
        Ok(request) => {
            let result = tokio::spawn(async move { dispatcher.dispatch_embeddings(&request).await })
                .await
                .unwrap_or_else(|e| Err(join_failure(e)));
            match result {
                Ok(response) => json_response(&response, None, protocol, &request_id),
                Err(e) => e.into_response(protocol, &request_id),
            }
        }
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            protocol,
            &format!("invalid request body: {e}"),
            &request_id,
        ),
    };
    finish(protocol, response, started, &request_id)
}

/// Dispatch on its own task: a client that disconnects mid-request does not
/// cancel the upstream call, so a complete response still reaches the cache.
async fn spawn_chat(
    dispatcher: Arc<Dispatcher>,
    request: ChatCompletionRequest,
) -> Result<ChatOutcome, DispatchError> {
    tokio::spawn(async move { dispatcher.dispatch_chat(&request).await })
        .await
        .unwrap_or_else(|e| Err(join_failure(e)))
}

fn join_failure(e: tokio::task::JoinError) -> DispatchError {
    error!(error = %e, "dispatch task failed");
    DispatchError::Internal("request processing failed".into())
}

fn json_response<T: Serialize>(
    value: &T,
    cached: Option<bool>,
    protocol: Protocol,
    request_id: &str,
) -> Response {
    let body = match serde_json::to_string(value) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to encode response");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                protocol,
                "failed to encode response",
                request_id,
            );
        }
    };
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    if let Some(cached) = cached {
        let value = if cached { "HIT" } else { "MISS" };
        response
            .headers_mut()
            .insert(CACHE_HEADER, HeaderValue::from_static(value));
    }
    response
}

fn sse_response<S>(frames: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}

/// Stamp the request id and record the request. For streams the recorded
/// duration ends when the headers go out.
fn finish(protocol: Protocol, mut response: Response, started: Instant, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    metrics::record_request(protocol.label(), status, elapsed.as_secs_f64());
    info!(
        status,
        latency_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    response
}
