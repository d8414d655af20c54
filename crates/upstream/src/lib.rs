//! Upstream (GitHub Copilot) chat API abstraction
//!
//! Defines the `ChatBackend` trait that decouples the dispatch pipeline from
//! the HTTP client. `CopilotClient` is the production implementation; tests
//! substitute in-process fakes. Also owns the upstream error taxonomy and the
//! resilient invoker that retries failed attempts.

pub mod classify;
pub mod client;
pub mod retry;
pub mod sse;
pub mod types;

pub use classify::{ErrorClassification, classify_status};
pub use client::{ClientConfig, CopilotClient};
pub use retry::{Invoker, RateGate, RetryPolicy};
pub use types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    EmbeddingsRequest, EmbeddingsResponse, MessageContent, Role, Usage,
};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;

/// Why a request never produced an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Connect,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Timeout => "timeout",
            TransportKind::Connect => "connect",
            TransportKind::Other => "transport",
        })
    }
}

/// Errors from a single upstream call attempt.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// No HTTP response: connection refused/reset, DNS, deadline expiry,
    /// or the body stream broke mid-read.
    #[error("upstream unavailable ({kind}): {message}")]
    Unavailable { kind: TransportKind, message: String },

    /// Upstream answered with a non-success status. `body` is preserved
    /// verbatim so it can be surfaced to the client.
    #[error("upstream rejected request with status {status}")]
    Rejected {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Local pacing violated and waiting is disabled.
    #[error("rate limit exceeded, retry in {}ms", retry_after.as_millis())]
    RateLimitExceeded { retry_after: Duration },
}

impl UpstreamError {
    /// Retry predicate: transport failures always, HTTP rejections only
    /// when their status is in `retryable_statuses`.
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            UpstreamError::Unavailable { .. } => true,
            UpstreamError::Rejected { status, .. } => retryable_statuses.contains(status),
            UpstreamError::InvalidResponse(_) | UpstreamError::RateLimitExceeded { .. } => false,
        }
    }

    /// HTTP status carried by the error, if upstream sent one.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Label for the `gateway_upstream_errors_total{error_type}` metric.
    pub fn metric_label(&self) -> &'static str {
        match self {
            UpstreamError::Unavailable {
                kind: TransportKind::Timeout,
                ..
            } => "timeout",
            UpstreamError::Unavailable { .. } => "transport",
            UpstreamError::Rejected { status: 429, .. } => "rate_limited",
            UpstreamError::Rejected { status, .. } if *status >= 500 => "server_error",
            UpstreamError::Rejected { .. } => "rejected",
            UpstreamError::InvalidResponse(_) => "invalid_response",
            UpstreamError::RateLimitExceeded { .. } => "paced",
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Boxed future returned by `ChatBackend` methods (keeps the trait dyn-compatible).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Live sequence of upstream streaming chunks, in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatCompletionChunk>> + Send>>;

/// One upstream chat/embeddings endpoint reachable with a bearer token.
///
/// Uses `Pin<Box<dyn Future>>` return types so the dispatcher can hold an
/// `Arc<dyn ChatBackend>`.
pub trait ChatBackend: Send + Sync {
    /// Non-streaming chat completion.
    fn chat<'a>(
        &'a self,
        token: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse>>;

    /// Streaming chat completion. Resolves once upstream has accepted the
    /// request; chunk-level failures arrive as `Err` items on the stream.
    fn chat_stream<'a>(
        &'a self,
        token: &'a str,
        request: &'a ChatCompletionRequest,
    ) -> BoxFuture<'a, Result<ChunkStream>>;

    fn embeddings<'a>(
        &'a self,
        token: &'a str,
        request: &'a EmbeddingsRequest,
    ) -> BoxFuture<'a, Result<EmbeddingsResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_RETRYABLE: &[u16] = &[429, 500, 502, 503, 504];

    fn rejected(status: u16) -> UpstreamError {
        UpstreamError::Rejected {
            status,
            body: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn transport_failures_are_retryable() {
        for kind in [TransportKind::Timeout, TransportKind::Connect, TransportKind::Other] {
            let err = UpstreamError::Unavailable {
                kind,
                message: "boom".into(),
            };
            assert!(err.is_retryable(DEFAULT_RETRYABLE), "{kind} must retry");
        }
    }

    #[test]
    fn only_listed_statuses_are_retryable() {
        assert!(rejected(503).is_retryable(DEFAULT_RETRYABLE));
        assert!(rejected(429).is_retryable(DEFAULT_RETRYABLE));
        assert!(!rejected(400).is_retryable(DEFAULT_RETRYABLE));
        assert!(!rejected(401).is_retryable(DEFAULT_RETRYABLE));
        assert!(!rejected(503).is_retryable(&[429]));
    }

    #[test]
    fn pacing_and_decode_errors_never_retry() {
        let paced = UpstreamError::RateLimitExceeded {
            retry_after: Duration::from_secs(1),
        };
        assert!(!paced.is_retryable(DEFAULT_RETRYABLE));
        assert!(!UpstreamError::InvalidResponse("bad".into()).is_retryable(DEFAULT_RETRYABLE));
    }

    #[test]
    fn metric_labels() {
        assert_eq!(rejected(429).metric_label(), "rate_limited");
        assert_eq!(rejected(502).metric_label(), "server_error");
        assert_eq!(rejected(404).metric_label(), "rejected");
        let timeout = UpstreamError::Unavailable {
            kind: TransportKind::Timeout,
            message: String::new(),
        };
        assert_eq!(timeout.metric_label(), "timeout");
    }
}
