//! Dispatch errors and their client-facing error envelopes
//!
//! Every failure surfaced to a client is rendered in the envelope of the
//! protocol it spoke:
//!
//! - Anthropic: `{"type":"error","error":{"type":..,"message":..},"request_id":..}`
//! - OpenAI: `{"error":{"type":..,"message":..,"code":..,"request_id":..}}`

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use upstream::{TransportKind, UpstreamError};

/// Wire protocol of the inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Anthropic,
    OpenAi,
}

impl Protocol {
    pub fn label(self) -> &'static str {
        match self {
            Protocol::Anthropic => "anthropic",
            Protocol::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("no upstream account available: {0}")]
    PoolExhausted(String),

    #[error(transparent)]
    Pool(copilot_pool::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<copilot_pool::Error> for DispatchError {
    fn from(e: copilot_pool::Error) -> Self {
        match e {
            copilot_pool::Error::PoolExhausted(message) => DispatchError::PoolExhausted(message),
            other => DispatchError::Pool(other),
        }
    }
}

impl From<translate::Error> for DispatchError {
    fn from(e: translate::Error) -> Self {
        DispatchError::InvalidRequest(e.to_string())
    }
}

fn error_type_for_status(status: u16) -> &'static str {
    match status {
        400 | 413 | 422 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        503 | 529 => "overloaded_error",
        _ => "api_error",
    }
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Upstream(UpstreamError::Unavailable {
                kind: TransportKind::Timeout,
                ..
            }) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Upstream(UpstreamError::Unavailable { .. })
            | DispatchError::Upstream(UpstreamError::InvalidResponse(_)) => StatusCode::BAD_GATEWAY,
            DispatchError::Upstream(UpstreamError::Rejected { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            DispatchError::Upstream(UpstreamError::RateLimitExceeded { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            DispatchError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Pool(_) | DispatchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Error `type` in the shared Anthropic/OpenAI vocabulary.
    pub fn error_type(&self) -> &'static str {
        match self {
            DispatchError::Upstream(UpstreamError::Rejected { status, .. }) => {
                error_type_for_status(*status)
            }
            DispatchError::Upstream(UpstreamError::RateLimitExceeded { .. }) => "rate_limit_error",
            DispatchError::Upstream(_) | DispatchError::Pool(_) | DispatchError::Internal(_) => {
                "api_error"
            }
            DispatchError::PoolExhausted(_) => "overloaded_error",
            DispatchError::InvalidRequest(_) => "invalid_request_error",
        }
    }

    /// Label for `gateway_upstream_errors_total`.
    pub fn metric_label(&self) -> &'static str {
        match self {
            DispatchError::Upstream(e) => e.metric_label(),
            DispatchError::PoolExhausted(_) => "pool_exhausted",
            DispatchError::Pool(_) => "pool",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Internal(_) => "internal",
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            DispatchError::Upstream(UpstreamError::RateLimitExceeded { retry_after }) => {
                Some(*retry_after)
            }
            DispatchError::Upstream(UpstreamError::Rejected { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }

    /// Client-facing message. Upstream rejections carry upstream's own
    /// message when its body has one.
    fn message(&self) -> String {
        match self {
            DispatchError::Upstream(UpstreamError::Rejected { status, body, .. }) => {
                serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.pointer("/error/message")
                            .or_else(|| v.get("message"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| format!("upstream returned status {status}"))
            }
            other => other.to_string(),
        }
    }

    /// Original upstream body, as JSON when it parses.
    fn upstream_body(&self) -> Option<Value> {
        match self {
            DispatchError::Upstream(UpstreamError::Rejected { body, .. }) if !body.is_empty() => {
                Some(serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.clone())))
            }
            _ => None,
        }
    }

    fn openai_code(&self) -> Value {
        match self {
            DispatchError::Upstream(UpstreamError::Rejected { status, .. }) => json!(status),
            DispatchError::Upstream(UpstreamError::RateLimitExceeded { .. }) => {
                json!("rate_limit_exceeded")
            }
            DispatchError::PoolExhausted(_) => json!("pool_exhausted"),
            _ => Value::Null,
        }
    }

    /// Error envelope for `protocol`.
    pub fn body(&self, protocol: Protocol, request_id: &str) -> Value {
        let mut error = json!({
            "type": self.error_type(),
            "message": self.message(),
        });
        if let Some(upstream_body) = self.upstream_body() {
            error["upstream_body"] = upstream_body;
        }
        match protocol {
            Protocol::Anthropic => json!({
                "type": "error",
                "error": error,
                "request_id": request_id,
            }),
            Protocol::OpenAi => {
                error["code"] = self.openai_code();
                error["request_id"] = json!(request_id);
                json!({ "error": error })
            }
        }
    }

    pub fn into_response(self, protocol: Protocol, request_id: &str) -> Response {
        let mut response = (
            self.status(),
            [(header::CONTENT_TYPE, "application/json")],
            self.body(protocol, request_id).to_string(),
        )
            .into_response();
        if let Some(retry_after) = self.retry_after() {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Error response for failures outside the dispatcher (bad JSON, admin
/// lookups).
pub fn error_response(
    status: StatusCode,
    protocol: Protocol,
    message: &str,
    request_id: &str,
) -> Response {
    let kind = error_type_for_status(status.as_u16());
    let body = match protocol {
        Protocol::Anthropic => json!({
            "type": "error",
            "error": {"type": kind, "message": message},
            "request_id": request_id,
        }),
        Protocol::OpenAi => json!({
            "error": {"type": kind, "message": message, "code": null, "request_id": request_id},
        }),
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16, body: &str) -> DispatchError {
        DispatchError::Upstream(UpstreamError::Rejected {
            status,
            body: body.into(),
            retry_after: None,
        })
    }

    #[test]
    fn status_mapping() {
        let timeout = DispatchError::Upstream(UpstreamError::Unavailable {
            kind: TransportKind::Timeout,
            message: "deadline".into(),
        });
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let refused = DispatchError::Upstream(UpstreamError::Unavailable {
            kind: TransportKind::Connect,
            message: "refused".into(),
        });
        assert_eq!(refused.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(refused.error_type(), "api_error");

        assert_eq!(rejected(400, "").status(), StatusCode::BAD_REQUEST);
        assert_eq!(rejected(400, "").error_type(), "invalid_request_error");
        assert_eq!(rejected(401, "").error_type(), "authentication_error");
        assert_eq!(rejected(1000, "").status(), StatusCode::BAD_GATEWAY);

        let exhausted: DispatchError =
            copilot_pool::Error::PoolExhausted("0 of 2 accounts eligible".into()).into();
        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(exhausted.error_type(), "overloaded_error");

        let paced = DispatchError::Upstream(UpstreamError::RateLimitExceeded {
            retry_after: Duration::from_millis(1500),
        });
        assert_eq!(paced.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(paced.error_type(), "rate_limit_error");
    }

    #[test]
    fn anthropic_envelope_preserves_upstream_body() {
        let err = rejected(422, r#"{"error":{"message":"model not supported"}}"#);
        let body = err.body(Protocol::Anthropic, "req_1");
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "model not supported");
        assert_eq!(
            body["error"]["upstream_body"]["error"]["message"],
            "model not supported"
        );
        assert_eq!(body["request_id"], "req_1");
    }

    #[test]
    fn openai_envelope_carries_code() {
        let err = rejected(404, "no such model");
        let body = err.body(Protocol::OpenAi, "req_2");
        assert_eq!(body["error"]["type"], "not_found_error");
        assert_eq!(body["error"]["message"], "upstream returned status 404");
        assert_eq!(body["error"]["upstream_body"], "no such model");
        assert_eq!(body["error"]["code"], 404);
        assert_eq!(body["error"]["request_id"], "req_2");
    }

    #[test]
    fn pacing_error_sets_retry_after_header() {
        let err = DispatchError::Upstream(UpstreamError::RateLimitExceeded {
            retry_after: Duration::from_millis(1500),
        });
        let response = err.into_response(Protocol::OpenAi, "req_3");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn translate_errors_are_invalid_requests() {
        let err: DispatchError =
            translate::Error::InvalidRequest("messages must not be empty".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("messages must not be empty"));
    }

    #[test]
    fn standalone_error_response() {
        let response = error_response(
            StatusCode::NOT_FOUND,
            Protocol::Anthropic,
            "unknown account",
            "req_4",
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
