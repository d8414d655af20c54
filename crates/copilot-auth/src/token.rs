//! Copilot token exchange and GitHub user lookup
//!
//! Both calls are `GET`s against the GitHub API authorised with
//! `Authorization: token <github-oauth-token>`. They run on a client with the
//! short auxiliary deadline, not the chat deadline.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{COPILOT_TOKEN_PATH, GITHUB_API_URL, REFRESH_MARGIN_SECS, USER_PATH};
use crate::error::{Error, Result};

/// Short-lived Copilot API token.
///
/// `expires_at` is an absolute unix timestamp in seconds; `refresh_in` is
/// GitHub's suggested refresh delay in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CopilotToken {
    pub token: String,
    pub expires_at: u64,
    #[serde(default)]
    pub refresh_in: u64,
}

impl CopilotToken {
    pub fn expires_at_millis(&self) -> u64 {
        self.expires_at.saturating_mul(1000)
    }

    /// Unix millis at which this token should be replaced.
    pub fn refresh_due_at(&self) -> u64 {
        self.expires_at
            .saturating_sub(REFRESH_MARGIN_SECS)
            .saturating_mul(1000)
    }

    /// True once `now_ms` is inside the refresh margin before expiry.
    pub fn needs_refresh(&self, now_ms: u64) -> bool {
        now_ms >= self.refresh_due_at()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GithubUser {
    pub login: String,
}

/// Source of Copilot tokens for a GitHub token.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn TokenSource>`), so the pool can be tested without HTTP.
pub trait TokenSource: Send + Sync {
    fn exchange<'a>(
        &'a self,
        github_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<CopilotToken>> + Send + 'a>>;
}

/// `TokenSource` backed by the GitHub API.
pub struct HttpTokenSource {
    client: reqwest::Client,
    api_url: String,
    vscode_version: String,
}

impl HttpTokenSource {
    pub fn new(
        api_url: Option<&str>,
        timeout: Duration,
        vscode_version: &str,
    ) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url
                .unwrap_or(GITHUB_API_URL)
                .trim_end_matches('/')
                .to_string(),
            vscode_version: vscode_version.to_string(),
        })
    }

    fn headers(&self, github_token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("token {github_token}"))
            .map_err(|_| Error::InvalidCredentials("GitHub token is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(upstream::client::GITHUB_API_VERSION),
        );
        if let Ok(v) = HeaderValue::from_str(&format!("vscode/{}", self.vscode_version)) {
            headers.insert("editor-version", v);
        }
        if let Ok(v) = HeaderValue::from_str(&upstream::client::editor_plugin_version()) {
            headers.insert("editor-plugin-version", v);
        }
        if let Ok(v) = HeaderValue::from_str(&upstream::client::user_agent()) {
            headers.insert(USER_AGENT, v);
        }
        Ok(headers)
    }

    async fn get(&self, path: &str, github_token: &str) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.api_url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers(github_token)?)
            .send()
            .await
            .map_err(|e| Error::Http(format!("GET {path} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403: token revoked or no Copilot subscription
            if status.as_u16() == 401 || status.as_u16() == 403 {
                warn!(status = status.as_u16(), path, "GitHub rejected credentials");
                return Err(Error::InvalidCredentials(format!(
                    "GitHub returned {status}: {body}"
                )));
            }
            return Err(Error::TokenExchange(format!(
                "GitHub returned {status} for {path}: {body}"
            )));
        }
        Ok(response)
    }

    /// Exchange a GitHub OAuth token for a Copilot token.
    pub async fn fetch_copilot_token(&self, github_token: &str) -> Result<CopilotToken> {
        let token = self
            .get(COPILOT_TOKEN_PATH, github_token)
            .await?
            .json::<CopilotToken>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))?;
        debug!(expires_at = token.expires_at, "obtained Copilot token");
        Ok(token)
    }

    /// Look up the login that owns a GitHub token.
    pub async fn fetch_user(&self, github_token: &str) -> Result<GithubUser> {
        self.get(USER_PATH, github_token)
            .await?
            .json::<GithubUser>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid user response: {e}")))
    }
}

impl TokenSource for HttpTokenSource {
    fn exchange<'a>(
        &'a self,
        github_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<CopilotToken>> + Send + 'a>> {
        Box::pin(self.fetch_copilot_token(github_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tokio::net::TcpListener;

    async fn start_github_mock() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    COPILOT_TOKEN_PATH,
                    get(|headers: axum::http::HeaderMap| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("");
                        if auth == "token gho_good" {
                            (
                                StatusCode::OK,
                                r#"{"token":"tid=abc;exp=1","expires_at":1700001500,"refresh_in":1500}"#,
                            )
                        } else {
                            (StatusCode::UNAUTHORIZED, r#"{"message":"Bad credentials"}"#)
                        }
                    }),
                )
                .route(
                    USER_PATH,
                    get(|| async { axum::Json(serde_json::json!({"login": "octocat", "id": 1})) }),
                );
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn source(url: &str) -> HttpTokenSource {
        HttpTokenSource::new(Some(url), Duration::from_secs(5), "1.99.3").unwrap()
    }

    #[test]
    fn token_deserializes() {
        let json = r#"{"token":"tid=1","expires_at":1700000000,"refresh_in":1500,"sku":"free"}"#;
        let token: CopilotToken = serde_json::from_str(json).unwrap();
        assert_eq!(token.token, "tid=1");
        assert_eq!(token.expires_at, 1_700_000_000);
        assert_eq!(token.refresh_in, 1500);
    }

    #[test]
    fn refresh_window_is_sixty_seconds_before_expiry() {
        let token = CopilotToken {
            token: "t".into(),
            expires_at: 1_000,
            refresh_in: 0,
        };
        assert_eq!(token.refresh_due_at(), 940_000);
        assert!(!token.needs_refresh(939_999));
        assert!(token.needs_refresh(940_000));
        assert_eq!(token.expires_at_millis(), 1_000_000);
    }

    #[tokio::test]
    async fn exchange_returns_copilot_token() {
        let url = start_github_mock().await;
        let token = source(&url).exchange("gho_good").await.unwrap();
        assert_eq!(token.token, "tid=abc;exp=1");
        assert_eq!(token.expires_at, 1_700_001_500);
    }

    #[tokio::test]
    async fn rejected_token_is_invalid_credentials() {
        let url = start_github_mock().await;
        let err = source(&url).exchange("gho_revoked").await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn user_lookup_returns_login() {
        let url = start_github_mock().await;
        let user = source(&url).fetch_user("gho_good").await.unwrap();
        assert_eq!(user.login, "octocat");
    }

    #[tokio::test]
    async fn unreachable_api_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = source(&format!("http://{addr}"))
            .exchange("gho_good")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
    }
}
