//! Admin API for the response cache and the account pool
//!
//! Runs on its own listener (`server.admin_addr`) so it is never reachable
//! through the public port.
//!
//! Endpoints:
//! - GET    /admin/cache/stats: size, hits, misses, hit rate, tokens saved
//! - DELETE /admin/cache: drop every entry (counters kept)
//! - DELETE /admin/cache/{key}: drop one entry
//! - GET    /admin/pool: pool health summary
//! - GET    /admin/pool/accounts: per-account status, never tokens
//! - POST   /admin/pool/accounts: add an account (login looked up on GitHub when omitted)
//! - DELETE /admin/pool/accounts/{id}: retire an account (marked inactive)
//! - POST   /admin/pool/accounts/{id}/pause: exclude from selection
//! - POST   /admin/pool/accounts/{id}/resume: undo pause
//! - POST   /admin/pool/accounts/{id}/activate: undo retirement or auth failure

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use common::Secret;
use copilot_auth::HttpTokenSource;
use copilot_pool::Credential;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    dispatcher: Arc<Dispatcher>,
    github: Option<Arc<HttpTokenSource>>,
}

impl AdminState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            github: None,
        }
    }

    /// Resolve missing logins of added accounts against the GitHub API.
    pub fn with_user_lookup(mut self, github: Arc<HttpTokenSource>) -> Self {
        self.github = Some(github);
        self
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache", delete(cache_clear))
        .route("/admin/cache/{key}", delete(cache_delete))
        .route("/admin/pool", get(pool_status))
        .route("/admin/pool/accounts", get(list_accounts).post(add_account))
        .route("/admin/pool/accounts/{id}", delete(remove_account))
        .route("/admin/pool/accounts/{id}/{action}", post(account_action))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

fn pool_error(id: &str, e: copilot_pool::Error) -> (StatusCode, serde_json::Value) {
    let status = match &e {
        copilot_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        copilot_pool::Error::Duplicate(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, json!({ "account_id": id, "error": e.to_string() }))
}

async fn cache_stats(State(state): State<AdminState>) -> impl IntoResponse {
    match state.dispatcher.cache_stats().await {
        Some(stats) => json_response(StatusCode::OK, json!(stats)),
        None => json_response(
            StatusCode::NOT_FOUND,
            json!({ "error": "response cache is disabled" }),
        ),
    }
}

async fn cache_clear(State(state): State<AdminState>) -> impl IntoResponse {
    let cleared = state.dispatcher.cache_clear().await;
    info!(cleared, "cache cleared");
    json_response(StatusCode::OK, json!({ "cleared": cleared }))
}

async fn cache_delete(
    State(state): State<AdminState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    if state.dispatcher.cache_delete(&key).await {
        json_response(StatusCode::OK, json!({ "key": key, "deleted": true }))
    } else {
        json_response(
            StatusCode::NOT_FOUND,
            json!({ "key": key, "error": "no such cache entry" }),
        )
    }
}

async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.dispatcher.pool_status().await)
}

async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = state.dispatcher.pool_accounts_status().await;
    json_response(StatusCode::OK, json!({ "accounts": accounts }))
}

#[derive(Deserialize)]
struct AddAccountRequest {
    id: String,
    /// GitHub OAuth token
    token: String,
    #[serde(default)]
    login: Option<String>,
}

async fn add_account(
    State(state): State<AdminState>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let request: AddAccountRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("invalid request body: {e}") }),
            );
        }
    };
    if request.id.trim().is_empty() || request.token.trim().is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({ "error": "id and token must not be empty" }),
        );
    }

    let id = request.id;
    let mut login = request.login;
    if login.is_none()
        && let Some(github) = &state.github
    {
        match github.fetch_user(&request.token).await {
            Ok(user) => login = Some(user.login),
            Err(copilot_auth::Error::InvalidCredentials(message)) => {
                warn!(account_id = id, "GitHub rejected token of new account");
                return json_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "account_id": id, "error": format!("invalid GitHub token: {message}") }),
                );
            }
            Err(e) => warn!(account_id = id, error = %e, "login lookup failed, adding without login"),
        }
    }

    let credential = Credential::new(id.clone(), Secret::new(request.token), login);
    match state.dispatcher.pool().add_account(credential).await {
        Ok(()) => {
            info!(account_id = id, "account added");
            json_response(
                StatusCode::CREATED,
                json!({ "account_id": id, "status": "added" }),
            )
        }
        Err(e) => {
            warn!(account_id = id, error = %e, "account not added");
            let (status, body) = pool_error(&id, e);
            json_response(status, body)
        }
    }
}

/// Removal is deferred: the account is marked inactive so in-flight requests
/// holding it finish normally.
async fn remove_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.dispatcher.pool().remove_account(&id).await {
        Ok(()) => {
            info!(account_id = id, "account removed");
            json_response(
                StatusCode::OK,
                json!({ "account_id": id, "status": "removed" }),
            )
        }
        Err(e) => {
            let (status, body) = pool_error(&id, e);
            json_response(status, body)
        }
    }
}

async fn account_action(
    State(state): State<AdminState>,
    Path((id, action)): Path<(String, String)>,
) -> impl IntoResponse {
    let pool = state.dispatcher.pool();
    let (result, status_label) = match action.as_str() {
        "pause" => (pool.pause(&id).await, "paused"),
        "resume" => (pool.resume(&id).await, "resumed"),
        "activate" => (pool.activate(&id).await, "activated"),
        _ => {
            return json_response(
                StatusCode::NOT_FOUND,
                json!({ "error": format!("unknown account action: {action}") }),
            );
        }
    };
    match result {
        Ok(()) => {
            info!(account_id = id, action, "account updated");
            json_response(
                StatusCode::OK,
                json!({ "account_id": id, "status": status_label }),
            )
        }
        Err(e) => {
            let (status, body) = pool_error(&id, e);
            json_response(status, body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::{FakeBackend, chat_request, test_cache, test_dispatcher};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn admin_app(dispatcher: Arc<Dispatcher>) -> Router {
        build_admin_router(AdminState::new(dispatcher))
    }

    fn dispatcher(ids: &[&str], with_cache: bool) -> Arc<Dispatcher> {
        let cache = with_cache.then(test_cache);
        Arc::new(test_dispatcher(ids, Arc::new(FakeBackend::default()), cache))
    }

    async fn send(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn cache_stats_reflect_traffic() {
        let dispatcher = dispatcher(&["a"], true);
        dispatcher.dispatch_chat(&chat_request(false)).await.unwrap();
        dispatcher.dispatch_chat(&chat_request(false)).await.unwrap();

        let (status, json) = send(admin_app(dispatcher), "GET", "/admin/cache/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["size"], 1);
        assert_eq!(json["hits"], 1);
        assert_eq!(json["misses"], 1);
        assert_eq!(json["tokens_saved"], 17);
    }

    #[tokio::test]
    async fn cache_stats_without_cache_is_404() {
        let (status, json) =
            send(admin_app(dispatcher(&["a"], false)), "GET", "/admin/cache/stats", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "response cache is disabled");
    }

    #[tokio::test]
    async fn cache_clear_and_delete() {
        let dispatcher = dispatcher(&["a"], true);
        dispatcher.dispatch_chat(&chat_request(false)).await.unwrap();

        let (status, json) =
            send(admin_app(dispatcher.clone()), "DELETE", "/admin/cache/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["key"], "nope");

        let (status, json) = send(admin_app(dispatcher.clone()), "DELETE", "/admin/cache", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cleared"], 1);
        assert_eq!(dispatcher.cache_stats().await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn pool_status_and_accounts_never_expose_tokens() {
        let app = admin_app(dispatcher(&["a", "b"], false));

        let (status, json) = send(app.clone(), "GET", "/admin/pool", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["accounts_total"], 2);

        let (status, json) = send(app, "GET", "/admin/pool/accounts", None).await;
        assert_eq!(status, StatusCode::OK);
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0]["id"], "a");
        let text = json.to_string();
        assert!(!text.contains("gho_"), "tokens leaked: {text}");
    }

    #[tokio::test]
    async fn add_account_then_duplicate_conflicts() {
        let dispatcher = dispatcher(&["a"], false);
        let body = json!({"id": "c", "token": "gho_c", "login": "octocat"});

        let (status, json) = send(
            admin_app(dispatcher.clone()),
            "POST",
            "/admin/pool/accounts",
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["account_id"], "c");
        assert_eq!(dispatcher.pool_accounts_status().await.len(), 2);

        let (status, _) = send(
            admin_app(dispatcher),
            "POST",
            "/admin/pool/accounts",
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    /// Mock GitHub `/user`: `gho_good` belongs to octocat, anything else is 401.
    async fn start_mock_github() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = Router::new().route(
                "/user",
                get(|headers: axum::http::HeaderMap| async move {
                    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                        Some("token gho_good") => (StatusCode::OK, r#"{"login":"octocat"}"#),
                        _ => (StatusCode::UNAUTHORIZED, r#"{"message":"Bad credentials"}"#),
                    }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn add_account_looks_up_missing_login() {
        let url = start_mock_github().await;
        let github = Arc::new(
            HttpTokenSource::new(Some(&url), std::time::Duration::from_secs(5), "1.99.3").unwrap(),
        );
        let dispatcher = dispatcher(&["a"], false);
        let app = build_admin_router(AdminState::new(dispatcher.clone()).with_user_lookup(github));

        let (status, _) = send(
            app.clone(),
            "POST",
            "/admin/pool/accounts",
            Some(json!({"id": "c", "token": "gho_good"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let accounts = dispatcher.pool_accounts_status().await;
        let added = accounts.iter().find(|s| s.id == "c").unwrap();
        assert_eq!(added.login.as_deref(), Some("octocat"));

        let (status, json) = send(
            app,
            "POST",
            "/admin/pool/accounts",
            Some(json!({"id": "d", "token": "gho_revoked"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().starts_with("invalid GitHub token"));
        assert_eq!(dispatcher.pool_accounts_status().await.len(), 2);
    }

    #[tokio::test]
    async fn add_account_rejects_empty_token() {
        let (status, json) = send(
            admin_app(dispatcher(&["a"], false)),
            "POST",
            "/admin/pool/accounts",
            Some(json!({"id": "c", "token": " "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "id and token must not be empty");
    }

    #[tokio::test]
    async fn remove_marks_account_inactive() {
        let dispatcher = dispatcher(&["a", "b"], false);
        let (status, json) = send(
            admin_app(dispatcher.clone()),
            "DELETE",
            "/admin/pool/accounts/a",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "removed");

        let accounts = dispatcher.pool_accounts_status().await;
        let a = accounts.iter().find(|s| s.id == "a").unwrap();
        assert!(!a.eligible);

        let (status, _) = send(
            admin_app(dispatcher),
            "DELETE",
            "/admin/pool/accounts/ghost",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pause_resume_activate() {
        let dispatcher = dispatcher(&["a"], false);
        let app = admin_app(dispatcher.clone());

        let (status, json) = send(app.clone(), "POST", "/admin/pool/accounts/a/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "paused");
        assert_eq!(dispatcher.pool_status().await["status"], "unhealthy");

        let (status, _) = send(app.clone(), "POST", "/admin/pool/accounts/a/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dispatcher.pool_status().await["status"], "healthy");

        let (status, _) = send(app.clone(), "POST", "/admin/pool/accounts/a/activate", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(app.clone(), "POST", "/admin/pool/accounts/ghost/pause", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(app, "POST", "/admin/pool/accounts/a/explode", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "unknown account action: explode");
    }

    #[tokio::test]
    async fn admin_router_does_not_serve_client_routes() {
        let response = admin_app(dispatcher(&["a"], false))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
