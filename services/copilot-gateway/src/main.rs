//! Copilot Gateway
//!
//! Single-binary service that:
//! 1. Accepts Anthropic Messages and OpenAI chat/embeddings requests
//! 2. Answers repeated non-streaming requests from a persistent LRU cache
//! 3. Spreads upstream calls across a pool of GitHub Copilot accounts,
//!    retrying transient failures and benching rate-limited accounts
//! 4. Streams upstream chunks back, translated chunk-by-chunk for Anthropic
//!    clients
//!
//! On SIGINT/SIGTERM both listeners drain, then pool and cache state are
//! flushed to the data directory.

mod admin;
mod config;
mod dispatch;
mod error;
mod metrics;
mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::JsonStore;
use copilot_auth::HttpTokenSource;
use copilot_pool::{Pool, spawn_refresh_task};
use metrics_exporter_prometheus::PrometheusHandle;
use response_cache::{PERSIST_INTERVAL, ResponseCache};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{CopilotClient, Invoker};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::dispatch::Dispatcher;

/// Upper bound on draining in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Debounce window for pool document writes.
const POOL_PERSIST_WINDOW: Duration = Duration::from_millis(500);

/// Request bodies may carry base64 images.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the public router. `max_connections` caps concurrent requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .route("/v1/embeddings", post(embeddings_handler))
        .route("/embeddings", post(embeddings_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting copilot-gateway");

    // Before anything can emit a metric
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = ?config.server.admin_addr,
        upstream_url = %config.upstream.copilot_url,
        pool_enabled = config.pool.enabled,
        strategy = ?config.pool.strategy,
        accounts = config.pool.accounts.len(),
        cache_enabled = config.cache.enabled,
        "configuration loaded"
    );

    let data_dir = config.storage.resolved_dir();
    let store = Arc::new(
        JsonStore::open(data_dir.clone())
            .await
            .with_context(|| format!("failed to open data directory {}", data_dir.display()))?,
    );

    let token_source = Arc::new(
        HttpTokenSource::new(
            Some(&config.upstream.github_api_url),
            config.upstream.auxiliary_timeout(),
            &config.upstream.vscode_version,
        )
        .context("failed to build GitHub token client")?,
    );

    let credentials = config.credentials();
    let configured: Vec<String> = credentials.iter().map(|c| c.id.clone()).collect();
    let pool = Arc::new(Pool::load(store.clone(), credentials, token_source.clone()).await);
    if !config.pool.enabled {
        // Accounts restored from an earlier pooled run sit out this process only
        let held = pool.hold_in_standby_except(&configured).await;
        info!(held, "pool disabled, serving from the first configured account");
    }
    let _pool_writer = pool.spawn_persistence(POOL_PERSIST_WINDOW);
    let _refresher = spawn_refresh_task(pool.clone());

    let cache = if config.cache.enabled {
        let cache = Arc::new(ResponseCache::load(store.clone(), config.cache.cache_config()).await);
        let _cache_writer = cache.spawn_persistence(PERSIST_INTERVAL);
        Some(cache)
    } else {
        info!("response cache disabled");
        None
    };

    let client = CopilotClient::new(config.upstream.client_config())
        .context("failed to build Copilot client")?;
    let invoker = Invoker::new(config.retry.policy(), config.rate_limit.gate());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(client),
        pool.clone(),
        cache.clone(),
        invoker,
        config.pool.strategy,
        config.rate_limit_cooldown(),
    ));

    let app = build_router(
        AppState {
            dispatcher: dispatcher.clone(),
            prometheus: prometheus_handle,
            started_at: Instant::now(),
        },
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Every listener drains once the watch flips
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut servers: Vec<(&'static str, JoinHandle<std::io::Result<()>>)> = Vec::new();

    servers.push(("api", serve(listener, app, shutdown_rx.clone())));
    info!(addr = %listen_addr, "api listener ready");

    if let Some(admin_addr) = config.server.admin_addr {
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
        let admin_app = build_admin_router(
            AdminState::new(dispatcher.clone()).with_user_lookup(token_source.clone()),
        );
        servers.push(("admin", serve(admin_listener, admin_app, shutdown_rx)));
        info!(addr = %admin_addr, "admin listener ready");
    } else {
        info!("admin listener disabled");
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // The drain timer starts at signal receipt
    let drain = async {
        for (name, handle) in servers {
            match handle.await {
                Ok(Ok(())) => info!(listener = name, "in-flight requests drained"),
                Ok(Err(e)) => error!(listener = name, error = %e, "server error during shutdown"),
                Err(e) => error!(listener = name, error = %e, "server task panicked"),
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        );
    }

    // Flush failures are logged only; shutdown proceeds
    if let Err(e) = pool.flush().await {
        error!(error = %e, "failed to persist pool state");
    }
    if let Some(cache) = &cache {
        match cache.flush().await {
            Ok(true) => info!("response cache persisted"),
            Ok(false) => debug!("response cache has no backing store"),
            Err(e) => error!(error = %e, "failed to persist response cache"),
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
    })
}

async fn messages_handler(State(state): State<AppState>, body: Bytes) -> Response {
    routes::messages(state.dispatcher.clone(), body, routes::new_request_id()).await
}

async fn chat_completions_handler(State(state): State<AppState>, body: Bytes) -> Response {
    routes::chat_completions(state.dispatcher.clone(), body, routes::new_request_id()).await
}

async fn embeddings_handler(State(state): State<AppState>, body: Bytes) -> Response {
    routes::embeddings(state.dispatcher.clone(), body, routes::new_request_id()).await
}

/// Pool health plus uptime. 503 when no account can serve a request.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.dispatcher.pool_status().await;
    body["uptime_seconds"] = serde_json::json!(state.started_at.elapsed().as_secs());
    body["cache"] = match state.dispatcher.cache_stats().await {
        Some(stats) => serde_json::json!({ "enabled": true, "size": stats.size }),
        None => serde_json::json!({ "enabled": false }),
    };

    let status_code = if body["status"] == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT. A handler that cannot be installed is logged
/// and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
