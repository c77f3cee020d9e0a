// HTTP gateway: loopback axum server, shared state, and route table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::signal;

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod handlers;
pub mod model_router;
pub mod openrouter;
pub mod passthrough;
pub mod schema_cleaner;
pub mod streaming;
pub mod vision;

use crate::auth::TokenStore;
use crate::config;
use model_router::Selection;

const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Timeout for OAuth refresh, userinfo and other short control-plane calls.
const SHORT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-scoped collaborators shared by all request tasks.
pub struct AppState {
    pub http: reqwest::Client,
    pub short_http: reqwest::Client,
    pub tokens: TokenStore,
    /// Last non-passthrough (provider, model) dispatched; resolves defaults
    /// for later requests with ambiguous model names.
    pub active: RwLock<Option<Selection>>,
    pub pending_logins: Mutex<HashMap<String, handlers::PendingLogin>>,
    pub vision: vision::VisionCache,
    pub started_at: i64,
}

impl AppState {
    pub fn new(started_at: i64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        let short_http = reqwest::Client::builder()
            .timeout(SHORT_CALL_TIMEOUT)
            .build()
            .context("failed to build short-call http client")?;

        Ok(Self {
            http,
            short_http,
            tokens: TokenStore::new(config::config_dir()),
            active: RwLock::new(None),
            pending_logins: Mutex::new(HashMap::new()),
            vision: vision::VisionCache::new(),
            started_at,
        })
    }
}

/// Pre-stream JSON error in the Messages error envelope.
pub fn error_json(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "type": error_type, "message": message } })),
    )
        .into_response()
}

pub async fn start_server(started_at: i64) -> Result<()> {
    let port = config::get().port;
    let state = Arc::new(AppState::new(started_at)?);

    let app = Router::new()
        .route("/v1/messages", post(handlers::messages))
        .route("/healthz", get(handlers::healthz))
        .route("/_status", get(handlers::status))
        .route("/google/login", get(handlers::google_login))
        .route("/google/login/start", get(handlers::google_login_start))
        .route("/google/callback", get(handlers::google_callback))
        .route("/google/status", get(handlers::google_status))
        .route("/google/logout", post(handlers::google_logout))
        .route("/codex/login", get(handlers::codex_login))
        .route("/codex/login/start", get(handlers::codex_login_start))
        .route("/codex/callback", get(handlers::codex_callback))
        .route("/codex/status", get(handlers::codex_status))
        .route("/codex/logout", post(handlers::codex_logout))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
