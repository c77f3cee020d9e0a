// Request handlers: the /v1/messages dispatch, health and status probes,
// and the browser-facing OAuth login/callback/status/logout endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::claude::{ContentBlock, MessagesRequest};
use super::model_router::{self, Provider, ReasoningLevel};
use super::{codex, error_json, gemini, openrouter, passthrough, vision, AppState};
use crate::auth::providers::{google, openai};
use crate::auth::{self, ensure_fresh, AuthError, OauthProviderKind, TokenRecord};
use crate::config;

#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub kind: OauthProviderKind,
    pub verifier: String,
    pub redirect_uri: String,
    pub slot: u8,
}

// ---------------------------------------------------------------------------
// Main dispatch

pub async fn messages(State(state): State<Arc<AppState>>, Json(raw): Json<Value>) -> Response {
    let mut req: MessagesRequest = match serde_json::from_value(raw.clone()) {
        Ok(req) => req,
        Err(e) => {
            return error_json(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("could not parse request: {}", e),
            )
        }
    };

    let default = state.active.read().clone();
    let selection = model_router::resolve(&req.model, default.as_ref());
    tracing::info!("dispatch {} -> {}", req.model, selection.describe());

    // Remember the selection for default resolution of later requests.
    // Anthropic-passthrough models are the client's internal side-task
    // defaults and must not clobber the user's explicit choice. This write
    // happens before any suspension point of the dispatch.
    if selection.provider != Provider::PassthroughAnthropic {
        *state.active.write() = Some(selection.clone());
    }

    let config = config::get();

    match selection.provider {
        Provider::PassthroughAnthropic => {
            let api_key = match &config.anthropic_api_key {
                Some(key) => key,
                None => {
                    return error_json(
                        StatusCode::UNAUTHORIZED,
                        "authentication_error",
                        "ANTHROPIC_API_KEY is not set",
                    )
                }
            };
            passthrough::dispatch_anthropic(
                &state.http,
                raw,
                &selection.model,
                &config.anthropic_upstream_url,
                api_key,
                &config.anthropic_version,
            )
            .await
        }
        Provider::PassthroughGlm => {
            let base_url = match &config.glm_upstream_url {
                Some(url) => url,
                None => {
                    return error_json(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "config_error",
                        "GLM_UPSTREAM_URL is not set",
                    )
                }
            };
            let api_key = match &config.glm_api_key {
                Some(key) => key,
                None => {
                    return error_json(
                        StatusCode::UNAUTHORIZED,
                        "authentication_error",
                        "ZAI_API_KEY (or GLM_API_KEY) is not set",
                    )
                }
            };

            // The GLM upstream has no image support: swap image blocks for
            // descriptions before the bytes go out.
            let mut raw = raw;
            if has_image_blocks(&req) {
                vision::apply_fallback(&state.http, &state.vision, &mut req).await;
                if let Ok(messages) = serde_json::to_value(&req.messages) {
                    raw["messages"] = messages;
                }
            }
            passthrough::dispatch_glm(&state.http, raw, &selection.model, base_url, api_key).await
        }
        Provider::OpenAiKey => {
            let api_key = match &config.openai_api_key {
                Some(key) => key,
                None => {
                    return error_json(
                        StatusCode::UNAUTHORIZED,
                        "authentication_error",
                        "OPENAI_API_KEY is not set",
                    )
                }
            };
            codex::dispatch_api_key(&state.http, &req, &selection.model, selection.reasoning, api_key)
                .await
        }
        Provider::OpenRouter => {
            let api_key = match &config.openrouter_api_key {
                Some(key) => key,
                None => {
                    return error_json(
                        StatusCode::UNAUTHORIZED,
                        "authentication_error",
                        "OPENROUTER_API_KEY is not set",
                    )
                }
            };
            openrouter::dispatch(&state.http, &req, &selection.model, selection.reasoning, api_key)
                .await
        }
        Provider::GeminiKey => {
            let api_key = match &config.gemini_api_key {
                Some(key) => key,
                None => {
                    return error_json(
                        StatusCode::UNAUTHORIZED,
                        "authentication_error",
                        "GEMINI_API_KEY is not set",
                    )
                }
            };
            gemini::dispatch_api_key(&state.http, &req, &selection.model, selection.reasoning, api_key)
                .await
        }
        Provider::GeminiOauth => {
            let token = match ensure_fresh(
                &state.tokens,
                &state.short_http,
                OauthProviderKind::Google,
                1,
            )
            .await
            {
                Ok(token) => token,
                Err(e) => return auth_error_response(e, "Gemini", "/google/login"),
            };
            gemini::dispatch_oauth(&state, &req, &selection.model, selection.reasoning, token).await
        }
        Provider::CodexOauth => {
            let effort = selection
                .reasoning
                .or_else(|| {
                    config
                        .codex_reasoning_effort
                        .as_deref()
                        .and_then(ReasoningLevel::parse)
                })
                .unwrap_or(ReasoningLevel::High);

            match ensure_fresh(&state.tokens, &state.short_http, OauthProviderKind::Codex, 1).await
            {
                Ok(token) => {
                    codex::dispatch_oauth(&state, &req, &selection.model, effort, &token).await
                }
                // no OAuth session: fall back to the API key if one exists
                Err(AuthError::NotLoggedIn) if config.openai_api_key.is_some() => {
                    let api_key = config.openai_api_key.as_deref().unwrap_or_default();
                    codex::dispatch_api_key(
                        &state.http,
                        &req,
                        &selection.model,
                        Some(effort),
                        api_key,
                    )
                    .await
                }
                Err(e) => auth_error_response(e, "Codex", "/codex/login"),
            }
        }
    }
}

fn has_image_blocks(req: &MessagesRequest) -> bool {
    req.messages.iter().any(|message| {
        message
            .content
            .blocks()
            .iter()
            .any(|block| matches!(block, ContentBlock::Image { .. }))
    })
}

fn auth_error_response(error: AuthError, provider: &str, login_path: &str) -> Response {
    match error {
        AuthError::NotLoggedIn => error_json(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            &format!("{} account not connected. Open {} to log in.", provider, login_path),
        ),
        AuthError::Refresh(message) => {
            tracing::warn!("{} token refresh failed: {}", provider, message);
            error_json(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                &format!(
                    "{} token refresh failed ({}). Open {} to log in again.",
                    provider, message, login_path
                ),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Probes

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    let active = state.active.read().as_ref().map(|s| s.describe());
    Json(json!({
        "ok": true,
        "pid": std::process::id(),
        "startedAt": state.started_at,
        "active": active,
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let active = state.active.read().clone();
    Json(match active {
        Some(selection) => json!({
            "provider": selection.provider.tag(),
            "model": selection.model,
            "reasoning": selection.reasoning.map(|r| r.as_str()),
        }),
        None => json!({ "provider": null, "model": null, "reasoning": null }),
    })
}

// ---------------------------------------------------------------------------
// OAuth endpoints

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub account: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

const SUCCESS_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Authentication Successful</title>
    <script>setTimeout(function(){window.close();}, 3000);</script>
    <style>
        body { font-family: system-ui, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #f5f5f5; }
        .container { text-align: center; padding: 2rem; background: white; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }
        h1 { color: #22c55e; }
    </style>
</head>
<body>
    <div class="container">
        <h1>&#10003; Authentication Successful!</h1>
        <p>You can close this window.</p>
    </div>
</body>
</html>
"#;

const ERROR_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Authentication Failed</title>
    <style>
        body { font-family: system-ui, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #f5f5f5; }
        .container { text-align: center; padding: 2rem; background: white; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }
        h1 { color: #ef4444; }
    </style>
</head>
<body>
    <div class="container">
        <h1>&#10007; Authentication Failed</h1>
        <p>{{ERROR}}</p>
        <p>Please close this window and try again.</p>
    </div>
</body>
</html>
"#;

fn login_page(provider: &str, start_path: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Connect {provider}</title>
<style>
    body {{ font-family: system-ui, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #f5f5f5; }}
    .container {{ text-align: center; padding: 2rem; background: white; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }}
    a {{ color: #2563eb; }}
</style></head>
<body><div class="container">
    <h1>Connect {provider}</h1>
    <p><a href="{start_path}">Continue to {provider} sign-in</a></p>
</div></body>
</html>"#
    ))
}

fn error_page(message: &str) -> Html<String> {
    Html(ERROR_HTML.replace("{{ERROR}}", message))
}

/// Best-effort browser launch; failure is only logged.
fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("open").arg(url).spawn();
    #[cfg(target_os = "windows")]
    let result = std::process::Command::new("cmd")
        .args(["/c", "start", "", url])
        .spawn();
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let result = std::process::Command::new("xdg-open").arg(url).spawn();

    if let Err(e) = result {
        tracing::debug!("could not open browser: {}", e);
    }
}

fn callback_url(path: &str) -> String {
    format!("http://127.0.0.1:{}{}", config::get().port, path)
}

fn begin_login(state: &AppState, kind: OauthProviderKind, slot: u8, callback_path: &str) -> String {
    let pkce = auth::PkceCodes::generate();
    let login_state = auth::generate_state();
    let redirect_uri = callback_url(callback_path);

    let url = match kind {
        OauthProviderKind::Google => {
            google::authorize_url(&redirect_uri, &login_state, &pkce.challenge)
        }
        OauthProviderKind::Codex => {
            openai::authorize_url(&redirect_uri, &login_state, &pkce.challenge)
        }
    };

    state.pending_logins.lock().insert(
        login_state,
        PendingLogin {
            kind,
            verifier: pkce.verifier,
            redirect_uri,
            slot,
        },
    );

    tracing::info!("{} login started, authorize at {}", kind.label(), url);
    open_browser(&url);
    url
}

/// Validate the returned state against the pending table; a mismatch is
/// treated as CSRF and clears nothing else.
fn take_pending(
    state: &AppState,
    kind: OauthProviderKind,
    params: &CallbackParams,
) -> Result<(String, PendingLogin), String> {
    let login_state = params
        .state
        .as_deref()
        .ok_or_else(|| "missing state parameter".to_string())?;
    let code = params
        .code
        .as_deref()
        .ok_or_else(|| "missing authorization code".to_string())?;

    let pending = state
        .pending_logins
        .lock()
        .remove(login_state)
        .ok_or_else(|| "state mismatch or expired login attempt".to_string())?;
    if pending.kind != kind {
        return Err("state mismatch or expired login attempt".to_string());
    }
    Ok((code.to_string(), pending))
}

fn expiry_from(tokens: &auth::TokenResponse) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    tokens
        .expires_in
        .map(|secs| now + secs as i64 * 1000)
        .or_else(|| auth::jwt_expiry_ms(&tokens.access_token))
        .unwrap_or(now)
}

pub async fn google_login() -> Html<String> {
    login_page("Google", "/google/login/start")
}

pub async fn google_login_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LoginParams>,
) -> Redirect {
    let slot = params.account.unwrap_or(1);
    let url = begin_login(&state, OauthProviderKind::Google, slot, "/google/callback");
    Redirect::to(&url)
}

pub async fn google_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    if let Some(error) = &params.error {
        let message = params.error_description.clone().unwrap_or_else(|| error.clone());
        tracing::error!("google oauth error: {}", message);
        return error_page(&message);
    }
    let (code, pending) = match take_pending(&state, OauthProviderKind::Google, &params) {
        Ok(ok) => ok,
        Err(message) => return error_page(&message),
    };

    let tokens = match google::exchange_code(&state.http, &code, &pending.verifier, &pending.redirect_uri)
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!("google token exchange failed: {}", e);
            return error_page("Token exchange failed");
        }
    };

    let email = match google::fetch_email(&state.short_http, &tokens.access_token).await {
        Ok(email) => email,
        Err(e) => {
            tracing::warn!("failed to fetch google userinfo: {}", e);
            None
        }
    };

    // Workspace onboarding is best-effort; without a project id the
    // standard API serves the account.
    let project_id = match google::provision_project(&state.http, &tokens.access_token).await {
        Ok(project) => project,
        Err(e) => {
            tracing::warn!("workspace onboarding failed: {}", e);
            None
        }
    };

    let record = TokenRecord {
        expires_at: expiry_from(&tokens),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        email: email.clone(),
        plan: None,
        account_id: None,
        project_id,
    };
    if let Err(e) = state.tokens.save(OauthProviderKind::Google, pending.slot, &record) {
        tracing::error!("failed to persist google tokens: {}", e);
        return error_page("Failed to save credentials");
    }

    tracing::info!(
        "google login complete for {} (slot {})",
        email.as_deref().unwrap_or("unknown"),
        pending.slot
    );
    Html(SUCCESS_HTML.to_string())
}

pub async fn google_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut accounts = Vec::new();
    for slot in [1u8, 2] {
        if let Some(record) = state.tokens.load(OauthProviderKind::Google, slot) {
            accounts.push(json!({
                "slot": slot,
                "email": record.email,
                "projectId": record.project_id,
                "expiresAt": record.expires_at,
            }));
        }
    }
    Json(json!({ "loggedIn": !accounts.is_empty(), "accounts": accounts }))
}

pub async fn google_logout(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LoginParams>,
) -> Response {
    let slot = params.account.unwrap_or(1);
    match state.tokens.delete(OauthProviderKind::Google, slot) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            &format!("logout failed: {}", e),
        ),
    }
}

pub async fn codex_login() -> Html<String> {
    login_page("ChatGPT", "/codex/login/start")
}

pub async fn codex_login_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LoginParams>,
) -> Redirect {
    let slot = params.account.unwrap_or(1);
    let url = begin_login(&state, OauthProviderKind::Codex, slot, "/codex/callback");
    Redirect::to(&url)
}

pub async fn codex_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    if let Some(error) = &params.error {
        let message = params.error_description.clone().unwrap_or_else(|| error.clone());
        tracing::error!("codex oauth error: {}", message);
        return error_page(&message);
    }
    let (code, pending) = match take_pending(&state, OauthProviderKind::Codex, &params) {
        Ok(ok) => ok,
        Err(message) => return error_page(&message),
    };

    let tokens = match openai::exchange_code(&state.http, &code, &pending.verifier, &pending.redirect_uri)
        .await
    {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!("codex token exchange failed: {}", e);
            return error_page("Token exchange failed");
        }
    };

    let hints = openai::identity_hints(&tokens);
    let record = TokenRecord {
        expires_at: expiry_from(&tokens),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        email: hints.email.clone(),
        plan: hints.plan,
        account_id: hints.account_id,
        project_id: None,
    };
    if let Err(e) = state.tokens.save(OauthProviderKind::Codex, pending.slot, &record) {
        tracing::error!("failed to persist codex tokens: {}", e);
        return error_page("Failed to save credentials");
    }

    tracing::info!(
        "codex login complete for {}",
        hints.email.as_deref().unwrap_or("unknown")
    );
    Html(SUCCESS_HTML.to_string())
}

pub async fn codex_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut accounts = Vec::new();
    for slot in [1u8, 2] {
        if let Some(record) = state.tokens.load(OauthProviderKind::Codex, slot) {
            accounts.push(json!({
                "slot": slot,
                "email": record.email,
                "plan": record.plan,
                "accountId": record.account_id,
                "expiresAt": record.expires_at,
            }));
        }
    }
    Json(json!({ "loggedIn": !accounts.is_empty(), "accounts": accounts }))
}

pub async fn codex_logout(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LoginParams>,
) -> Response {
    let slot = params.account.unwrap_or(1);
    match state.tokens.delete(OauthProviderKind::Codex, slot) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            "api_error",
            &format!("logout failed: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::model_router::Selection;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(1_700_000_000_000).unwrap())
    }

    fn callback(code: Option<&str>, state: Option<&str>) -> CallbackParams {
        CallbackParams {
            code: code.map(|s| s.to_string()),
            state: state.map(|s| s.to_string()),
            error: None,
            error_description: None,
        }
    }

    fn park(state: &AppState, login_state: &str, kind: OauthProviderKind) {
        state.pending_logins.lock().insert(
            login_state.to_string(),
            PendingLogin {
                kind,
                verifier: "verifier".into(),
                redirect_uri: "http://127.0.0.1:17870/cb".into(),
                slot: 1,
            },
        );
    }

    #[test]
    fn take_pending_consumes_the_entry_once() {
        let state = test_state();
        park(&state, "st-1", OauthProviderKind::Google);

        let params = callback(Some("the-code"), Some("st-1"));
        let (code, pending) = take_pending(&state, OauthProviderKind::Google, &params).unwrap();
        assert_eq!(code, "the-code");
        assert_eq!(pending.verifier, "verifier");

        // a replayed callback must fail
        assert!(take_pending(&state, OauthProviderKind::Google, &params).is_err());
    }

    #[test]
    fn take_pending_rejects_unknown_or_cross_provider_state() {
        let state = test_state();
        park(&state, "st-google", OauthProviderKind::Google);

        let params = callback(Some("c"), Some("st-unknown"));
        assert!(take_pending(&state, OauthProviderKind::Google, &params).is_err());

        let params = callback(Some("c"), Some("st-google"));
        assert!(take_pending(&state, OauthProviderKind::Codex, &params).is_err());

        let params = callback(Some("c"), None);
        assert!(take_pending(&state, OauthProviderKind::Google, &params).is_err());
    }

    #[test]
    fn auth_errors_map_to_401() {
        let response = auth_error_response(AuthError::NotLoggedIn, "Gemini", "/google/login");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response =
            auth_error_response(AuthError::Refresh("expired".into()), "Codex", "/codex/login");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn healthz_reports_pid_and_start_time() {
        let state = test_state();
        let body = healthz(State(state)).await.0;
        assert_eq!(body["ok"], true);
        assert_eq!(body["pid"].as_u64(), Some(std::process::id() as u64));
        assert_eq!(body["startedAt"].as_i64(), Some(1_700_000_000_000));
        assert!(body["active"].is_null());
    }

    #[tokio::test]
    async fn status_reflects_the_active_selection() {
        let state = test_state();
        *state.active.write() = Some(Selection {
            provider: Provider::CodexOauth,
            model: "gpt-5.3-codex".into(),
            reasoning: Some(ReasoningLevel::Low),
        });
        let body = status(State(state)).await.0;
        assert_eq!(body["provider"], "codex");
        assert_eq!(body["model"], "gpt-5.3-codex");
        assert_eq!(body["reasoning"], "low");
    }

    #[tokio::test]
    async fn malformed_request_bodies_fail_with_400() {
        let state = test_state();
        let response = messages(State(state), Json(json!({ "messages": "nope" }))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn anthropic_passthrough_never_touches_the_active_cell() {
        let state = test_state();
        // no ANTHROPIC_API_KEY configured: the dispatch stops at validation,
        // after the point where the cell would have been written
        let response = messages(
            State(state.clone()),
            Json(json!({
                "model": "claude-haiku-4-5-20251001",
                "messages": [{ "role": "user", "content": "hi" }]
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(state.active.read().is_none());
    }

    #[tokio::test]
    async fn non_passthrough_dispatch_updates_the_active_cell() {
        let state = test_state();
        // GLM_UPSTREAM_URL is not configured, so the dispatch fails after
        // routing; the cell is written before any suspension point
        let response = messages(
            State(state.clone()),
            Json(json!({
                "model": "glm",
                "messages": [{ "role": "user", "content": "hi" }]
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let active = state.active.read().clone().unwrap();
        assert_eq!(active.provider, Provider::PassthroughGlm);
        assert_eq!(active.model, "glm-4.6");
    }
}
