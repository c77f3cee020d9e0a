// OpenAI/Codex OAuth: PKCE login against auth.openai.com with the query
// extras the Codex CLI sends, and a JSON refresh grant without a secret.

use anyhow::{anyhow, Result};
use serde_json::json;

use crate::auth::{decode_jwt_payload, TokenResponse};

const OPENAI_AUTH_URL: &str = "https://auth.openai.com/oauth/authorize";
const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";

pub const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const SCOPE: &str = "openid email profile offline_access";

pub fn authorize_url(redirect_uri: &str, state: &str, challenge: &str) -> String {
    // id_token_add_organizations, codex_cli_simplified_flow and originator
    // mirror the provider's own CLI and are required for this API surface.
    let params = [
        ("client_id", CLIENT_ID),
        ("response_type", "code"),
        ("redirect_uri", redirect_uri),
        ("scope", SCOPE),
        ("state", state),
        ("code_challenge", challenge),
        ("code_challenge_method", "S256"),
        ("prompt", "login"),
        ("id_token_add_organizations", "true"),
        ("codex_cli_simplified_flow", "true"),
        ("originator", "codex_cli_rs"),
    ];
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", OPENAI_AUTH_URL, query)
}

pub async fn exchange_code(
    http: &reqwest::Client,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let params = [
        ("grant_type", "authorization_code"),
        ("client_id", CLIENT_ID),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("code_verifier", verifier),
    ];

    let response = http
        .post(OPENAI_TOKEN_URL)
        .header("Accept", "application/json")
        .form(&params)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("token exchange failed: {} {}", status, body));
    }
    Ok(response.json().await?)
}

/// Codex refresh grant: JSON body, no client secret.
pub async fn refresh(http: &reqwest::Client, refresh_token: &str) -> Result<TokenResponse> {
    let body = json!({
        "client_id": CLIENT_ID,
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
        "scope": "openid profile email",
    });

    let response = http
        .post(OPENAI_TOKEN_URL)
        .header("Accept", "application/json")
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(anyhow!("token refresh failed: {} {}", status, text));
    }
    let text = response.text().await?;
    serde_json::from_str(&text).map_err(|e| anyhow!("bad token response: {} - body: {}", e, text))
}

/// Identity hints extracted from the token response's JWTs.
#[derive(Debug, Clone, Default)]
pub struct IdentityHints {
    pub email: Option<String>,
    pub plan: Option<String>,
    pub account_id: Option<String>,
}

pub fn identity_hints(tokens: &TokenResponse) -> IdentityHints {
    let mut hints = IdentityHints::default();

    if let Some(claims) = tokens.id_token.as_deref().and_then(decode_jwt_payload) {
        hints.email = claims
            .get("email")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
    }
    if let Some(claims) = decode_jwt_payload(&tokens.access_token) {
        if let Some(auth) = claims.get("https://api.openai.com/auth") {
            hints.plan = auth
                .get("chatgpt_plan_type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            hints.account_id = auth
                .get("chatgpt_account_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
        }
    }
    hints
}
