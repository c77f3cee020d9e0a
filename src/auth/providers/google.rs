// Google/Gemini OAuth: PKCE login, token refresh, userinfo, and the Cloud
// Code Assist workspace onboarding (loadCodeAssist / onboardUser).

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::auth::TokenResponse;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";

pub const CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "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";

pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const CODE_ASSIST_VERSION: &str = "v1internal";

/// How long onboarding polls the long-running operation before giving up.
const ONBOARD_POLL_ATTEMPTS: u32 = 30;
const ONBOARD_POLL_INTERVAL_SECS: u64 = 2;

pub fn authorize_url(redirect_uri: &str, state: &str, challenge: &str) -> String {
    let scope = SCOPES.join(" ");
    let params = [
        ("client_id", CLIENT_ID),
        ("response_type", "code"),
        ("redirect_uri", redirect_uri),
        ("scope", scope.as_str()),
        ("state", state),
        ("code_challenge", challenge),
        ("code_challenge_method", "S256"),
        ("access_type", "offline"),
        ("prompt", "consent"),
    ];
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", GOOGLE_AUTH_URL, query)
}

pub async fn exchange_code(
    http: &reqwest::Client,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let params = [
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("code", code),
        ("code_verifier", verifier),
        ("grant_type", "authorization_code"),
        ("redirect_uri", redirect_uri),
    ];

    let response = http.post(GOOGLE_TOKEN_URL).form(&params).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("token exchange failed: {} {}", status, body));
    }
    Ok(response.json().await?)
}

/// Google refresh grant: form-urlencoded with the client secret.
pub async fn refresh(http: &reqwest::Client, refresh_token: &str) -> Result<TokenResponse> {
    let params = [
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let response = http.post(GOOGLE_TOKEN_URL).form(&params).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("token refresh failed: {} {}", status, body));
    }
    Ok(response.json().await?)
}

pub async fn fetch_email(http: &reqwest::Client, access_token: &str) -> Result<Option<String>> {
    let response = http
        .get(GOOGLE_USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        return Err(anyhow!("userinfo failed: {}", status));
    }
    let body: Value = response.json().await?;
    Ok(body
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string()))
}

fn client_metadata() -> Value {
    json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": "PLATFORM_UNSPECIFIED",
        "pluginType": "GEMINI"
    })
}

/// Resolve the workspace project id for an account. If the account already
/// has a provisioned project, `loadCodeAssist` returns it directly;
/// otherwise onboard the best available tier and poll the long-running
/// operation until it yields one. Returns None when onboarding does not
/// resolve, in which case the standard API is used instead.
pub async fn provision_project(http: &reqwest::Client, access_token: &str) -> Result<Option<String>> {
    let load = load_code_assist(http, access_token).await?;

    if load.get("currentTier").map(|t| !t.is_null()).unwrap_or(false) {
        if let Some(project) = load
            .get("cloudaicompanionProject")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
        {
            return Ok(Some(project.to_string()));
        }
    }

    let tier_id = pick_tier(&load);
    onboard_user(http, access_token, &tier_id).await
}

async fn load_code_assist(http: &reqwest::Client, access_token: &str) -> Result<Value> {
    let url = format!("{}/{}:loadCodeAssist", CODE_ASSIST_ENDPOINT, CODE_ASSIST_VERSION);
    let response = http
        .post(&url)
        .bearer_auth(access_token)
        .json(&json!({ "metadata": client_metadata() }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("loadCodeAssist failed: {} {}", status, body));
    }
    Ok(response.json().await?)
}

/// Tier preference: paid, then the account's current tier, then standard,
/// then free, then whatever is listed first.
fn pick_tier(load: &Value) -> String {
    let tiers: Vec<&Value> = load
        .get("allowedTiers")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().collect())
        .unwrap_or_default();

    let tier_id = |tier: &Value| -> Option<String> {
        tier.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    for pattern in ["paid"] {
        if let Some(id) = tiers
            .iter()
            .filter_map(|t| tier_id(t))
            .find(|id| id.contains(pattern))
        {
            return id;
        }
    }
    if let Some(id) = load
        .get("currentTier")
        .and_then(|t| t.get("id"))
        .and_then(|v| v.as_str())
    {
        return id.to_string();
    }
    for pattern in ["standard", "free"] {
        if let Some(id) = tiers
            .iter()
            .filter_map(|t| tier_id(t))
            .find(|id| id.contains(pattern))
        {
            return id;
        }
    }
    tiers
        .first()
        .and_then(|t| tier_id(t))
        .unwrap_or_else(|| "free-tier".to_string())
}

async fn onboard_user(
    http: &reqwest::Client,
    access_token: &str,
    tier_id: &str,
) -> Result<Option<String>> {
    let url = format!("{}/{}:onboardUser", CODE_ASSIST_ENDPOINT, CODE_ASSIST_VERSION);
    let body = json!({
        "tierId": tier_id,
        "metadata": client_metadata(),
    });

    for _ in 0..ONBOARD_POLL_ATTEMPTS {
        let response = http
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("onboardUser failed: {} {}", status, text));
        }
        let payload: Value = response.json().await?;
        if payload.get("done").and_then(|v| v.as_bool()) == Some(true) {
            let project = payload
                .get("response")
                .and_then(|v| v.get("cloudaicompanionProject"));
            let project_id = project
                .and_then(|v| v.get("id"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| project.and_then(|v| v.as_str()).map(|s| s.to_string()));
            return Ok(project_id);
        }
        tokio::time::sleep(tokio::time::Duration::from_secs(ONBOARD_POLL_INTERVAL_SECS)).await;
    }
    Ok(None)
}
