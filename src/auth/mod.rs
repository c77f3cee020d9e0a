// Credential subsystem: OAuth token records, per-provider token files and
// the silent-refresh path used before every OAuth-backed upstream call.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod providers;

/// Refresh when the stored token expires within this margin.
pub const REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OauthProviderKind {
    Google,
    Codex,
}

impl OauthProviderKind {
    pub fn label(&self) -> &'static str {
        match self {
            OauthProviderKind::Google => "google",
            OauthProviderKind::Codex => "codex",
        }
    }

    /// Token file name for an account slot. Slot 1 is the primary account;
    /// the secondary slot is used for rate-limit failover.
    pub fn file_name(&self, slot: u8) -> String {
        match self {
            OauthProviderKind::Google => {
                if slot <= 1 {
                    "google-oauth.json".to_string()
                } else {
                    format!("google-oauth-{}.json", slot)
                }
            }
            OauthProviderKind::Codex => {
                if slot <= 1 {
                    "codex-oauth.json".to_string()
                } else {
                    format!("codex-oauth-{}.json", slot)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry in epoch milliseconds.
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl TokenRecord {
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        self.expires_at - now_ms < REFRESH_MARGIN_MS
    }
}

#[derive(Debug)]
pub enum AuthError {
    NotLoggedIn,
    Refresh(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::NotLoggedIn => write!(f, "not logged in"),
            AuthError::Refresh(msg) => write!(f, "token refresh failed: {}", msg),
        }
    }
}

/// File-backed token store. Reads go straight to disk; refreshes serialize
/// on a per-(provider, slot) async mutex so concurrent requests never race
/// the file write, while other requests keep reading the current token.
pub struct TokenStore {
    dir: PathBuf,
    refresh_locks: parking_lot::Mutex<HashMap<(OauthProviderKind, u8), Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            refresh_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn token_path(&self, kind: OauthProviderKind, slot: u8) -> PathBuf {
        self.dir.join(kind.file_name(slot))
    }

    pub fn load(&self, kind: OauthProviderKind, slot: u8) -> Option<TokenRecord> {
        let path = self.token_path(kind, slot);
        if let Some(record) = read_record(&path) {
            return Some(record);
        }
        // The Codex CLI maintains its own token file; use it as a read-only
        // fallback when the gateway has no token of its own.
        if kind == OauthProviderKind::Codex && slot <= 1 {
            return load_codex_cli_tokens();
        }
        None
    }

    pub fn save(&self, kind: OauthProviderKind, slot: u8, record: &TokenRecord) -> Result<()> {
        let path = self.token_path(kind, slot);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(record)?;

        // Write-then-rename so a concurrent reader never observes a torn file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&tmp)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&tmp, perms)?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn delete(&self, kind: OauthProviderKind, slot: u8) -> Result<()> {
        let path = self.token_path(kind, slot);
        if path.exists() {
            fs::remove_file(&path).context("failed to remove token file")?;
        }
        Ok(())
    }

    pub fn refresh_lock(&self, kind: OauthProviderKind, slot: u8) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock();
        locks
            .entry((kind, slot))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn read_record(path: &PathBuf) -> Option<TokenRecord> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!("unreadable token file {:?}: {}", path, e);
            None
        }
    }
}

/// Parse ~/.codex/auth.json (the Codex CLI's own storage) into a record.
/// The file is never written by the gateway.
fn load_codex_cli_tokens() -> Option<TokenRecord> {
    let path = dirs::home_dir()?.join(".codex").join("auth.json");
    let content = fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&content).ok()?;
    let tokens = parsed.get("tokens")?;
    let access_token = tokens.get("access_token")?.as_str()?.to_string();

    let expires_at = jwt_expiry_ms(&access_token).unwrap_or(0);
    let claims = decode_jwt_payload(&access_token);
    let auth_claims = claims.as_ref().and_then(|c| c.get("https://api.openai.com/auth"));

    Some(TokenRecord {
        access_token,
        refresh_token: tokens
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        expires_at,
        email: claims
            .as_ref()
            .and_then(|c| c.get("email"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        plan: auth_claims
            .and_then(|a| a.get("chatgpt_plan_type"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        account_id: tokens
            .get("account_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| {
                auth_claims
                    .and_then(|a| a.get("chatgpt_account_id"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            }),
        project_id: None,
    })
}

/// Return a valid access token record, refreshing first when the stored one
/// expires within the margin. `http` should carry a short timeout.
pub async fn ensure_fresh(
    store: &TokenStore,
    http: &reqwest::Client,
    kind: OauthProviderKind,
    slot: u8,
) -> Result<TokenRecord, AuthError> {
    let now = chrono::Utc::now().timestamp_millis();
    let record = store.load(kind, slot).ok_or(AuthError::NotLoggedIn)?;
    if !record.needs_refresh(now) {
        return Ok(record);
    }

    let lock = store.refresh_lock(kind, slot);
    let _guard = lock.lock().await;

    // Another request may have refreshed while we waited on the lock.
    let record = store.load(kind, slot).ok_or(AuthError::NotLoggedIn)?;
    if !record.needs_refresh(chrono::Utc::now().timestamp_millis()) {
        return Ok(record);
    }

    let refresh_token = record
        .refresh_token
        .clone()
        .ok_or_else(|| AuthError::Refresh("no refresh token stored".to_string()))?;

    tracing::info!("refreshing {} token (slot {})", kind.label(), slot);
    let refreshed = match kind {
        OauthProviderKind::Google => providers::google::refresh(http, &refresh_token).await,
        OauthProviderKind::Codex => providers::openai::refresh(http, &refresh_token).await,
    }
    .map_err(|e| AuthError::Refresh(e.to_string()))?;

    let now = chrono::Utc::now().timestamp_millis();
    let expires_at = refreshed
        .expires_in
        .map(|secs| now + secs as i64 * 1000)
        .or_else(|| jwt_expiry_ms(&refreshed.access_token))
        .unwrap_or(now);

    let updated = TokenRecord {
        access_token: refreshed.access_token,
        refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
        expires_at,
        ..record
    };
    store
        .save(kind, slot, &updated)
        .map_err(|e| AuthError::Refresh(e.to_string()))?;
    Ok(updated)
}

/// Common shape of a token endpoint response across both providers.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// PKCE verifier/challenge pair for the authorization-code flow.
#[derive(Debug, Clone)]
pub struct PkceCodes {
    pub verifier: String,
    pub challenge: String,
}

impl PkceCodes {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let random_bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&random_bytes);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self { verifier, challenge }
    }
}

/// Random state token for CSRF protection.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&random_bytes)
}

/// Decode the payload segment of a JWT without verifying the signature.
/// Claims are advisory hints only (email, plan, account id, exp).
pub fn decode_jwt_payload(token: &str) -> Option<Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&payload).ok()
}

pub fn jwt_expiry_ms(token: &str) -> Option<i64> {
    decode_jwt_payload(token)?
        .get("exp")?
        .as_i64()
        .map(|secs| secs * 1000)
}
