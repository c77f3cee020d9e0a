// Configuration module for the gateway
//
// All settings come from a dotenv-style file in the user config directory
// (~/.claude-proxy/.env by default). Process environment variables with the
// same names take precedence over file entries.

use std::collections::HashMap;
use std::path::PathBuf;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

static CONFIG: OnceCell<RwLock<Config>> = OnceCell::new();

pub const DEFAULT_PORT: u16 = 17870;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_ANTHROPIC_UPSTREAM_URL: &str = "https://api.anthropic.com";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_VISION_MODEL: &str = "qwen/qwen2.5-vl-32b-instruct";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_base_url: String,
    pub openrouter_referer: Option<String>,
    pub openrouter_title: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    pub glm_upstream_url: Option<String>,
    pub glm_api_key: Option<String>,
    pub anthropic_upstream_url: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_version: String,
    pub vision_model: String,
    pub codex_reasoning_effort: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_lookup(|_| None)
    }
}

impl Config {
    /// Build a config from a key lookup function. Used by `load` with the
    /// merged env/file view and by tests with a plain map.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let nonempty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        Config {
            port: nonempty("CLAUDE_PROXY_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_PORT),
            openai_api_key: nonempty("OPENAI_API_KEY"),
            openai_base_url: nonempty("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            openrouter_api_key: nonempty("OPENROUTER_API_KEY"),
            openrouter_base_url: nonempty("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENROUTER_BASE_URL.to_string()),
            openrouter_referer: nonempty("OPENROUTER_REFERER"),
            openrouter_title: nonempty("OPENROUTER_TITLE"),
            gemini_api_key: nonempty("GEMINI_API_KEY"),
            gemini_base_url: nonempty("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            glm_upstream_url: nonempty("GLM_UPSTREAM_URL"),
            glm_api_key: nonempty("ZAI_API_KEY").or_else(|| nonempty("GLM_API_KEY")),
            anthropic_upstream_url: nonempty("ANTHROPIC_UPSTREAM_URL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_UPSTREAM_URL.to_string()),
            anthropic_api_key: nonempty("ANTHROPIC_API_KEY"),
            anthropic_version: nonempty("ANTHROPIC_VERSION")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_VERSION.to_string()),
            vision_model: nonempty("VISION_MODEL")
                .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            codex_reasoning_effort: nonempty("CODEX_REASONING_EFFORT"),
        }
    }

    fn load() -> Self {
        let mut file_vars: HashMap<String, String> = HashMap::new();
        let env_path = config_dir().join(".env");
        if env_path.exists() {
            match dotenvy::from_path_iter(&env_path) {
                Ok(iter) => {
                    for item in iter.flatten() {
                        file_vars.insert(item.0, item.1);
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to parse {:?}: {}", env_path, e);
                }
            }
        }

        Config::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        })
    }
}

/// Resolve the gateway's config directory. `CLAUDE_PROXY_DIR` overrides the
/// default of ~/.claude-proxy.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLAUDE_PROXY_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-proxy")
}

pub fn init() {
    let config = Config::load();
    if CONFIG.set(RwLock::new(config)).is_err() {
        tracing::warn!("config already initialized");
    }
}

pub fn get() -> Config {
    CONFIG
        .get()
        .map(|lock| lock.read().clone())
        .unwrap_or_default()
}
