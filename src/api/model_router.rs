// Model router: parses the incoming model identifier into
// (provider, model, reasoning level), expanding shortcut aliases and
// falling back to the remembered active selection.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    PassthroughAnthropic,
    PassthroughGlm,
    OpenAiKey,
    OpenRouter,
    GeminiKey,
    GeminiOauth,
    CodexOauth,
}

impl Provider {
    pub fn tag(&self) -> &'static str {
        match self {
            Provider::PassthroughAnthropic => "anthropic",
            Provider::PassthroughGlm => "glm",
            Provider::OpenAiKey => "openai",
            Provider::OpenRouter => "openrouter",
            Provider::GeminiKey => "gemini",
            Provider::GeminiOauth => "gemini-oauth",
            Provider::CodexOauth => "codex",
        }
    }

    /// Human-facing label used in synthetic error blocks and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Provider::PassthroughAnthropic => "Anthropic",
            Provider::PassthroughGlm => "GLM",
            Provider::OpenAiKey => "OpenAI",
            Provider::OpenRouter => "OpenRouter",
            Provider::GeminiKey | Provider::GeminiOauth => "Gemini",
            Provider::CodexOauth => "Codex",
        }
    }

    fn from_tag(tag: &str) -> Option<Provider> {
        match tag {
            "anthropic" | "claude" => Some(Provider::PassthroughAnthropic),
            "glm" => Some(Provider::PassthroughGlm),
            "openai" => Some(Provider::OpenAiKey),
            "openrouter" => Some(Provider::OpenRouter),
            "gemini" => Some(Provider::GeminiKey),
            "gemini-oauth" => Some(Provider::GeminiOauth),
            "codex" => Some(Provider::CodexOauth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningLevel {
    Low,
    Medium,
    High,
    XHigh,
}

impl ReasoningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningLevel::Low => "low",
            ReasoningLevel::Medium => "medium",
            ReasoningLevel::High => "high",
            ReasoningLevel::XHigh => "xhigh",
        }
    }

    pub fn parse(value: &str) -> Option<ReasoningLevel> {
        match value {
            "low" => Some(ReasoningLevel::Low),
            "medium" => Some(ReasoningLevel::Medium),
            "high" => Some(ReasoningLevel::High),
            "xhigh" => Some(ReasoningLevel::XHigh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub provider: Provider,
    pub model: String,
    pub reasoning: Option<ReasoningLevel>,
}

impl Selection {
    pub fn describe(&self) -> String {
        match self.reasoning {
            Some(level) => format!("{}:{}@{}", self.provider.tag(), self.model, level.as_str()),
            None => format!("{}:{}", self.provider.tag(), self.model),
        }
    }
}

/// Shortcut aliases, looked up case-insensitively. Targets resolve through
/// the same prefix rules in the same pass.
const ALIASES: &[(&str, &str)] = &[
    ("codex", "codex:gpt-5.3-codex"),
    ("codex-mini", "codex:gpt-5.3-codex-mini"),
    ("gpt", "openai:gpt-5.2"),
    ("gemini", "gemini-oauth:gemini-3-pro-preview"),
    ("flash", "gemini-oauth:gemini-3-flash-preview"),
    ("gemini-pro", "gemini:gemini-3-pro-preview"),
    ("or", "openrouter:anthropic/claude-sonnet-4.5"),
    ("glm", "glm-4.6"),
    ("opus", "claude-opus-4-5-20251101"),
    ("sonnet", "claude-sonnet-4-5-20250929"),
    ("haiku", "claude-haiku-4-5-20251001"),
];

/// Resolve a model string. Deterministic and pure: the optional default is
/// the process's active selection, consulted only when nothing matches.
pub fn resolve(raw: &str, default: Option<&Selection>) -> Selection {
    let trimmed = raw.trim();

    // 1. strip a terminal @level suffix; unknown levels are left alone
    let (mut name, mut reasoning) = match trimmed.rsplit_once('@') {
        Some((head, tail)) => match ReasoningLevel::parse(&tail.to_ascii_lowercase()) {
            Some(level) if !head.is_empty() => (head.to_string(), Some(level)),
            _ => (trimmed.to_string(), None),
        },
        None => (trimmed.to_string(), None),
    };

    // 2. alias expansion, one pass
    let lower = name.to_ascii_lowercase();
    if let Some((_, target)) = ALIASES.iter().find(|(key, _)| *key == lower) {
        name = target.to_string();
    }

    // 3-4. vendor prefixes route straight to the passthroughs
    if name.starts_with("claude-") {
        return attach(Provider::PassthroughAnthropic, name, reasoning, default);
    }
    if name.starts_with("glm-") {
        return attach(Provider::PassthroughGlm, name, reasoning, default);
    }

    // 5. provider tag before the first ':' or '/'
    if let Some(split_at) = name.find(|c: char| c == ':' || c == '/') {
        let (tag, rest) = name.split_at(split_at);
        let model = &rest[1..];
        if let Some(provider) = Provider::from_tag(&tag.to_ascii_lowercase()) {
            if !model.is_empty() {
                return attach(provider, model.to_string(), reasoning, default);
            }
        }
    }

    // 6. default selection, then the GLM passthrough
    if let Some(default) = default {
        if reasoning.is_none() {
            reasoning = default.reasoning;
        }
        return Selection {
            provider: default.provider,
            model: default.model.clone(),
            reasoning,
        };
    }
    Selection {
        provider: Provider::PassthroughGlm,
        model: name,
        reasoning,
    }
}

fn attach(
    provider: Provider,
    model: String,
    explicit: Option<ReasoningLevel>,
    default: Option<&Selection>,
) -> Selection {
    // an explicit @level wins over any default-carried level
    let reasoning = explicit.or_else(|| default.and_then(|d| d.reasoning));
    Selection {
        provider,
        model,
        reasoning,
    }
}
