// Gemini adapter. One translator serves both the standard generative API
// (API key) and the Cloud Code Assist workspace backend (OAuth); the
// workspace schema wraps the payload in an envelope and has no first-class
// systemInstruction, so the system prompt is spliced into the first user
// message there.

use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::api::claude::{tool_result_text, ContentBlock, MessagesRequest};
use crate::api::error_json;
use crate::api::model_router::ReasoningLevel;
use crate::api::schema_cleaner::sanitize_schema;
use crate::api::streaming::{collect_message, sse_response, Delta, SseEvent, StopReason, UpstreamHandler};
use crate::api::AppState;
use crate::auth::{ensure_fresh, OauthProviderKind, TokenRecord};
use crate::config;

/// The workspace backend validates thought signatures on replayed
/// functionCall parts; history we replay never has one, so a fixed marker
/// is attached instead.
const DUMMY_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

const SYSTEM_OPEN: &str = "[System Instructions]";
const SYSTEM_CLOSE: &str = "[End System Instructions]";

fn default_safety_settings() -> Value {
    json!([
        { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "BLOCK_NONE" }
    ])
}

/// Build the inner generateContent request. Consecutive same-role messages
/// merge into one contents entry; the assistant role is renamed to model.
pub fn build_request(
    req: &MessagesRequest,
    model: &str,
    reasoning: Option<ReasoningLevel>,
    workspace: bool,
) -> Value {
    let mut contents: Vec<Value> = Vec::new();

    for message in &req.messages {
        let role = if message.role == "assistant" { "model" } else { "user" };
        let mut parts: Vec<Value> = Vec::new();

        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    parts.push(json!({ "text": text }));
                }
                ContentBlock::Image { source } => {
                    if let (Some(data), media_type) = (&source.data, &source.media_type) {
                        parts.push(json!({
                            "inlineData": {
                                "mimeType": media_type.as_deref().unwrap_or("image/png"),
                                "data": data
                            }
                        }));
                    } else if let Some(url) = &source.url {
                        parts.push(json!({ "fileData": { "fileUri": url } }));
                    }
                }
                ContentBlock::ToolUse { name, input, .. } => {
                    parts.push(json!({
                        "functionCall": { "name": name, "args": input },
                        "thoughtSignature": DUMMY_THOUGHT_SIGNATURE
                    }));
                }
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    let name = req.tool_name_for_id(&tool_use_id).unwrap_or("unknown");
                    parts.push(json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "content": tool_result_text(&content) }
                        }
                    }));
                }
                ContentBlock::Thinking { .. } => {}
            }
        }

        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["parts"].as_array_mut() {
                    existing.extend(parts);
                }
            }
            _ => contents.push(json!({ "role": role, "parts": parts })),
        }
    }

    let mut request = json!({ "contents": contents });

    if let Some(system) = req.system_text() {
        if workspace {
            splice_system_into_first_user(&mut request, &system);
        } else {
            request["systemInstruction"] = json!({ "role": "user", "parts": [{ "text": system }] });
        }
    }

    let mut generation_config = json!({});
    if let Some(temperature) = req.temperature {
        generation_config["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = req.max_tokens {
        generation_config["maxOutputTokens"] = json!(max_tokens);
    }
    generation_config["thinkingConfig"] = thinking_config(model, reasoning);
    request["generationConfig"] = generation_config;

    let mut tools: Vec<Value> = Vec::new();
    if let Some(defs) = &req.tools {
        if !defs.is_empty() {
            let declarations: Vec<Value> = defs
                .iter()
                .map(|tool| {
                    let mut declaration = json!({
                        "name": tool.name,
                        "parameters": sanitize_schema(&tool.input_schema)
                    });
                    if let Some(description) = &tool.description {
                        declaration["description"] = json!(description);
                    }
                    declaration
                })
                .collect();
            tools.push(json!({ "functionDeclarations": declarations }));
        }
    }
    tools.push(json!({ "google_search": {} }));
    request["tools"] = json!(tools);
    request["safetySettings"] = default_safety_settings();

    request
}

/// Workspace has no systemInstruction field: prepend a delimited segment to
/// the first user message instead.
fn splice_system_into_first_user(request: &mut Value, system: &str) {
    let segment = format!("{}\n{}\n{}\n\n", SYSTEM_OPEN, system, SYSTEM_CLOSE);
    let contents = match request["contents"].as_array_mut() {
        Some(contents) => contents,
        None => return,
    };

    for entry in contents.iter_mut() {
        if entry["role"] != "user" {
            continue;
        }
        if let Some(parts) = entry["parts"].as_array_mut() {
            for part in parts.iter_mut() {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    part["text"] = json!(format!("{}{}", segment, text));
                    return;
                }
            }
            parts.insert(0, json!({ "text": segment }));
            return;
        }
    }
    contents.insert(0, json!({ "role": "user", "parts": [{ "text": segment }] }));
}

/// Thinking controls differ by model family: 3.x takes a discrete
/// thinkingLevel (xhigh clamps to HIGH, and the 3.x pro model knows no
/// MEDIUM), 2.5 takes a token budget.
fn thinking_config(model: &str, reasoning: Option<ReasoningLevel>) -> Value {
    let mut config = json!({ "includeThoughts": true });
    let level = match reasoning {
        Some(level) => level,
        None => return config,
    };

    if model.contains("gemini-3") {
        let mut thinking_level = match level {
            ReasoningLevel::Low => "LOW",
            ReasoningLevel::Medium => "MEDIUM",
            ReasoningLevel::High | ReasoningLevel::XHigh => "HIGH",
        };
        if model.starts_with("gemini-3-pro") && thinking_level == "MEDIUM" {
            thinking_level = "HIGH";
        }
        config["thinkingLevel"] = json!(thinking_level);
    } else if model.contains("2.5") {
        let budget = match level {
            ReasoningLevel::Low => 1024,
            ReasoningLevel::Medium => 8192,
            ReasoningLevel::High => 32768,
            ReasoningLevel::XHigh => 65536,
        };
        config["thinkingBudget"] = json!(budget);
    }
    config
}

/// Cloud Code Assist envelope around the inner request.
pub fn wrap_workspace(inner: Value, model: &str, project: &str) -> Value {
    json!({
        "model": model,
        "project": project,
        "user_prompt_id": uuid::Uuid::new_v4().to_string(),
        "request": inner
    })
}

/// Stream handler for both Gemini endpoints. Text parts flagged `thought`
/// become thinking deltas; functionCall parts buffer until the stream ends
/// and then emerge as tool_use blocks.
#[derive(Default)]
pub struct GeminiStreamHandler {
    pending_calls: Vec<(String, Value)>,
}

impl UpstreamHandler for GeminiStreamHandler {
    fn on_event(&mut self, event: SseEvent) -> Vec<Delta> {
        let parsed: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        // the workspace backend wraps each payload in {"response": ...}
        let response = parsed.get("response").unwrap_or(&parsed);
        let mut deltas = Vec::new();

        if let Some(usage) = response.get("usageMetadata") {
            if let Some(n) = usage.get("promptTokenCount").and_then(|v| v.as_u64()) {
                deltas.push(Delta::InputTokens(n));
            }
            if let Some(n) = usage.get("candidatesTokenCount").and_then(|v| v.as_u64()) {
                deltas.push(Delta::OutputTokens(n));
            }
        }

        let candidate = match response.get("candidates").and_then(|v| v.get(0)) {
            Some(candidate) => candidate,
            None => return deltas,
        };

        if candidate.get("finishReason").and_then(|v| v.as_str()) == Some("MAX_TOKENS") {
            deltas.push(Delta::Stop(StopReason::MaxTokens));
        }

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());
        let parts = match parts {
            Some(parts) => parts,
            None => return deltas,
        };

        for part in parts {
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                self.pending_calls.push((name, args));
                continue;
            }
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if text.is_empty() {
                    continue;
                }
                if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
                    deltas.push(Delta::Thinking(text.to_string()));
                } else {
                    deltas.push(Delta::Text(text.to_string()));
                }
            }
        }
        deltas
    }

    fn flush(&mut self) -> Vec<Delta> {
        std::mem::take(&mut self.pending_calls)
            .into_iter()
            .map(|(name, input)| Delta::ToolUse {
                id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                name,
                input,
            })
            .collect()
    }
}

/// Standard generative API with an API key.
pub async fn dispatch_api_key(
    http: &reqwest::Client,
    req: &MessagesRequest,
    model: &str,
    reasoning: Option<ReasoningLevel>,
    api_key: &str,
) -> Response {
    let config = config::get();
    let payload = build_request(req, model, reasoning, false);
    let url = format!(
        "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
        config.gemini_base_url.trim_end_matches('/'),
        model
    );

    let upstream = match http
        .post(&url)
        .header("x-goog-api-key", api_key)
        .header("Accept", "text/event-stream")
        .json(&payload)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("Gemini request failed: {}", e),
            )
        }
    };
    respond(upstream, req, model).await
}

/// Workspace-OAuth mode. On a rate-limit response from the primary account
/// the dispatch retries once with the secondary slot.
pub async fn dispatch_oauth(
    state: &AppState,
    req: &MessagesRequest,
    model: &str,
    reasoning: Option<ReasoningLevel>,
    token: TokenRecord,
) -> Response {
    let upstream = match send_oauth(state, req, model, reasoning, &token).await {
        Ok(response) => response,
        Err(e) => {
            return error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("Gemini request failed: {}", e),
            )
        }
    };

    let upstream = if upstream.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        match ensure_fresh(&state.tokens, &state.short_http, OauthProviderKind::Google, 2).await {
            Ok(secondary) => {
                tracing::warn!("gemini primary account throttled, failing over to slot 2");
                match send_oauth(state, req, model, reasoning, &secondary).await {
                    Ok(response) => response,
                    Err(e) => {
                        return error_json(
                            axum::http::StatusCode::BAD_GATEWAY,
                            "upstream_error",
                            &format!("Gemini request failed: {}", e),
                        )
                    }
                }
            }
            Err(_) => upstream,
        }
    } else {
        upstream
    };

    respond(upstream, req, model).await
}

async fn send_oauth(
    state: &AppState,
    req: &MessagesRequest,
    model: &str,
    reasoning: Option<ReasoningLevel>,
    token: &TokenRecord,
) -> anyhow::Result<reqwest::Response> {
    use crate::auth::providers::google::{CODE_ASSIST_ENDPOINT, CODE_ASSIST_VERSION};

    // With a provisioned workspace project the Code Assist backend is used;
    // otherwise the standard API accepts the OAuth bearer directly.
    let (url, payload) = match &token.project_id {
        Some(project) => {
            let inner = build_request(req, model, reasoning, true);
            (
                format!(
                    "{}/{}:streamGenerateContent?alt=sse",
                    CODE_ASSIST_ENDPOINT, CODE_ASSIST_VERSION
                ),
                wrap_workspace(inner, model, project),
            )
        }
        None => {
            let config = config::get();
            (
                format!(
                    "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                    config.gemini_base_url.trim_end_matches('/'),
                    model
                ),
                build_request(req, model, reasoning, false),
            )
        }
    };

    let response = state
        .http
        .post(&url)
        .bearer_auth(&token.access_token)
        .header("Accept", "text/event-stream")
        .header(
            "Client-Metadata",
            "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI",
        )
        .json(&payload)
        .send()
        .await?;
    Ok(response)
}

async fn respond(upstream: reqwest::Response, req: &MessagesRequest, model: &str) -> Response {
    if !upstream.status().is_success() {
        let status = upstream.status();
        let body = upstream.text().await.unwrap_or_default();
        tracing::warn!("gemini upstream rejected: {} {}", status, body);
        return error_json(
            axum::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
            "upstream_error",
            &format!("Gemini request failed: {} {}", status, body),
        );
    }

    if req.wants_stream() {
        sse_response(upstream, model, GeminiStreamHandler::default(), "Gemini")
    } else {
        match collect_message(upstream, model, GeminiStreamHandler::default()).await {
            Ok(message) => axum::Json(message).into_response(),
            Err(e) => error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("Gemini stream failed: {}", e),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn tool_round_trip_request() -> MessagesRequest {
        request(json!({
            "model": "gemini",
            "messages": [
                { "role": "user", "content": "look up X" },
                { "role": "assistant", "content": [
                    { "type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "X"} }
                ]},
                { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": "ok" }
                ]}
            ]
        }))
    }

    #[test]
    fn tool_round_trip_recovers_name_for_function_response() {
        let payload = build_request(&tool_round_trip_request(), "gemini-3-pro-preview", None, true);
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);

        let call_part = &contents[1]["parts"][0];
        assert_eq!(call_part["functionCall"]["name"], "search");
        assert_eq!(call_part["thoughtSignature"], DUMMY_THOUGHT_SIGNATURE);

        let response_part = &contents[2]["parts"][0];
        assert_eq!(response_part["functionResponse"]["name"], "search");
        assert_eq!(response_part["functionResponse"]["response"]["content"], "ok");
    }

    #[test]
    fn same_role_runs_merge_and_assistant_becomes_model() {
        let req = request(json!({
            "model": "m",
            "messages": [
                { "role": "user", "content": "a" },
                { "role": "user", "content": "b" },
                { "role": "assistant", "content": "c" }
            ]
        }));
        let payload = build_request(&req, "gemini-2.5-pro", None, false);
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn standard_mode_carries_system_instruction_natively() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "system": "be brief"
        }));
        let payload = build_request(&req, "gemini-2.5-flash", None, false);
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(payload["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn workspace_mode_splices_system_into_first_user_message() {
        let req = request(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "system": "be brief"
        }));
        let payload = build_request(&req, "gemini-3-pro-preview", None, true);
        assert!(payload.get("systemInstruction").is_none());
        let text = payload["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("[System Instructions]\nbe brief\n[End System Instructions]"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn thinking_levels_clamp_per_family() {
        let config = thinking_config("gemini-3-flash-preview", Some(ReasoningLevel::Medium));
        assert_eq!(config["thinkingLevel"], "MEDIUM");

        // the 3.x pro model accepts only LOW/HIGH
        let config = thinking_config("gemini-3-pro-preview", Some(ReasoningLevel::Medium));
        assert_eq!(config["thinkingLevel"], "HIGH");

        let config = thinking_config("gemini-3-pro-preview", Some(ReasoningLevel::XHigh));
        assert_eq!(config["thinkingLevel"], "HIGH");

        let config = thinking_config("gemini-2.5-pro", Some(ReasoningLevel::XHigh));
        assert_eq!(config["thinkingBudget"], 65536);
        let config = thinking_config("gemini-2.5-pro", Some(ReasoningLevel::Low));
        assert_eq!(config["thinkingBudget"], 1024);

        let config = thinking_config("gemini-2.5-pro", None);
        assert_eq!(config, json!({ "includeThoughts": true }));
    }

    #[test]
    fn tools_are_sanitized_and_google_search_appended() {
        let req = request(json!({
            "model": "m",
            "messages": [],
            "tools": [{
                "name": "lookup",
                "input_schema": {
                    "type": "object",
                    "properties": { "x": { "type": "string", "pattern": "." } },
                    "$schema": "http://example.com"
                }
            }]
        }));
        let payload = build_request(&req, "gemini-2.5-pro", None, false);
        let tools = payload["tools"].as_array().unwrap();
        let decl = &tools[0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "lookup");
        assert!(decl["parameters"].get("$schema").is_none());
        assert!(decl["parameters"]["properties"]["x"].get("pattern").is_none());
        assert!(tools.iter().any(|t| t.get("google_search").is_some()));
    }

    #[test]
    fn workspace_envelope_shape() {
        let wrapped = wrap_workspace(json!({"contents": []}), "gemini-3-pro-preview", "proj-1");
        assert_eq!(wrapped["model"], "gemini-3-pro-preview");
        assert_eq!(wrapped["project"], "proj-1");
        assert!(wrapped["user_prompt_id"].as_str().is_some());
        assert!(wrapped["request"].get("contents").is_some());
    }

    fn event(data: Value) -> SseEvent {
        SseEvent { event: None, data: data.to_string() }
    }

    #[test]
    fn stream_handler_splits_thoughts_and_buffers_calls() {
        let mut handler = GeminiStreamHandler::default();

        let deltas = handler.on_event(event(json!({
            "candidates": [{ "content": { "parts": [
                { "text": "pondering", "thought": true },
                { "text": "answer" }
            ]}}]
        })));
        assert!(matches!(&deltas[0], Delta::Thinking(t) if t == "pondering"));
        assert!(matches!(&deltas[1], Delta::Text(t) if t == "answer"));

        let deltas = handler.on_event(event(json!({
            "candidates": [{ "content": { "parts": [
                { "functionCall": { "name": "search", "args": { "q": "X" } } }
            ]}}]
        })));
        assert!(deltas.is_empty(), "tool calls buffer until stream end");

        let flushed = handler.flush();
        assert_eq!(flushed.len(), 1);
        match &flushed[0] {
            Delta::ToolUse { id, name, input } => {
                assert!(id.starts_with("toolu_"));
                assert_eq!(name, "search");
                assert_eq!(input, &json!({"q": "X"}));
            }
            other => panic!("unexpected delta: {:?}", other),
        }
    }

    #[test]
    fn stream_handler_unwraps_workspace_envelope() {
        let mut handler = GeminiStreamHandler::default();
        let deltas = handler.on_event(event(json!({
            "response": {
                "candidates": [{ "content": { "parts": [{ "text": "hi" }] } }],
                "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 5 }
            }
        })));
        assert!(matches!(deltas[0], Delta::InputTokens(3)));
        assert!(matches!(deltas[1], Delta::OutputTokens(5)));
        assert!(matches!(&deltas[2], Delta::Text(t) if t == "hi"));
    }
}
