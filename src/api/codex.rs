// Codex adapter. OAuth mode talks to the ChatGPT-backed Responses API;
// API-key mode falls back to plain OpenAI Chat Completions. The chat-stream
// handler here is shared with the OpenRouter adapter.

use std::collections::{BTreeMap, HashMap};

use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::api::claude::{tool_result_text, ContentBlock, MessagesRequest};
use crate::api::error_json;
use crate::api::model_router::ReasoningLevel;
use crate::api::streaming::{collect_message, sse_response, Delta, SseEvent, StopReason, UpstreamHandler};
use crate::api::AppState;
use crate::auth::{ensure_fresh, OauthProviderKind, TokenRecord};
use crate::config;

const CODEX_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const CODEX_USER_AGENT: &str = "codex_cli_rs/0.50.0 (Mac OS 26.0.1; arm64) Apple_Terminal/464";

/// Translate the canonical request into the Responses API body. Messages
/// become a flat item sequence; each tool_use / tool_result becomes its own
/// function_call / function_call_output item carrying the Protocol-A id as
/// call_id. `store: false` is required by the ChatGPT backend.
pub fn build_responses_request(
    req: &MessagesRequest,
    model: &str,
    effort: ReasoningLevel,
    stream: bool,
) -> Value {
    let mut input: Vec<Value> = Vec::new();

    for message in &req.messages {
        let role = message.role.as_str();
        let mut parts: Vec<Value> = Vec::new();

        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    let part_type = if role == "assistant" { "output_text" } else { "input_text" };
                    parts.push(json!({ "type": part_type, "text": text }));
                }
                ContentBlock::Image { source } => {
                    if let Some(url) = source.as_url() {
                        parts.push(json!({ "type": "input_image", "image_url": url }));
                    }
                }
                ContentBlock::ToolUse { id, name, input: args } => {
                    flush_message_item(role, &mut parts, &mut input);
                    input.push(json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": args.to_string()
                    }));
                }
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    flush_message_item(role, &mut parts, &mut input);
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": tool_use_id,
                        "output": tool_result_text(&content)
                    }));
                }
                ContentBlock::Thinking { .. } => {}
            }
        }
        flush_message_item(role, &mut parts, &mut input);
    }

    let mut tools: Vec<Value> = req
        .tools
        .iter()
        .flatten()
        .map(|tool| {
            let mut entry = json!({
                "type": "function",
                "name": tool.name,
                "parameters": tool.input_schema
            });
            if let Some(description) = &tool.description {
                entry["description"] = json!(description);
            }
            entry
        })
        .collect();
    tools.push(json!({ "type": "web_search" }));

    json!({
        "model": model,
        "instructions": req.system_text().unwrap_or_default(),
        "input": input,
        "tools": tools,
        "tool_choice": "auto",
        "parallel_tool_calls": true,
        "reasoning": { "effort": effort.as_str(), "summary": "auto" },
        "store": false,
        "stream": stream
    })
}

fn flush_message_item(role: &str, parts: &mut Vec<Value>, input: &mut Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    let content: Vec<Value> = parts.drain(..).collect();
    input.push(json!({ "type": "message", "role": role, "content": content }));
}

/// Translate the canonical request into the Chat Completions body used by
/// the API-key mode and by OpenRouter.
pub fn build_chat_request(
    req: &MessagesRequest,
    model: &str,
    effort: Option<ReasoningLevel>,
) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = req.system_text() {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for message in &req.messages {
        let role = message.role.as_str();
        let mut parts: Vec<Value> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();

        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text } => {
                    parts.push(json!({ "type": "text", "text": text }));
                }
                ContentBlock::Image { source } => {
                    if let Some(url) = source.as_url() {
                        parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
                    }
                }
                ContentBlock::ToolUse { id, name, input: args } => {
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": args.to_string() }
                    }));
                }
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": tool_result_text(&content)
                    }));
                }
                ContentBlock::Thinking { .. } => {}
            }
        }

        if parts.is_empty() && tool_calls.is_empty() {
            continue;
        }
        let mut entry = json!({ "role": role });
        if !parts.is_empty() {
            // a single text part collapses to the plain-string form
            if parts.len() == 1 && parts[0]["type"] == "text" {
                entry["content"] = parts[0]["text"].clone();
            } else {
                entry["content"] = json!(parts);
            }
        }
        if !tool_calls.is_empty() {
            entry["tool_calls"] = json!(tool_calls);
        }
        messages.push(entry);
    }

    let mut payload = json!({
        "model": model,
        "messages": messages,
        "stream": true
    });
    if let Some(max_tokens) = req.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = req.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(effort) = effort {
        payload["reasoning_effort"] = json!(effort.as_str());
    }
    if let Some(tools) = &req.tools {
        if !tools.is_empty() {
            let entries: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    let mut function = json!({
                        "name": tool.name,
                        "parameters": tool.input_schema
                    });
                    if let Some(description) = &tool.description {
                        function["description"] = json!(description);
                    }
                    json!({ "type": "function", "function": function })
                })
                .collect();
            payload["tools"] = json!(entries);
        }
    }
    payload
}

#[derive(Default)]
struct PendingCall {
    call_id: String,
    name: String,
    arguments: String,
}

/// Event handler for the typed `response.*` stream of the Responses API.
/// Function-call arguments accumulate under their output_index until the
/// item is done.
#[derive(Default)]
pub struct ResponsesHandler {
    pending: HashMap<u64, PendingCall>,
}

impl UpstreamHandler for ResponsesHandler {
    fn on_event(&mut self, event: SseEvent) -> Vec<Delta> {
        let parsed: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        let kind = parsed
            .get("type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or(event.event)
            .unwrap_or_default();

        match kind.as_str() {
            "response.reasoning_summary_text.delta" => {
                match parsed.get("delta").and_then(|v| v.as_str()) {
                    Some(delta) => vec![Delta::Thinking(delta.to_string())],
                    None => Vec::new(),
                }
            }
            "response.output_text.delta" => {
                match parsed.get("delta").and_then(|v| v.as_str()) {
                    Some(delta) => vec![Delta::Text(delta.to_string())],
                    None => Vec::new(),
                }
            }
            "response.output_item.added" => {
                if let Some(item) = parsed.get("item") {
                    match item.get("type").and_then(|v| v.as_str()) {
                        Some("function_call") => {
                            let index = parsed
                                .get("output_index")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(0);
                            self.pending.insert(
                                index,
                                PendingCall {
                                    call_id: item
                                        .get("call_id")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string(),
                                    name: item
                                        .get("name")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string(),
                                    arguments: String::new(),
                                },
                            );
                        }
                        Some("web_search_call") => {
                            tracing::debug!("codex started a web_search call");
                        }
                        _ => {}
                    }
                }
                Vec::new()
            }
            "response.function_call_arguments.delta" => {
                let index = parsed
                    .get("output_index")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if let Some(delta) = parsed.get("delta").and_then(|v| v.as_str()) {
                    self.pending.entry(index).or_default().arguments.push_str(delta);
                }
                Vec::new()
            }
            "response.output_item.done" => {
                let item = match parsed.get("item") {
                    Some(item) if item.get("type").and_then(|v| v.as_str()) == Some("function_call") => item,
                    _ => return Vec::new(),
                };
                let index = parsed
                    .get("output_index")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let pending = self.pending.remove(&index).unwrap_or_default();

                let call_id = item
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(&pending.call_id)
                    .to_string();
                let name = item
                    .get("name")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(&pending.name)
                    .to_string();
                let raw_args = item
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(&pending.arguments);
                let input = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));

                vec![Delta::ToolUse { id: call_id, name, input }]
            }
            "response.completed" => {
                let mut deltas = Vec::new();
                if let Some(response) = parsed.get("response") {
                    if let Some(usage) = response.get("usage") {
                        if let Some(n) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
                            deltas.push(Delta::InputTokens(n));
                        }
                        if let Some(n) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
                            deltas.push(Delta::OutputTokens(n));
                        }
                    }
                    if response.get("status").and_then(|v| v.as_str()) == Some("incomplete") {
                        deltas.push(Delta::Stop(StopReason::MaxTokens));
                    }
                }
                deltas
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Default)]
struct ChatToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Event handler for OpenAI-style Chat Completions deltas; used for the
/// API-key mode and OpenRouter. Tool calls assemble by delta index and
/// flush once the stream ends.
#[derive(Default)]
pub struct ChatStreamHandler {
    calls: BTreeMap<u64, ChatToolCall>,
}

impl UpstreamHandler for ChatStreamHandler {
    fn on_event(&mut self, event: SseEvent) -> Vec<Delta> {
        let parsed: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        let mut deltas = Vec::new();

        if let Some(usage) = parsed.get("usage") {
            if let Some(n) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                deltas.push(Delta::InputTokens(n));
            }
            if let Some(n) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                deltas.push(Delta::OutputTokens(n));
            }
        }

        let choice = match parsed.get("choices").and_then(|v| v.get(0)) {
            Some(choice) => choice,
            None => return deltas,
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta
                .get("reasoning")
                .or_else(|| delta.get("reasoning_content"))
                .and_then(|v| v.as_str())
            {
                if !text.is_empty() {
                    deltas.push(Delta::Thinking(text.to_string()));
                }
            }
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    deltas.push(Delta::Text(text.to_string()));
                }
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    let entry = self.calls.entry(index).or_default();
                    if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                        entry.id = id.to_string();
                    }
                    if let Some(function) = tc.get("function") {
                        if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                            entry.name.push_str(name);
                        }
                        if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                            entry.arguments.push_str(args);
                        }
                    }
                }
            }
        }

        if choice.get("finish_reason").and_then(|v| v.as_str()) == Some("length") {
            deltas.push(Delta::Stop(StopReason::MaxTokens));
        }
        deltas
    }

    fn flush(&mut self) -> Vec<Delta> {
        let calls = std::mem::take(&mut self.calls);
        calls
            .into_values()
            .map(|call| {
                let id = if call.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    call.id
                };
                let input = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                Delta::ToolUse { id, name: call.name, input }
            })
            .collect()
    }
}

/// OAuth mode: POST the Responses endpoint with the ChatGPT backend
/// headers. On a rate-limit response from the primary account the dispatch
/// retries once with the secondary slot.
pub async fn dispatch_oauth(
    state: &AppState,
    req: &MessagesRequest,
    model: &str,
    effort: ReasoningLevel,
    token: &TokenRecord,
) -> Response {
    let payload = build_responses_request(req, model, effort, true);

    let upstream = match send_oauth(&state.http, &payload, token).await {
        Ok(response) => response,
        Err(e) => {
            return error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("Codex request failed: {}", e),
            )
        }
    };

    let upstream = if upstream.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        match ensure_fresh(&state.tokens, &state.short_http, OauthProviderKind::Codex, 2).await {
            Ok(secondary) => {
                tracing::warn!("codex primary account throttled, failing over to slot 2");
                match send_oauth(&state.http, &payload, &secondary).await {
                    Ok(response) => response,
                    Err(e) => {
                        return error_json(
                            axum::http::StatusCode::BAD_GATEWAY,
                            "upstream_error",
                            &format!("Codex request failed: {}", e),
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
    http: &reqwest::Client,
    payload: &Value,
    token: &TokenRecord,
) -> anyhow::Result<reqwest::Response> {
    let url = format!("{}/responses", CODEX_BASE_URL);
    let mut request = http
        .post(&url)
        .bearer_auth(&token.access_token)
        .header("OpenAI-Beta", "responses=experimental")
        .header("originator", "codex_cli_rs")
        .header("User-Agent", CODEX_USER_AGENT)
        .header("session_id", uuid::Uuid::new_v4().to_string())
        .header("Accept", "text/event-stream")
        .json(payload);
    if let Some(account_id) = &token.account_id {
        request = request.header("chatgpt-account-id", account_id.as_str());
    }
    Ok(request.send().await?)
}

async fn respond(upstream: reqwest::Response, req: &MessagesRequest, model: &str) -> Response {
    if !upstream.status().is_success() {
        let status = upstream.status();
        let body = upstream.text().await.unwrap_or_default();
        tracing::warn!("codex upstream rejected: {} {}", status, body);
        return error_json(
            axum::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
            "upstream_error",
            &format!("Codex request failed: {} {}", status, body),
        );
    }

    if req.wants_stream() {
        sse_response(upstream, model, ResponsesHandler::default(), "Codex")
    } else {
        match collect_message(upstream, model, ResponsesHandler::default()).await {
            Ok(message) => axum::Json(message).into_response(),
            Err(e) => error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("Codex stream failed: {}", e),
            ),
        }
    }
}

/// API-key mode: plain Chat Completions against OPENAI_BASE_URL.
pub async fn dispatch_api_key(
    http: &reqwest::Client,
    req: &MessagesRequest,
    model: &str,
    effort: Option<ReasoningLevel>,
    api_key: &str,
) -> Response {
    let config = config::get();
    let payload = build_chat_request(req, model, effort);
    let url = format!(
        "{}/chat/completions",
        config.openai_base_url.trim_end_matches('/')
    );

    let upstream = match http
        .post(&url)
        .bearer_auth(api_key)
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
                &format!("OpenAI request failed: {}", e),
            )
        }
    };
    if !upstream.status().is_success() {
        let status = upstream.status();
        let body = upstream.text().await.unwrap_or_default();
        return error_json(
            axum::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
            "upstream_error",
            &format!("OpenAI request failed: {} {}", status, body),
        );
    }

    if req.wants_stream() {
        sse_response(upstream, model, ChatStreamHandler::default(), "OpenAI")
    } else {
        match collect_message(upstream, model, ChatStreamHandler::default()).await {
            Ok(message) => axum::Json(message).into_response(),
            Err(e) => error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("OpenAI stream failed: {}", e),
            ),
        }
    }
}
