// OpenRouter adapter: OpenAI-compatible Chat Completions with the
// OpenRouter attribution headers. Streaming reuses the shared chat handler,
// which already captures delta.reasoning as thinking.

use axum::response::{IntoResponse, Response};

use crate::api::claude::MessagesRequest;
use crate::api::codex::{build_chat_request, ChatStreamHandler};
use crate::api::error_json;
use crate::api::model_router::ReasoningLevel;
use crate::api::streaming::{collect_message, sse_response};
use crate::config;

pub async fn dispatch(
    http: &reqwest::Client,
    req: &MessagesRequest,
    model: &str,
    reasoning: Option<ReasoningLevel>,
    api_key: &str,
) -> Response {
    let config = config::get();
    let payload = build_chat_request(req, model, reasoning);
    let url = format!(
        "{}/chat/completions",
        config.openrouter_base_url.trim_end_matches('/')
    );

    let mut request = http
        .post(&url)
        .bearer_auth(api_key)
        .header("Accept", "text/event-stream")
        .json(&payload);
    if let Some(referer) = &config.openrouter_referer {
        request = request.header("HTTP-Referer", referer.as_str());
    }
    if let Some(title) = &config.openrouter_title {
        request = request.header("X-Title", title.as_str());
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("OpenRouter request failed: {}", e),
            )
        }
    };
    if !upstream.status().is_success() {
        let status = upstream.status();
        let body = upstream.text().await.unwrap_or_default();
        tracing::warn!("openrouter upstream rejected: {} {}", status, body);
        return error_json(
            axum::http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
            "upstream_error",
            &format!("OpenRouter request failed: {} {}", status, body),
        );
    }

    if req.wants_stream() {
        sse_response(upstream, model, ChatStreamHandler::default(), "OpenRouter")
    } else {
        match collect_message(upstream, model, ChatStreamHandler::default()).await {
            Ok(message) => axum::Json(message).into_response(),
            Err(e) => error_json(
                axum::http::StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("OpenRouter stream failed: {}", e),
            ),
        }
    }
}
