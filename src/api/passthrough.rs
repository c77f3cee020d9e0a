// Passthrough adapter for upstreams that already speak the Messages
// protocol: rewrite the model, force streaming, and copy bytes through.
// Response headers are flushed only after the upstream accepts, so an
// upstream auth failure still surfaces as a JSON error.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::api::error_json;

pub async fn dispatch_anthropic(
    http: &reqwest::Client,
    mut body: Value,
    model: &str,
    base_url: &str,
    api_key: &str,
    version: &str,
) -> Response {
    body["model"] = json!(model);
    body["stream"] = json!(true);
    let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));

    let upstream = http
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", version)
        .header("Accept", "text/event-stream")
        .json(&body)
        .send()
        .await;
    relay("Anthropic", upstream).await
}

pub async fn dispatch_glm(
    http: &reqwest::Client,
    mut body: Value,
    model: &str,
    base_url: &str,
    api_key: &str,
) -> Response {
    body["model"] = json!(model);
    body["stream"] = json!(true);
    let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));

    let upstream = http
        .post(&url)
        .bearer_auth(api_key)
        .header("Accept", "text/event-stream")
        .json(&body)
        .send()
        .await;
    relay("GLM", upstream).await
}

async fn relay(
    label: &'static str,
    upstream: Result<reqwest::Response, reqwest::Error>,
) -> Response {
    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            return error_json(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &format!("{} request failed: {}", label, e),
            )
        }
    };

    if !upstream.status().is_success() {
        let status = upstream.status();
        let body = upstream.text().await.unwrap_or_default();
        tracing::warn!("{} passthrough rejected: {} {}", label, status, body);
        return error_json(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            "upstream_error",
            &format!("{} request failed: {} {}", label, status, body),
        );
    }

    let stream = upstream.bytes_stream().filter_map(move |chunk| async move {
        match chunk {
            Ok(bytes) => Some(Ok::<_, std::convert::Infallible>(bytes)),
            Err(e) => {
                tracing::warn!("{} passthrough read failed: {}", label, e);
                None
            }
        }
    });

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("failed to build passthrough response: {}", e);
            Response::new(Body::empty())
        }
    }
}
