// Protocol-A streaming: the SSE event encoder every adapter drives, the
// generic upstream SSE parser, and the relay loop between them.
//
// The encoder owns the event grammar:
//
//   message_start
//     ( content_block_start (content_block_delta)* content_block_stop )*
//   message_delta
//   message_stop
//
// message_start is emitted lazily on the first real delta so an error
// raised before any upstream output still surfaces as a single synthetic
// block instead of a broken half-stream.

use std::convert::Infallible;

use anyhow::{anyhow, Result};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

/// One upstream server-sent event: optional event name plus data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame parser. Feed raw bytes, get completed records.
/// Records are dispatched on the blank line per the SSE framing rules;
/// multiple data lines join with a newline.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);

            if line.is_empty() {
                if !self.data.is_empty() {
                    out.push(SseEvent {
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.event = None;
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.trim().to_string());
            }
            // comment and id fields are ignored
        }
        out
    }

    /// Flush a trailing record when the upstream closes without a final
    /// blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }
}

/// Canonical response increments produced by adapter event handlers.
#[derive(Debug, Clone)]
pub enum Delta {
    Thinking(String),
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    InputTokens(u64),
    OutputTokens(u64),
    Stop(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
        }
    }
}

/// Per-upstream event interpreter. The relay loop feeds it `(event, data)`
/// records and forwards the produced deltas to the encoder; `flush` runs
/// once the upstream stream ends (Gemini buffers tool calls until then).
pub trait UpstreamHandler: Send + 'static {
    fn on_event(&mut self, event: SseEvent) -> Vec<Delta>;
    fn flush(&mut self) -> Vec<Delta> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

const ERROR_TRUNCATE_CHARS: usize = 300;

pub struct StreamEncoder {
    message_id: String,
    model: String,
    started: bool,
    finished: bool,
    index: usize,
    open: Option<BlockKind>,
    saw_tool_use: bool,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<StopReason>,
}

impl StreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            started: false,
            finished: false,
            index: 0,
            open: None,
            saw_tool_use: false,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
        }
    }

    fn frame(name: &str, payload: Value) -> String {
        format!("event: {}\ndata: {}\n\n", name, payload)
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(Self::frame(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 }
                }
            }),
        ));
    }

    fn open_block(&mut self, kind: BlockKind, content_block: Value, out: &mut Vec<String>) {
        self.ensure_started(out);
        self.close_open(out);
        self.open = Some(kind);
        out.push(Self::frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.index,
                "content_block": content_block
            }),
        ));
    }

    fn close_open(&mut self, out: &mut Vec<String>) {
        if self.open.take().is_some() {
            out.push(Self::frame(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": self.index }),
            ));
            self.index += 1;
        }
    }

    fn delta_frame(&self, delta: Value) -> String {
        Self::frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.index,
                "delta": delta
            }),
        )
    }

    pub fn apply(&mut self, delta: Delta) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        match delta {
            Delta::Thinking(text) => {
                if text.is_empty() {
                    return out;
                }
                if self.open != Some(BlockKind::Thinking) {
                    self.open_block(
                        BlockKind::Thinking,
                        json!({ "type": "thinking", "thinking": "" }),
                        &mut out,
                    );
                }
                out.push(self.delta_frame(json!({ "type": "thinking_delta", "thinking": text })));
            }
            Delta::Text(text) => {
                if text.is_empty() {
                    return out;
                }
                // A thinking block in progress auto-closes before text opens.
                if self.open != Some(BlockKind::Text) {
                    self.open_block(
                        BlockKind::Text,
                        json!({ "type": "text", "text": "" }),
                        &mut out,
                    );
                }
                out.push(self.delta_frame(json!({ "type": "text_delta", "text": text })));
            }
            Delta::ToolUse { id, name, input } => {
                self.saw_tool_use = true;
                self.open_block(
                    BlockKind::ToolUse,
                    json!({ "type": "tool_use", "id": id, "name": name, "input": {} }),
                    &mut out,
                );
                out.push(self.delta_frame(json!({
                    "type": "input_json_delta",
                    "partial_json": input.to_string()
                })));
                self.close_open(&mut out);
            }
            Delta::InputTokens(n) => self.input_tokens = n,
            Delta::OutputTokens(n) => self.output_tokens = n,
            Delta::Stop(reason) => self.stop_reason = Some(reason),
        }
        out
    }

    /// Emit a complete synthetic error message and terminate the grammar.
    pub fn error(&mut self, provider_label: &str, message: &str) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let truncated: String = message.chars().take(ERROR_TRUNCATE_CHARS).collect();
        let text = format!("[{} Error] {}", provider_label, truncated);
        let mut out = self.apply(Delta::Text(text));
        out.extend(self.terminate(StopReason::EndTurn));
        out
    }

    /// Close any open block and terminate the stream in grammar order.
    pub fn finish(&mut self) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        let reason = match self.stop_reason {
            Some(StopReason::MaxTokens) => StopReason::MaxTokens,
            _ if self.saw_tool_use => StopReason::ToolUse,
            Some(reason) => reason,
            None => StopReason::EndTurn,
        };
        self.terminate(reason)
    }

    fn terminate(&mut self, reason: StopReason) -> Vec<String> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open(&mut out);
        out.push(Self::frame(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": reason.as_str(), "stop_sequence": null },
                "usage": { "output_tokens": self.output_tokens }
            }),
        ));
        out.push(Self::frame("message_stop", json!({ "type": "message_stop" })));
        self.finished = true;
        out
    }
}

/// Fold deltas into a complete non-streaming Protocol-A message.
#[derive(Default)]
pub struct CollectedMessage {
    thinking: String,
    text: String,
    tools: Vec<(String, String, Value)>,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<StopReason>,
}

impl CollectedMessage {
    pub fn push(&mut self, delta: Delta) {
        match delta {
            Delta::Thinking(t) => self.thinking.push_str(&t),
            Delta::Text(t) => self.text.push_str(&t),
            Delta::ToolUse { id, name, input } => self.tools.push((id, name, input)),
            Delta::InputTokens(n) => self.input_tokens = n,
            Delta::OutputTokens(n) => self.output_tokens = n,
            Delta::Stop(reason) => self.stop_reason = Some(reason),
        }
    }

    pub fn into_value(self, model: &str) -> Value {
        let mut content = Vec::new();
        if !self.thinking.is_empty() {
            content.push(json!({ "type": "thinking", "thinking": self.thinking }));
        }
        if !self.text.is_empty() {
            content.push(json!({ "type": "text", "text": self.text }));
        }
        for (id, name, input) in &self.tools {
            content.push(json!({ "type": "tool_use", "id": id, "name": name, "input": input }));
        }
        let stop_reason = match self.stop_reason {
            Some(StopReason::MaxTokens) => StopReason::MaxTokens,
            _ if !self.tools.is_empty() => StopReason::ToolUse,
            Some(reason) => reason,
            None => StopReason::EndTurn,
        };
        json!({
            "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
            "type": "message",
            "role": "assistant",
            "content": content,
            "model": model,
            "stop_reason": stop_reason.as_str(),
            "stop_sequence": null,
            "usage": {
                "input_tokens": self.input_tokens,
                "output_tokens": self.output_tokens
            }
        })
    }
}

/// Relay an upstream SSE body to the downstream as Protocol-A events.
/// Upstream read failures mid-stream become a synthetic error block; the
/// grammar is always terminated.
pub fn sse_response<H: UpstreamHandler>(
    upstream: reqwest::Response,
    model: &str,
    handler: H,
    provider_label: &str,
) -> Response {
    let encoder = StreamEncoder::new(model);
    let label = provider_label.to_string();

    let stream = async_stream::stream! {
        let mut parser = SseParser::new();
        let mut encoder = encoder;
        let mut handler = handler;
        let mut body = upstream.bytes_stream();
        let mut failed = false;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in parser.feed(&bytes) {
                        if event.data == "[DONE]" {
                            continue;
                        }
                        for delta in handler.on_event(event) {
                            for frame in encoder.apply(delta) {
                                yield Ok::<_, Infallible>(Bytes::from(frame));
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("{} stream read failed: {}", label, e);
                    for frame in encoder.error(&label, &e.to_string()) {
                        yield Ok(Bytes::from(frame));
                    }
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            if let Some(event) = parser.finish() {
                if event.data != "[DONE]" {
                    for delta in handler.on_event(event) {
                        for frame in encoder.apply(delta) {
                            yield Ok(Bytes::from(frame));
                        }
                    }
                }
            }
            for delta in handler.flush() {
                for frame in encoder.apply(delta) {
                    yield Ok(Bytes::from(frame));
                }
            }
            for frame in encoder.finish() {
                yield Ok(Bytes::from(frame));
            }
        }
    };

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("failed to build stream response: {}", e);
            Response::new(Body::empty())
        }
    }
}

/// Consume the whole upstream stream and build one Protocol-A message.
pub async fn collect_message<H: UpstreamHandler>(
    upstream: reqwest::Response,
    model: &str,
    mut handler: H,
) -> Result<Value> {
    let mut parser = SseParser::new();
    let mut collected = CollectedMessage::default();
    let mut body = upstream.bytes_stream();

    while let Some(chunk) = body.next().await {
        let bytes = chunk.map_err(|e| anyhow!("upstream read failed: {}", e))?;
        for event in parser.feed(&bytes) {
            if event.data == "[DONE]" {
                continue;
            }
            for delta in handler.on_event(event) {
                collected.push(delta);
            }
        }
    }
    if let Some(event) = parser.finish() {
        if event.data != "[DONE]" {
            for delta in handler.on_event(event) {
                collected.push(delta);
            }
        }
    }
    for delta in handler.flush() {
        collected.push(delta);
    }
    Ok(collected.into_value(model))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_to_events(frames: &[String]) -> Vec<(String, Value)> {
        frames
            .iter()
            .map(|frame| {
                let mut lines = frame.lines();
                let event = lines
                    .next()
                    .unwrap()
                    .strip_prefix("event: ")
                    .unwrap()
                    .to_string();
                let data: Value = serde_json::from_str(
                    lines.next().unwrap().strip_prefix("data: ").unwrap(),
                )
                .unwrap();
                (event, data)
            })
            .collect()
    }

    /// Parse an emitted stream and assert grammar: message_start first,
    /// balanced block open/close, monotonically increasing indices, and a
    /// message_delta/message_stop tail.
    fn assert_grammar(frames: &[String]) {
        let events = frames_to_events(frames);
        assert_eq!(events.first().unwrap().0, "message_start");
        assert_eq!(events[events.len() - 2].0, "message_delta");
        assert_eq!(events.last().unwrap().0, "message_stop");

        let mut open: Option<i64> = None;
        let mut next_index = 0i64;
        for (name, data) in &events {
            match name.as_str() {
                "content_block_start" => {
                    assert!(open.is_none(), "block opened while another is open");
                    let index = data["index"].as_i64().unwrap();
                    assert_eq!(index, next_index, "indices must be monotonic");
                    open = Some(index);
                }
                "content_block_delta" => {
                    assert_eq!(Some(data["index"].as_i64().unwrap()), open);
                }
                "content_block_stop" => {
                    assert_eq!(Some(data["index"].as_i64().unwrap()), open.take());
                    next_index += 1;
                }
                _ => {}
            }
        }
        assert!(open.is_none(), "unclosed block at message end");
    }

    #[test]
    fn sse_parser_splits_event_and_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: response.output_text.delta\ndata: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].event.as_deref(),
            Some("response.output_text.delta")
        );
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].event, None);
        assert_eq!(events[1].data, "[DONE]");
    }

    #[test]
    fn sse_parser_handles_split_chunks_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"par").is_empty());
        let events = parser.feed(b"tial\":true}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"partial\":true}");
    }

    #[test]
    fn thinking_then_text_auto_closes() {
        let mut encoder = StreamEncoder::new("test-model");
        let mut frames = Vec::new();
        frames.extend(encoder.apply(Delta::Thinking("let me think".into())));
        frames.extend(encoder.apply(Delta::Text("answer".into())));
        frames.extend(encoder.finish());
        assert_grammar(&frames);

        let events = frames_to_events(&frames);
        let kinds: Vec<&str> = events
            .iter()
            .filter(|(name, _)| name == "content_block_start")
            .map(|(_, data)| data["content_block"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["thinking", "text"]);
    }

    #[test]
    fn tool_use_blocks_take_their_own_index() {
        let mut encoder = StreamEncoder::new("test-model");
        let mut frames = Vec::new();
        frames.extend(encoder.apply(Delta::Text("calling".into())));
        frames.extend(encoder.apply(Delta::ToolUse {
            id: "toolu_1".into(),
            name: "search".into(),
            input: json!({"q": "X"}),
        }));
        frames.extend(encoder.apply(Delta::ToolUse {
            id: "toolu_2".into(),
            name: "read".into(),
            input: json!({}),
        }));
        frames.extend(encoder.finish());
        assert_grammar(&frames);

        let events = frames_to_events(&frames);
        let (_, delta) = events.last().unwrap();
        assert_eq!(delta["type"], "message_stop");
        let message_delta = &events[events.len() - 2].1;
        assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");

        // input_json_delta payloads accumulate to valid JSON per block
        let jsons: Vec<Value> = events
            .iter()
            .filter(|(name, data)| {
                name == "content_block_delta" && data["delta"]["type"] == "input_json_delta"
            })
            .map(|(_, data)| {
                serde_json::from_str(data["delta"]["partial_json"].as_str().unwrap()).unwrap()
            })
            .collect();
        assert_eq!(jsons, vec![json!({"q": "X"}), json!({})]);
    }

    #[test]
    fn error_before_output_is_a_single_block_message() {
        let mut encoder = StreamEncoder::new("test-model");
        let frames = encoder.error("Gemini", "upstream exploded");
        assert_grammar(&frames);
        let events = frames_to_events(&frames);
        let text = events
            .iter()
            .find(|(name, data)| {
                name == "content_block_delta" && data["delta"]["type"] == "text_delta"
            })
            .map(|(_, data)| data["delta"]["text"].as_str().unwrap().to_string())
            .unwrap();
        assert!(text.starts_with("[Gemini Error] upstream exploded"));
    }

    #[test]
    fn mid_stream_error_closes_open_block_first() {
        let mut encoder = StreamEncoder::new("test-model");
        let mut frames = Vec::new();
        frames.extend(encoder.apply(Delta::Text("partial ".into())));
        frames.extend(encoder.apply(Delta::Text("output".into())));
        frames.extend(encoder.error("Codex", &"x".repeat(500)));
        assert_grammar(&frames);

        let events = frames_to_events(&frames);
        let error_text = events
            .iter()
            .rev()
            .find(|(name, data)| {
                name == "content_block_delta" && data["delta"]["type"] == "text_delta"
            })
            .map(|(_, data)| data["delta"]["text"].as_str().unwrap().to_string())
            .unwrap();
        // "[Codex Error] " plus the message truncated to 300 chars
        assert_eq!(error_text.len(), "[Codex Error] ".len() + 300);
    }

    #[test]
    fn empty_stream_still_terminates_grammar() {
        let mut encoder = StreamEncoder::new("test-model");
        let frames = encoder.finish();
        assert_grammar(&frames);
    }

    #[test]
    fn collected_message_orders_blocks() {
        let mut collected = CollectedMessage::default();
        collected.push(Delta::Thinking("hmm".into()));
        collected.push(Delta::Text("hi".into()));
        collected.push(Delta::ToolUse {
            id: "toolu_9".into(),
            name: "search".into(),
            input: json!({"q": 1}),
        });
        collected.push(Delta::InputTokens(10));
        collected.push(Delta::OutputTokens(20));
        let message = collected.into_value("m");
        assert_eq!(message["content"][0]["type"], "thinking");
        assert_eq!(message["content"][1]["type"], "text");
        assert_eq!(message["content"][2]["type"], "tool_use");
        assert_eq!(message["stop_reason"], "tool_use");
        assert_eq!(message["usage"]["input_tokens"], 10);
        assert_eq!(message["usage"]["output_tokens"], 20);
    }
}
