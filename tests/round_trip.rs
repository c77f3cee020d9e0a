// Round-trip laws: translating a request down to an upstream body, replaying
// an idealized upstream echo of that body, and decoding the events back up
// must reproduce the input text and tool calls exactly.

use claude_proxy::api::claude::MessagesRequest;
use claude_proxy::api::codex::{
    build_chat_request, build_responses_request, ChatStreamHandler, ResponsesHandler,
};
use claude_proxy::api::gemini::{build_request, GeminiStreamHandler};
use claude_proxy::api::model_router::ReasoningLevel;
use claude_proxy::api::streaming::{
    CollectedMessage, Delta, SseEvent, SseParser, StreamEncoder, UpstreamHandler,
};
use serde_json::{json, Value};

const ASSISTANT_TEXT: &str = "Let me check that for you.";

fn request_with_tool_history() -> MessagesRequest {
    serde_json::from_value(json!({
        "model": "test",
        "messages": [
            { "role": "user", "content": "look up X" },
            { "role": "assistant", "content": [
                { "type": "text", "text": ASSISTANT_TEXT },
                { "type": "tool_use", "id": "toolu_1", "name": "search", "input": { "q": "X" } }
            ]},
            { "role": "user", "content": [
                { "type": "tool_result", "tool_use_id": "toolu_1", "content": "ok" }
            ]}
        ]
    }))
    .unwrap()
}

fn event(data: Value) -> SseEvent {
    SseEvent {
        event: None,
        data: data.to_string(),
    }
}

fn collect<H: UpstreamHandler>(mut handler: H, events: Vec<SseEvent>) -> Value {
    let mut collected = CollectedMessage::default();
    for e in events {
        for delta in handler.on_event(e) {
            collected.push(delta);
        }
    }
    for delta in handler.flush() {
        collected.push(delta);
    }
    collected.into_value("test")
}

#[test]
fn responses_api_round_trip_preserves_text_and_tool_calls() {
    let req = request_with_tool_history();
    let body = build_responses_request(&req, "gpt-5.3-codex", ReasoningLevel::High, true);

    // idealized upstream: echo the assistant items from the request body
    let input = body["input"].as_array().unwrap();
    let assistant_text = input
        .iter()
        .find(|i| i["type"] == "message" && i["role"] == "assistant")
        .and_then(|i| i["content"][0]["text"].as_str())
        .unwrap();
    let call = input.iter().find(|i| i["type"] == "function_call").unwrap();

    let mut events = Vec::new();
    // text streamed in two chunks
    let (head, tail) = assistant_text.split_at(assistant_text.len() / 2);
    events.push(event(json!({ "type": "response.output_text.delta", "delta": head })));
    events.push(event(json!({ "type": "response.output_text.delta", "delta": tail })));
    events.push(event(json!({
        "type": "response.output_item.added",
        "output_index": 1,
        "item": { "type": "function_call", "call_id": call["call_id"], "name": call["name"] }
    })));
    events.push(event(json!({
        "type": "response.function_call_arguments.delta",
        "output_index": 1,
        "delta": call["arguments"]
    })));
    events.push(event(json!({
        "type": "response.output_item.done",
        "output_index": 1,
        "item": { "type": "function_call", "call_id": call["call_id"], "name": call["name"] }
    })));

    let message = collect(ResponsesHandler::default(), events);
    assert_eq!(message["content"][0]["text"], ASSISTANT_TEXT);
    assert_eq!(message["content"][1]["type"], "tool_use");
    assert_eq!(message["content"][1]["id"], "toolu_1");
    assert_eq!(message["content"][1]["name"], "search");
    assert_eq!(message["content"][1]["input"], json!({ "q": "X" }));
    assert_eq!(message["stop_reason"], "tool_use");
}

#[test]
fn chat_completions_round_trip_preserves_text_and_tool_calls() {
    let req = request_with_tool_history();
    let body = build_chat_request(&req, "gpt-5.2", None);

    let assistant = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "assistant")
        .unwrap()
        .clone();
    let tool_call = &assistant["tool_calls"][0];

    let events = vec![
        event(json!({ "choices": [{ "delta": { "role": "assistant", "content": assistant["content"] } }] })),
        event(json!({ "choices": [{ "delta": { "tool_calls": [{
            "index": 0,
            "id": tool_call["id"],
            "function": {
                "name": tool_call["function"]["name"],
                "arguments": tool_call["function"]["arguments"]
            }
        }] } }] })),
        event(json!({ "choices": [{ "delta": {}, "finish_reason": "tool_calls" }] })),
    ];

    let message = collect(ChatStreamHandler::default(), events);
    assert_eq!(message["content"][0]["text"], ASSISTANT_TEXT);
    assert_eq!(message["content"][1]["id"], "toolu_1");
    assert_eq!(message["content"][1]["name"], "search");
    assert_eq!(message["content"][1]["input"], json!({ "q": "X" }));
}

#[test]
fn gemini_round_trip_preserves_text_and_tool_calls() {
    let req = request_with_tool_history();
    let body = build_request(&req, "gemini-3-pro-preview", None, false);

    let model_turn = body["contents"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["role"] == "model")
        .unwrap()
        .clone();
    let text = model_turn["parts"][0]["text"].clone();
    let call = model_turn["parts"][1]["functionCall"].clone();

    let events = vec![
        event(json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })),
        event(json!({ "candidates": [{ "content": { "parts": [{ "functionCall": call }] } }] })),
    ];

    let message = collect(GeminiStreamHandler::default(), events);
    assert_eq!(message["content"][0]["text"], ASSISTANT_TEXT);
    assert_eq!(message["content"][1]["name"], "search");
    assert_eq!(message["content"][1]["input"], json!({ "q": "X" }));
    assert_eq!(message["stop_reason"], "tool_use");
}

/// The full streaming path: adapter deltas driven through the encoder must
/// emit a byte stream that parses back as SSE and satisfies the grammar.
#[test]
fn encoded_stream_parses_back_in_grammar_order() {
    let mut encoder = StreamEncoder::new("gemini-3-pro-preview");
    let mut handler = GeminiStreamHandler::default();

    let mut frames: Vec<String> = Vec::new();
    let upstream_events = vec![
        event(json!({ "candidates": [{ "content": { "parts": [
            { "text": "planning", "thought": true }
        ] } }] })),
        event(json!({ "candidates": [{ "content": { "parts": [{ "text": "done. " }] } }] })),
        event(json!({ "candidates": [{ "content": { "parts": [
            { "functionCall": { "name": "search", "args": { "q": "X" } } }
        ] } }] })),
    ];
    for e in upstream_events {
        for delta in handler.on_event(e) {
            frames.extend(encoder.apply(delta));
        }
    }
    for delta in handler.flush() {
        frames.extend(encoder.apply(delta));
    }
    frames.extend(encoder.finish());

    // re-parse the emitted bytes with the generic SSE parser
    let mut parser = SseParser::new();
    let mut parsed = Vec::new();
    for frame in &frames {
        parsed.extend(parser.feed(frame.as_bytes()));
    }
    assert!(parser.finish().is_none(), "encoder must emit complete frames");

    let names: Vec<String> = parsed.iter().map(|e| e.event.clone().unwrap()).collect();
    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));

    let mut open_index: Option<i64> = None;
    let mut next_index = 0i64;
    let mut kinds = Vec::new();
    for record in &parsed {
        let data: Value = serde_json::from_str(&record.data).unwrap();
        match record.event.as_deref().unwrap() {
            "content_block_start" => {
                assert!(open_index.is_none());
                assert_eq!(data["index"].as_i64().unwrap(), next_index);
                open_index = Some(next_index);
                kinds.push(data["content_block"]["type"].as_str().unwrap().to_string());
            }
            "content_block_stop" => {
                assert_eq!(data["index"].as_i64(), open_index.take());
                next_index += 1;
            }
            "content_block_delta" => {
                assert_eq!(data["index"].as_i64(), open_index);
            }
            _ => {}
        }
    }
    assert!(open_index.is_none());
    assert_eq!(kinds, vec!["thinking", "text", "tool_use"]);

    let message_delta: Value = serde_json::from_str(
        &parsed[parsed.len() - 2].data,
    )
    .unwrap();
    assert_eq!(message_delta["delta"]["stop_reason"], "tool_use");
}

/// Tool deltas interleaved with text must keep the accumulated JSON of
/// every tool_use block valid at its content_block_stop.
#[test]
fn input_json_is_valid_at_block_stop() {
    let mut encoder = StreamEncoder::new("m");
    let mut frames = Vec::new();
    frames.extend(encoder.apply(Delta::Text("a".into())));
    frames.extend(encoder.apply(Delta::ToolUse {
        id: "toolu_1".into(),
        name: "search".into(),
        input: json!({ "nested": { "deep": [1, 2, 3] } }),
    }));
    frames.extend(encoder.finish());

    let mut parser = SseParser::new();
    let mut accumulated = String::new();
    let mut validated = 0;
    for frame in &frames {
        for record in parser.feed(frame.as_bytes()) {
            let data: Value = serde_json::from_str(&record.data).unwrap();
            match record.event.as_deref().unwrap() {
                "content_block_delta" if data["delta"]["type"] == "input_json_delta" => {
                    accumulated.push_str(data["delta"]["partial_json"].as_str().unwrap());
                }
                "content_block_stop" if !accumulated.is_empty() => {
                    let parsed: Value = serde_json::from_str(&accumulated).unwrap();
                    assert_eq!(parsed, json!({ "nested": { "deep": [1, 2, 3] } }));
                    accumulated.clear();
                    validated += 1;
                }
                _ => {}
            }
        }
    }
    assert_eq!(validated, 1);
}
