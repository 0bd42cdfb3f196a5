//! Normalizes heterogeneous provider chunks into the canonical
//! [`StreamEvent`] stream.
//!
//! Providers disagree wildly about chunk shape: OpenAI deltas, final
//! messages, Harmony channel messages, Anthropic chunks pre-normalized to the
//! OpenAI tool-call shape by the backend, and bare Ollama lines. The
//! extractor recognizes them in order of specificity so the rest of the
//! pipeline stays agnostic of the wire format.

use serde_json::Value;

use crate::stream::Channel;
use crate::stream::StreamEvent;

/// Extracts zero or more canonical events from one JSON-decoded chunk.
pub fn extract_events_from_chunk(chunk: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    if let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) {
        let delta = choice.get("delta");

        if let Some(content) = delta.and_then(|d| d.get("content")) {
            push_content(&mut events, None, content);
        }

        if let Some(tool_calls) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        {
            push_tool_calls(&mut events, tool_calls, true);
        }

        // Harmony-style channel messages ride inside the delta.
        if let Some(messages) = delta
            .and_then(|d| d.get("messages"))
            .and_then(|m| m.as_array())
        {
            for message in messages {
                push_channel_message(&mut events, message);
            }
        }

        // Final (non-streamed) message.
        if let Some(message) = choice.get("message") {
            if let Some(content) = message.get("content") {
                push_content(&mut events, None, content);
            }
            if let Some(tool_calls) = message.get("tool_calls").and_then(|tc| tc.as_array()) {
                push_tool_calls(&mut events, tool_calls, false);
            }
        }

        if choice
            .get("finish_reason")
            .and_then(|fr| fr.as_str())
            .is_some()
        {
            events.push(StreamEvent::Done);
        }

        return events;
    }

    // Root-level shapes from thinner backends.
    if let Some(tool_calls) = chunk.get("tool_calls").and_then(|tc| tc.as_array()) {
        push_tool_calls(&mut events, tool_calls, false);
        return events;
    }

    if chunk.get("type").and_then(|t| t.as_str()) == Some("return") {
        events.push(StreamEvent::Return {
            channel: chunk
                .get("channel")
                .and_then(|c| c.as_str())
                .and_then(Channel::parse),
            name: chunk
                .get("name")
                .and_then(|n| n.as_str())
                .map(str::to_string),
            result: chunk.get("result").cloned().unwrap_or(Value::Null),
        });
        return events;
    }

    if let Some(content) = chunk.get("content") {
        let channel = chunk
            .get("channel")
            .and_then(|c| c.as_str())
            .and_then(Channel::parse);
        push_content(&mut events, channel, content);
    }

    events
}

/// Content arrives as a plain string or as an array of parts; parts are
/// strings or `{ "text": … }` objects.
fn push_content(events: &mut Vec<StreamEvent>, channel: Option<Channel>, content: &Value) {
    match content {
        Value::String(text) => {
            if !text.is_empty() {
                events.push(StreamEvent::Content {
                    channel,
                    text: text.clone(),
                });
            }
        }
        Value::Array(parts) => {
            for part in parts {
                let text = match part {
                    Value::String(text) => Some(text.as_str()),
                    Value::Object(map) => map.get("text").and_then(|t| t.as_str()),
                    _ => None,
                };
                if let Some(text) = text
                    && !text.is_empty()
                {
                    events.push(StreamEvent::Content {
                        channel,
                        text: text.to_string(),
                    });
                }
            }
        }
        _ => {}
    }
}

fn push_tool_calls(events: &mut Vec<StreamEvent>, tool_calls: &[Value], is_delta: bool) {
    for (position, tool_call) in tool_calls.iter().enumerate() {
        let index = tool_call
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64) as u32;
        let id = tool_call
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let function = tool_call.get("function");
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_string);
        let arguments = function
            .and_then(|f| f.get("arguments"))
            .map(|a| match a {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        events.push(StreamEvent::ToolCall {
            index,
            id,
            name,
            arguments,
            is_delta,
        });
    }
}

/// One Harmony `delta.messages[]` entry: explicit channels pass through as
/// hints; unknown roles become no channel.
fn push_channel_message(events: &mut Vec<StreamEvent>, message: &Value) {
    let channel = message
        .get("channel")
        .or_else(|| message.get("role"))
        .and_then(|c| c.as_str())
        .and_then(Channel::parse);
    if let Some(content) = message.get("content").or_else(|| message.get("text")) {
        push_content(events, channel, content);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn openai_text_delta() {
        let chunk = json!({ "choices": [{ "delta": { "content": "Hel" } }] });
        assert_eq!(
            extract_events_from_chunk(&chunk),
            vec![StreamEvent::Content {
                channel: None,
                text: "Hel".into()
            }]
        );
    }

    #[test]
    fn openai_content_parts() {
        let chunk = json!({
            "choices": [{ "delta": { "content": [{ "type": "text", "text": "a" }, "b"] } }]
        });
        let events = extract_events_from_chunk(&chunk);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn openai_tool_call_delta_carries_fragment() {
        let chunk = json!({
            "choices": [{ "delta": { "tool_calls": [{
                "index": 0,
                "id": "call_1",
                "function": { "name": "emit_batch", "arguments": "{\"ba" }
            }] } }]
        });
        assert_eq!(
            extract_events_from_chunk(&chunk),
            vec![StreamEvent::ToolCall {
                index: 0,
                id: Some("call_1".into()),
                name: Some("emit_batch".into()),
                arguments: "{\"ba".into(),
                is_delta: true,
            }]
        );
    }

    #[test]
    fn anthropic_normalized_final_message() {
        // The backend maps Anthropic tool-use blocks onto the OpenAI shape.
        let chunk = json!({
            "choices": [{ "message": {
                "content": "done",
                "tool_calls": [{ "id": "tu_1", "function": { "name": "emit_plan", "arguments": { "summary": "s" } } }]
            }, "finish_reason": "tool_calls" }]
        });
        let events = extract_events_from_chunk(&chunk);
        assert_eq!(events.len(), 3);
        match &events[1] {
            StreamEvent::ToolCall {
                arguments,
                is_delta,
                ..
            } => {
                assert!(!is_delta);
                assert!(arguments.contains("summary"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[test]
    fn harmony_channel_messages_pass_channel_hint() {
        let chunk = json!({
            "choices": [{ "delta": { "messages": [
                { "channel": "analysis", "content": "thinking" },
                { "channel": "final", "content": "answer" },
                { "channel": "no-such-channel", "content": "stray" }
            ] } }]
        });
        let events = extract_events_from_chunk(&chunk);
        assert_eq!(
            events,
            vec![
                StreamEvent::Content {
                    channel: Some(Channel::Analysis),
                    text: "thinking".into()
                },
                StreamEvent::Content {
                    channel: Some(Channel::Final),
                    text: "answer".into()
                },
                StreamEvent::Content {
                    channel: None,
                    text: "stray".into()
                },
            ]
        );
    }

    #[test]
    fn root_level_return_event() {
        let chunk = json!({ "type": "return", "result": "" });
        assert_eq!(
            extract_events_from_chunk(&chunk),
            vec![StreamEvent::Return {
                channel: None,
                name: None,
                result: json!("")
            }]
        );
    }

    #[test]
    fn ollama_root_content_line() {
        let chunk = json!({ "content": "token" });
        assert_eq!(
            extract_events_from_chunk(&chunk),
            vec![StreamEvent::Content {
                channel: None,
                text: "token".into()
            }]
        );
    }

    #[test]
    fn unknown_chunk_yields_nothing() {
        assert!(extract_events_from_chunk(&json!({ "usage": { "total_tokens": 5 } })).is_empty());
    }
}
