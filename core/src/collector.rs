//! Single-pass stream consumption: text accumulates per channel while tool
//! call argument deltas accumulate per index; everything is resolved when the
//! stream ends.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Result;
use crate::error::UicpErr;
use crate::harmony::lenient_json;
use crate::stream::EventStream;
use crate::stream::StreamEvent;
use crate::telemetry::TOOL_ARGS_UNPARSABLE;
use crate::telemetry::TelemetryBus;

/// Outcome of one collection pass. `tool_result` is absent when no tool call
/// arrived or its arguments failed to parse; callers then attempt a
/// text-to-JSON recovery on `text_content`.
#[derive(Debug, Default)]
pub struct Collected {
    pub tool_result: Option<Value>,
    /// Concatenated non-analysis content, the input for text fallback.
    pub text_content: String,
    /// Per-channel buffers, kept raw for diagnostics.
    pub channels: HashMap<String, String>,
}

#[derive(Default)]
struct ToolAccumulator {
    id: Option<String>,
    name: Option<String>,
    parts: Vec<String>,
    object_arg: Option<Value>,
}

/// Drains `stream` until `Done` or exhaustion, then selects the tool call
/// whose name matches `target_tool` (or the sole accumulator when only one
/// exists).
///
/// On timeout the stream is told to return so the provider can cancel its
/// upstream work, and `E-UICP-0101` is raised. Argument parse failures do NOT
/// raise: they emit telemetry and leave `tool_result` unset.
pub async fn collect_with_fallback(
    stream: &mut EventStream,
    target_tool: &str,
    budget: Duration,
    context: &str,
    bus: &TelemetryBus,
) -> Result<Collected> {
    let consumed = timeout(budget, consume(stream)).await;
    let (accumulators, channels, returned) = match consumed {
        Ok(Ok(state)) => state,
        Ok(Err(err)) => {
            stream.ret();
            return Err(err);
        }
        Err(_elapsed) => {
            stream.ret();
            return Err(UicpErr::CollectionTimeout(budget, context.to_string()));
        }
    };

    let text_content = {
        let mut text = String::new();
        for key in ["", "commentary", "final", "json", "text"] {
            if let Some(buf) = channels.get(key) {
                text.push_str(buf);
            }
        }
        text
    };

    let selected = accumulators
        .values()
        .find(|acc| acc.name.as_deref() == Some(target_tool))
        .or_else(|| {
            if accumulators.len() == 1 {
                accumulators.values().next()
            } else {
                None
            }
        });

    let tool_result = match selected {
        Some(acc) => {
            if let Some(object) = &acc.object_arg {
                Some(object.clone())
            } else {
                let joined = acc.parts.concat();
                if joined.trim().is_empty() {
                    None
                } else {
                    match lenient_json(&joined) {
                        Some(value) => Some(value),
                        None => {
                            debug!(context, "tool argument buffer failed to parse");
                            bus.emit(
                                TOOL_ARGS_UNPARSABLE,
                                serde_json::json!({
                                    "context": context,
                                    "tool": acc.name,
                                    "bytes": joined.len(),
                                }),
                            );
                            None
                        }
                    }
                }
            }
        }
        // A bare `return` event with an object result stands in for a tool
        // call on backends that skip the tool_call framing.
        None => returned.filter(|value| value.is_object()),
    };

    Ok(Collected {
        tool_result,
        text_content,
        channels,
    })
}

type ConsumeState = (
    BTreeMap<u32, ToolAccumulator>,
    HashMap<String, String>,
    Option<Value>,
);

async fn consume(stream: &mut EventStream) -> Result<ConsumeState> {
    let mut accumulators: BTreeMap<u32, ToolAccumulator> = BTreeMap::new();
    let mut channels: HashMap<String, String> = HashMap::new();
    let mut returned: Option<Value> = None;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Content { channel, text } => {
                let key = channel.map(|c| c.as_str()).unwrap_or("");
                channels.entry(key.to_string()).or_default().push_str(&text);
            }
            StreamEvent::ToolCall {
                index,
                id,
                name,
                arguments,
                is_delta,
            } => {
                let acc = accumulators.entry(index).or_default();
                // Missing fields carry forward across deltas keyed by index.
                if let Some(id) = id {
                    acc.id.get_or_insert(id);
                }
                if let Some(name) = name {
                    acc.name.get_or_insert(name);
                }
                if arguments.is_empty() {
                    continue;
                }
                if is_delta {
                    acc.parts.push(arguments);
                } else {
                    match lenient_json(&arguments) {
                        Some(value) if value.is_object() => acc.object_arg = Some(value),
                        _ => acc.parts.push(arguments),
                    }
                }
            }
            StreamEvent::Return { result, .. } => {
                returned = Some(result);
            }
            StreamEvent::Done => break,
        }
    }

    // Let the producer tear down its upstream listener.
    stream.ret();
    Ok((accumulators, channels, returned))
}

/// Text fallback: recover a tool payload from free-form model text. Accepts a
/// whole-message JSON object or the first fenced/balanced object found.
pub fn parse_tool_from_text(text: &str) -> Option<Value> {
    if let Some(value) = lenient_json(text)
        && value.is_object()
    {
        return Some(value);
    }

    // Scan for the first balanced top-level object.
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + c.len_utf8()];
                    return lenient_json(candidate).filter(|v| v.is_object());
                }
            }
            _ => {}
        }
    }
    None
}
