//! Incremental decoder for Harmony-framed model output.
//!
//! Frames look like `<|start|>assistant<|channel|>analysis<|message|>…<|end|>`;
//! tool invocations terminate with `<|call|>` and final results with
//! `<|return|>`. The decoder is chunk-boundary safe: a marker split across
//! two pushes is reassembled, and plain text outside frames streams through.

use regex_lite::Regex;
use serde_json::Value;

use crate::stream::Channel;

const START: &str = "<|start|>";
const CHANNEL: &str = "<|channel|>";
const MESSAGE: &str = "<|message|>";
const END: &str = "<|end|>";
const CALL: &str = "<|call|>";
const RETURN: &str = "<|return|>";

const MARKERS: [&str; 6] = [START, CHANNEL, MESSAGE, END, CALL, RETURN];

#[derive(Debug, Clone, PartialEq)]
pub enum HarmonyEvent {
    Text {
        channel: Option<Channel>,
        text: String,
    },
    Tool {
        name: Option<String>,
        arguments: Value,
        raw: String,
    },
    Return {
        channel: Option<Channel>,
        result: Value,
    },
}

#[derive(Default)]
pub struct HarmonyDecoder {
    buf: String,
}

impl HarmonyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of raw text, returning every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<HarmonyEvent> {
        self.buf.push_str(chunk);
        let mut events = Vec::new();

        loop {
            match self.buf.find(START) {
                None => {
                    // Plain text; hold back anything that could be the start
                    // of a marker split across chunk boundaries.
                    let safe = self.buf.len() - marker_prefix_holdback(&self.buf);
                    if safe > 0 {
                        let text: String = self.buf.drain(..safe).collect();
                        if !text.is_empty() {
                            events.push(HarmonyEvent::Text {
                                channel: None,
                                text,
                            });
                        }
                    }
                    break;
                }
                Some(0) => {
                    match self.take_frame() {
                        Some(event) => events.extend(event),
                        // Incomplete frame; wait for more input.
                        None => break,
                    }
                }
                Some(pos) => {
                    let text: String = self.buf.drain(..pos).collect();
                    if !text.is_empty() {
                        events.push(HarmonyEvent::Text {
                            channel: None,
                            text,
                        });
                    }
                }
            }
        }

        events
    }

    /// Flushes whatever remains (an unterminated frame degrades to text).
    pub fn finish(&mut self) -> Vec<HarmonyEvent> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buf);
        let text = match rest.find(MESSAGE) {
            Some(pos) => rest[pos + MESSAGE.len()..].to_string(),
            None => rest,
        };
        if text.is_empty() {
            Vec::new()
        } else {
            vec![HarmonyEvent::Text {
                channel: None,
                text,
            }]
        }
    }

    /// Consumes one complete frame from the head of the buffer, or returns
    /// None when the terminator has not arrived yet.
    fn take_frame(&mut self) -> Option<Option<HarmonyEvent>> {
        debug_assert!(self.buf.starts_with(START));
        let body_at = self.buf.find(MESSAGE)?;
        let header = self.buf[START.len()..body_at].to_string();
        let body_start = body_at + MESSAGE.len();

        let terminator = [END, CALL, RETURN]
            .iter()
            .filter_map(|t| self.buf[body_start..].find(t).map(|pos| (pos, *t)))
            .min_by_key(|(pos, _)| *pos)?;
        let (term_at, term) = terminator;
        let body = self.buf[body_start..body_start + term_at].to_string();
        self.buf.drain(..body_start + term_at + term.len());

        let channel = header
            .find(CHANNEL)
            .map(|pos| &header[pos + CHANNEL.len()..])
            .map(|rest| rest.split_whitespace().next().unwrap_or(""))
            .and_then(Channel::parse);
        let tool_name = header
            .split_whitespace()
            .find_map(|token| token.strip_prefix("to="))
            .map(|name| name.trim_start_matches("functions.").to_string());

        let event = match term {
            CALL => Some(HarmonyEvent::Tool {
                name: tool_name,
                arguments: lenient_json(&body).unwrap_or(Value::Null),
                raw: body,
            }),
            RETURN => Some(HarmonyEvent::Return {
                channel,
                result: lenient_json(&body).unwrap_or_else(|| Value::String(body.clone())),
            }),
            _ => {
                if body.is_empty() {
                    None
                } else {
                    Some(HarmonyEvent::Text {
                        channel,
                        text: body,
                    })
                }
            }
        };
        Some(event)
    }
}

/// Number of trailing bytes that could be an incomplete marker prefix.
fn marker_prefix_holdback(buf: &str) -> usize {
    let tail_start = buf.len().saturating_sub(START.len() + CHANNEL.len());
    for at in (tail_start..buf.len()).rev() {
        if !buf.is_char_boundary(at) {
            continue;
        }
        let tail = &buf[at..];
        if MARKERS.iter().any(|m| m.starts_with(tail)) {
            return buf.len() - at;
        }
    }
    0
}

/// Parses model-produced JSON leniently: code fences are stripped, smart
/// quotes normalized, trailing commas removed. Returns None when the payload
/// still is not JSON.
pub(crate) fn lenient_json(raw: &str) -> Option<Value> {
    let mut text = raw.trim().to_string();

    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }

    for (smart, plain) in [
        ('\u{201c}', '"'),
        ('\u{201d}', '"'),
        ('\u{201e}', '"'),
        ('\u{2018}', '\''),
        ('\u{2019}', '\''),
    ] {
        if text.contains(smart) {
            text = text.replace(smart, &plain.to_string());
        }
    }

    if let Ok(value) = serde_json::from_str(&text) {
        return Some(value);
    }

    // Trailing commas before a closing brace/bracket.
    let trailing_comma = Regex::new(r",\s*([}\]])").ok()?;
    let repaired = trailing_comma.replace_all(&text, "$1");
    serde_json::from_str(repaired.as_ref()).ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn whole_frame_decodes_text() {
        let mut dec = HarmonyDecoder::new();
        let events =
            dec.push("<|start|>assistant<|channel|>analysis<|message|>thinking hard<|end|>");
        assert_eq!(
            events,
            vec![HarmonyEvent::Text {
                channel: Some(Channel::Analysis),
                text: "thinking hard".into()
            }]
        );
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut dec = HarmonyDecoder::new();
        assert!(dec.push("<|sta").is_empty());
        assert!(dec.push("rt|>assistant<|channel|>final<|mess").is_empty());
        let events = dec.push("age|>done<|end|>");
        assert_eq!(
            events,
            vec![HarmonyEvent::Text {
                channel: Some(Channel::Final),
                text: "done".into()
            }]
        );
    }

    #[test]
    fn call_frame_parses_sloppy_json() {
        let mut dec = HarmonyDecoder::new();
        let events = dec.push(
            "<|start|>assistant<|channel|>commentary to=functions.emit_batch<|message|>{\u{201c}batch\u{201d}: [],}<|call|>",
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            HarmonyEvent::Tool { name, arguments, .. } => {
                assert_eq!(name.as_deref(), Some("emit_batch"));
                assert_eq!(arguments, &json!({ "batch": [] }));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn return_frame_yields_result() {
        let mut dec = HarmonyDecoder::new();
        let events = dec.push("<|start|>assistant<|message|>{\"ok\": true}<|return|>");
        assert_eq!(
            events,
            vec![HarmonyEvent::Return {
                channel: None,
                result: json!({ "ok": true })
            }]
        );
    }

    #[test]
    fn plain_text_streams_through() {
        let mut dec = HarmonyDecoder::new();
        let events = dec.push("hello ");
        assert_eq!(
            events,
            vec![HarmonyEvent::Text {
                channel: None,
                text: "hello ".into()
            }]
        );
    }

    #[test]
    fn unterminated_frame_flushes_as_text() {
        let mut dec = HarmonyDecoder::new();
        assert!(dec.push("<|start|>assistant<|message|>partial answer").is_empty());
        assert_eq!(
            dec.finish(),
            vec![HarmonyEvent::Text {
                channel: None,
                text: "partial answer".into()
            }]
        );
    }

    #[test]
    fn lenient_json_strips_code_fences() {
        let value = lenient_json("```json\n{\"a\": 1,}\n```").unwrap();
        assert_eq!(value, json!({ "a": 1 }));
    }

    #[test]
    fn lenient_json_rejects_non_json() {
        assert!(lenient_json("not json at all").is_none());
    }
}
