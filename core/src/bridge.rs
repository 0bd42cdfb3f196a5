//! Opaque host IPC bridge and the chat stream built on top of it.
//!
//! The host exposes `invoke(command, payload)` / `listen(event, handler)`.
//! `open_chat_stream` registers a completion listener, fires
//! `chat_completion`, and pumps every arriving chunk through the extractor
//! (and the Harmony decoder for raw text deltas) into a bounded event queue.
//! Consumer cancellation sends a best-effort `cancel_chat`.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::error::UicpErr;
use crate::extract::extract_events_from_chunk;
use crate::harmony::HarmonyDecoder;
use crate::harmony::HarmonyEvent;
use crate::stream::EventSink;
use crate::stream::EventStream;
use crate::stream::StreamEvent;
use crate::stream::event_channel;

pub const CHAT_COMPLETION: &str = "chat_completion";
pub const CANCEL_CHAT: &str = "cancel_chat";
pub const COMPLETION_EVENT: &str = "ollama-completion";

pub type ChunkHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Detaches the listener when dropped.
pub struct ListenerGuard {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn noop() -> Self {
        Self { detach: None }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// The opaque host calls. Implementations reach the model backend and host
/// persistence; the core never sees transport details.
pub trait HostBridge: Send + Sync {
    fn invoke(&self, command: &str, payload: Value) -> BoxFuture<'_, Result<Value>>;
    fn listen(&self, event: &str, handler: ChunkHandler) -> ListenerGuard;
}

/// Opens one streaming chat turn. The returned stream is finite and
/// non-restartable; calling its `ret()` cancels the backend request.
pub fn open_chat_stream(bridge: Arc<dyn HostBridge>, request: Value) -> EventStream {
    let request_id = Uuid::new_v4().to_string();
    let (sink, stream) = event_channel();

    let decoder = Arc::new(Mutex::new(HarmonyDecoder::new()));
    let handler_sink = sink.clone();
    let handler_decoder = Arc::clone(&decoder);
    let handler_request_id = request_id.clone();
    let handler: ChunkHandler = Arc::new(move |chunk| {
        handle_completion_chunk(&handler_sink, &handler_decoder, &handler_request_id, chunk);
    });
    let guard = bridge.listen(COMPLETION_EVENT, handler);

    tokio::spawn(async move {
        let payload = json!({ "requestId": request_id, "request": request });
        tokio::select! {
            result = bridge.invoke(CHAT_COMPLETION, payload) => {
                if let Err(err) = result {
                    sink.fail(err);
                }
            }
            _ = sink.cancelled() => {
                debug!("consumer returned; cancelling chat {request_id}");
                let _ = bridge
                    .invoke(CANCEL_CHAT, json!({ "requestId": request_id }))
                    .await;
            }
        }
        drop(guard);
    });

    stream
}

/// One `ollama-completion` event: `{done?, delta?, kind?, error?}`.
/// `done:true` with an error is a terminal failure.
fn handle_completion_chunk(
    sink: &EventSink,
    decoder: &Mutex<HarmonyDecoder>,
    request_id: &str,
    chunk: &Value,
) {
    // Events for other in-flight requests are not ours.
    let chunk_request = chunk
        .get("requestId")
        .or_else(|| chunk.get("error").and_then(|e| e.get("requestId")))
        .and_then(|id| id.as_str());
    if let Some(other) = chunk_request
        && other != request_id
    {
        return;
    }

    let done = chunk.get("done").and_then(|d| d.as_bool()).unwrap_or(false);

    if let Some(error) = chunk.get("error")
        && !error.is_null()
    {
        let code = error
            .get("code")
            .and_then(|c| c.as_str())
            .unwrap_or("unknown")
            .to_string();
        let detail = error
            .get("detail")
            .and_then(|d| d.as_str())
            .unwrap_or("backend error")
            .to_string();
        let status = error
            .get("status")
            .and_then(|s| s.as_u64())
            .map(|s| s as u16);
        let retry_after = error
            .get("retryAfterMs")
            .and_then(|ms| ms.as_u64())
            .map(Duration::from_millis);
        if done {
            sink.fail(UicpErr::Backend {
                status,
                code,
                detail,
                retry_after,
            });
            return;
        }
        warn!("non-terminal backend error on stream: {code}: {detail}");
    }

    if let Some(delta) = chunk.get("delta") {
        let kind = chunk.get("kind").and_then(|k| k.as_str());
        match (kind, delta) {
            (Some("json"), Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => {
                    for event in extract_events_from_chunk(&parsed) {
                        sink.event(event);
                    }
                }
                Err(err) => {
                    sink.fail(UicpErr::ChunkParse(err.to_string()));
                    return;
                }
            },
            (_, Value::Object(_)) => {
                for event in extract_events_from_chunk(delta) {
                    sink.event(event);
                }
            }
            (_, Value::String(raw)) => {
                let events = {
                    let mut decoder = decoder.lock().unwrap_or_else(|p| p.into_inner());
                    decoder.push(raw)
                };
                for event in events {
                    sink.event(map_harmony_event(event));
                }
            }
            _ => {}
        }
    }

    if done {
        let tail = {
            let mut decoder = decoder.lock().unwrap_or_else(|p| p.into_inner());
            decoder.finish()
        };
        for event in tail {
            sink.event(map_harmony_event(event));
        }
        sink.finish();
    }
}

fn map_harmony_event(event: HarmonyEvent) -> StreamEvent {
    match event {
        HarmonyEvent::Text { channel, text } => StreamEvent::Content { channel, text },
        HarmonyEvent::Tool {
            name,
            arguments,
            raw,
        } => StreamEvent::ToolCall {
            index: 0,
            id: None,
            name,
            arguments: if arguments.is_null() {
                raw
            } else {
                arguments.to_string()
            },
            is_delta: false,
        },
        HarmonyEvent::Return { channel, result } => StreamEvent::Return {
            channel,
            name: None,
            result,
        },
    }
}
