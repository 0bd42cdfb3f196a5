//! Shared test support: a scripted host bridge that replays canned
//! completion chunks per chat invocation.
#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use serde_json::Value;
use serde_json::json;
use uicp_core::Result;
use uicp_core::bridge::CANCEL_CHAT;
use uicp_core::bridge::CHAT_COMPLETION;
use uicp_core::bridge::COMPLETION_EVENT;
use uicp_core::bridge::ChunkHandler;
use uicp_core::bridge::HostBridge;
use uicp_core::bridge::ListenerGuard;

/// Replays one chunk script per `chat_completion` invocation, in order.
/// Running out of scripts replays an immediate bare `done`.
pub struct ScriptedBridge {
    scripts: Mutex<Vec<Vec<Value>>>,
    handlers: Mutex<HashMap<String, ChunkHandler>>,
    pub invocations: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl ScriptedBridge {
    pub fn new(scripts: Vec<Vec<Value>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts),
            handlers: Mutex::new(HashMap::new()),
            invocations: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl HostBridge for ScriptedBridge {
    fn invoke(&self, command: &str, payload: Value) -> BoxFuture<'_, Result<Value>> {
        let command = command.to_string();
        Box::pin(async move {
            if command == CANCEL_CHAT {
                self.cancels.fetch_add(1, Ordering::SeqCst);
                return Ok(Value::Null);
            }
            assert_eq!(command, CHAT_COMPLETION, "unexpected host command");
            self.invocations.fetch_add(1, Ordering::SeqCst);

            let request_id = payload["requestId"].as_str().unwrap_or_default().to_string();
            let script = {
                let mut scripts = self.scripts.lock().expect("scripts lock");
                if scripts.is_empty() {
                    Vec::new()
                } else {
                    scripts.remove(0)
                }
            };
            let handler = self
                .handlers
                .lock()
                .expect("handlers lock")
                .get(COMPLETION_EVENT)
                .cloned();
            if let Some(handler) = handler {
                for chunk in script {
                    let mut chunk = chunk;
                    if let Some(map) = chunk.as_object_mut() {
                        map.insert("requestId".to_string(), json!(request_id));
                    }
                    handler(&chunk);
                }
                handler(&json!({ "requestId": request_id, "done": true }));
            }
            Ok(Value::Null)
        })
    }

    fn listen(&self, event: &str, handler: ChunkHandler) -> ListenerGuard {
        self.handlers
            .lock()
            .expect("handlers lock")
            .insert(event.to_string(), handler);
        ListenerGuard::noop()
    }
}

/// One OpenAI-style tool-call delta chunk wrapped the way the completion
/// event carries it.
pub fn tool_call_chunk(name: &str, arguments: &Value) -> Value {
    json!({
        "kind": "json",
        "delta": {
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_1",
                        "function": {
                            "name": name,
                            "arguments": arguments.to_string(),
                        }
                    }]
                }
            }]
        }
    })
}

pub fn content_chunk(text: &str) -> Value {
    json!({
        "kind": "json",
        "delta": { "choices": [{ "delta": { "content": text } }] }
    })
}
