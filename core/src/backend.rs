//! Direct HTTP implementation of [`HostBridge`] for an OpenAI-compatible
//! chat-completions backend. Used by the CLI and by integration tests; the
//! desktop shell supplies its own bridge over host IPC.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::bridge::CANCEL_CHAT;
use crate::bridge::CHAT_COMPLETION;
use crate::bridge::COMPLETION_EVENT;
use crate::bridge::ChunkHandler;
use crate::bridge::HostBridge;
use crate::bridge::ListenerGuard;
use crate::error::Result;
use crate::error::UicpErr;
use crate::flags;
use crate::util::backoff;

const MAX_REQUEST_RETRIES: u64 = 4;

pub struct HttpHostBridge {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    listeners: Arc<Mutex<HashMap<String, Vec<(u64, ChunkHandler)>>>>,
    next_listener: Mutex<u64>,
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl HttpHostBridge {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: Mutex::new(0),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn emit(&self, event: &str, chunk: &Value) {
        let handlers: Vec<ChunkHandler> = {
            let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
            listeners
                .get(event)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(chunk);
        }
    }

    fn is_cancelled(&self, request_id: &str) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(request_id)
    }

    /// POSTs the chat request and pumps the SSE stream into
    /// `ollama-completion` events. Resolves only after the stream completes,
    /// errors out, or is cancelled.
    async fn run_chat(&self, payload: Value) -> Result<Value> {
        let request_id = payload
            .get("requestId")
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();
        let request = payload.get("request").cloned().unwrap_or(Value::Null);

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!("POST to {url}");

        let mut attempt = 0;
        let response = loop {
            attempt += 1;

            let mut builder = self.client.post(&url);
            if let Some(api_key) = &self.api_key {
                builder = builder.bearer_auth(api_key.clone());
            }
            let result = builder
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&request)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => break response,
                Ok(response) => {
                    let status = response.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = response.text().await.unwrap_or_default();
                        self.emit_terminal_error(&request_id, Some(status.as_u16()), &body);
                        return Err(UicpErr::UnexpectedStatus(status, body));
                    }
                    if attempt > MAX_REQUEST_RETRIES {
                        self.emit_terminal_error(&request_id, Some(status.as_u16()), "retry limit");
                        return Err(UicpErr::RetryLimit(status));
                    }
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(retry_after).await;
                }
                Err(err) => {
                    if attempt > MAX_REQUEST_RETRIES {
                        self.emit_terminal_error(&request_id, None, &err.to_string());
                        return Err(err.into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        };

        let idle_timeout = *flags::VITE_CHAT_DEFAULT_TIMEOUT_MS;
        let mut events = response.bytes_stream().eventsource();

        loop {
            if self.is_cancelled(&request_id) {
                debug!("chat {request_id} cancelled, dropping stream");
                self.emit(COMPLETION_EVENT, &json!({ "requestId": request_id, "done": true }));
                return Ok(Value::Null);
            }

            let event = match timeout(idle_timeout, events.next()).await {
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(err))) => {
                    self.emit_terminal_error(&request_id, None, &err.to_string());
                    return Err(UicpErr::StreamClosed(err.to_string()));
                }
                Ok(None) => {
                    // Stream closed gracefully without [DONE].
                    self.emit(COMPLETION_EVENT, &json!({ "requestId": request_id, "done": true }));
                    return Ok(Value::Null);
                }
                Err(_elapsed) => {
                    self.emit_terminal_error(&request_id, None, "idle timeout waiting for SSE");
                    return Err(UicpErr::StreamClosed("idle timeout".to_string()));
                }
            };

            if event.data.trim() == "[DONE]" {
                self.emit(COMPLETION_EVENT, &json!({ "requestId": request_id, "done": true }));
                return Ok(Value::Null);
            }

            match serde_json::from_str::<Value>(&event.data) {
                Ok(chunk) => {
                    trace!("chat sse chunk: {chunk:?}");
                    self.emit(
                        COMPLETION_EVENT,
                        &json!({ "requestId": request_id, "kind": "json", "delta": chunk }),
                    );
                }
                // Some backends interleave plain text keep-alives.
                Err(_) => {
                    self.emit(
                        COMPLETION_EVENT,
                        &json!({ "requestId": request_id, "kind": "text", "delta": event.data }),
                    );
                }
            }
        }
    }

    fn emit_terminal_error(&self, request_id: &str, status: Option<u16>, detail: &str) {
        self.emit(
            COMPLETION_EVENT,
            &json!({
                "requestId": request_id,
                "done": true,
                "error": {
                    "status": status,
                    "code": "backend_error",
                    "detail": detail,
                    "requestId": request_id,
                }
            }),
        );
    }
}

impl HostBridge for HttpHostBridge {
    fn invoke(&self, command: &str, payload: Value) -> BoxFuture<'_, Result<Value>> {
        let command = command.to_string();
        Box::pin(async move {
            match command.as_str() {
                CHAT_COMPLETION => self.run_chat(payload).await,
                CANCEL_CHAT => {
                    if let Some(request_id) = payload.get("requestId").and_then(|id| id.as_str()) {
                        self.cancelled
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(request_id.to_string());
                    }
                    Ok(Value::Null)
                }
                other => Err(UicpErr::QueueClosed(format!("unknown host command `{other}`"))),
            }
        })
    }

    fn listen(&self, event: &str, handler: ChunkHandler) -> ListenerGuard {
        let token = {
            let mut next = self.next_listener.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        {
            let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
            listeners
                .entry(event.to_string())
                .or_default()
                .push((token, handler));
        }
        let listeners = Arc::clone(&self.listeners);
        let event = event.to_string();
        ListenerGuard::new(move || {
            let mut listeners = listeners.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entries) = listeners.get_mut(&event) {
                entries.retain(|(id, _)| *id != token);
            }
        })
    }
}
