//! Fire-and-forget telemetry bus.
//!
//! Listeners are invoked synchronously from the emitting call site. Listeners
//! MUST NOT re-enter guarded capabilities; if they do, event ordering becomes
//! undefined.

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::util::now_ms;

pub const NET_GUARD_ATTEMPT: &str = "net-guard-attempt";
pub const NET_GUARD_BLOCK: &str = "net-guard-block";
pub const COMPUTE_PERMISSION: &str = "compute-permission";
pub const UI_DEBUG_LOG: &str = "ui-debug-log";
pub const LINTER_REJECT: &str = "linter_reject";
pub const COMPONENT_UNKNOWN: &str = "component.unknown";
pub const TOOL_ARGS_UNPARSABLE: &str = "tool_args_unparsable";

/// Typed event envelope with span/trace correlation.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub payload: Value,
    pub ts: i64,
}

type Listener = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Cheaply cloneable handle onto the process-wide subscriber list.
#[derive(Clone, Default)]
pub struct TelemetryBus {
    listeners: Arc<Mutex<Vec<(u64, Listener)>>>,
    next_id: Arc<Mutex<u64>>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and returns a token for [`TelemetryBus::unsubscribe`].
    pub fn subscribe(&self, listener: impl Fn(&TelemetryEvent) + Send + Sync + 'static) -> u64 {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, token: u64) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners.retain(|(id, _)| *id != token);
    }

    pub fn emit(&self, name: &str, payload: Value) {
        self.emit_traced(name, None, None, payload);
    }

    /// Listeners are tried individually; a panicking listener never blocks the
    /// others.
    pub fn emit_traced(
        &self,
        name: &str,
        trace_id: Option<String>,
        span_id: Option<String>,
        payload: Value,
    ) {
        let event = TelemetryEvent {
            name: name.to_string(),
            trace_id,
            span_id,
            payload,
            ts: now_ms(),
        };
        let listeners: Vec<Listener> = {
            let guard = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("telemetry listener panicked on `{name}`");
            }
        }
    }
}
