//! Workspace-scoped state store backing the `state.*` operations.

use std::collections::HashMap;
use std::collections::HashSet;

use serde_json::Value;
use uicp_protocol::StateScope;

use crate::telemetry::TelemetryBus;

pub const STATE_UPDATE: &str = "state-update";

type StateKey = (StateScope, String, String);

#[derive(Default)]
pub struct StateStore {
    values: HashMap<StateKey, Value>,
    watched: HashSet<StateKey>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        bus: &TelemetryBus,
        scope: StateScope,
        window_id: Option<&str>,
        key: &str,
        value: Value,
    ) {
        let state_key = make_key(scope, window_id, key);
        let watched = self.watched.contains(&state_key);
        self.values.insert(state_key, value.clone());
        if watched {
            emit_update(bus, scope, window_id, key, &value);
        }
    }

    pub fn get(&self, scope: StateScope, window_id: Option<&str>, key: &str) -> Option<&Value> {
        self.values.get(&make_key(scope, window_id, key))
    }

    pub fn watch(&mut self, scope: StateScope, window_id: Option<&str>, key: &str) {
        self.watched.insert(make_key(scope, window_id, key));
    }

    pub fn unwatch(&mut self, scope: StateScope, window_id: Option<&str>, key: &str) {
        self.watched.remove(&make_key(scope, window_id, key));
    }

    pub fn is_watched(&self, scope: StateScope, window_id: Option<&str>, key: &str) -> bool {
        self.watched.contains(&make_key(scope, window_id, key))
    }

    /// RFC 7386 merge-patch semantics: objects merge recursively, explicit
    /// nulls delete, everything else replaces.
    pub fn patch(
        &mut self,
        bus: &TelemetryBus,
        scope: StateScope,
        window_id: Option<&str>,
        key: &str,
        patch: Value,
    ) {
        let state_key = make_key(scope, window_id, key);
        let current = self.values.remove(&state_key).unwrap_or(Value::Null);
        let merged = merge_patch(current, patch);
        let watched = self.watched.contains(&state_key);
        self.values.insert(state_key, merged.clone());
        if watched {
            emit_update(bus, scope, window_id, key, &merged);
        }
    }
}

fn make_key(scope: StateScope, window_id: Option<&str>, key: &str) -> StateKey {
    let window = match scope {
        StateScope::Window => window_id.unwrap_or_default().to_string(),
        _ => String::new(),
    };
    (scope, window, key.to_string())
}

fn emit_update(
    bus: &TelemetryBus,
    scope: StateScope,
    window_id: Option<&str>,
    key: &str,
    value: &Value,
) {
    bus.emit(
        STATE_UPDATE,
        serde_json::json!({
            "scope": scope,
            "windowId": window_id,
            "key": key,
            "value": value,
        }),
    );
}

fn merge_patch(target: Value, patch: Value) -> Value {
    match patch {
        Value::Object(patch_map) => {
            let mut target_map = match target {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(&key);
                } else {
                    let existing = target_map.remove(&key).unwrap_or(Value::Null);
                    target_map.insert(key, merge_patch(existing, value));
                }
            }
            Value::Object(target_map)
        }
        other => other,
    }
}
