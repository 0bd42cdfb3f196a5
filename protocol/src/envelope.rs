use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Ordered sequence of envelopes. Application is transactional with respect to
/// ordering only; there is no partial-failure rollback.
pub type Batch = Vec<Envelope>;

/// One UI operation plus metadata; the atomic unit of application.
///
/// The operation tag and its parameter record travel as `op`/`params` on the
/// wire. The metadata fields are optional on input and stamped by the
/// orchestrator before a batch is returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub op: Operation,

    /// Originating envelope id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Unique within a batch run; duplicate keys are a validation error.
    #[serde(
        default,
        rename = "idempotencyKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub idempotency_key: Option<String>,

    #[serde(default, rename = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, rename = "txnId", skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,

    /// Window the operation is scoped to, when the params do not carry one.
    #[serde(default, rename = "windowId", skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
}

impl Envelope {
    pub fn new(op: Operation) -> Self {
        Self {
            op,
            id: None,
            idempotency_key: None,
            trace_id: None,
            txn_id: None,
            window_id: None,
        }
    }

    /// Stable operation tag, e.g. `"window.create"`.
    pub fn op_name(&self) -> &'static str {
        self.op.name()
    }

    /// HTML payload carried by `dom.*` operations.
    pub fn html(&self) -> Option<&str> {
        match &self.op {
            Operation::DomSet(p) | Operation::DomReplace(p) | Operation::DomAppend(p) => {
                Some(p.html.as_str())
            }
            _ => None,
        }
    }

    /// Window id referenced by the operation params, falling back to the
    /// envelope-level `windowId`.
    pub fn referenced_window_id(&self) -> Option<&str> {
        let from_params = match &self.op {
            Operation::WindowUpdate(p) => Some(p.id.as_str()),
            Operation::WindowMove(p) | Operation::WindowResize(p) => Some(p.id.as_str()),
            Operation::WindowFocus(p) | Operation::WindowClose(p) => Some(p.id.as_str()),
            Operation::DomSet(p) | Operation::DomReplace(p) | Operation::DomAppend(p) => {
                p.window_id.as_deref()
            }
            Operation::ComponentRender(p) => Some(p.window_id.as_str()),
            Operation::NeedsCode(p) => p.window_id.as_deref(),
            _ => None,
        };
        from_params.or(self.window_id.as_deref())
    }
}

/// Closed set of UI mutation operations. The tag and the parameter record must
/// agree; unknown tags fail deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params")]
pub enum Operation {
    #[serde(rename = "window.create")]
    WindowCreate(WindowCreateParams),
    #[serde(rename = "window.update")]
    WindowUpdate(WindowUpdateParams),
    #[serde(rename = "window.move")]
    WindowMove(WindowGeometryParams),
    #[serde(rename = "window.resize")]
    WindowResize(WindowGeometryParams),
    #[serde(rename = "window.focus")]
    WindowFocus(WindowIdParams),
    #[serde(rename = "window.close")]
    WindowClose(WindowIdParams),
    #[serde(rename = "dom.set")]
    DomSet(DomParams),
    #[serde(rename = "dom.replace")]
    DomReplace(DomParams),
    #[serde(rename = "dom.append")]
    DomAppend(DomParams),
    #[serde(rename = "component.render")]
    ComponentRender(ComponentRenderParams),
    #[serde(rename = "component.update")]
    ComponentUpdate(ComponentUpdateParams),
    #[serde(rename = "component.destroy")]
    ComponentDestroy(ComponentIdParams),
    #[serde(rename = "state.set")]
    StateSet(StateValueParams),
    #[serde(rename = "state.get")]
    StateGet(StateKeyParams),
    #[serde(rename = "state.watch")]
    StateWatch(StateKeyParams),
    #[serde(rename = "state.unwatch")]
    StateUnwatch(StateKeyParams),
    #[serde(rename = "state.patch")]
    StatePatch(StateValueParams),
    #[serde(rename = "api.call")]
    ApiCall(ApiCallParams),
    #[serde(rename = "needs.code")]
    NeedsCode(NeedsCodeParams),
    #[serde(rename = "txn.cancel")]
    TxnCancel(TxnCancelParams),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::WindowCreate(_) => "window.create",
            Operation::WindowUpdate(_) => "window.update",
            Operation::WindowMove(_) => "window.move",
            Operation::WindowResize(_) => "window.resize",
            Operation::WindowFocus(_) => "window.focus",
            Operation::WindowClose(_) => "window.close",
            Operation::DomSet(_) => "dom.set",
            Operation::DomReplace(_) => "dom.replace",
            Operation::DomAppend(_) => "dom.append",
            Operation::ComponentRender(_) => "component.render",
            Operation::ComponentUpdate(_) => "component.update",
            Operation::ComponentDestroy(_) => "component.destroy",
            Operation::StateSet(_) => "state.set",
            Operation::StateGet(_) => "state.get",
            Operation::StateWatch(_) => "state.watch",
            Operation::StateUnwatch(_) => "state.unwatch",
            Operation::StatePatch(_) => "state.patch",
            Operation::ApiCall(_) => "api.call",
            Operation::NeedsCode(_) => "needs.code",
            Operation::TxnCancel(_) => "txn.cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WindowCreateParams {
    /// Client-chosen id. When omitted the window manager derives one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WindowUpdateParams {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

/// Params shared by `window.move` and `window.resize`: move reads `x`/`y`,
/// resize reads `width`/`height`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WindowGeometryParams {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowIdParams {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DomParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    /// Literal `#root` or a querySelector evaluated within the window's
    /// content subtree.
    pub target: String,
    pub html: String,
    /// Adapter-internal renderings that emit pre-escaped markup may opt out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitize: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ComponentRenderParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub window_id: String,
    pub target: String,
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default)]
    pub props: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentUpdateParams {
    pub id: String,
    #[serde(default)]
    pub props: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentIdParams {
    pub id: String,
}

/// Visibility scope for workspace state keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateScope {
    Window,
    #[default]
    Workspace,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StateKeyParams {
    #[serde(default)]
    pub scope: StateScope,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct StateValueParams {
    #[serde(default)]
    pub scope: StateScope,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ApiCallParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// State key the response is written into. Pairing an `api.call` with a
    /// watched `into` key is what makes a `needs.code` batch observable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub into: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct NeedsCodeParams {
    /// What the generated applet should do.
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TxnCancelParams {
    /// Transaction to cancel; the envelope's own `txnId` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn window_create_round_trips() {
        let json = serde_json::json!({
            "op": "window.create",
            "params": { "id": "win-notes", "title": "Notepad", "width": 420.0 },
            "traceId": "t-1"
        });
        let env: Envelope = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(env.op_name(), "window.create");
        assert_eq!(env.trace_id.as_deref(), Some("t-1"));
        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn unknown_op_tag_is_rejected() {
        let json = serde_json::json!({ "op": "window.explode", "params": { "id": "w" } });
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }

    #[test]
    fn unknown_param_field_is_rejected() {
        let json = serde_json::json!({
            "op": "dom.set",
            "params": { "target": "#root", "html": "<p>hi</p>", "onClick": "alert(1)" }
        });
        assert!(serde_json::from_value::<Envelope>(json).is_err());
    }

    #[test]
    fn referenced_window_id_prefers_params() {
        let mut env: Envelope = serde_json::from_value(serde_json::json!({
            "op": "dom.set",
            "params": { "windowId": "w-params", "target": "#root", "html": "<p>x</p>" }
        }))
        .unwrap();
        env.window_id = Some("w-envelope".into());
        assert_eq!(env.referenced_window_id(), Some("w-params"));
    }

    #[test]
    fn state_scope_defaults_to_workspace() {
        let env: Envelope = serde_json::from_value(serde_json::json!({
            "op": "state.get",
            "params": { "key": "notes" }
        }))
        .unwrap();
        match env.op {
            Operation::StateGet(p) => assert_eq!(p.scope, StateScope::Workspace),
            other => panic!("unexpected op: {other:?}"),
        }
    }
}
