//! Adapter orchestrator: validate → permission-check → route each envelope.
//!
//! Modules receive each other by constructor injection and expose narrow
//! capability interfaces; the orchestrator owns the apply queue. Calls are
//! strictly sequential — later envelopes see prior DOM mutations, and batches
//! apply FIFO in call order.

pub mod component;
pub mod dom;
pub mod permission;
pub mod state;
pub mod window;
pub mod workspace;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uicp_protocol::ApiCallParams;
use uicp_protocol::Batch;
use uicp_protocol::Envelope;
use uicp_protocol::NeedsCodeParams;
use uicp_protocol::Operation;
use uicp_protocol::StateScope;
use uuid::Uuid;

use crate::adapter::component::ComponentRenderer;
use crate::adapter::dom::DomApplier;
use crate::adapter::dom::DomMode;
use crate::adapter::dom::DomOutcome;
use crate::adapter::permission::AllowAllGate;
use crate::adapter::permission::PermissionDecision;
use crate::adapter::permission::PermissionGate;
use crate::adapter::permission::scope_for_op;
use crate::adapter::state::StateStore;
use crate::adapter::window::DesktopBounds;
use crate::adapter::window::WindowManager;
use crate::adapter::workspace::WorkspaceDom;
use crate::error::AdapterError;
use crate::linter::lint_batch;
use crate::net::guard::FetchRequest;
use crate::net::guard::NetworkGuard;
use crate::net::guard::installed_guard;
use crate::policy::FsAccess;
use crate::policy::runtime::get_effective_policy;
use crate::schema::validate_envelope;
use crate::telemetry::LINTER_REJECT;
use crate::telemetry::TelemetryBus;
use crate::util::fnv1a64;

/// External hook for `needs.code` and `uicp://compute.call`: the applet
/// runtime is out of scope, so the default hook only records the request.
pub trait ComputeBridge: Send + Sync {
    fn enqueue_code_job(&self, params: &NeedsCodeParams);
    fn call(&self, body: &Value);
}

struct NullCompute;

impl ComputeBridge for NullCompute {
    fn enqueue_code_job(&self, _params: &NeedsCodeParams) {}
    fn call(&self, _body: &Value) {}
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Keep applying after a validation failure instead of stopping.
    pub allow_partial: bool,
    /// Bypass the pre-apply linter (trusted internal batches only).
    pub skip_lint: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            allow_partial: true,
            skip_lint: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    pub success: bool,
    pub applied: u32,
    pub skipped_duplicates: u32,
    pub denied_by_policy: u32,
    pub errors: Vec<String>,
    pub batch_id: String,
    pub ops_hash: Option<String>,
}

pub struct Adapter {
    dom: WorkspaceDom,
    windows: WindowManager,
    dom_applier: DomApplier,
    components: ComponentRenderer,
    state: StateStore,
    gate: Arc<dyn PermissionGate>,
    compute: Arc<dyn ComputeBridge>,
    bus: TelemetryBus,
    guard: Option<Arc<NetworkGuard>>,
    cancelled_txns: HashSet<String>,
}

impl Adapter {
    pub fn new(bus: TelemetryBus) -> Self {
        Self {
            dom: WorkspaceDom::new(),
            windows: WindowManager::new(DesktopBounds::default()),
            dom_applier: DomApplier::new(),
            components: ComponentRenderer::new(bus.clone()),
            state: StateStore::new(),
            gate: Arc::new(AllowAllGate),
            compute: Arc::new(NullCompute),
            bus,
            guard: None,
            cancelled_txns: HashSet::new(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_compute(mut self, compute: Arc<dyn ComputeBridge>) -> Self {
        self.compute = compute;
        self
    }

    pub fn with_guard(mut self, guard: Arc<NetworkGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn workspace_html(&self) -> String {
        self.dom.inner_html(self.dom.root())
    }

    pub fn stylesheet(&self) -> String {
        self.windows.render_stylesheet()
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Applies one batch in order. Identical repeated content counts as
    /// `skipped_duplicates`, policy denials as `denied_by_policy`; with
    /// `allow_partial:false` the first validation failure stops the run.
    pub async fn apply_batch(&mut self, batch: &Batch, options: &ApplyOptions) -> ApplyOutcome {
        let mut outcome = ApplyOutcome {
            success: true,
            batch_id: Uuid::new_v4().to_string(),
            ops_hash: ops_hash(batch),
            ..ApplyOutcome::default()
        };

        if !options.skip_lint {
            let known: HashSet<String> = self.windows.ids().map(str::to_string).collect();
            if let Err(reject) = lint_batch(batch, &known) {
                self.bus.emit(
                    LINTER_REJECT,
                    serde_json::json!({
                        "code": reject.code,
                        "reason": reject.reason,
                        "batchId": outcome.batch_id,
                    }),
                );
                outcome.success = false;
                outcome.errors.push(reject.to_string());
                return outcome;
            }
        }

        for envelope in batch {
            if let Some(txn) = envelope.txn_id.as_deref()
                && self.cancelled_txns.contains(txn)
                && !matches!(envelope.op, Operation::TxnCancel(_))
            {
                debug!("skipping envelope for cancelled txn {txn}");
                continue;
            }

            if let Err(err) = validate_envelope(envelope) {
                let message = AdapterError::ValidationFailed(err.to_string()).to_string();
                outcome.errors.push(message);
                if !options.allow_partial {
                    outcome.success = false;
                    return outcome;
                }
                continue;
            }

            let scope = scope_for_op(&envelope.op);
            if self.gate.check(scope) == PermissionDecision::Denied {
                outcome.denied_by_policy += 1;
                continue;
            }

            match self.dispatch(envelope, &mut outcome).await {
                Ok(()) => {}
                Err(err) => {
                    outcome.errors.push(err.to_string());
                    if !options.allow_partial {
                        outcome.success = false;
                        return outcome;
                    }
                }
            }
        }

        outcome.success = outcome.errors.is_empty();
        outcome
    }

    async fn dispatch(
        &mut self,
        envelope: &Envelope,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), AdapterError> {
        match &envelope.op {
            Operation::WindowCreate(params) => {
                let (_, created) = self.windows.create(&mut self.dom, params);
                // Create with a known id behaves as update: no applied
                // increment.
                if created {
                    outcome.applied += 1;
                }
            }
            Operation::WindowUpdate(params) => {
                self.windows.update(&mut self.dom, params)?;
                outcome.applied += 1;
            }
            Operation::WindowMove(params) => {
                let x = params.x.unwrap_or(0.0);
                let y = params.y.unwrap_or(0.0);
                self.windows.move_to(&params.id, x, y)?;
                outcome.applied += 1;
            }
            Operation::WindowResize(params) => {
                let width = params.width.unwrap_or(window::MIN_WIDTH);
                let height = params.height.unwrap_or(window::MIN_HEIGHT);
                self.windows.resize(&params.id, width, height)?;
                outcome.applied += 1;
            }
            Operation::WindowFocus(params) => {
                self.windows.focus(&params.id)?;
                outcome.applied += 1;
            }
            Operation::WindowClose(params) => {
                self.windows.close(&mut self.dom, &params.id)?;
                self.dom_applier.forget(&params.id);
                outcome.applied += 1;
            }
            Operation::DomSet(params) => {
                self.apply_dom(DomMode::Set, params, outcome)?;
            }
            Operation::DomReplace(params) => {
                self.apply_dom(DomMode::Replace, params, outcome)?;
            }
            Operation::DomAppend(params) => {
                self.apply_dom(DomMode::Append, params, outcome)?;
            }
            Operation::ComponentRender(params) => {
                self.components.render(
                    &mut self.dom,
                    &self.windows,
                    &mut self.dom_applier,
                    params,
                )?;
                outcome.applied += 1;
            }
            Operation::ComponentUpdate(params) => {
                self.components.update(
                    &mut self.dom,
                    &self.windows,
                    &mut self.dom_applier,
                    params,
                )?;
                outcome.applied += 1;
            }
            Operation::ComponentDestroy(params) => {
                self.components.destroy(&mut self.dom, &params.id)?;
                outcome.applied += 1;
            }
            Operation::StateSet(params) => {
                self.state.set(
                    &self.bus,
                    params.scope,
                    params.window_id.as_deref(),
                    &params.key,
                    params.value.clone(),
                );
                outcome.applied += 1;
            }
            Operation::StateGet(params) => {
                let value = self
                    .state
                    .get(params.scope, params.window_id.as_deref(), &params.key)
                    .cloned()
                    .unwrap_or(Value::Null);
                self.bus.emit(
                    state::STATE_UPDATE,
                    serde_json::json!({
                        "scope": params.scope,
                        "key": params.key,
                        "value": value,
                        "read": true,
                    }),
                );
                outcome.applied += 1;
            }
            Operation::StateWatch(params) => {
                self.state
                    .watch(params.scope, params.window_id.as_deref(), &params.key);
                outcome.applied += 1;
            }
            Operation::StateUnwatch(params) => {
                self.state
                    .unwatch(params.scope, params.window_id.as_deref(), &params.key);
                outcome.applied += 1;
            }
            Operation::StatePatch(params) => {
                self.state.patch(
                    &self.bus,
                    params.scope,
                    params.window_id.as_deref(),
                    &params.key,
                    params.value.clone(),
                );
                outcome.applied += 1;
            }
            Operation::ApiCall(params) => {
                self.apply_api_call(params, outcome).await?;
            }
            Operation::NeedsCode(params) => {
                self.compute.enqueue_code_job(params);
                self.bus.emit(
                    "compute-enqueue",
                    serde_json::json!({
                        "description": params.description,
                        "windowId": params.window_id,
                    }),
                );
                outcome.applied += 1;
            }
            Operation::TxnCancel(params) => {
                let txn = params
                    .id
                    .clone()
                    .or_else(|| envelope.txn_id.clone())
                    .unwrap_or_default();
                if !txn.is_empty() {
                    self.cancelled_txns.insert(txn);
                }
                outcome.applied += 1;
            }
        }
        Ok(())
    }

    fn apply_dom(
        &mut self,
        mode: DomMode,
        params: &uicp_protocol::DomParams,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), AdapterError> {
        match self
            .dom_applier
            .apply(&mut self.dom, &self.windows, mode, params)?
        {
            DomOutcome::Applied => outcome.applied += 1,
            DomOutcome::SkippedDuplicate => outcome.skipped_duplicates += 1,
        }
        Ok(())
    }

    /// `api.call` routing: internal schemes dispatch locally, HTTP passes
    /// through the network guard, filesystem writes consult the filesystem
    /// policy (the actual write belongs to the host).
    async fn apply_api_call(
        &mut self,
        params: &ApiCallParams,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), AdapterError> {
        let url = params.url.trim();

        if url.starts_with("uicp://intent") {
            self.bus.emit(
                "uicp-intent",
                params.body.clone().unwrap_or(Value::Null),
            );
            outcome.applied += 1;
            return Ok(());
        }

        if url.starts_with("uicp://compute.call") {
            let body = params.body.clone().unwrap_or(Value::Null);
            self.compute.call(&body);
            self.bus.emit("compute-call", body);
            outcome.applied += 1;
            return Ok(());
        }

        if url.starts_with("tauri://fs/writeTextFile") {
            let policy = get_effective_policy();
            match policy.filesystem.access {
                FsAccess::Allow => {
                    self.bus.emit(
                        "fs-write",
                        params.body.clone().unwrap_or(Value::Null),
                    );
                    outcome.applied += 1;
                }
                FsAccess::Prompt | FsAccess::Deny => {
                    outcome.denied_by_policy += 1;
                }
            }
            return Ok(());
        }

        if url.starts_with("mailto:") {
            self.bus.emit("open-mailto", serde_json::json!({ "url": url }));
            outcome.applied += 1;
            return Ok(());
        }

        let guard = self
            .guard
            .clone()
            .or_else(installed_guard)
            .ok_or_else(|| {
                AdapterError::ValidationFailed(
                    "api.call requires an installed network guard".to_string(),
                )
            })?;

        let request = FetchRequest {
            method: params
                .method
                .clone()
                .unwrap_or_else(|| "GET".to_string()),
            url: url.to_string(),
            headers: params
                .headers
                .clone()
                .map(|headers| headers.into_iter().collect())
                .unwrap_or_default(),
            body: params
                .body
                .as_ref()
                .map(|body| bytes::Bytes::from(body.to_string())),
        };

        let response = guard
            .fetch(request)
            .await
            .map_err(|err| AdapterError::DomApplyFailed(err.to_string()))?;

        if response.blocked {
            outcome.denied_by_policy += 1;
            return Ok(());
        }

        if let Some(into) = params.into.as_deref() {
            let value: Value = serde_json::from_slice(&response.body).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&response.body).into_owned())
            });
            self.state
                .set(&self.bus, StateScope::Workspace, None, into, value);
        }
        outcome.applied += 1;
        Ok(())
    }
}

fn ops_hash(batch: &Batch) -> Option<String> {
    serde_json::to_vec(batch)
        .ok()
        .map(|bytes| format!("{:016x}", fnv1a64(&bytes)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::adapter::permission::PermissionScope;
    use crate::adapter::permission::ScopedGate;

    fn batch(value: Value) -> Batch {
        serde_json::from_value(value).unwrap()
    }

    fn notepad_batch() -> Batch {
        batch(json!([
            { "op": "window.create", "params": { "id": "w1", "title": "Notepad" } },
            { "op": "dom.set", "params": { "windowId": "w1", "target": "#root",
                "html": "<textarea name=\"notes\"></textarea>" } }
        ]))
    }

    #[tokio::test]
    async fn apply_batch_twice_is_idempotent() {
        let mut adapter = Adapter::new(TelemetryBus::new());
        let options = ApplyOptions::default();
        let b = notepad_batch();

        let first = adapter.apply_batch(&b, &options).await;
        assert!(first.success);
        assert_eq!(first.applied, 2);
        assert_eq!(first.skipped_duplicates, 0);
        let html_after_first = adapter.workspace_html();

        let second = adapter.apply_batch(&b, &options).await;
        assert!(second.success);
        // window.create on a known id is update semantics; the dom.set dedups.
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped_duplicates, 1);
        assert_eq!(adapter.workspace_html(), html_after_first);
    }

    #[tokio::test]
    async fn denied_scope_counts_and_continues() {
        let mut adapter = Adapter::new(TelemetryBus::new())
            .with_gate(Arc::new(ScopedGate::denying([PermissionScope::Dom])));
        let outcome = adapter
            .apply_batch(&notepad_batch(), &ApplyOptions::default())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.denied_by_policy, 1);
    }

    #[tokio::test]
    async fn lint_reject_stops_batch_and_emits() {
        let bus = TelemetryBus::new();
        let rejects = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let rejects_clone = std::sync::Arc::clone(&rejects);
        bus.subscribe(move |ev| {
            if ev.name == LINTER_REJECT {
                rejects_clone.lock().unwrap().push(ev.payload.clone());
            }
        });
        let mut adapter = Adapter::new(bus);
        let inert = batch(json!([
            { "op": "dom.append", "params": { "windowId": "w1", "target": "#root", "html": "Hello" } }
        ]));
        let outcome = adapter.apply_batch(&inert, &ApplyOptions::default()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.applied, 0);
        assert_eq!(rejects.lock().unwrap().len(), 1);
        assert_eq!(rejects.lock().unwrap()[0]["code"], json!("E-UICP-0402"));
    }

    #[tokio::test]
    async fn allow_partial_false_stops_at_first_failure() {
        let mut adapter = Adapter::new(TelemetryBus::new());
        let b = batch(json!([
            { "op": "window.create", "params": { "id": "w1", "title": "Win" } },
            { "op": "window.move", "params": { "id": "ghost", "x": 1.0, "y": 2.0 } },
            { "op": "window.focus", "params": { "id": "w1" } }
        ]));
        let outcome = adapter
            .apply_batch(
                &b,
                &ApplyOptions {
                    allow_partial: false,
                    skip_lint: false,
                },
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("Adapter.WindowNotFound"));
    }

    #[tokio::test]
    async fn state_round_trip_through_batch() {
        let mut adapter = Adapter::new(TelemetryBus::new());
        let b = batch(json!([
            { "op": "window.create", "params": { "id": "w1", "title": "Win" } },
            { "op": "state.set", "params": { "key": "draft", "value": { "text": "hi" } } },
            { "op": "state.patch", "params": { "key": "draft", "value": { "saved": true } } }
        ]));
        let outcome = adapter.apply_batch(&b, &ApplyOptions::default()).await;
        assert!(outcome.success);
        assert_eq!(
            adapter
                .state()
                .get(StateScope::Workspace, None, "draft")
                .unwrap(),
            &json!({ "text": "hi", "saved": true })
        );
    }

    #[tokio::test]
    async fn cancelled_txn_skips_following_ops() {
        let mut adapter = Adapter::new(TelemetryBus::new());
        let b = batch(json!([
            { "op": "txn.cancel", "params": { "id": "t1" } },
            { "op": "window.create", "params": { "id": "w1", "title": "Win" }, "txnId": "t1" },
            { "op": "window.create", "params": { "id": "w2", "title": "Other" }, "txnId": "t2" }
        ]));
        let outcome = adapter.apply_batch(&b, &ApplyOptions::default()).await;
        assert!(outcome.success);
        assert!(!adapter.windows().contains("w1"));
        assert!(adapter.windows().contains("w2"));
        assert_eq!(outcome.applied, 2);
    }

    #[tokio::test]
    async fn fs_write_denied_by_locked_policy() {
        let _guard = crate::policy::runtime::test_policy_lock();
        let mut adapter = Adapter::new(TelemetryBus::new());
        crate::policy::runtime::set_runtime_policy(crate::policy::Presets::locked());
        let b = batch(json!([
            { "op": "window.create", "params": { "id": "w1", "title": "Win" } },
            { "op": "api.call", "params": { "url": "tauri://fs/writeTextFile",
                "body": { "path": "a.txt", "contents": "x" } } }
        ]));
        let outcome = adapter.apply_batch(&b, &ApplyOptions::default()).await;
        crate::policy::runtime::reset_policy_for_tests();
        assert_eq!(outcome.denied_by_policy, 1);
    }

    #[tokio::test]
    async fn intent_scheme_emits_event() {
        let bus = TelemetryBus::new();
        let intents = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let intents_clone = std::sync::Arc::clone(&intents);
        bus.subscribe(move |ev| {
            if ev.name == "uicp-intent" {
                intents_clone.lock().unwrap().push(ev.payload.clone());
            }
        });
        let mut adapter = Adapter::new(bus);
        let b = batch(json!([
            { "op": "window.create", "params": { "id": "w1", "title": "Win" } },
            { "op": "api.call", "params": { "url": "uicp://intent",
                "body": { "prompt": "Which folder?" } } }
        ]));
        let outcome = adapter.apply_batch(&b, &ApplyOptions::default()).await;
        assert!(outcome.success);
        assert_eq!(intents.lock().unwrap().len(), 1);
    }
}
