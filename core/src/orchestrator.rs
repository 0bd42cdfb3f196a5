//! Two-phase planner/actor pipeline with timeouts, retries, degraded-mode
//! fallbacks and trace stamping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;
use tracing::warn;
use uicp_protocol::Batch;
use uicp_protocol::DomParams;
use uicp_protocol::Envelope;
use uicp_protocol::Operation;
use uicp_protocol::Plan;
use uicp_protocol::Risks;
use uicp_protocol::WindowCreateParams;
use uuid::Uuid;

use crate::adapter::Adapter;
use crate::adapter::ApplyOptions;
use crate::adapter::ApplyOutcome;
use crate::bridge::HostBridge;
use crate::bridge::open_chat_stream;
use crate::collector::collect_with_fallback;
use crate::collector::parse_tool_from_text;
use crate::error::Result;
use crate::error::UicpErr;
use crate::profile::ProfilePair;
use crate::schema::MAX_ACTOR_HINTS;
use crate::schema::validate_batch;
use crate::schema::validate_plan;
use crate::telemetry::TelemetryBus;
use crate::telemetry::UI_DEBUG_LOG;
use crate::tool_spec::EMIT_BATCH;
use crate::tool_spec::EMIT_PLAN;
use crate::util::escape_html;
use crate::util::slug;

const MAX_PHASE_ATTEMPTS: u32 = 2;

pub const NOTICE_PLANNER_FALLBACK: &str = "planner_fallback";
pub const NOTICE_ACTOR_FALLBACK: &str = "actor_fallback";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    pub plan_ms: u64,
    pub act_ms: u64,
}

#[derive(Debug)]
pub struct IntentOutcome {
    pub plan: Plan,
    pub batch: Batch,
    pub notice: Option<&'static str>,
    pub trace_id: String,
    pub timings: Timings,
    /// Channel-indexed text buffers accumulated across both phases.
    pub channels: Option<HashMap<String, String>>,
    /// Set when a structured clarifier plan short-circuited the actor.
    pub auto_apply: bool,
    pub failures: Vec<String>,
    pub apply_outcome: Option<ApplyOutcome>,
}

/// Optional per-run observers.
#[derive(Default)]
pub struct IntentHooks {
    pub on_phase: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_plan: Option<Box<dyn Fn(&Plan) + Send + Sync>>,
}

pub struct Orchestrator {
    bridge: Arc<dyn HostBridge>,
    profiles: ProfilePair,
    bus: TelemetryBus,
    adapter: Option<Arc<tokio::sync::Mutex<Adapter>>>,
}

impl Orchestrator {
    pub fn new(bridge: Arc<dyn HostBridge>, bus: TelemetryBus) -> Self {
        Self {
            bridge,
            profiles: ProfilePair::default(),
            bus,
            adapter: None,
        }
    }

    pub fn with_profiles(mut self, profiles: ProfilePair) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<tokio::sync::Mutex<Adapter>>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Runs one intent through plan → act. Phase failures degrade rather than
    /// surface: a dead planner yields an actor-only run, a dead actor yields
    /// a safe error window.
    pub async fn run_intent(
        &self,
        text: &str,
        apply_now: bool,
        hooks: Option<&IntentHooks>,
    ) -> Result<IntentOutcome> {
        let trace_id = Uuid::new_v4().to_string();
        let txn_id = Uuid::new_v4().to_string();
        let mut failures = Vec::new();
        let mut channels: HashMap<String, String> = HashMap::new();
        let mut notice = None;

        self.breadcrumb(&trace_id, "intent", serde_json::json!({ "chars": text.len() }));
        if let Some(on_phase) = hooks.and_then(|h| h.on_phase.as_ref()) {
            on_phase("planner");
        }

        let plan_started = Instant::now();
        let mut plan = match self
            .run_planner(text, &trace_id, &mut failures, &mut channels)
            .await
        {
            Ok(plan) => plan,
            Err(err) => {
                notice = Some(NOTICE_PLANNER_FALLBACK);
                let message = err.to_string();
                warn!("planner degraded: {message}");
                failures.push(message.clone());
                Plan {
                    summary: "Planner degraded: using actor-only".to_string(),
                    risks: Some(Risks::Many(vec![format!("planner_error: {message}")])),
                    actor_hints: Vec::new(),
                    batch: Vec::new(),
                }
            }
        };
        let plan_ms = plan_started.elapsed().as_millis() as u64;
        if let Some(on_plan) = hooks.and_then(|h| h.on_plan.as_ref()) {
            on_plan(&plan);
        }

        // A structured clarifier skips the actor and applies directly.
        if is_clarifier_plan(&plan) {
            let mut batch = plan.batch.clone();
            stamp_batch(&mut batch, &trace_id, &txn_id);
            let apply_outcome = self
                .apply(
                    &batch,
                    &ApplyOptions {
                        allow_partial: true,
                        skip_lint: true,
                    },
                )
                .await;
            self.breadcrumb(&trace_id, "clarifier", serde_json::json!({ "ops": batch.len() }));
            return Ok(IntentOutcome {
                plan,
                batch,
                notice,
                trace_id,
                timings: Timings {
                    plan_ms,
                    act_ms: 0,
                },
                channels: non_empty(channels),
                auto_apply: true,
                failures,
                apply_outcome,
            });
        }

        if let Some(on_phase) = hooks.and_then(|h| h.on_phase.as_ref()) {
            on_phase("actor");
        }
        let act_started = Instant::now();
        let batch = match self
            .run_actor(text, &plan, &trace_id, &mut failures, &mut channels)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                notice = Some(NOTICE_ACTOR_FALLBACK);
                let message = err.to_string();
                warn!("actor degraded: {message}");
                failures.push(message.clone());
                actor_fallback_batch(&message)
            }
        };
        let act_ms = act_started.elapsed().as_millis() as u64;

        augment_plan_hints(&mut plan);

        let mut batch = batch;
        stamp_batch(&mut batch, &trace_id, &txn_id);

        let apply_outcome = if apply_now {
            self.apply(&batch, &ApplyOptions::default()).await
        } else {
            None
        };

        self.breadcrumb(
            &trace_id,
            "done",
            serde_json::json!({
                "ops": batch.len(),
                "notice": notice,
                "planMs": plan_ms,
                "actMs": act_ms,
            }),
        );

        Ok(IntentOutcome {
            plan,
            batch,
            notice,
            trace_id,
            timings: Timings { plan_ms, act_ms },
            channels: non_empty(channels),
            auto_apply: false,
            failures,
            apply_outcome,
        })
    }

    /// Raises `E-UICP-1200` once every attempt is spent; `run_intent`
    /// catches it and degrades.
    async fn run_planner(
        &self,
        text: &str,
        trace_id: &str,
        failures: &mut Vec<String>,
        channels: &mut HashMap<String, String>,
    ) -> Result<Plan> {
        let profile = &self.profiles.planner;
        for attempt in 1..=MAX_PHASE_ATTEMPTS {
            self.breadcrumb(trace_id, "planner_attempt", serde_json::json!({ "attempt": attempt }));
            let mut stream =
                open_chat_stream(Arc::clone(&self.bridge), profile.planner_request(text));
            let collected = match collect_with_fallback(
                &mut stream,
                EMIT_PLAN,
                profile.timeout,
                "planner",
                &self.bus,
            )
            .await
            {
                Ok(collected) => collected,
                Err(UicpErr::CollectionTimeout(elapsed, _)) => {
                    failures.push(
                        UicpErr::PhaseTimeout {
                            phase: "planner",
                            elapsed,
                        }
                        .to_string(),
                    );
                    continue;
                }
                Err(err) => {
                    failures.push(err.to_string());
                    continue;
                }
            };
            merge_channels(channels, &collected.channels);

            let candidate = collected
                .tool_result
                .or_else(|| parse_tool_from_text(&collected.text_content));
            let Some(candidate) = candidate else {
                failures.push("planner produced no parsable output".to_string());
                continue;
            };
            match validate_plan(&candidate) {
                Ok(plan) => return Ok(plan),
                Err(err) => failures.push(err.to_string()),
            }
        }
        let last = failures
            .last()
            .cloned()
            .unwrap_or_else(|| "no usable planner output".to_string());
        Err(UicpErr::PlannerFailed(last))
    }

    /// Raises `E-UICP-1201` once every attempt is spent; `run_intent`
    /// catches it and renders the safe error window instead.
    async fn run_actor(
        &self,
        text: &str,
        plan: &Plan,
        trace_id: &str,
        failures: &mut Vec<String>,
        channels: &mut HashMap<String, String>,
    ) -> Result<Batch> {
        let profile = &self.profiles.actor;
        let plan_context = plan_context(plan);
        for attempt in 1..=MAX_PHASE_ATTEMPTS {
            self.breadcrumb(trace_id, "actor_attempt", serde_json::json!({ "attempt": attempt }));
            let mut stream = open_chat_stream(
                Arc::clone(&self.bridge),
                profile.actor_request(text, &plan_context),
            );
            let collected = match collect_with_fallback(
                &mut stream,
                EMIT_BATCH,
                profile.timeout,
                "actor",
                &self.bus,
            )
            .await
            {
                Ok(collected) => collected,
                Err(UicpErr::CollectionTimeout(elapsed, _)) => {
                    failures.push(
                        UicpErr::PhaseTimeout {
                            phase: "actor",
                            elapsed,
                        }
                        .to_string(),
                    );
                    continue;
                }
                Err(err) => {
                    failures.push(err.to_string());
                    continue;
                }
            };
            merge_channels(channels, &collected.channels);

            let candidate = collected
                .tool_result
                .or_else(|| parse_tool_from_text(&collected.text_content));
            let Some(candidate) = candidate else {
                failures.push("actor produced no parsable output".to_string());
                continue;
            };
            match validate_batch(&candidate) {
                Ok(batch) if batch.is_empty() => {
                    failures.push("actor emitted an empty batch".to_string());
                }
                Ok(batch) => return Ok(batch),
                Err(err) => failures.push(err.to_string()),
            }
        }
        let last = failures
            .last()
            .cloned()
            .unwrap_or_else(|| "no usable actor output".to_string());
        Err(UicpErr::ActorFailed(last))
    }

    async fn apply(&self, batch: &Batch, options: &ApplyOptions) -> Option<ApplyOutcome> {
        let adapter = self.adapter.as_ref()?;
        let mut adapter = adapter.lock().await;
        Some(adapter.apply_batch(batch, options).await)
    }

    fn breadcrumb(&self, trace_id: &str, event: &str, payload: Value) {
        debug!(trace_id, event, "orchestrator breadcrumb");
        self.bus.emit_traced(
            UI_DEBUG_LOG,
            Some(trace_id.to_string()),
            None,
            serde_json::json!({ "event": event, "detail": payload }),
        );
    }
}

fn plan_context(plan: &Plan) -> String {
    let mut out = format!("Summary: {}", plan.summary);
    let risks = plan.risk_list();
    if !risks.is_empty() {
        out.push_str(&format!("\nRisks: {}", risks.join("; ")));
    }
    if !plan.actor_hints.is_empty() {
        out.push_str(&format!("\nHints: {}", plan.actor_hints.join("; ")));
    }
    if !plan.batch.is_empty() {
        out.push_str(&format!("\nSketch ops: {}", plan.batch.len()));
    }
    out
}

/// Summary ends with a question mark, the risks carry the clarifier token,
/// and the batch is exactly one `api.call` back into the intent channel.
fn is_clarifier_plan(plan: &Plan) -> bool {
    plan.summary.trim_end().ends_with('?')
        && plan.has_clarifier_risk()
        && plan.batch.len() == 1
        && matches!(
            &plan.batch[0].op,
            Operation::ApiCall(params) if params.url.starts_with("uicp://intent")
        )
}

/// Deterministic hints appended after both phases: a stable window id derived
/// from the summary slug, and an accessible status region.
fn augment_plan_hints(plan: &mut Plan) {
    let window_hint = format!("reuse window id `win-{}`", slug(&plan.summary));
    let aria_hint = "include an aria-live=\"polite\" status region".to_string();
    for hint in [window_hint, aria_hint] {
        if !plan.actor_hints.contains(&hint) && plan.actor_hints.len() < MAX_ACTOR_HINTS {
            plan.actor_hints.push(hint);
        }
    }
}

/// Safe two-op replacement when the actor produced nothing usable.
fn actor_fallback_batch(message: &str) -> Batch {
    let window_id = "action-failed".to_string();
    vec![
        Envelope::new(Operation::WindowCreate(WindowCreateParams {
            id: Some(window_id.clone()),
            title: "Action Failed".to_string(),
            x: None,
            y: None,
            width: Some(420.0),
            height: Some(220.0),
            z_index: None,
        })),
        Envelope::new(Operation::DomSet(DomParams {
            window_id: Some(window_id),
            target: "#root".to_string(),
            html: format!(
                "<div class=\"uicp-error\" role=\"alert\"><p>Unable to apply plan: {}</p></div>",
                escape_html(message)
            ),
            sanitize: None,
        })),
    ]
}

/// Fills missing idempotency/trace/txn ids; existing ids are never rewritten.
fn stamp_batch(batch: &mut Batch, trace_id: &str, txn_id: &str) {
    for envelope in batch {
        if envelope.idempotency_key.is_none() {
            envelope.idempotency_key = Some(Uuid::new_v4().to_string());
        }
        if envelope.trace_id.is_none() {
            envelope.trace_id = Some(trace_id.to_string());
        }
        if envelope.txn_id.is_none() {
            envelope.txn_id = Some(txn_id.to_string());
        }
    }
}

fn merge_channels(into: &mut HashMap<String, String>, from: &HashMap<String, String>) {
    for (channel, text) in from {
        into.entry(channel.clone()).or_default().push_str(text);
    }
}

fn non_empty(channels: HashMap<String, String>) -> Option<HashMap<String, String>> {
    if channels.is_empty() {
        None
    } else {
        Some(channels)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn fallback_batch_shape_matches_contract() {
        let batch = actor_fallback_batch("boom <script>");
        assert_eq!(batch.len(), 2);
        match &batch[0].op {
            Operation::WindowCreate(params) => assert_eq!(params.title, "Action Failed"),
            other => panic!("unexpected first op: {other:?}"),
        }
        match &batch[1].op {
            Operation::DomSet(params) => {
                assert!(params.html.contains("Unable to apply plan"));
                assert!(params.html.contains("&lt;script&gt;"));
            }
            other => panic!("unexpected second op: {other:?}"),
        }
    }

    #[test]
    fn stamping_fills_only_missing_ids() {
        let mut batch: Batch = serde_json::from_value(json!([
            { "op": "window.focus", "params": { "id": "w1" }, "idempotencyKey": "keep-me" },
            { "op": "window.focus", "params": { "id": "w2" } }
        ]))
        .unwrap();
        stamp_batch(&mut batch, "trace-1", "txn-1");
        assert_eq!(batch[0].idempotency_key.as_deref(), Some("keep-me"));
        assert_eq!(batch[0].trace_id.as_deref(), Some("trace-1"));
        assert!(batch[1].idempotency_key.is_some());
        assert_eq!(batch[1].txn_id.as_deref(), Some("txn-1"));
    }

    #[test]
    fn clarifier_detection_requires_all_three_signals() {
        let clarifier: Plan = serde_json::from_value(json!({
            "summary": "Which folder should notes live in?",
            "risks": ["clarifier"],
            "batch": [{ "op": "api.call", "params": { "url": "uicp://intent",
                "body": { "prompt": "Which folder?" } } }]
        }))
        .unwrap();
        assert!(is_clarifier_plan(&clarifier));

        let no_question: Plan = serde_json::from_value(json!({
            "summary": "Create a notepad",
            "risks": ["clarifier"],
            "batch": [{ "op": "api.call", "params": { "url": "uicp://intent" } }]
        }))
        .unwrap();
        assert!(!is_clarifier_plan(&no_question));

        let wrong_batch: Plan = serde_json::from_value(json!({
            "summary": "Which folder?",
            "risks": ["clarifier"],
            "batch": [{ "op": "window.create", "params": { "title": "x" } }]
        }))
        .unwrap();
        assert!(!is_clarifier_plan(&wrong_batch));
    }

    #[test]
    fn hint_augmentation_is_idempotent_and_capped() {
        let mut plan = Plan {
            summary: "Create a notepad".to_string(),
            ..Plan::default()
        };
        augment_plan_hints(&mut plan);
        let after_first = plan.actor_hints.clone();
        assert_eq!(after_first.len(), 2);
        assert!(after_first[0].contains("win-create-a-notepad"));
        augment_plan_hints(&mut plan);
        assert_eq!(plan.actor_hints, after_first);
    }
}
