//! End-to-end planner → actor pipeline scenarios against a scripted bridge.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use serde_json::json;
use uicp_core::Orchestrator;
use uicp_core::TelemetryBus;
use uicp_core::orchestrator::NOTICE_ACTOR_FALLBACK;
use uicp_core::orchestrator::NOTICE_PLANNER_FALLBACK;
use uicp_protocol::Operation;

use common::ScriptedBridge;
use common::content_chunk;
use common::tool_call_chunk;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_plan_then_act() {
    let planner_args = json!({
        "summary": "Create notepad",
        "batch": [{ "op": "window.create", "params": { "id": "win-notepad", "title": "Notepad" } }]
    });
    let actor_args = json!({
        "batch": [{ "op": "window.create", "params": { "id": "win-notepad", "title": "Notepad" } }]
    });
    let bridge = ScriptedBridge::new(vec![
        vec![tool_call_chunk("emit_plan", &planner_args)],
        vec![tool_call_chunk("emit_batch", &actor_args)],
    ]);

    let orchestrator = Orchestrator::new(bridge.clone(), TelemetryBus::new());
    let outcome = orchestrator
        .run_intent("make a notepad", false, None)
        .await
        .expect("pipeline");

    assert!(outcome.notice.is_none());
    assert!(outcome.plan.summary.to_lowercase().contains("notepad"));
    assert_eq!(outcome.batch.len(), 1);
    assert_eq!(bridge.invocation_count(), 2);

    // Stamped ids are present and shared across the batch.
    let first = &outcome.batch[0];
    assert_eq!(first.trace_id.as_deref(), Some(outcome.trace_id.as_str()));
    assert!(first.idempotency_key.is_some());
    assert!(first.txn_id.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn planner_fallback_degrades_to_actor_only() {
    // Planner yields only an empty return; both attempts come up dry.
    let empty_return = json!({ "kind": "json", "delta": { "type": "return", "result": "" } });
    let actor_args = json!({
        "batch": [{ "op": "window.create", "params": { "id": "w1", "title": "Win" } }]
    });
    let bridge = ScriptedBridge::new(vec![
        vec![empty_return.clone()],
        vec![empty_return],
        vec![tool_call_chunk("emit_batch", &actor_args)],
    ]);

    let orchestrator = Orchestrator::new(bridge.clone(), TelemetryBus::new());
    let outcome = orchestrator
        .run_intent("make something", false, None)
        .await
        .expect("pipeline");

    assert_eq!(outcome.notice, Some(NOTICE_PLANNER_FALLBACK));
    assert!(outcome
        .plan
        .risk_list()
        .iter()
        .any(|risk| risk.starts_with("planner_error:")));
    assert_eq!(outcome.batch.len(), 1);
    for envelope in &outcome.batch {
        assert!(envelope.trace_id.is_some());
        assert!(envelope.txn_id.is_some());
        assert!(envelope.idempotency_key.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actor_fallback_renders_error_window() {
    let planner_args = json!({ "summary": "Create notepad", "batch": [] });
    let bridge = ScriptedBridge::new(vec![
        vec![tool_call_chunk("emit_plan", &planner_args)],
        // Two actor attempts, neither parsable.
        vec![content_chunk("sorry, I cannot help with that")],
        vec![content_chunk("still nothing structured")],
    ]);

    let orchestrator = Orchestrator::new(bridge.clone(), TelemetryBus::new());
    let outcome = orchestrator
        .run_intent("make a notepad", false, None)
        .await
        .expect("pipeline");

    assert_eq!(outcome.notice, Some(NOTICE_ACTOR_FALLBACK));
    assert_eq!(outcome.batch.len(), 2);
    match &outcome.batch[0].op {
        Operation::WindowCreate(params) => assert_eq!(params.title, "Action Failed"),
        other => panic!("unexpected first op: {other:?}"),
    }
    match &outcome.batch[1].op {
        Operation::DomSet(params) => {
            assert!(params.html.contains("Unable to apply plan"));
        }
        other => panic!("unexpected second op: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clarifier_plan_skips_actor_and_auto_applies() {
    let planner_args = json!({
        "summary": "Which folder should the notes live in?",
        "risks": ["clarifier"],
        "batch": [{ "op": "api.call", "params": { "url": "uicp://intent",
            "body": { "prompt": "Which folder?", "fields": [{ "name": "folder" }] } } }]
    });
    let bridge = ScriptedBridge::new(vec![vec![tool_call_chunk("emit_plan", &planner_args)]]);

    let orchestrator = Orchestrator::new(bridge.clone(), TelemetryBus::new());
    let outcome = orchestrator
        .run_intent("save my notes", false, None)
        .await
        .expect("pipeline");

    assert!(outcome.auto_apply);
    assert_eq!(outcome.batch.len(), 1);
    // The actor phase never ran.
    assert_eq!(bridge.invocation_count(), 1);
    assert_eq!(outcome.timings.act_ms, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channels_surface_in_outcome() {
    let planner_args = json!({ "summary": "Create notepad", "batch": [] });
    let actor_args = json!({
        "batch": [{ "op": "window.create", "params": { "id": "w1", "title": "Notepad" } }]
    });
    let harmony = json!({
        "kind": "text",
        "delta": "<|start|>assistant<|channel|>analysis<|message|>thinking<|end|>"
    });
    let bridge = ScriptedBridge::new(vec![
        vec![harmony, tool_call_chunk("emit_plan", &planner_args)],
        vec![tool_call_chunk("emit_batch", &actor_args)],
    ]);

    let orchestrator = Orchestrator::new(bridge, TelemetryBus::new());
    let outcome = orchestrator
        .run_intent("make a notepad", false, None)
        .await
        .expect("pipeline");

    let channels = outcome.channels.expect("channels present");
    assert_eq!(channels.get("analysis").map(String::as_str), Some("thinking"));
}
