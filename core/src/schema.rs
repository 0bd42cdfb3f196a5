//! Semantic validation for plans, batches and envelopes on top of the serde
//! structural layer.

use std::collections::HashSet;

use serde_json::Value;
use uicp_protocol::Batch;
use uicp_protocol::Envelope;
use uicp_protocol::Operation;
use uicp_protocol::Plan;

use crate::error::Result;
use crate::error::ValidationError;

/// Batches longer than this are rejected outright.
pub const MAX_BATCH_OPS: usize = 64;
/// Cumulative HTML payload budget across a batch.
pub const MAX_BATCH_HTML_BYTES: usize = 1024 * 1024;
/// Per-operation HTML cap for `dom.*`.
pub const MAX_OP_HTML_BYTES: usize = 64 * 1024;
pub const MAX_ACTOR_HINTS: usize = 20;

/// URL schemes an `api.call` may address.
const ALLOWED_URL_PREFIXES: &[&str] = &[
    "https://",
    "http://",
    "mailto:",
    "uicp://intent",
    "uicp://compute.call",
    "tauri://fs/writeTextFile",
];

/// Decodes and validates a planner payload.
pub fn validate_plan(value: &Value) -> Result<Plan> {
    let plan: Plan = serde_json::from_value(value.clone()).map_err(|err| {
        ValidationError::new("E-UICP-0410", "plan failed schema decode").with_detail(err.to_string())
    })?;

    if plan.summary.trim().is_empty() {
        return Err(ValidationError::new("E-UICP-0416", "plan summary must be non-empty").into());
    }
    if plan.actor_hints.len() > MAX_ACTOR_HINTS {
        return Err(ValidationError::new(
            "E-UICP-0417",
            format!(
                "plan carries {} actor hints, max {MAX_ACTOR_HINTS}",
                plan.actor_hints.len()
            ),
        )
        .into());
    }
    validate_batch_ops(&plan.batch)?;
    Ok(plan)
}

/// Decodes and validates an actor batch payload. Accepts either a bare array
/// of envelopes or an object with a `batch` field.
pub fn validate_batch(value: &Value) -> Result<Batch> {
    let payload = match value {
        Value::Object(map) if map.contains_key("batch") => &map["batch"],
        other => other,
    };
    let batch: Batch = serde_json::from_value(payload.clone()).map_err(|err| {
        ValidationError::new("E-UICP-0410", "batch failed schema decode")
            .with_detail(err.to_string())
    })?;
    validate_batch_ops(&batch)?;
    Ok(batch)
}

/// Semantic checks over an already-decoded batch.
pub fn validate_batch_ops(batch: &Batch) -> Result<()> {
    if batch.len() > MAX_BATCH_OPS {
        return Err(ValidationError::new(
            "E-UICP-0413",
            format!("batch has {} ops, max {MAX_BATCH_OPS}", batch.len()),
        )
        .into());
    }

    let mut html_total = 0usize;
    let mut seen_keys: HashSet<&str> = HashSet::new();
    for envelope in batch {
        validate_envelope(envelope)?;
        html_total += envelope.html().map(str::len).unwrap_or(0);
        if let Some(key) = envelope.idempotency_key.as_deref()
            && !seen_keys.insert(key)
        {
            return Err(ValidationError::new(
                "E-UICP-0415",
                format!("duplicate idempotency key `{key}` within batch"),
            )
            .into());
        }
    }
    if html_total > MAX_BATCH_HTML_BYTES {
        return Err(ValidationError::new(
            "E-UICP-0414",
            format!("batch HTML payload {html_total} bytes exceeds {MAX_BATCH_HTML_BYTES}"),
        )
        .into());
    }
    Ok(())
}

/// Operation-specific parameter checks the type system cannot express.
pub fn validate_envelope(envelope: &Envelope) -> Result<()> {
    if let Some(html) = envelope.html()
        && html.len() > MAX_OP_HTML_BYTES
    {
        return Err(ValidationError::new(
            "E-UICP-0412",
            format!(
                "{} HTML payload {} bytes exceeds {MAX_OP_HTML_BYTES}",
                envelope.op_name(),
                html.len()
            ),
        )
        .into());
    }

    match &envelope.op {
        Operation::WindowCreate(p) => {
            if p.title.trim().is_empty() {
                return Err(
                    ValidationError::new("E-UICP-0410", "window.create requires a title").into(),
                );
            }
        }
        Operation::DomSet(p) | Operation::DomReplace(p) | Operation::DomAppend(p) => {
            if p.target.trim().is_empty() {
                return Err(ValidationError::new(
                    "E-UICP-0410",
                    format!("{} requires a non-empty target", envelope.op_name()),
                )
                .into());
            }
        }
        Operation::ComponentRender(p) => {
            if p.component_type.trim().is_empty() {
                return Err(ValidationError::new(
                    "E-UICP-0410",
                    "component.render requires a type",
                )
                .into());
            }
        }
        Operation::StateSet(p) | Operation::StatePatch(p) => {
            if p.key.trim().is_empty() {
                return Err(ValidationError::new(
                    "E-UICP-0410",
                    format!("{} requires a non-empty key", envelope.op_name()),
                )
                .into());
            }
        }
        Operation::StateGet(p)
        | Operation::StateWatch(p)
        | Operation::StateUnwatch(p) => {
            if p.key.trim().is_empty() {
                return Err(ValidationError::new(
                    "E-UICP-0410",
                    format!("{} requires a non-empty key", envelope.op_name()),
                )
                .into());
            }
        }
        Operation::ApiCall(p) => {
            let url = p.url.trim();
            let allowed = ALLOWED_URL_PREFIXES
                .iter()
                .any(|prefix| url.starts_with(prefix));
            if !allowed {
                return Err(ValidationError::new(
                    "E-UICP-0411",
                    format!("api.call url `{url}` uses a disallowed scheme"),
                )
                .into());
            }
        }
        _ => {}
    }
    Ok(())
}
