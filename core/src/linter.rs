//! Pre-apply batch gate.
//!
//! Rejects low-value batches before they touch the DOM: no visible effect,
//! dangling window references, inert text-only appends, unpaired compute
//! requests, and first renders that bypass `#root`. Runs at the plan
//! boundary; the adapter does not paper over violations afterwards.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;
use uicp_protocol::Batch;
use uicp_protocol::Envelope;
use uicp_protocol::Operation;

use crate::error::LintReject;

/// Markup that makes an appended fragment interactive rather than inert.
static INTERACTIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"data-command=",
        r"<button",
        r"<input",
        r"<textarea",
        r"<select",
        r"<form",
        r#"<a\s+[^>]*href="http"#,
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

fn is_visual(envelope: &Envelope) -> bool {
    matches!(
        envelope.op,
        Operation::WindowCreate(_)
            | Operation::WindowUpdate(_)
            | Operation::DomSet(_)
            | Operation::DomReplace(_)
            | Operation::DomAppend(_)
            | Operation::ComponentRender(_)
            | Operation::ComponentUpdate(_)
    )
}

/// Gate a batch before application. `known_windows` carries the ids of
/// windows already live in the workspace so follow-up batches can address
/// them without re-creating.
pub fn lint_batch(batch: &Batch, known_windows: &HashSet<String>) -> Result<(), LintReject> {
    // Empty batches and pure cancellations pass.
    if batch.is_empty()
        || batch
            .iter()
            .all(|envelope| matches!(envelope.op, Operation::TxnCancel(_)))
    {
        return Ok(());
    }

    let created_ids: HashSet<&str> = batch
        .iter()
        .filter_map(|envelope| match &envelope.op {
            Operation::WindowCreate(params) => params.id.as_deref(),
            _ => None,
        })
        .collect();
    let has_window_create = batch
        .iter()
        .any(|envelope| matches!(envelope.op, Operation::WindowCreate(_)));

    let has_visual = batch.iter().any(is_visual);
    let watched_keys: HashSet<&str> = batch
        .iter()
        .filter_map(|envelope| match &envelope.op {
            Operation::StateWatch(params) => Some(params.key.as_str()),
            _ => None,
        })
        .collect();
    let has_watched_sink = batch.iter().any(|envelope| match &envelope.op {
        Operation::ApiCall(params) => params
            .into
            .as_deref()
            .map(|key| watched_keys.contains(key))
            .unwrap_or(false),
        _ => false,
    });
    let has_needs_code = batch
        .iter()
        .any(|envelope| matches!(envelope.op, Operation::NeedsCode(_)));

    // 0404: a compute request needs an observable effect, either UI or an
    // api.call writing into a watched state key.
    if has_needs_code && !has_visual && !has_watched_sink {
        return Err(LintReject {
            code: "E-UICP-0404",
            reason: "needs.code without a visible effect or a watched sink".to_string(),
            hint: "pair the compute request with UI or an api.call into a watched state key"
                .to_string(),
        });
    }

    // 0401: the batch must do something a user can observe. A compute batch
    // wired into a watched sink counts.
    if !has_visual && !(has_needs_code && has_watched_sink) {
        return Err(LintReject {
            code: "E-UICP-0401",
            reason: "batch has no visible effect".to_string(),
            hint: "include a window.create, dom.* or component.render op".to_string(),
        });
    }

    // 0402: DOM ops must address a window this batch creates or one that
    // already exists.
    for envelope in batch {
        let (Operation::DomSet(params) | Operation::DomReplace(params) | Operation::DomAppend(params)) =
            &envelope.op
        else {
            continue;
        };
        if params.target.trim().is_empty() {
            continue;
        }
        let window_ref = params.window_id.as_deref().or(envelope.window_id.as_deref());
        let established = match window_ref {
            None => has_window_create,
            Some(id) => {
                created_ids.contains(id) || known_windows.contains(id) || has_window_create
            }
        };
        if !established {
            return Err(LintReject {
                code: "E-UICP-0402",
                reason: format!(
                    "dom op targets `{}` but no window is established for it",
                    params.target
                ),
                hint: "create the window in this batch or address an existing window id"
                    .to_string(),
            });
        }
    }

    // 0403: append-only batches must produce something interactive.
    let visual_ops: Vec<&Envelope> = batch.iter().filter(|e| is_visual(e)).collect();
    let all_appends = !visual_ops.is_empty()
        && visual_ops
            .iter()
            .all(|envelope| matches!(envelope.op, Operation::DomAppend(_)));
    if all_appends {
        let inert = visual_ops.iter().all(|envelope| {
            envelope
                .html()
                .map(|html| !INTERACTIVE_PATTERNS.iter().any(|re| re.is_match(html)))
                .unwrap_or(true)
        });
        if inert {
            return Err(LintReject {
                code: "E-UICP-0403",
                reason: "append-only batch carries inert text".to_string(),
                hint: "render interactive markup or use dom.set to build real UI".to_string(),
            });
        }
    }

    // 0406: without a window.create, DOM ops may only target the root.
    if !has_window_create {
        for envelope in batch {
            let (Operation::DomSet(params)
            | Operation::DomReplace(params)
            | Operation::DomAppend(params)) = &envelope.op
            else {
                continue;
            };
            if params.target != "#root" {
                return Err(LintReject {
                    code: "E-UICP-0406",
                    reason: format!(
                        "first render must target `#root`, got `{}`",
                        params.target
                    ),
                    hint: "target #root or create the window in the same batch".to_string(),
                });
            }
        }
    }

    // 0407: window ids must be consistent with the created window.
    if has_window_create && !created_ids.is_empty() {
        for envelope in batch {
            let referenced = match &envelope.op {
                Operation::DomSet(params)
                | Operation::DomReplace(params)
                | Operation::DomAppend(params) => params.window_id.as_deref(),
                Operation::ComponentRender(params) => Some(params.window_id.as_str()),
                _ => None,
            };
            if let Some(id) = referenced
                && !created_ids.contains(id)
                && !known_windows.contains(id)
            {
                return Err(LintReject {
                    code: "E-UICP-0407",
                    reason: format!(
                        "op references window `{id}` but the batch creates {created_ids:?}"
                    ),
                    hint: "reference the id passed to window.create".to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn batch(value: serde_json::Value) -> Batch {
        serde_json::from_value(value).unwrap()
    }

    fn no_windows() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn empty_and_cancel_only_batches_pass() {
        assert!(lint_batch(&Vec::new(), &no_windows()).is_ok());
        let cancels = batch(json!([{ "op": "txn.cancel", "params": {} }]));
        assert!(lint_batch(&cancels, &no_windows()).is_ok());
    }

    #[test]
    fn rejects_no_visible_effect() {
        let b = batch(json!([
            { "op": "state.set", "params": { "key": "k", "value": 1 } }
        ]));
        let err = lint_batch(&b, &no_windows()).unwrap_err();
        assert_eq!(err.code, "E-UICP-0401");
    }

    #[test]
    fn rejects_dangling_window_reference() {
        // Seed case: append into a window nothing established.
        let b = batch(json!([
            { "op": "dom.append", "params": { "windowId": "w1", "target": "#root", "html": "Hello world" } }
        ]));
        let err = lint_batch(&b, &no_windows()).unwrap_err();
        assert_eq!(err.code, "E-UICP-0402");
    }

    #[test]
    fn known_window_satisfies_0402_but_0403_still_applies() {
        let known: HashSet<String> = ["w1".to_string()].into_iter().collect();
        let b = batch(json!([
            { "op": "dom.append", "params": { "windowId": "w1", "target": "#root", "html": "Hello world" } }
        ]));
        let err = lint_batch(&b, &known).unwrap_err();
        assert_eq!(err.code, "E-UICP-0403");
    }

    #[test]
    fn interactive_append_passes() {
        let known: HashSet<String> = ["w1".to_string()].into_iter().collect();
        let b = batch(json!([
            { "op": "dom.append", "params": { "windowId": "w1", "target": "#root",
                "html": "<button data-command=\"save\">Save</button>" } }
        ]));
        assert!(lint_batch(&b, &known).is_ok());
    }

    #[test]
    fn rejects_needs_code_without_sink() {
        let b = batch(json!([
            { "op": "needs.code", "params": { "description": "crunch numbers" } }
        ]));
        let err = lint_batch(&b, &no_windows()).unwrap_err();
        assert_eq!(err.code, "E-UICP-0404");

        // A watched sink makes a UI-less compute batch observable.
        let with_sink = batch(json!([
            { "op": "state.watch", "params": { "key": "result" } },
            { "op": "api.call", "params": { "url": "uicp://compute.call", "into": "result" } },
            { "op": "needs.code", "params": { "description": "crunch numbers" } }
        ]));
        assert!(lint_batch(&with_sink, &no_windows()).is_ok());
    }

    #[test]
    fn rejects_first_render_off_root() {
        let known: HashSet<String> = ["w1".to_string()].into_iter().collect();
        let b = batch(json!([
            { "op": "dom.set", "params": { "windowId": "w1", "target": "#sidebar", "html": "<p>x</p>" } }
        ]));
        let err = lint_batch(&b, &known).unwrap_err();
        assert_eq!(err.code, "E-UICP-0406");
    }

    #[test]
    fn rejects_mismatched_window_ids() {
        let b = batch(json!([
            { "op": "window.create", "params": { "id": "w1", "title": "Win" } },
            { "op": "dom.set", "params": { "windowId": "w2", "target": "#root", "html": "<p>x</p>" } }
        ]));
        let err = lint_batch(&b, &no_windows()).unwrap_err();
        assert_eq!(err.code, "E-UICP-0407");
    }

    #[test]
    fn consistent_create_and_set_passes() {
        let b = batch(json!([
            { "op": "window.create", "params": { "id": "w1", "title": "Win" } },
            { "op": "dom.set", "params": { "windowId": "w1", "target": "#root", "html": "<p>x</p>" } }
        ]));
        assert!(lint_batch(&b, &no_windows()).is_ok());
    }
}
