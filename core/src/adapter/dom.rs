//! Sanitized DOM application with content-hash dedup.

use uicp_protocol::DomParams;

use crate::adapter::window::WindowManager;
use crate::adapter::workspace::NodeId;
use crate::adapter::workspace::WorkspaceDom;
use crate::error::AdapterError;
use crate::sanitize::sanitize_html_strict;
use crate::util::fnv1a64;

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomMode {
    Set,
    Replace,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomOutcome {
    Applied,
    /// Identical content for the same scope/target; treated as success.
    SkippedDuplicate,
}

#[derive(Debug, Default)]
pub struct DomApplier {
    /// Last applied content hash keyed by `scope:target`.
    last_hashes: HashMap<String, u64>,
}

impl DomApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &mut self,
        dom: &mut WorkspaceDom,
        windows: &WindowManager,
        mode: DomMode,
        params: &DomParams,
    ) -> Result<DomOutcome, AdapterError> {
        let (scope_key, scope_node) = resolve_scope(dom, windows, params.window_id.as_deref())?;
        let target_node = resolve_target(dom, scope_node, &params.target).ok_or_else(|| {
            AdapterError::TargetNotFound {
                window: scope_key.clone(),
                target: params.target.clone(),
            }
        })?;

        let html = if params.sanitize == Some(false) {
            params.html.clone()
        } else {
            sanitize_html_strict(&params.html).into_string()
        };

        // Idempotence: set/replace with unchanged content is a no-op.
        let hash_key = format!("{scope_key}:{}", params.target);
        let hash = fnv1a64(html.as_bytes());
        if matches!(mode, DomMode::Set | DomMode::Replace)
            && self.last_hashes.get(&hash_key) == Some(&hash)
        {
            return Ok(DomOutcome::SkippedDuplicate);
        }

        match mode {
            DomMode::Set => dom.set_inner_html(target_node, &html),
            DomMode::Replace => {
                if !dom.replace_with_html(target_node, &html) {
                    return Err(AdapterError::DomApplyFailed(format!(
                        "cannot replace detached target `{}`",
                        params.target
                    )));
                }
            }
            DomMode::Append => dom.append_html(target_node, &html),
        }

        match mode {
            DomMode::Set | DomMode::Replace => {
                self.last_hashes.insert(hash_key, hash);
            }
            DomMode::Append => {
                // Appends accumulate; any remembered hash is stale now.
                self.last_hashes.remove(&hash_key);
            }
        }
        Ok(DomOutcome::Applied)
    }

    pub fn forget(&mut self, scope_key: &str) {
        self.last_hashes
            .retain(|key, _| !key.starts_with(&format!("{scope_key}:")));
    }
}

fn resolve_scope(
    dom: &WorkspaceDom,
    windows: &WindowManager,
    window_id: Option<&str>,
) -> Result<(String, NodeId), AdapterError> {
    match window_id {
        Some(id) => {
            let record = windows
                .get(id)
                .ok_or_else(|| AdapterError::WindowNotFound(id.to_string()))?;
            Ok((id.to_string(), record.content))
        }
        None => Ok(("workspace".to_string(), dom.root())),
    }
}

/// Literal `#root` resolves to the scope's content element; anything else is
/// a querySelector within the scope subtree.
fn resolve_target(dom: &WorkspaceDom, scope: NodeId, target: &str) -> Option<NodeId> {
    if target == "#root" {
        return Some(scope);
    }
    dom.query_selector(scope, target)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use uicp_protocol::WindowCreateParams;

    use super::*;
    use crate::adapter::window::DesktopBounds;

    fn dom_params(window_id: Option<&str>, target: &str, html: &str) -> DomParams {
        DomParams {
            window_id: window_id.map(str::to_string),
            target: target.to_string(),
            html: html.to_string(),
            sanitize: None,
        }
    }

    fn window_fixture() -> (WorkspaceDom, WindowManager) {
        let mut dom = WorkspaceDom::new();
        let mut windows = WindowManager::new(DesktopBounds::default());
        windows.create(
            &mut dom,
            &WindowCreateParams {
                id: Some("w1".to_string()),
                title: "Win".to_string(),
                x: None,
                y: None,
                width: None,
                height: None,
                z_index: None,
            },
        );
        (dom, windows)
    }

    #[test]
    fn set_applies_then_dedups() {
        let (mut dom, windows) = window_fixture();
        let mut applier = DomApplier::new();
        let params = dom_params(Some("w1"), "#root", "<p>hi</p>");

        assert_eq!(
            applier.apply(&mut dom, &windows, DomMode::Set, &params).unwrap(),
            DomOutcome::Applied
        );
        assert_eq!(
            applier.apply(&mut dom, &windows, DomMode::Set, &params).unwrap(),
            DomOutcome::SkippedDuplicate
        );

        let changed = dom_params(Some("w1"), "#root", "<p>other</p>");
        assert_eq!(
            applier.apply(&mut dom, &windows, DomMode::Set, &changed).unwrap(),
            DomOutcome::Applied
        );
    }

    #[test]
    fn append_never_dedups() {
        let (mut dom, windows) = window_fixture();
        let mut applier = DomApplier::new();
        let params = dom_params(Some("w1"), "#root", "<li>x</li>");
        applier.apply(&mut dom, &windows, DomMode::Append, &params).unwrap();
        applier.apply(&mut dom, &windows, DomMode::Append, &params).unwrap();
        let content = windows.get("w1").unwrap().content;
        assert_eq!(dom.inner_html(content), "<li>x</li><li>x</li>");
    }

    #[test]
    fn sanitizes_by_default_and_honors_opt_out() {
        let (mut dom, windows) = window_fixture();
        let mut applier = DomApplier::new();
        let dirty = dom_params(Some("w1"), "#root", "<p onclick=\"x()\">hi</p>");
        applier.apply(&mut dom, &windows, DomMode::Set, &dirty).unwrap();
        let content = windows.get("w1").unwrap().content;
        assert_eq!(dom.inner_html(content), "<p>hi</p>");

        let mut trusted = dom_params(Some("w1"), "#root", "<p data-trusted=\"1\">hi</p>");
        trusted.sanitize = Some(false);
        applier.apply(&mut dom, &windows, DomMode::Set, &trusted).unwrap();
        assert!(dom.inner_html(content).contains("data-trusted"));
    }

    #[test]
    fn unknown_window_fails() {
        let (mut dom, windows) = window_fixture();
        let mut applier = DomApplier::new();
        let params = dom_params(Some("ghost"), "#root", "<p>x</p>");
        assert!(matches!(
            applier.apply(&mut dom, &windows, DomMode::Set, &params),
            Err(AdapterError::WindowNotFound(_))
        ));
    }

    #[test]
    fn missing_selector_fails_with_target_not_found() {
        let (mut dom, windows) = window_fixture();
        let mut applier = DomApplier::new();
        let params = dom_params(Some("w1"), "#nope", "<p>x</p>");
        assert!(matches!(
            applier.apply(&mut dom, &windows, DomMode::Set, &params),
            Err(AdapterError::TargetNotFound { .. })
        ));
    }

    #[test]
    fn replace_swaps_targeted_node() {
        let (mut dom, windows) = window_fixture();
        let mut applier = DomApplier::new();
        let seed = dom_params(Some("w1"), "#root", "<div id=\"card\">old</div>");
        applier.apply(&mut dom, &windows, DomMode::Set, &seed).unwrap();
        let replace = dom_params(Some("w1"), "#card", "<div id=\"card\">new</div>");
        applier
            .apply(&mut dom, &windows, DomMode::Replace, &replace)
            .unwrap();
        let content = windows.get("w1").unwrap().content;
        assert_eq!(dom.inner_html(content), "<div id=\"card\">new</div>");
    }

    #[test]
    fn workspace_root_used_when_window_absent() {
        let mut dom = WorkspaceDom::new();
        let windows = WindowManager::new(DesktopBounds::default());
        let mut applier = DomApplier::new();
        let params = dom_params(None, "#root", "<p>global</p>");
        applier.apply(&mut dom, &windows, DomMode::Set, &params).unwrap();
        assert_eq!(dom.inner_html(dom.root()), "<p>global</p>");
    }
}
