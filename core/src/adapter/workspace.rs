//! Owned workspace DOM: a node arena rooted at the workspace `#root`.
//!
//! Fragments parse through the HTML5 parser; selector queries round-trip the
//! subtree through it as well, so the full CSS selector grammar works against
//! the arena without a second selector engine.

use scraper::Html;
use scraper::Node;
use scraper::Selector;

use crate::util::escape_html;

pub type NodeId = usize;

/// Attribute used to map selector matches back onto arena nodes during
/// queries; never serialized through the public accessors.
const NID_ATTR: &str = "data-uicp-nid";

const VOID_ELEMENTS: &[&str] = &["br", "hr", "img", "input"];

#[derive(Debug, Clone)]
pub enum DomValue {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug)]
struct Slot {
    value: DomValue,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    alive: bool,
}

#[derive(Debug)]
pub struct WorkspaceDom {
    slots: Vec<Slot>,
    root: NodeId,
}

impl Default for WorkspaceDom {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceDom {
    pub fn new() -> Self {
        let mut dom = Self {
            slots: Vec::new(),
            root: 0,
        };
        dom.root = dom.alloc(DomValue::Element {
            tag: "div".to_string(),
            attrs: vec![
                ("id".to_string(), "root".to_string()),
                ("class".to_string(), "uicp-workspace".to_string()),
            ],
        });
        dom
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn create_element(
        &mut self,
        tag: &str,
        attrs: Vec<(String, String)>,
    ) -> NodeId {
        self.alloc(DomValue::Element {
            tag: tag.to_string(),
            attrs,
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(DomValue::Text(text.to_string()))
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.slots[child].parent = Some(parent);
        self.slots[parent].children.push(child);
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.slots.get(id).map(|slot| slot.alive).unwrap_or(false)
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.slots.get(id)?.value {
            DomValue::Element { attrs, .. } => attrs
                .iter()
                .find(|(attr, _)| attr == name)
                .map(|(_, value)| value.as_str()),
            DomValue::Text(_) => None,
        }
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let DomValue::Element { attrs, .. } = &mut self.slots[id].value {
            match attrs.iter_mut().find(|(attr, _)| attr == name) {
                Some((_, existing)) => *existing = value.to_string(),
                None => attrs.push((name.to_string(), value.to_string())),
            }
        }
    }

    /// Replaces the node's children with a single text node.
    pub fn set_text(&mut self, id: NodeId, text: &str) {
        self.remove_children(id);
        let child = self.create_text(text);
        self.append_child(id, child);
    }

    pub fn remove_children(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.slots[id].children);
        for child in children {
            self.kill(child);
        }
    }

    /// Detaches the node from its parent and retires the subtree.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.slots[id].parent {
            self.slots[parent].children.retain(|&child| child != id);
        }
        self.kill(id);
    }

    /// `innerHTML = html`.
    pub fn set_inner_html(&mut self, id: NodeId, html: &str) {
        self.remove_children(id);
        self.append_fragment(id, html);
    }

    /// `insertAdjacentHTML('beforeend', html)`.
    pub fn append_html(&mut self, id: NodeId, html: &str) {
        self.append_fragment(id, html);
    }

    /// `outerHTML = html`: the parsed fragment replaces the node in place.
    pub fn replace_with_html(&mut self, id: NodeId, html: &str) -> bool {
        let Some(parent) = self.slots[id].parent else {
            return false;
        };
        let Some(position) = self.slots[parent]
            .children
            .iter()
            .position(|&child| child == id)
        else {
            return false;
        };
        let new_ids = self.parse_fragment(html);
        for (offset, &new_id) in new_ids.iter().enumerate() {
            self.slots[new_id].parent = Some(parent);
            self.slots[parent].children.insert(position + offset, new_id);
        }
        self.detach(id);
        true
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for &child in &self.slots[id].children {
            self.serialize(child, &mut out, false);
        }
        out
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.serialize(id, &mut out, false);
        out
    }

    /// First descendant of `scope` matching the CSS selector.
    pub fn query_selector(&self, scope: NodeId, selector: &str) -> Option<NodeId> {
        let parsed = Selector::parse(selector).ok()?;
        let mut annotated = String::new();
        for &child in &self.slots[scope].children {
            self.serialize(child, &mut annotated, true);
        }
        let fragment = Html::parse_fragment(&annotated);
        let matched = fragment.select(&parsed).next()?;
        matched
            .value()
            .attr(NID_ATTR)
            .and_then(|raw| raw.parse::<NodeId>().ok())
            .filter(|&id| self.is_alive(id))
    }

    fn alloc(&mut self, value: DomValue) -> NodeId {
        let id = self.slots.len();
        self.slots.push(Slot {
            value,
            parent: None,
            children: Vec::new(),
            alive: true,
        });
        id
    }

    fn kill(&mut self, id: NodeId) {
        self.slots[id].alive = false;
        self.slots[id].parent = None;
        let children = std::mem::take(&mut self.slots[id].children);
        for child in children {
            self.kill(child);
        }
    }

    fn append_fragment(&mut self, parent: NodeId, html: &str) {
        let new_ids = self.parse_fragment(html);
        for new_id in new_ids {
            self.append_child(parent, new_id);
        }
    }

    /// Parses an HTML fragment into detached arena nodes (top-level order
    /// preserved).
    fn parse_fragment(&mut self, html: &str) -> Vec<NodeId> {
        let fragment = Html::parse_fragment(html);
        let mut top_level = Vec::new();
        let root = fragment.tree.root();
        for child in root.children() {
            self.import_node(&child, &mut top_level);
        }
        top_level
    }

    fn import_node(
        &mut self,
        node: &ego_tree::NodeRef<'_, Node>,
        out: &mut Vec<NodeId>,
    ) {
        match node.value() {
            Node::Text(text) => {
                let id = self.create_text(&text.text);
                out.push(id);
            }
            Node::Element(element) => {
                let tag = element.name().to_string();
                // The fragment parser inserts a synthetic <html> wrapper;
                // unwrap it to its children.
                if tag == "html" || tag == "head" || tag == "body" {
                    for child in node.children() {
                        self.import_node(&child, out);
                    }
                    return;
                }
                let attrs = element
                    .attrs()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect();
                let id = self.create_element(&tag, attrs);
                let mut children = Vec::new();
                for child in node.children() {
                    self.import_node(&child, &mut children);
                }
                for child in children {
                    self.append_child(id, child);
                }
                out.push(id);
            }
            _ => {
                for child in node.children() {
                    self.import_node(&child, out);
                }
            }
        }
    }

    fn serialize(&self, id: NodeId, out: &mut String, annotate: bool) {
        let slot = &self.slots[id];
        if !slot.alive {
            return;
        }
        match &slot.value {
            DomValue::Text(text) => out.push_str(&escape_html(text)),
            DomValue::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape_html(value));
                    out.push('"');
                }
                if annotate {
                    out.push_str(&format!(" {NID_ATTR}=\"{id}\""));
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return;
                }
                for &child in &slot.children {
                    self.serialize(child, out, annotate);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn set_inner_html_round_trips() {
        let mut dom = WorkspaceDom::new();
        let root = dom.root();
        dom.set_inner_html(root, "<p class=\"note\">hello</p>");
        assert_eq!(dom.inner_html(root), "<p class=\"note\">hello</p>");
    }

    #[test]
    fn append_html_preserves_existing_children() {
        let mut dom = WorkspaceDom::new();
        let root = dom.root();
        dom.set_inner_html(root, "<p>a</p>");
        dom.append_html(root, "<p>b</p>");
        assert_eq!(dom.inner_html(root), "<p>a</p><p>b</p>");
    }

    #[test]
    fn query_selector_finds_descendants() {
        let mut dom = WorkspaceDom::new();
        let root = dom.root();
        dom.set_inner_html(root, "<div><span id=\"inner\">x</span></div>");
        let found = dom.query_selector(root, "#inner").unwrap();
        assert_eq!(dom.outer_html(found), "<span id=\"inner\">x</span>");
        assert!(dom.query_selector(root, ".missing").is_none());
    }

    #[test]
    fn query_selector_supports_attribute_selectors() {
        let mut dom = WorkspaceDom::new();
        let root = dom.root();
        dom.set_inner_html(root, "<div data-component-id=\"c1\">x</div>");
        assert!(dom
            .query_selector(root, "[data-component-id=\"c1\"]")
            .is_some());
    }

    #[test]
    fn replace_with_html_swaps_in_place() {
        let mut dom = WorkspaceDom::new();
        let root = dom.root();
        dom.set_inner_html(root, "<p>a</p><p id=\"mid\">b</p><p>c</p>");
        let mid = dom.query_selector(root, "#mid").unwrap();
        assert!(dom.replace_with_html(mid, "<h2>B</h2>"));
        assert_eq!(dom.inner_html(root), "<p>a</p><h2>B</h2><p>c</p>");
    }

    #[test]
    fn detached_nodes_stop_matching() {
        let mut dom = WorkspaceDom::new();
        let root = dom.root();
        dom.set_inner_html(root, "<div id=\"gone\">x</div>");
        let node = dom.query_selector(root, "#gone").unwrap();
        dom.detach(node);
        assert!(dom.query_selector(root, "#gone").is_none());
        assert_eq!(dom.inner_html(root), "");
    }

    #[test]
    fn text_is_escaped_on_serialize() {
        let mut dom = WorkspaceDom::new();
        let root = dom.root();
        let text = dom.create_text("a < b & c");
        dom.append_child(root, text);
        assert_eq!(dom.inner_html(root), "a &lt; b &amp; c");
    }
}
