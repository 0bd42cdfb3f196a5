//! Strict HTML sanitizer for externally sourced markup.
//!
//! The policy is allowlist-only: elements off the list are unwrapped to their
//! children (active content is dropped wholesale), attributes off the list
//! are removed, and URL-carrying attributes are scheme-checked. Adapter
//! internal renderings that emit pre-escaped markup bypass this via
//! `sanitize:false`.

use scraper::Html;
use scraper::Node;

use crate::util::escape_html;

/// Markup that has passed [`sanitize_html_strict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeHtml(String);

impl SafeHtml {
    /// Wraps markup the caller guarantees is already safe (component
    /// factories emitting pre-escaped output).
    pub fn trusted(html: impl Into<String>) -> Self {
        Self(html.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

const ALLOWED_ELEMENTS: &[&str] = &[
    "a", "article", "aside", "b", "blockquote", "br", "button", "caption", "code", "dd", "div",
    "dl", "dt", "em", "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4",
    "h5", "h6", "header", "hr", "i", "img", "input", "label", "legend", "li", "main", "nav", "ol",
    "option", "p", "pre", "s", "section", "select", "small", "span", "strong", "sub", "sup",
    "table", "tbody", "td", "textarea", "tfoot", "th", "thead", "tr", "u", "ul",
];

/// Subtrees dropped entirely rather than unwrapped.
const DROPPED_SUBTREES: &[&str] = &[
    "base", "embed", "frame", "frameset", "iframe", "link", "meta", "noscript", "object",
    "script", "style", "template", "title",
];

const ALLOWED_ATTRIBUTES: &[&str] = &[
    "action", "alt", "checked", "class", "cols", "colspan", "disabled", "for", "height", "href",
    "id", "label", "max", "maxlength", "method", "min", "minlength", "multiple", "name",
    "placeholder", "readonly", "rel", "required", "role", "rows", "rowspan", "selected", "src",
    "step", "tabindex", "target", "title", "type", "value", "width",
];

/// Product-specific data attributes the generated UI is allowed to carry.
const ALLOWED_DATA_ATTRIBUTES: &[&str] = &[
    "data-command",
    "data-component-id",
    "data-state-key",
    "data-state-scope",
];

const VOID_ELEMENTS: &[&str] = &["br", "hr", "img", "input"];

const SAFE_IMAGE_DATA_PREFIXES: &[&str] = &[
    "data:image/png;base64,",
    "data:image/jpeg;base64,",
    "data:image/jpg;base64,",
    "data:image/gif;base64,",
    "data:image/webp;base64,",
];

/// Sanitizes a raw HTML fragment. Mandatory for any externally sourced HTML.
pub fn sanitize_html_strict(raw: &str) -> SafeHtml {
    let fragment = Html::parse_fragment(raw);
    let mut out = String::with_capacity(raw.len());
    for child in fragment.tree.root().children() {
        serialize(&child, &mut out);
    }
    SafeHtml(out)
}

fn serialize(node: &ego_tree::NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(&escape_html(&text.text)),
        Node::Element(element) => {
            let name = element.name();
            if DROPPED_SUBTREES.contains(&name) {
                return;
            }
            if !ALLOWED_ELEMENTS.contains(&name) {
                // Unknown wrapper (including the fragment's synthetic <html>):
                // keep the children, lose the element.
                for child in node.children() {
                    serialize(&child, out);
                }
                return;
            }
            out.push('<');
            out.push_str(name);
            for (attr, value) in element.attrs() {
                if let Some(value) = sanitized_attribute(name, attr, value) {
                    out.push(' ');
                    out.push_str(attr);
                    out.push_str("=\"");
                    out.push_str(&escape_html(&value));
                    out.push('"');
                }
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&name) {
                return;
            }
            for child in node.children() {
                serialize(&child, out);
            }
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        // Comments, doctypes and processing instructions never survive.
        _ => {
            for child in node.children() {
                serialize(&child, out);
            }
        }
    }
}

fn sanitized_attribute(element: &str, attr: &str, value: &str) -> Option<String> {
    let allowed = ALLOWED_ATTRIBUTES.contains(&attr)
        || ALLOWED_DATA_ATTRIBUTES.contains(&attr)
        || attr.starts_with("aria-");
    if !allowed {
        return None;
    }
    if matches!(attr, "href" | "src" | "action") && !is_safe_url(element, attr, value) {
        return None;
    }
    Some(value.to_string())
}

fn is_safe_url(element: &str, attr: &str, value: &str) -> bool {
    let trimmed = value.trim();
    let lowered: String = trimmed
        .chars()
        .filter(|c| !c.is_ascii_control() && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    if lowered.starts_with("javascript:") || lowered.starts_with("vbscript:") {
        return false;
    }
    if lowered.starts_with("data:") {
        // Only images with safe mime prefixes may inline data.
        return element == "img"
            && attr == "src"
            && SAFE_IMAGE_DATA_PREFIXES
                .iter()
                .any(|prefix| lowered.starts_with(prefix));
    }
    true
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn strips_script_subtrees() {
        let safe = sanitize_html_strict("<div>ok<script>alert(1)</script></div>");
        assert_eq!(safe.as_str(), "<div>ok</div>");
    }

    #[test]
    fn strips_event_handler_attributes() {
        let safe = sanitize_html_strict(r#"<button onclick="steal()">Go</button>"#);
        assert_eq!(safe.as_str(), "<button>Go</button>");
    }

    #[test]
    fn strips_javascript_urls() {
        let safe = sanitize_html_strict(r#"<a href="javascript:alert(1)">x</a>"#);
        assert_eq!(safe.as_str(), "<a>x</a>");
        let mixed = sanitize_html_strict(r#"<a href="JaVaScRiPt:alert(1)">x</a>"#);
        assert_eq!(mixed.as_str(), "<a>x</a>");
    }

    #[test]
    fn keeps_https_links_and_commands() {
        let safe = sanitize_html_strict(r#"<a href="https://example.com" data-command="open">x</a>"#);
        assert!(safe.as_str().contains(r#"href="https://example.com""#));
        assert!(safe.as_str().contains(r#"data-command="open""#));
    }

    #[test]
    fn data_urls_only_for_safe_image_mimes() {
        let img = sanitize_html_strict(r#"<img src="data:image/png;base64,AAAA">"#);
        assert!(img.as_str().contains("src="));
        let html_data = sanitize_html_strict(r#"<img src="data:text/html;base64,AAAA">"#);
        assert!(!html_data.as_str().contains("src="));
        let anchor = sanitize_html_strict(r#"<a href="data:image/png;base64,AAAA">x</a>"#);
        assert!(!anchor.as_str().contains("href="));
    }

    #[test]
    fn unknown_elements_unwrap_to_children() {
        let safe = sanitize_html_strict("<blink><p>hello</p></blink>");
        assert_eq!(safe.as_str(), "<p>hello</p>");
    }

    #[test]
    fn text_is_escaped() {
        let safe = sanitize_html_strict("<p>1 < 2 & 3</p>");
        assert_eq!(safe.as_str(), "<p>1 &lt; 2 &amp; 3</p>");
    }

    #[test]
    fn comments_are_dropped() {
        let safe = sanitize_html_strict("<div><!-- secret --><span>ok</span></div>");
        assert_eq!(safe.as_str(), "<div><span>ok</span></div>");
    }

    #[test]
    fn aria_attributes_survive() {
        let safe = sanitize_html_strict(r#"<div aria-live="polite" role="status">ready</div>"#);
        assert!(safe.as_str().contains(r#"aria-live="polite""#));
        assert!(safe.as_str().contains(r#"role="status""#));
    }
}
