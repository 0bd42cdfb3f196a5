//! Component factory registry.
//!
//! Factories emit pre-escaped markup, so rendering bypasses the sanitizer.
//! Unknown component types render an invisible neutral frame (never a visible
//! placeholder) and emit `component.unknown` telemetry.

use std::collections::HashMap;

use serde_json::Value;
use uicp_protocol::ComponentRenderParams;
use uicp_protocol::ComponentUpdateParams;
use uicp_protocol::DomParams;
use uuid::Uuid;

use crate::adapter::dom::DomApplier;
use crate::adapter::dom::DomMode;
use crate::adapter::window::WindowManager;
use crate::adapter::workspace::WorkspaceDom;
use crate::error::AdapterError;
use crate::telemetry::COMPONENT_UNKNOWN;
use crate::telemetry::TelemetryBus;
use crate::util::escape_html;

type ComponentFactory = fn(&Value) -> String;

#[derive(Debug, Clone)]
pub struct ComponentInstance {
    pub id: String,
    pub window_id: String,
    pub target: String,
    pub component_type: String,
    pub props: Value,
}

pub struct ComponentRenderer {
    factories: HashMap<&'static str, ComponentFactory>,
    instances: HashMap<String, ComponentInstance>,
    bus: TelemetryBus,
}

impl ComponentRenderer {
    pub fn new(bus: TelemetryBus) -> Self {
        let mut factories: HashMap<&'static str, ComponentFactory> = HashMap::new();
        factories.insert("button.v1", render_button);
        factories.insert("form.v1", render_form);
        factories.insert("data.table", render_table);
        factories.insert("data.view", render_data_view);
        factories.insert("modal.v1", render_modal);
        factories.insert("list.v1", render_list);
        factories.insert("script.panel", render_script_panel);
        // Back-compat aliases.
        factories.insert("button", render_button);
        factories.insert("form", render_form);
        factories.insert("table", render_table);
        factories.insert("modal", render_modal);
        factories.insert("list", render_list);
        Self {
            factories,
            instances: HashMap::new(),
            bus,
        }
    }

    pub fn instance(&self, id: &str) -> Option<&ComponentInstance> {
        self.instances.get(id)
    }

    pub fn render(
        &mut self,
        dom: &mut WorkspaceDom,
        windows: &WindowManager,
        applier: &mut DomApplier,
        params: &ComponentRenderParams,
    ) -> Result<String, AdapterError> {
        let id = params
            .id
            .clone()
            .unwrap_or_else(|| format!("cmp-{}", Uuid::new_v4()));

        let markup = match self.factories.get(params.component_type.as_str()) {
            Some(factory) => factory(&params.props),
            None => {
                self.bus.emit(
                    COMPONENT_UNKNOWN,
                    serde_json::json!({
                        "type": params.component_type,
                        "windowId": params.window_id,
                        "componentId": id,
                    }),
                );
                // Invisible neutral frame; never a visible placeholder.
                String::new()
            }
        };

        let html = format!(
            "<div data-component-id=\"{}\" data-component-type=\"{}\"{}>{}</div>",
            escape_html(&id),
            escape_html(&params.component_type),
            if markup.is_empty() {
                " style=\"display:none\" aria-hidden=\"true\""
            } else {
                " class=\"uicp-component\""
            },
            markup
        );

        let dom_params = DomParams {
            window_id: Some(params.window_id.clone()),
            target: params.target.clone(),
            html,
            sanitize: Some(false),
        };
        applier.apply(dom, windows, DomMode::Set, &dom_params)?;

        self.instances.insert(
            id.clone(),
            ComponentInstance {
                id: id.clone(),
                window_id: params.window_id.clone(),
                target: params.target.clone(),
                component_type: params.component_type.clone(),
                props: params.props.clone(),
            },
        );
        Ok(id)
    }

    /// Shallow-merges object props, then re-renders in place.
    pub fn update(
        &mut self,
        dom: &mut WorkspaceDom,
        windows: &WindowManager,
        applier: &mut DomApplier,
        params: &ComponentUpdateParams,
    ) -> Result<(), AdapterError> {
        let instance = self
            .instances
            .get(&params.id)
            .cloned()
            .ok_or_else(|| AdapterError::ComponentNotFound(params.id.clone()))?;

        let merged = match (&instance.props, &params.props) {
            (Value::Object(old), Value::Object(new)) => {
                let mut merged = old.clone();
                for (key, value) in new {
                    merged.insert(key.clone(), value.clone());
                }
                Value::Object(merged)
            }
            (_, new) if !new.is_null() => new.clone(),
            (old, _) => old.clone(),
        };

        let render_params = ComponentRenderParams {
            id: Some(instance.id.clone()),
            window_id: instance.window_id.clone(),
            target: instance.target.clone(),
            component_type: instance.component_type.clone(),
            props: merged,
        };
        self.render(dom, windows, applier, &render_params)?;
        Ok(())
    }

    /// Replaces the instance subtree with the empty string.
    pub fn destroy(&mut self, dom: &mut WorkspaceDom, id: &str) -> Result<(), AdapterError> {
        let _instance = self
            .instances
            .remove(id)
            .ok_or_else(|| AdapterError::ComponentNotFound(id.to_string()))?;
        let selector = format!("[data-component-id=\"{id}\"]");
        if let Some(node) = dom.query_selector(dom.root(), &selector) {
            dom.detach(node);
        }
        Ok(())
    }
}

fn str_prop<'a>(props: &'a Value, key: &str) -> &'a str {
    props.get(key).and_then(|v| v.as_str()).unwrap_or_default()
}

fn render_button(props: &Value) -> String {
    let label = escape_html(str_prop(props, "label"));
    let command = escape_html(str_prop(props, "command"));
    if command.is_empty() {
        format!("<button class=\"uicp-button\">{label}</button>")
    } else {
        format!("<button class=\"uicp-button\" data-command=\"{command}\">{label}</button>")
    }
}

fn render_form(props: &Value) -> String {
    let submit = escape_html(str_prop(props, "submitCommand"));
    let mut out = if submit.is_empty() {
        "<form class=\"uicp-form\">".to_string()
    } else {
        format!("<form class=\"uicp-form\" data-command=\"{submit}\">")
    };
    if let Some(fields) = props.get("fields").and_then(|f| f.as_array()) {
        for field in fields {
            let name = escape_html(str_prop(field, "name"));
            let label = escape_html(str_prop(field, "label"));
            let kind = match str_prop(field, "type") {
                "" => "text".to_string(),
                other => escape_html(other),
            };
            if kind == "textarea" {
                out.push_str(&format!(
                    "<label for=\"{name}\">{label}</label><textarea id=\"{name}\" name=\"{name}\" rows=\"4\"></textarea>"
                ));
            } else {
                out.push_str(&format!(
                    "<label for=\"{name}\">{label}</label><input id=\"{name}\" name=\"{name}\" type=\"{kind}\">"
                ));
            }
        }
    }
    let submit_label = {
        let raw = str_prop(props, "submitLabel");
        if raw.is_empty() {
            "Submit".to_string()
        } else {
            escape_html(raw)
        }
    };
    out.push_str(&format!(
        "<button type=\"submit\" class=\"uicp-button\">{submit_label}</button></form>"
    ));
    out
}

fn render_table(props: &Value) -> String {
    let mut out = "<table class=\"uicp-table\">".to_string();
    if let Some(columns) = props.get("columns").and_then(|c| c.as_array()) {
        out.push_str("<thead><tr>");
        for column in columns {
            let text = column.as_str().unwrap_or_default();
            out.push_str(&format!("<th>{}</th>", escape_html(text)));
        }
        out.push_str("</tr></thead>");
    }
    out.push_str("<tbody>");
    if let Some(rows) = props.get("rows").and_then(|r| r.as_array()) {
        for row in rows {
            out.push_str("<tr>");
            if let Some(cells) = row.as_array() {
                for cell in cells {
                    let text = match cell {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out.push_str(&format!("<td>{}</td>", escape_html(&text)));
                }
            }
            out.push_str("</tr>");
        }
    }
    out.push_str("</tbody></table>");
    out
}

fn render_data_view(props: &Value) -> String {
    let state_key = escape_html(str_prop(props, "stateKey"));
    let content = escape_html(str_prop(props, "content"));
    format!(
        "<div class=\"uicp-data-view\" data-state-key=\"{state_key}\" aria-live=\"polite\">{content}</div>"
    )
}

fn render_modal(props: &Value) -> String {
    let title = escape_html(str_prop(props, "title"));
    let body = escape_html(str_prop(props, "body"));
    format!(
        "<div class=\"uicp-modal\" role=\"dialog\" aria-label=\"{title}\"><h2>{title}</h2><p>{body}</p><button class=\"uicp-button\" data-command=\"modal.close\">Close</button></div>"
    )
}

fn render_list(props: &Value) -> String {
    let mut out = "<ul class=\"uicp-list\">".to_string();
    if let Some(items) = props.get("items").and_then(|i| i.as_array()) {
        for item in items {
            let text = match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("<li>{}</li>", escape_html(&text)));
        }
    }
    out.push_str("</ul>");
    out
}

fn render_script_panel(props: &Value) -> String {
    let title = escape_html(str_prop(props, "title"));
    let code = escape_html(str_prop(props, "code"));
    format!(
        "<section class=\"uicp-script-panel\"><header>{title}</header><pre><code>{code}</code></pre></section>"
    )
}
