//! Idempotent window lifecycle over the workspace DOM.

use std::collections::HashMap;

use uicp_protocol::WindowCreateParams;
use uicp_protocol::WindowUpdateParams;

use crate::adapter::workspace::NodeId;
use crate::adapter::workspace::WorkspaceDom;
use crate::error::AdapterError;
use crate::util::slug;

pub const MIN_WIDTH: f64 = 200.0;
pub const MAX_WIDTH: f64 = 4000.0;
pub const MIN_HEIGHT: f64 = 150.0;
pub const MAX_HEIGHT: f64 = 3000.0;

/// Desktop viewport the coordinate clamps derive from.
#[derive(Debug, Clone, Copy)]
pub struct DesktopBounds {
    pub client_width: f64,
    pub client_height: f64,
}

impl Default for DesktopBounds {
    fn default() -> Self {
        Self {
            client_width: 1280.0,
            client_height: 800.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub z_index: i32,
}

/// Wrapper element, content element, title text node and the stable selector
/// used by the dynamic stylesheet. Owned exclusively by the adapter.
#[derive(Debug, Clone)]
pub struct WindowRecord {
    pub id: String,
    pub wrapper: NodeId,
    pub content: NodeId,
    pub title_node: NodeId,
    pub selector: String,
    pub title: String,
}

#[derive(Debug, Default)]
pub struct WindowManager {
    windows: HashMap<String, WindowRecord>,
    geometry: HashMap<String, Geometry>,
    desktop: DesktopBounds,
    next_z: i32,
}

impl WindowManager {
    pub fn new(desktop: DesktopBounds) -> Self {
        Self {
            windows: HashMap::new(),
            geometry: HashMap::new(),
            desktop,
            next_z: 1,
        }
    }

    pub fn get(&self, id: &str) -> Option<&WindowRecord> {
        self.windows.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.windows.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// Creates a window, or applies update semantics when the id is already
    /// known. Returns the window id and whether a new window was created.
    pub fn create(
        &mut self,
        dom: &mut WorkspaceDom,
        params: &WindowCreateParams,
    ) -> (String, bool) {
        let id = params
            .id
            .clone()
            .unwrap_or_else(|| format!("win-{}", slug(&params.title)));

        if self.windows.contains_key(&id) {
            let update = WindowUpdateParams {
                id: id.clone(),
                title: Some(params.title.clone()),
                x: params.x,
                y: params.y,
                width: params.width,
                height: params.height,
            };
            // Known id behaves as update; the record is guaranteed present.
            let _ = self.update(dom, &update);
            return (id, false);
        }

        let selector = format!("[data-window-id=\"{id}\"]");

        let wrapper = dom.create_element(
            "section",
            vec![
                ("class".to_string(), "uicp-window".to_string()),
                ("data-window-id".to_string(), id.clone()),
                ("role".to_string(), "dialog".to_string()),
                ("aria-label".to_string(), params.title.clone()),
            ],
        );
        let titlebar = dom.create_element(
            "header",
            vec![("class".to_string(), "uicp-window-titlebar".to_string())],
        );
        let title_node = dom.create_element(
            "span",
            vec![("class".to_string(), "uicp-window-title".to_string())],
        );
        dom.set_text(title_node, &params.title);
        let close = dom.create_element(
            "button",
            vec![
                ("class".to_string(), "uicp-window-close".to_string()),
                ("data-command".to_string(), format!("window.close:{id}")),
                ("aria-label".to_string(), "Close window".to_string()),
            ],
        );
        dom.set_text(close, "\u{00d7}");
        dom.append_child(titlebar, title_node);
        dom.append_child(titlebar, close);

        let content = dom.create_element(
            "div",
            vec![
                ("class".to_string(), "uicp-window-content".to_string()),
                ("id".to_string(), "root".to_string()),
            ],
        );

        dom.append_child(wrapper, titlebar);
        dom.append_child(wrapper, content);
        dom.append_child(dom.root(), wrapper);

        let z_index = params.z_index.unwrap_or_else(|| self.bump_z());
        let geometry = Geometry {
            x: self.clamp_x(params.x.unwrap_or(80.0)),
            y: self.clamp_y(params.y.unwrap_or(60.0)),
            width: params.width.unwrap_or(480.0).clamp(MIN_WIDTH, MAX_WIDTH),
            height: params.height.unwrap_or(360.0).clamp(MIN_HEIGHT, MAX_HEIGHT),
            z_index,
        };
        self.geometry.insert(selector.clone(), geometry);
        self.windows.insert(
            id.clone(),
            WindowRecord {
                id: id.clone(),
                wrapper,
                content,
                title_node,
                selector,
                title: params.title.clone(),
            },
        );
        (id, true)
    }

    pub fn update(
        &mut self,
        dom: &mut WorkspaceDom,
        params: &WindowUpdateParams,
    ) -> Result<(), AdapterError> {
        let record = self
            .windows
            .get_mut(&params.id)
            .ok_or_else(|| AdapterError::WindowNotFound(params.id.clone()))?;

        if let Some(title) = &params.title {
            record.title = title.clone();
            dom.set_text(record.title_node, title);
            dom.set_attr(record.wrapper, "aria-label", title);
        }

        let selector = record.selector.clone();
        if let Some(geometry) = self.geometry.get_mut(&selector) {
            if let Some(x) = params.x {
                geometry.x = clamp_x_for(self.desktop, x);
            }
            if let Some(y) = params.y {
                geometry.y = clamp_y_for(self.desktop, y);
            }
            if let Some(width) = params.width {
                geometry.width = width.clamp(MIN_WIDTH, MAX_WIDTH);
            }
            if let Some(height) = params.height {
                geometry.height = height.clamp(MIN_HEIGHT, MAX_HEIGHT);
            }
        }
        Ok(())
    }

    pub fn move_to(&mut self, id: &str, x: f64, y: f64) -> Result<(), AdapterError> {
        let selector = self
            .windows
            .get(id)
            .map(|record| record.selector.clone())
            .ok_or_else(|| AdapterError::WindowNotFound(id.to_string()))?;
        if let Some(geometry) = self.geometry.get_mut(&selector) {
            geometry.x = clamp_x_for(self.desktop, x);
            geometry.y = clamp_y_for(self.desktop, y);
        }
        Ok(())
    }

    pub fn resize(&mut self, id: &str, width: f64, height: f64) -> Result<(), AdapterError> {
        let selector = self
            .windows
            .get(id)
            .map(|record| record.selector.clone())
            .ok_or_else(|| AdapterError::WindowNotFound(id.to_string()))?;
        if let Some(geometry) = self.geometry.get_mut(&selector) {
            geometry.width = width.clamp(MIN_WIDTH, MAX_WIDTH);
            geometry.height = height.clamp(MIN_HEIGHT, MAX_HEIGHT);
        }
        Ok(())
    }

    /// Brings the window to the top of the stacking order.
    pub fn focus(&mut self, id: &str) -> Result<(), AdapterError> {
        let selector = self
            .windows
            .get(id)
            .map(|record| record.selector.clone())
            .ok_or_else(|| AdapterError::WindowNotFound(id.to_string()))?;
        let z_index = self.bump_z();
        if let Some(geometry) = self.geometry.get_mut(&selector) {
            geometry.z_index = z_index;
        }
        Ok(())
    }

    pub fn close(&mut self, dom: &mut WorkspaceDom, id: &str) -> Result<(), AdapterError> {
        let record = self
            .windows
            .remove(id)
            .ok_or_else(|| AdapterError::WindowNotFound(id.to_string()))?;
        self.geometry.remove(&record.selector);
        dom.detach(record.wrapper);
        Ok(())
    }

    /// Geometry applies through a dynamic stylesheet keyed by the stable
    /// selector rather than inline styles.
    pub fn render_stylesheet(&self) -> String {
        let mut selectors: Vec<&String> = self.geometry.keys().collect();
        selectors.sort();
        let mut out = String::new();
        for selector in selectors {
            let geometry = &self.geometry[selector];
            out.push_str(&format!(
                "{selector} {{ position: absolute; left: {}px; top: {}px; width: {}px; height: {}px; z-index: {}; }}\n",
                geometry.x, geometry.y, geometry.width, geometry.height, geometry.z_index
            ));
        }
        out
    }

    pub fn geometry_of(&self, id: &str) -> Option<Geometry> {
        let record = self.windows.get(id)?;
        self.geometry.get(&record.selector).copied()
    }

    fn clamp_x(&self, x: f64) -> f64 {
        clamp_x_for(self.desktop, x)
    }

    fn clamp_y(&self, y: f64) -> f64 {
        clamp_y_for(self.desktop, y)
    }

    fn bump_z(&mut self) -> i32 {
        self.next_z += 1;
        self.next_z
    }
}

fn clamp_x_for(desktop: DesktopBounds, x: f64) -> f64 {
    x.clamp(0.0, (desktop.client_width - 200.0).max(0.0))
}

fn clamp_y_for(desktop: DesktopBounds, y: f64) -> f64 {
    y.clamp(0.0, (desktop.client_height - 100.0).max(0.0))
}
