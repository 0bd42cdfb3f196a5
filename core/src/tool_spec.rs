//! Function specs for the planner and actor tool calls.
//!
//! Both phases force a tool choice: the planner answers through `emit_plan`,
//! the actor through `emit_batch`. The JSON schemas ride along as the
//! `parameters` field of an OpenAI-style function spec.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

pub const EMIT_PLAN: &str = "emit_plan";
pub const EMIT_BATCH: &str = "emit_batch";

/// Generic JSON-Schema subset needed for our tool definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum JsonSchema {
    Boolean {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    String {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(alias = "integer")]
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Array {
        items: Box<JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Object {
        properties: BTreeMap<String, JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        required: Option<Vec<String>>,
        #[serde(
            rename = "additionalProperties",
            skip_serializing_if = "Option::is_none"
        )]
        additional_properties: Option<bool>,
    },
}

fn envelope_schema() -> JsonSchema {
    let mut properties = BTreeMap::new();
    properties.insert(
        "op".to_string(),
        JsonSchema::String {
            description: Some(
                "Operation tag, e.g. window.create, dom.set, component.render".to_string(),
            ),
        },
    );
    properties.insert(
        "params".to_string(),
        JsonSchema::Object {
            properties: BTreeMap::new(),
            required: None,
            additional_properties: Some(true),
        },
    );
    properties.insert(
        "idempotencyKey".to_string(),
        JsonSchema::String { description: None },
    );
    properties.insert(
        "windowId".to_string(),
        JsonSchema::String { description: None },
    );
    JsonSchema::Object {
        properties,
        required: Some(vec!["op".to_string(), "params".to_string()]),
        additional_properties: Some(true),
    }
}

fn batch_schema() -> JsonSchema {
    JsonSchema::Array {
        items: Box::new(envelope_schema()),
        description: Some("Ordered UI mutation envelopes".to_string()),
    }
}

fn plan_parameters() -> JsonSchema {
    let mut properties = BTreeMap::new();
    properties.insert(
        "summary".to_string(),
        JsonSchema::String {
            description: Some("One-sentence description of what will be built".to_string()),
        },
    );
    properties.insert(
        "risks".to_string(),
        JsonSchema::Array {
            items: Box::new(JsonSchema::String { description: None }),
            description: Some("Known risks; include `clarifier` when asking back".to_string()),
        },
    );
    properties.insert(
        "actor_hints".to_string(),
        JsonSchema::Array {
            items: Box::new(JsonSchema::String { description: None }),
            description: Some("Up to 20 hints for the actor".to_string()),
        },
    );
    properties.insert("batch".to_string(), batch_schema());
    JsonSchema::Object {
        properties,
        required: Some(vec!["summary".to_string()]),
        additional_properties: Some(false),
    }
}

fn batch_parameters() -> JsonSchema {
    let mut properties = BTreeMap::new();
    properties.insert("batch".to_string(), batch_schema());
    JsonSchema::Object {
        properties,
        required: Some(vec!["batch".to_string()]),
        additional_properties: Some(false),
    }
}

/// Chat-completions-shaped tool entry.
fn function_tool(name: &str, description: &str, parameters: JsonSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}

pub fn emit_plan_tool() -> Value {
    function_tool(
        EMIT_PLAN,
        "Report the plan for satisfying the user's intent.",
        plan_parameters(),
    )
}

pub fn emit_batch_tool() -> Value {
    function_tool(
        EMIT_BATCH,
        "Emit the final batch of UI mutation envelopes.",
        batch_parameters(),
    )
}

pub fn forced_choice(name: &str) -> Value {
    json!({ "type": "function", "function": { "name": name } })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plan_tool_has_expected_shape() {
        let tool = emit_plan_tool();
        assert_eq!(tool["type"], json!("function"));
        assert_eq!(tool["function"]["name"], json!(EMIT_PLAN));
        let params = &tool["function"]["parameters"];
        assert_eq!(params["type"], json!("object"));
        assert!(params["properties"]["summary"].is_object());
        assert_eq!(params["required"], json!(["summary"]));
    }

    #[test]
    fn batch_tool_requires_batch() {
        let tool = emit_batch_tool();
        assert_eq!(tool["function"]["name"], json!(EMIT_BATCH));
        assert_eq!(tool["function"]["parameters"]["required"], json!(["batch"]));
        let items = &tool["function"]["parameters"]["properties"]["batch"]["items"];
        assert_eq!(items["required"], json!(["op", "params"]));
    }
}
