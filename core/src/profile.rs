//! Phase profiles: `(model, message-formatter, channel-capabilities)` triple
//! configuring one phase of the planner/actor pipeline.

use std::time::Duration;

use serde_json::Value;
use serde_json::json;

use crate::flags;
use crate::tool_spec;

const PLANNER_INSTRUCTIONS: &str = include_str!("../planner_prompt.md");
const ACTOR_INSTRUCTIONS: &str = include_str!("../actor_prompt.md");

/// How messages are laid out for the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Plain OpenAI chat messages.
    OpenAiChat,
    /// Harmony-framed system prompt for channel-capable models.
    Harmony,
}

#[derive(Debug, Clone)]
pub struct PhaseProfile {
    pub model: String,
    pub format: MessageFormat,
    /// Whether the model emits analysis/commentary/final channels.
    pub channels: bool,
    pub timeout: Duration,
}

impl PhaseProfile {
    pub fn planner_default() -> Self {
        Self {
            model: "qwen3-coder:480b-cloud".to_string(),
            format: MessageFormat::OpenAiChat,
            channels: false,
            timeout: *flags::VITE_PLANNER_TIMEOUT_MS,
        }
    }

    pub fn actor_default() -> Self {
        Self {
            model: "qwen3-coder:480b-cloud".to_string(),
            format: MessageFormat::OpenAiChat,
            channels: false,
            timeout: *flags::VITE_ACTOR_TIMEOUT_MS,
        }
    }

    fn messages(&self, instructions: &str, user: String) -> Vec<Value> {
        let system = match self.format {
            MessageFormat::OpenAiChat => instructions.to_string(),
            MessageFormat::Harmony => format!(
                "{instructions}\n\nAnswer on the `final` channel; reasoning stays on `analysis`."
            ),
        };
        vec![
            json!({ "role": "system", "content": system }),
            json!({ "role": "user", "content": user }),
        ]
    }

    /// Full `chat_completion` request payload for the planner phase.
    pub fn planner_request(&self, intent: &str) -> Value {
        json!({
            "model": self.model,
            "messages": self.messages(PLANNER_INSTRUCTIONS, intent.to_string()),
            "stream": true,
            "tools": [tool_spec::emit_plan_tool()],
            "tool_choice": tool_spec::forced_choice(tool_spec::EMIT_PLAN),
        })
    }

    /// Full `chat_completion` request payload for the actor phase.
    pub fn actor_request(&self, intent: &str, plan_context: &str) -> Value {
        let user = format!("Intent:\n{intent}\n\nPlan:\n{plan_context}");
        json!({
            "model": self.model,
            "messages": self.messages(ACTOR_INSTRUCTIONS, user),
            "stream": true,
            "tools": [tool_spec::emit_batch_tool()],
            "tool_choice": tool_spec::forced_choice(tool_spec::EMIT_BATCH),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProfilePair {
    pub planner: PhaseProfile,
    pub actor: PhaseProfile,
}

impl Default for ProfilePair {
    fn default() -> Self {
        Self {
            planner: PhaseProfile::planner_default(),
            actor: PhaseProfile::actor_default(),
        }
    }
}
