use serde::Deserialize;
use serde::Serialize;

use crate::envelope::Batch;

/// Planner output: a short summary, optional risks, hints for the actor, and a
/// proposed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub summary: String,

    /// Planners emit either a single string or a list; both are accepted and
    /// normalized through [`Plan::risk_list`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risks: Option<Risks>,

    #[serde(default, alias = "actorHints", skip_serializing_if = "Vec::is_empty")]
    pub actor_hints: Vec<String>,

    #[serde(default)]
    pub batch: Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Risks {
    One(String),
    Many(Vec<String>),
}

impl Plan {
    pub fn risk_list(&self) -> Vec<String> {
        match &self.risks {
            None => Vec::new(),
            Some(Risks::One(risk)) => vec![risk.clone()],
            Some(Risks::Many(risks)) => risks.clone(),
        }
    }

    /// Structured clarifier plans end their summary with a question mark and
    /// carry a clarifier token in the risks.
    pub fn has_clarifier_risk(&self) -> bool {
        self.risk_list()
            .iter()
            .any(|r| r.eq_ignore_ascii_case("clarifier") || r.starts_with("clarifier:"))
    }
}
