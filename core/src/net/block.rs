//! Structured block payloads: every denied request produces a remediation
//! report the UI can turn into actionable affordances.

use serde::Deserialize;
use serde::Serialize;

use crate::policy::PolicyMode;
use crate::util::now_ms;

/// Stable string tags for every way the guard can say no.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    DotBlocked,
    DohBlocked,
    DomainBlocked,
    IpBlocked,
    IpPrivate,
    IpV6Private,
    PrivateLanBlocked,
    IpLiteralBlocked,
    PolicyDefaultDeny,
    RateLimited,
    SchemeBlocked,
    HttpsRequired,
    PathBlocked,
    IntelMalicious,
    CapabilityDenied,
    RequestTooLarge,
    ResponseTooLarge,
    TooManyRedirects,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::DotBlocked => "dot_blocked",
            BlockReason::DohBlocked => "doh_blocked",
            BlockReason::DomainBlocked => "domain_blocked",
            BlockReason::IpBlocked => "ip_blocked",
            BlockReason::IpPrivate => "ip_private",
            BlockReason::IpV6Private => "ip_v6_private",
            BlockReason::PrivateLanBlocked => "private_lan_blocked",
            BlockReason::IpLiteralBlocked => "ip_literal_blocked",
            BlockReason::PolicyDefaultDeny => "policy_default_deny",
            BlockReason::RateLimited => "rate_limited",
            BlockReason::SchemeBlocked => "scheme_blocked",
            BlockReason::HttpsRequired => "https_required",
            BlockReason::PathBlocked => "path_blocked",
            BlockReason::IntelMalicious => "intel_malicious",
            BlockReason::CapabilityDenied => "capability_denied",
            BlockReason::RequestTooLarge => "request_too_large",
            BlockReason::ResponseTooLarge => "response_too_large",
            BlockReason::TooManyRedirects => "too_many_redirects",
        }
    }
}

/// Remediation affordances the UI offers for a given block reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    AllowOnce,
    AllowDomain,
    AllowWildcard,
    SetLanModeAllow,
    SetLanModeAsk,
    AllowIpLiterals,
    SwitchModeDefaultAllow,
    AllowHttp,
    RaiseQuota,
    RaiseSizeCap,
    EnableCapability,
    ReviewIntelReport,
    OpenPolicyViewer,
}

/// Per-reason action taxonomy. Every reason ends with the policy viewer as
/// the catch-all.
pub fn actions_for_reason(reason: BlockReason) -> Vec<RemediationAction> {
    use RemediationAction::*;
    match reason {
        BlockReason::PrivateLanBlocked => {
            vec![AllowOnce, SetLanModeAllow, SetLanModeAsk, OpenPolicyViewer]
        }
        BlockReason::IpPrivate | BlockReason::IpV6Private => {
            vec![SetLanModeAllow, OpenPolicyViewer]
        }
        BlockReason::IpLiteralBlocked => vec![AllowIpLiterals, AllowOnce, OpenPolicyViewer],
        BlockReason::PolicyDefaultDeny => {
            vec![AllowOnce, AllowWildcard, SwitchModeDefaultAllow, OpenPolicyViewer]
        }
        BlockReason::DomainBlocked | BlockReason::IpBlocked => {
            vec![AllowDomain, OpenPolicyViewer]
        }
        BlockReason::RateLimited => vec![RaiseQuota, OpenPolicyViewer],
        BlockReason::HttpsRequired => vec![AllowHttp, OpenPolicyViewer],
        BlockReason::RequestTooLarge | BlockReason::ResponseTooLarge => {
            vec![RaiseSizeCap, OpenPolicyViewer]
        }
        BlockReason::CapabilityDenied => vec![EnableCapability, OpenPolicyViewer],
        BlockReason::IntelMalicious => vec![ReviewIntelReport, OpenPolicyViewer],
        BlockReason::DotBlocked
        | BlockReason::DohBlocked
        | BlockReason::SchemeBlocked
        | BlockReason::PathBlocked
        | BlockReason::TooManyRedirects => vec![OpenPolicyViewer],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockContext {
    pub api: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub url: String,
}

/// The structured remediation report returned from a denied request. A
/// blocked fetch carries this as the JSON body of a synthetic 403; other
/// capabilities raise it as a security error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub ok: bool,
    pub blocked: bool,
    pub error: String,
    pub reason: BlockReason,
    /// The specific rule or check that produced the decision.
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub policy_mode: PolicyMode,
    pub how_to_fix: String,
    pub actions: Vec<RemediationAction>,
    pub remediation: String,
    pub context: BlockContext,
    pub timestamp: i64,
}

impl BlockPayload {
    pub fn new(
        reason: BlockReason,
        rule: impl Into<String>,
        domain: Option<String>,
        policy_mode: PolicyMode,
        context: BlockContext,
    ) -> Self {
        Self {
            ok: false,
            blocked: true,
            error: "NetGuardBlocked".to_string(),
            reason,
            rule: rule.into(),
            domain,
            policy_mode,
            how_to_fix: how_to_fix(reason),
            actions: actions_for_reason(reason),
            remediation: remediation(reason),
            context,
            timestamp: now_ms(),
        }
    }
}

fn how_to_fix(reason: BlockReason) -> String {
    match reason {
        BlockReason::PrivateLanBlocked => {
            "Private LAN access is set to ask. Allow it once or change the LAN mode in the policy viewer."
        }
        BlockReason::IpPrivate | BlockReason::IpV6Private => {
            "Private address ranges are denied by the current policy."
        }
        BlockReason::IpLiteralBlocked => "IP-literal destinations are disabled by policy.",
        BlockReason::PolicyDefaultDeny => {
            "The network policy is default-deny and no allow rule matched this host."
        }
        BlockReason::DomainBlocked | BlockReason::IpBlocked => {
            "This destination is on the configured blocklist."
        }
        BlockReason::RateLimited => "The per-domain request quota is exhausted; retry later.",
        BlockReason::SchemeBlocked => "This URL scheme is never allowed from the workspace.",
        BlockReason::HttpsRequired => "Plaintext HTTP is disabled; use https.",
        BlockReason::PathBlocked => "This path is outside the configured allowlist.",
        BlockReason::IntelMalicious => "Threat intelligence marked this destination malicious.",
        BlockReason::CapabilityDenied => "This capability is disabled by the compute policy.",
        BlockReason::RequestTooLarge => "The request body exceeds the configured size cap.",
        BlockReason::ResponseTooLarge => "The response exceeds the configured size cap.",
        BlockReason::TooManyRedirects => "The request exceeded the redirect limit.",
        BlockReason::DotBlocked => "DNS-over-TLS (port 853) is always blocked.",
        BlockReason::DohBlocked => "Known DNS-over-HTTPS resolvers are always blocked.",
    }
    .to_string()
}

fn remediation(reason: BlockReason) -> String {
    match reason {
        BlockReason::DotBlocked | BlockReason::DohBlocked => {
            "Use the platform resolver instead of an encrypted-DNS endpoint.".to_string()
        }
        _ => "Review the block in the policy viewer and adjust the policy if this was intended."
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reason_tags_are_snake_case() {
        let json = serde_json::to_value(BlockReason::PrivateLanBlocked).unwrap();
        assert_eq!(json, serde_json::json!("private_lan_blocked"));
        let v6 = serde_json::to_value(BlockReason::IpV6Private).unwrap();
        assert_eq!(v6, serde_json::json!("ip_v6_private"));
    }

    #[test]
    fn default_deny_actions_include_wildcard_and_viewer() {
        let actions = actions_for_reason(BlockReason::PolicyDefaultDeny);
        assert!(actions.contains(&RemediationAction::AllowWildcard));
        assert!(actions.contains(&RemediationAction::OpenPolicyViewer));
    }

    #[test]
    fn private_lan_taxonomy_matches_contract() {
        assert_eq!(
            actions_for_reason(BlockReason::PrivateLanBlocked),
            vec![
                RemediationAction::AllowOnce,
                RemediationAction::SetLanModeAllow,
                RemediationAction::SetLanModeAsk,
                RemediationAction::OpenPolicyViewer,
            ]
        );
    }

    #[test]
    fn payload_shape_round_trips() {
        let payload = BlockPayload::new(
            BlockReason::PolicyDefaultDeny,
            "host_policy",
            Some("example.com".to_string()),
            PolicyMode::DefaultDeny,
            BlockContext {
                api: "fetch".to_string(),
                method: Some("GET".to_string()),
                url: "https://example.com/x".to_string(),
            },
        );
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["ok"], serde_json::json!(false));
        assert_eq!(value["blocked"], serde_json::json!(true));
        assert_eq!(value["reason"], serde_json::json!("policy_default_deny"));
        assert_eq!(value["policy_mode"], serde_json::json!("default_deny"));
        let back: BlockPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }
}
