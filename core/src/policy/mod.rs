//! Layered policy model.
//!
//! Presets are deep-copied starting points; runtime overrides layer on top and
//! replace the process-wide policy atomically through
//! [`runtime::set_runtime_policy`].

mod matcher;
pub mod runtime;

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub use matcher::Ipv4Cidr;
pub use matcher::host_ip;
pub use matcher::is_loopback_host;
pub use matcher::is_private_ip;
pub use matcher::matches_wildcard_domain;

/// Network stance: allow unless a rule blocks, or deny unless a rule allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    DefaultAllow,
    DefaultDeny,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Deny,
    #[default]
    Ask,
    Allow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsAccess {
    Deny,
    #[default]
    Prompt,
    Allow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomSource {
    /// Seeded, reproducible randomness for generated compute.
    Deterministic,
    #[default]
    System,
}

/// Allow pattern with optional path prefixes. `*.example.com` covers the apex
/// and every subdomain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WildcardRule {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSpec {
    /// Burst capacity in tokens.
    pub capacity: f64,
    /// Sustained refill rate, tokens per second.
    pub refill_per_sec: f64,
}

impl Default for QuotaSpec {
    fn default() -> Self {
        Self {
            capacity: 30.0,
            refill_per_sec: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPolicy {
    #[serde(default)]
    pub default: QuotaSpec,
    /// Per-domain overrides; closest wildcard match wins.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_domain: HashMap<String, QuotaSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub mode: PolicyMode,
    pub https_only: bool,
    pub allow_ip_literals: bool,
    pub allow_private_lan: Decision,
    pub allow_domains: Vec<String>,
    pub block_domains: Vec<String>,
    pub allow_ips: Vec<String>,
    pub allow_ip_ranges: Vec<String>,
    pub block_ips: Vec<String>,
    pub allow_paths: Vec<String>,
    pub rules: Vec<WildcardRule>,
    pub quotas: QuotaPolicy,
    pub max_redirects: u32,
    pub max_request_bytes: u64,
    pub max_response_bytes: u64,
    /// Per-domain response caps; the effective cap is the min of the override
    /// and the global cap.
    pub per_domain_response_bytes: HashMap<String, u64>,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            mode: PolicyMode::DefaultAllow,
            https_only: true,
            allow_ip_literals: false,
            allow_private_lan: Decision::Ask,
            allow_domains: Vec::new(),
            block_domains: Vec::new(),
            allow_ips: Vec::new(),
            allow_ip_ranges: Vec::new(),
            block_ips: Vec::new(),
            allow_paths: Vec::new(),
            rules: Vec::new(),
            quotas: QuotaPolicy::default(),
            max_redirects: *crate::flags::VITE_GUARD_MAX_REDIRECTS,
            max_request_bytes: *crate::flags::VITE_GUARD_MAX_REQUEST_BYTES,
            max_response_bytes: *crate::flags::VITE_GUARD_MAX_RESPONSE_BYTES,
            per_domain_response_bytes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComputePolicy {
    pub allow_timers: bool,
    pub random_source: RandomSource,
    pub cpu_ms_cap: u64,
    pub memory_mb_cap: u64,
    pub workers: Decision,
    pub service_worker: Decision,
    pub webrtc: Decision,
    pub webtransport: Decision,
}

impl Default for ComputePolicy {
    fn default() -> Self {
        Self {
            allow_timers: true,
            random_source: RandomSource::System,
            cpu_ms_cap: 30_000,
            memory_mb_cap: 256,
            workers: Decision::Ask,
            service_worker: Decision::Deny,
            webrtc: Decision::Ask,
            webtransport: Decision::Ask,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilesystemPolicy {
    pub access: FsAccess,
    pub read_globs: Vec<String>,
    pub write_globs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermissionsPolicy {
    pub persist: bool,
    pub review_on_first_run: bool,
}

impl Default for PermissionsPolicy {
    fn default() -> Self {
        Self {
            persist: true,
            review_on_first_run: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObservabilityPolicy {
    pub log_level: String,
    pub overlay: bool,
}

impl Default for ObservabilityPolicy {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            overlay: false,
        }
    }
}

/// Complete policy record. Missing sections and fields always fill from the
/// balanced defaults, so a policy can never be partially constructed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub network: NetworkPolicy,
    pub compute: ComputePolicy,
    pub filesystem: FilesystemPolicy,
    pub permissions: PermissionsPolicy,
    pub observability: ObservabilityPolicy,
}

/// Fills every missing field of a partial policy value with its documented
/// default. Idempotent: `ensure_policy(ensure_policy(p)) == ensure_policy(p)`.
pub fn ensure_policy(partial: &Value) -> Policy {
    serde_json::from_value(partial.clone()).unwrap_or_default()
}

/// Deep-copied preset starting points. Mutating a returned preset never
/// affects subsequent reads.
pub struct Presets;

impl Presets {
    pub fn by_name(name: &str) -> Option<Policy> {
        match name {
            "open" => Some(Self::open()),
            "balanced" => Some(Self::balanced()),
            "locked" => Some(Self::locked()),
            _ => None,
        }
    }

    pub fn open() -> Policy {
        Policy {
            network: NetworkPolicy {
                mode: PolicyMode::DefaultAllow,
                https_only: false,
                allow_ip_literals: true,
                allow_private_lan: Decision::Allow,
                ..NetworkPolicy::default()
            },
            compute: ComputePolicy {
                workers: Decision::Allow,
                service_worker: Decision::Ask,
                webrtc: Decision::Allow,
                webtransport: Decision::Allow,
                ..ComputePolicy::default()
            },
            filesystem: FilesystemPolicy {
                access: FsAccess::Allow,
                ..FilesystemPolicy::default()
            },
            ..Policy::default()
        }
    }

    pub fn balanced() -> Policy {
        Policy::default()
    }

    pub fn locked() -> Policy {
        Policy {
            network: NetworkPolicy {
                mode: PolicyMode::DefaultDeny,
                https_only: true,
                allow_ip_literals: false,
                allow_private_lan: Decision::Deny,
                ..NetworkPolicy::default()
            },
            compute: ComputePolicy {
                workers: Decision::Deny,
                service_worker: Decision::Deny,
                webrtc: Decision::Deny,
                webtransport: Decision::Deny,
                random_source: RandomSource::Deterministic,
                ..ComputePolicy::default()
            },
            filesystem: FilesystemPolicy {
                access: FsAccess::Deny,
                ..FilesystemPolicy::default()
            },
            observability: ObservabilityPolicy {
                log_level: "warn".to_string(),
                overlay: false,
            },
            ..Policy::default()
        }
    }
}
