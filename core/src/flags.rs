use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Master switch for the network guard. Disabling it leaves every
    /// outbound capability un-intercepted.
    pub VITE_NET_GUARD_ENABLED: bool = true;
    /// Start the guard in monitor-only mode (emit block events, never block).
    pub VITE_NET_GUARD_MONITOR: bool = false;
    pub VITE_GUARD_VERBOSE: bool = false;

    /// Comma-separated seed lists merged into the network policy at startup.
    pub VITE_GUARD_ALLOW_DOMAINS: &str = "";
    pub VITE_GUARD_BLOCK_DOMAINS: &str = "";
    pub VITE_GUARD_ALLOW_IPS: &str = "";
    pub VITE_GUARD_ALLOW_IP_RANGES: &str = "";
    pub VITE_GUARD_BLOCK_IPS: &str = "";
    pub VITE_GUARD_ALLOW_PATHS: &str = "";

    pub VITE_GUARD_MAX_REDIRECTS: u32 = 5;
    pub VITE_GUARD_MAX_REQUEST_BYTES: u64 = 1_048_576;
    pub VITE_GUARD_MAX_RESPONSE_BYTES: u64 = 8_388_608;
    /// Sampling ratio for `net-guard-attempt` telemetry in [0, 1].
    pub VITE_GUARD_ATTEMPT_SAMPLE: f64 = 1.0;

    /// Rollout controller knobs: stage override and escalation thresholds.
    pub VITE_GUARD_ROLLOUT_STAGE: Option<&str> = None;
    pub VITE_GUARD_MINUTES_MONITOR: u64 = 30;
    pub VITE_GUARD_FPR_THRESHOLD: f64 = 0.001;
    pub VITE_GUARD_MIN_ATTEMPTS: u64 = 50;

    pub VITE_URLHAUS_ENABLED: bool = false;
    /// `host` or `url`.
    pub VITE_URLHAUS_MODE: &str = "host";
    pub VITE_URLHAUS_API_BASE: &str = "https://urlhaus-api.abuse.ch/v1";
    pub VITE_URLHAUS_AUTH_KEY: Option<&str> = None;
    pub VITE_URLHAUS_TIMEOUT_MS: Duration = Duration::from_millis(3_000), |value| {
        value.parse().map(Duration::from_millis)
    };
    pub VITE_URLHAUS_CACHE_TTL_SEC: u64 = 600;
    pub VITE_URLHAUS_PERSIST: bool = false;
    pub VITE_URLHAUS_PERSIST_KEY: &str = "uicp:urlhaus:cache:v1";
    pub VITE_URLHAUS_PERSIST_TTL_SEC: u64 = 86_400;
    pub VITE_URLHAUS_PERSIST_MAX: usize = 500;
    /// Policy allow-lists bypass URLHaus entirely when set.
    pub VITE_URLHAUS_RESPECT_ALLOWS: bool = true;

    pub VITE_PLANNER_TIMEOUT_MS: Duration = Duration::from_millis(120_000), |value| {
        value.parse().map(Duration::from_millis)
    };
    pub VITE_ACTOR_TIMEOUT_MS: Duration = Duration::from_millis(180_000), |value| {
        value.parse().map(Duration::from_millis)
    };
    pub VITE_CHAT_DEFAULT_TIMEOUT_MS: Duration = Duration::from_millis(120_000), |value| {
        value.parse().map(Duration::from_millis)
    };
    pub VITE_TASK_SPEC_TIMEOUT_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Inline JSON policy override; takes precedence over the persisted file.
    pub UICP_POLICY: Option<&str> = None;
    /// Forces the `locked` preset regardless of persisted policy.
    pub UICP_SAFE_MODE: bool = false;
}
