//! The network guard: every outbound capability the workspace can reach goes
//! through one state machine per invocation:
//!
//! ```text
//! Invoked → Classify scheme → Check path allowlist → Threat-intel lookup →
//! Host policy → Per-domain quota → (apply) → Post-response inspection
//! ```
//!
//! Termination states: Allowed (delegate), MonitorOnly (delegate but emit a
//! `net-guard-block` with `blocked:false`), Blocked (synthetic 403 for fetch,
//! security error for constructors), or BlockedAwaitingRetry in interactive
//! mode.

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use rand::Rng;
use reqwest::Url;
use tracing::debug;
use tracing::warn;
use wildmatch::WildMatch;

use crate::error::Result;
use crate::error::UicpErr;
use crate::flags;
use crate::net::block::BlockContext;
use crate::net::block::BlockPayload;
use crate::net::block::BlockReason;
use crate::net::classify::should_block_host;
use crate::net::intel::IntelClient;
use crate::net::intel::IntelMode;
use crate::net::intel::Verdict;
use crate::net::quota::TokenBuckets;
use crate::net::retry::RetryResolution;
use crate::net::retry::RetryTable;
use crate::policy::Decision;
use crate::policy::Policy;
use crate::policy::matches_wildcard_domain;
use crate::policy::runtime::get_effective_policy;
use crate::telemetry::COMPUTE_PERMISSION;
use crate::telemetry::NET_GUARD_ATTEMPT;
use crate::telemetry::NET_GUARD_BLOCK;
use crate::telemetry::TelemetryBus;
use crate::util::now_ms;

/// Outbound capabilities exposed to the embedded workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityApi {
    Fetch,
    Xhr,
    WebSocket,
    EventSource,
    Beacon,
    WebRtc,
    WebTransport,
    Worker,
    SharedWorker,
    ServiceWorker,
}

impl CapabilityApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityApi::Fetch => "fetch",
            CapabilityApi::Xhr => "xhr",
            CapabilityApi::WebSocket => "websocket",
            CapabilityApi::EventSource => "eventsource",
            CapabilityApi::Beacon => "beacon",
            CapabilityApi::WebRtc => "webrtc",
            CapabilityApi::WebTransport => "webtransport",
            CapabilityApi::Worker => "worker",
            CapabilityApi::SharedWorker => "shared_worker",
            CapabilityApi::ServiceWorker => "service_worker",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub enabled: bool,
    /// Emit block events without actually blocking; the rollout stage.
    pub monitor_only: bool,
    /// Park blocked fetches for interactive block-and-retry.
    pub interactive: bool,
    pub verbose: bool,
    /// Sampling ratio for attempt telemetry.
    pub attempt_sample: f64,
}

impl GuardConfig {
    pub fn from_flags() -> Self {
        Self {
            enabled: *flags::VITE_NET_GUARD_ENABLED,
            monitor_only: *flags::VITE_NET_GUARD_MONITOR,
            interactive: false,
            verbose: *flags::VITE_GUARD_VERBOSE,
            attempt_sample: (*flags::VITE_GUARD_ATTEMPT_SAMPLE).clamp(0.0, 1.0),
        }
    }
}

/// Attempt/block counters shared across reinstalls; the rollout controller
/// reads these to compute the false-positive ratio.
#[derive(Debug, Default)]
pub struct GuardStats {
    pub attempts: AtomicU64,
    pub blocks: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub redirected: bool,
    /// True when this is a synthetic block response carrying a
    /// [`BlockPayload`] JSON body rather than origin data.
    pub blocked: bool,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn block_payload(&self) -> Option<BlockPayload> {
        if !self.blocked {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Debug)]
pub enum GuardVerdict {
    Allowed,
    MonitorOnly(Box<BlockPayload>),
    Blocked(Box<BlockPayload>),
}

pub struct NetworkGuard {
    config: GuardConfig,
    policy: Arc<Policy>,
    quotas: Mutex<TokenBuckets>,
    intel: Option<Arc<IntelClient>>,
    bus: TelemetryBus,
    retries: Arc<RetryTable>,
    stats: Arc<GuardStats>,
    http: reqwest::Client,
}

impl NetworkGuard {
    pub fn new(
        config: GuardConfig,
        policy: Arc<Policy>,
        intel: Option<Arc<IntelClient>>,
        bus: TelemetryBus,
    ) -> Self {
        Self::with_shared(config, policy, intel, bus, Arc::default(), Arc::new(RetryTable::new()))
    }

    fn with_shared(
        config: GuardConfig,
        policy: Arc<Policy>,
        intel: Option<Arc<IntelClient>>,
        bus: TelemetryBus,
        stats: Arc<GuardStats>,
        retries: Arc<RetryTable>,
    ) -> Self {
        let max_redirects = policy.network.max_redirects as usize;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(max_redirects))
            .build()
            .unwrap_or_default();
        Self {
            config,
            policy,
            quotas: Mutex::new(TokenBuckets::new()),
            intel,
            bus,
            retries,
            stats,
            http,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<GuardStats> {
        &self.stats
    }

    pub fn retries(&self) -> &Arc<RetryTable> {
        &self.retries
    }

    /// Runs the classification chain and emits attempt/block telemetry. Does
    /// not delegate; callers act on the verdict.
    pub async fn check(
        &self,
        api: CapabilityApi,
        method: Option<&str>,
        url: &str,
    ) -> GuardVerdict {
        let context = BlockContext {
            api: api.as_str().to_string(),
            method: method.map(str::to_string),
            url: url.to_string(),
        };
        self.record_attempt(&context);

        let network = &self.policy.network;
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!("unparsable url `{url}`: {err}");
                return self.terminate(
                    BlockPayload::new(
                        BlockReason::SchemeBlocked,
                        "url_parse",
                        None,
                        network.mode,
                        context,
                    ),
                );
            }
        };

        // 1. Scheme.
        let host = parsed.host_str().unwrap_or_default().to_string();
        let loopback = crate::policy::is_loopback_host(&host);
        match parsed.scheme() {
            "https" | "wss" => {}
            "http" | "ws" => {
                if network.https_only && !loopback {
                    return self.terminate(BlockPayload::new(
                        BlockReason::HttpsRequired,
                        "https_only",
                        Some(host),
                        network.mode,
                        context,
                    ));
                }
            }
            other => {
                return self.terminate(BlockPayload::new(
                    BlockReason::SchemeBlocked,
                    format!("scheme:{other}"),
                    Some(host),
                    network.mode,
                    context,
                ));
            }
        }

        // 2. Path allowlist short-circuits the rest of the chain.
        let path = parsed.path();
        if self.path_allowed(&host, path) {
            return GuardVerdict::Allowed;
        }

        // 3. Threat intel.
        if let Some(intel) = &self.intel
            && !(intel.respects_allows() && is_allow_listed(&host, network))
        {
            let key = match intel.mode() {
                IntelMode::Host => host.clone(),
                IntelMode::Url => url.to_string(),
            };
            if intel.lookup(&key).await == Verdict::Malicious {
                return self.terminate(BlockPayload::new(
                    BlockReason::IntelMalicious,
                    "urlhaus",
                    Some(host),
                    network.mode,
                    context,
                ));
            }
        }

        // 4. Host policy.
        let decision = should_block_host(&host, parsed.port(), network);
        if decision.block {
            let reason = decision.reason.unwrap_or(BlockReason::PolicyDefaultDeny);
            return self.terminate(BlockPayload::new(
                reason,
                decision.rule.unwrap_or_else(|| "host_policy".to_string()),
                Some(host),
                network.mode,
                context,
            ));
        }

        // 5. Per-domain quota.
        let admitted = {
            let mut quotas = self.quotas.lock().unwrap_or_else(|p| p.into_inner());
            quotas.try_acquire(&host, now_ms(), network)
        };
        if !admitted {
            return self.terminate(BlockPayload::new(
                BlockReason::RateLimited,
                "quota",
                Some(host),
                network.mode,
                context,
            ));
        }

        GuardVerdict::Allowed
    }

    /// Guarded fetch. Allowed requests delegate to the HTTP client with
    /// request/response size caps and the redirect limit enforced; blocked
    /// requests resolve to a synthetic 403 carrying the block payload, or
    /// park for retry in interactive mode.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        if !self.config.enabled {
            return self.delegate_fetch(&request).await;
        }

        let context = BlockContext {
            api: CapabilityApi::Fetch.as_str().to_string(),
            method: Some(request.method.clone()),
            url: request.url.clone(),
        };

        let request_len = request.body.as_ref().map(Bytes::len).unwrap_or(0) as u64;
        if request_len > self.policy.network.max_request_bytes {
            let payload = BlockPayload::new(
                BlockReason::RequestTooLarge,
                "max_request_bytes",
                host_of(&request.url),
                self.policy.network.mode,
                context,
            );
            let payload = self.emit_block(payload);
            if !self.config.monitor_only {
                return Ok(block_response(&payload));
            }
        }

        match self
            .check(CapabilityApi::Fetch, Some(&request.method), &request.url)
            .await
        {
            GuardVerdict::Allowed | GuardVerdict::MonitorOnly(_) => {
                self.delegate_fetch(&request).await
            }
            GuardVerdict::Blocked(payload) => {
                if self.config.interactive {
                    self.park_for_retry(*payload, request).await
                } else {
                    Ok(block_response(&payload))
                }
            }
        }
    }

    /// WebSocket/EventSource/XHR-style constructors cannot return a synthetic
    /// response; a block raises a security error instead.
    pub async fn check_or_throw(
        &self,
        api: CapabilityApi,
        method: Option<&str>,
        url: &str,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        match self.check(api, method, url).await {
            GuardVerdict::Allowed | GuardVerdict::MonitorOnly(_) => Ok(()),
            GuardVerdict::Blocked(payload) => Err(UicpErr::GuardBlocked(payload)),
        }
    }

    /// WebSocket constructor wrapper.
    pub async fn connect_websocket(&self, url: &str) -> Result<()> {
        self.check_or_throw(CapabilityApi::WebSocket, None, url).await
    }

    /// EventSource constructor wrapper.
    pub async fn open_event_source(&self, url: &str) -> Result<()> {
        self.check_or_throw(CapabilityApi::EventSource, Some("GET"), url)
            .await
    }

    /// XHR `open` wrapper; XHR shares fetch semantics but raises on block.
    pub async fn open_xhr(&self, method: &str, url: &str) -> Result<()> {
        self.check_or_throw(CapabilityApi::Xhr, Some(method), url).await
    }

    /// Beacon semantics: returns whether the payload was queued. Blocked
    /// beacons report false rather than raising.
    pub async fn send_beacon(&self, url: &str, body: Bytes) -> Result<bool> {
        if !self.config.enabled {
            let request = FetchRequest {
                method: "POST".to_string(),
                url: url.to_string(),
                headers: Vec::new(),
                body: Some(body),
            };
            return Ok(self.delegate_fetch(&request).await.is_ok());
        }

        if body.len() as u64 > self.policy.network.max_request_bytes {
            let payload = BlockPayload::new(
                BlockReason::RequestTooLarge,
                "max_request_bytes",
                host_of(url),
                self.policy.network.mode,
                BlockContext {
                    api: CapabilityApi::Beacon.as_str().to_string(),
                    method: Some("POST".to_string()),
                    url: url.to_string(),
                },
            );
            self.emit_block(payload);
            return Ok(false);
        }

        match self.check(CapabilityApi::Beacon, Some("POST"), url).await {
            GuardVerdict::Allowed | GuardVerdict::MonitorOnly(_) => {
                let request = FetchRequest {
                    method: "POST".to_string(),
                    url: url.to_string(),
                    headers: Vec::new(),
                    body: Some(body),
                };
                // Fire-and-forget; queueing is success.
                let guard_http = self.http.clone();
                let built = build_request(&guard_http, &request);
                if let Some(built) = built {
                    tokio::spawn(async move {
                        let _ = built.send().await;
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            GuardVerdict::Blocked(_) => Ok(false),
        }
    }

    /// Dedicated-toggle capabilities (WebRTC, WebTransport, workers, service
    /// worker registration) consult the compute policy instead of the host
    /// chain.
    pub fn check_capability(&self, api: CapabilityApi) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let toggle = match api {
            CapabilityApi::Worker | CapabilityApi::SharedWorker => self.policy.compute.workers,
            CapabilityApi::ServiceWorker => self.policy.compute.service_worker,
            CapabilityApi::WebRtc => self.policy.compute.webrtc,
            CapabilityApi::WebTransport => self.policy.compute.webtransport,
            other => {
                warn!("check_capability called for {other:?}");
                return Ok(());
            }
        };
        match toggle {
            Decision::Allow => Ok(()),
            Decision::Ask | Decision::Deny => {
                if toggle == Decision::Ask {
                    self.bus.emit(
                        COMPUTE_PERMISSION,
                        serde_json::json!({ "feature": api.as_str() }),
                    );
                }
                let context = BlockContext {
                    api: api.as_str().to_string(),
                    method: None,
                    url: String::new(),
                };
                self.record_attempt(&context);
                let payload = BlockPayload::new(
                    BlockReason::CapabilityDenied,
                    format!("compute:{}", api.as_str()),
                    None,
                    self.policy.network.mode,
                    context,
                );
                let payload = self.emit_block(payload);
                if self.config.monitor_only {
                    Ok(())
                } else {
                    Err(UicpErr::GuardBlocked(Box::new(payload)))
                }
            }
        }
    }

    async fn delegate_fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let Some(built) = build_request(&self.http, request) else {
            return Err(UicpErr::StreamClosed(format!(
                "invalid fetch request for {}",
                request.url
            )));
        };

        let response = match built.send().await {
            Ok(response) => response,
            Err(err) => {
                if err.is_redirect() {
                    let payload = BlockPayload::new(
                        BlockReason::TooManyRedirects,
                        "max_redirects",
                        host_of(&request.url),
                        self.policy.network.mode,
                        BlockContext {
                            api: CapabilityApi::Fetch.as_str().to_string(),
                            method: Some(request.method.clone()),
                            url: request.url.clone(),
                        },
                    );
                    let payload = self.emit_block(payload);
                    return Ok(block_response(&payload));
                }
                return Err(err.into());
            }
        };

        let redirected = response.url().as_str() != request.url;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        // Post-response inspection: effective cap is the min of the
        // per-domain override and the global cap.
        let cap = self.effective_response_cap(&host_of(&request.url).unwrap_or_default());
        if self.config.enabled && body.len() as u64 > cap {
            let payload = BlockPayload::new(
                BlockReason::ResponseTooLarge,
                "max_response_bytes",
                host_of(&request.url),
                self.policy.network.mode,
                BlockContext {
                    api: CapabilityApi::Fetch.as_str().to_string(),
                    method: Some(request.method.clone()),
                    url: request.url.clone(),
                },
            );
            let payload = self.emit_block(payload);
            if !self.config.monitor_only {
                return Ok(block_response(&payload));
            }
        }

        Ok(FetchResponse {
            status,
            redirected,
            blocked: false,
            body,
        })
    }

    async fn park_for_retry(
        &self,
        payload: BlockPayload,
        request: FetchRequest,
    ) -> Result<FetchResponse> {
        let http = self.http.clone();
        let cloned = request.clone();
        let invoke: crate::net::retry::RetryInvoke = Arc::new(move || {
            let http = http.clone();
            let request = cloned.clone();
            Box::pin(async move {
                let Some(built) = build_request(&http, &request) else {
                    return Err(UicpErr::StreamClosed(format!(
                        "invalid fetch request for {}",
                        request.url
                    )));
                };
                let response = built.send().await?;
                let redirected = response.url().as_str() != request.url;
                let status = response.status().as_u16();
                let body = response.bytes().await?;
                Ok(FetchResponse {
                    status,
                    redirected,
                    blocked: false,
                    body,
                })
            })
        });

        let (retry_id, receiver) = self.retries.register(payload.clone(), invoke);
        self.bus.emit(
            NET_GUARD_BLOCK,
            serde_json::json!({
                "api": payload.context.api,
                "url": payload.context.url,
                "reason": payload.reason.as_str(),
                "blocked": true,
                "retryId": retry_id,
                "payload": payload,
            }),
        );

        match receiver.await {
            Ok(RetryResolution::Retried(outcome)) => outcome,
            Ok(RetryResolution::Denied(payload)) | Ok(RetryResolution::TimedOut(payload)) => {
                Ok(block_response(&payload))
            }
            Err(_) => Ok(block_response(&payload)),
        }
    }

    fn path_allowed(&self, host: &str, path: &str) -> bool {
        let target = format!("{host}{path}");
        self.policy.network.allow_paths.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_prefix('/') {
                path.strip_prefix('/')
                    .map(|p| p.starts_with(prefix) || WildMatch::new(pattern).matches(path))
                    .unwrap_or(false)
            } else {
                WildMatch::new(pattern).matches(&target) || target.starts_with(pattern)
            }
        })
    }

    fn effective_response_cap(&self, host: &str) -> u64 {
        let network = &self.policy.network;
        let global = network.max_response_bytes;
        network
            .per_domain_response_bytes
            .iter()
            .filter(|(pattern, _)| {
                pattern.eq_ignore_ascii_case(host) || matches_wildcard_domain(host, pattern)
            })
            .map(|(_, cap)| *cap)
            .min()
            .map(|cap| cap.min(global))
            .unwrap_or(global)
    }

    fn record_attempt(&self, context: &BlockContext) {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        let sampled = self.config.attempt_sample >= 1.0
            || rand::rng().random_range(0.0..1.0) < self.config.attempt_sample;
        if sampled {
            self.bus.emit(
                NET_GUARD_ATTEMPT,
                serde_json::json!({
                    "api": context.api,
                    "url": context.url,
                    "method": context.method,
                    "blocked": false,
                }),
            );
        }
    }

    /// Counts the block and emits the event; in monitor-only mode the event
    /// carries `blocked:false` and the caller delegates anyway.
    fn emit_block(&self, payload: BlockPayload) -> BlockPayload {
        self.stats.blocks.fetch_add(1, Ordering::Relaxed);
        if self.config.verbose {
            debug!(
                reason = payload.reason.as_str(),
                url = payload.context.url,
                "net guard block"
            );
        }
        self.bus.emit(
            NET_GUARD_BLOCK,
            serde_json::json!({
                "api": payload.context.api,
                "url": payload.context.url,
                "method": payload.context.method,
                "reason": payload.reason.as_str(),
                "blocked": !self.config.monitor_only,
                "payload": payload,
            }),
        );
        payload
    }

    fn terminate(&self, payload: BlockPayload) -> GuardVerdict {
        let payload = self.emit_block(payload);
        if self.config.monitor_only {
            GuardVerdict::MonitorOnly(Box::new(payload))
        } else {
            GuardVerdict::Blocked(Box::new(payload))
        }
    }
}

fn build_request(
    client: &reqwest::Client,
    request: &FetchRequest,
) -> Option<reqwest::RequestBuilder> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes()).ok()?;
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    Some(builder)
}

fn block_response(payload: &BlockPayload) -> FetchResponse {
    FetchResponse {
        status: 403,
        redirected: false,
        blocked: true,
        body: Bytes::from(serde_json::to_vec(payload).unwrap_or_default()),
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

fn is_allow_listed(host: &str, network: &crate::policy::NetworkPolicy) -> bool {
    network.allow_domains.iter().any(|domain| {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    }) || network
        .allow_ips
        .iter()
        .any(|ip| ip.eq_ignore_ascii_case(host))
}

// ---------------------------------------------------------------------------
// Installation registry
// ---------------------------------------------------------------------------

static INSTALLED: LazyLock<RwLock<Option<Arc<NetworkGuard>>>> =
    LazyLock::new(|| RwLock::new(None));
static SEALED: AtomicBool = AtomicBool::new(false);
static POLICY_HOOKED: AtomicBool = AtomicBool::new(false);

/// Installs the guard once. A second call returns the existing instance
/// (wrappers are marked once to prevent double-install); policy changes
/// re-install through the registered subscriber.
pub fn install_network_guard(
    config: GuardConfig,
    intel: Option<Arc<IntelClient>>,
    bus: TelemetryBus,
) -> Arc<NetworkGuard> {
    {
        let installed = INSTALLED.read().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = installed.as_ref() {
            return Arc::clone(existing);
        }
    }

    let guard = Arc::new(NetworkGuard::new(
        config,
        get_effective_policy(),
        intel.clone(),
        bus.clone(),
    ));
    {
        let mut installed = INSTALLED.write().unwrap_or_else(|p| p.into_inner());
        *installed = Some(Arc::clone(&guard));
    }

    if !POLICY_HOOKED.swap(true, Ordering::SeqCst) {
        crate::policy::runtime::subscribe_policy(move |_| {
            reinstall_network_guard(None);
        });
    }

    guard
}

/// Rebuilds the installed guard against the current effective policy,
/// carrying over stats and parked retries. `monitor_only` overrides the
/// stage when given (the rollout controller's escalation path).
pub fn reinstall_network_guard(monitor_only: Option<bool>) -> Option<Arc<NetworkGuard>> {
    let mut installed = INSTALLED.write().unwrap_or_else(|p| p.into_inner());
    let existing = installed.as_ref()?;

    let mut config = existing.config.clone();
    if let Some(monitor_only) = monitor_only {
        config.monitor_only = monitor_only;
        if !monitor_only {
            // Leaving monitor mode resolves anything parked under it.
            existing.retries.cancel_all();
        }
    }
    let next = Arc::new(NetworkGuard::with_shared(
        config,
        get_effective_policy(),
        existing.intel.clone(),
        existing.bus.clone(),
        Arc::clone(&existing.stats),
        Arc::clone(&existing.retries),
    ));
    *installed = Some(Arc::clone(&next));
    Some(next)
}

pub fn installed_guard() -> Option<Arc<NetworkGuard>> {
    INSTALLED
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .as_ref()
        .map(Arc::clone)
}

/// After sealing, the guard cannot be uninstalled. Tests detect a test
/// runtime and relax this via [`uninstall_network_guard_for_tests`].
pub fn seal_network_guard() {
    SEALED.store(true, Ordering::SeqCst);
}

pub fn uninstall_network_guard_for_tests() {
    SEALED.store(false, Ordering::SeqCst);
    let mut installed = INSTALLED.write().unwrap_or_else(|p| p.into_inner());
    *installed = None;
}

/// Production uninstall path: refused once sealed.
pub fn uninstall_network_guard() -> bool {
    if SEALED.load(Ordering::SeqCst) {
        warn!("refusing to uninstall a sealed network guard");
        return false;
    }
    let mut installed = INSTALLED.write().unwrap_or_else(|p| p.into_inner());
    installed.take().is_some()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::policy::PolicyMode;
    use crate::policy::WildcardRule;

    fn guard_with(policy: Policy, config: GuardConfig) -> NetworkGuard {
        NetworkGuard::new(config, Arc::new(policy), None, TelemetryBus::new())
    }

    fn enforcing() -> GuardConfig {
        GuardConfig {
            enabled: true,
            monitor_only: false,
            interactive: false,
            verbose: false,
            attempt_sample: 1.0,
        }
    }

    #[tokio::test]
    async fn default_deny_blocks_unlisted_host() {
        let mut policy = Policy::default();
        policy.network.mode = PolicyMode::DefaultDeny;
        let guard = guard_with(policy, enforcing());
        match guard
            .check(CapabilityApi::Fetch, Some("GET"), "https://example.com/x")
            .await
        {
            GuardVerdict::Blocked(payload) => {
                assert_eq!(payload.reason, BlockReason::PolicyDefaultDeny);
                assert!(payload
                    .actions
                    .contains(&crate::net::block::RemediationAction::AllowWildcard));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wildcard_rule_allows_under_default_deny() {
        let mut policy = Policy::default();
        policy.network.mode = PolicyMode::DefaultDeny;
        policy.network.rules.push(WildcardRule {
            pattern: "*.example.com".to_string(),
            paths: Vec::new(),
        });
        let guard = guard_with(policy, enforcing());
        assert!(matches!(
            guard
                .check(CapabilityApi::Fetch, Some("GET"), "https://api.example.com/x")
                .await,
            GuardVerdict::Allowed
        ));
    }

    #[tokio::test]
    async fn monitor_only_reports_without_blocking() {
        let mut policy = Policy::default();
        policy.network.mode = PolicyMode::DefaultDeny;
        let mut config = enforcing();
        config.monitor_only = true;

        let bus = TelemetryBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        bus.subscribe(move |ev| {
            if ev.name == NET_GUARD_BLOCK {
                events_clone.lock().unwrap().push(ev.payload.clone());
            }
        });

        let guard = NetworkGuard::new(config, Arc::new(policy), None, bus);
        match guard
            .check(CapabilityApi::Fetch, Some("GET"), "https://example.com/x")
            .await
        {
            GuardVerdict::MonitorOnly(_) => {}
            other => panic!("expected monitor-only, got {other:?}"),
        }
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["blocked"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn https_only_blocks_plaintext_except_loopback() {
        let guard = guard_with(Policy::default(), enforcing());
        match guard
            .check(CapabilityApi::Fetch, Some("GET"), "http://example.com/")
            .await
        {
            GuardVerdict::Blocked(payload) => {
                assert_eq!(payload.reason, BlockReason::HttpsRequired)
            }
            other => panic!("expected block, got {other:?}"),
        }
        assert!(matches!(
            guard
                .check(CapabilityApi::Fetch, Some("GET"), "http://localhost:8080/dev")
                .await,
            GuardVerdict::Allowed
        ));
    }

    #[tokio::test]
    async fn path_allowlist_short_circuits() {
        let mut policy = Policy::default();
        policy.network.mode = PolicyMode::DefaultDeny;
        policy.network.allow_paths.push("api.example.com/v1/*".to_string());
        let guard = guard_with(policy, enforcing());
        assert!(matches!(
            guard
                .check(
                    CapabilityApi::Fetch,
                    Some("GET"),
                    "https://api.example.com/v1/items"
                )
                .await,
            GuardVerdict::Allowed
        ));
    }

    #[tokio::test]
    async fn quota_exhaustion_blocks_with_rate_limited() {
        let mut policy = Policy::default();
        policy.network.quotas.default = crate::policy::QuotaSpec {
            capacity: 1.0,
            refill_per_sec: 0.0,
        };
        let guard = guard_with(policy, enforcing());
        assert!(matches!(
            guard
                .check(CapabilityApi::Fetch, Some("GET"), "https://example.com/a")
                .await,
            GuardVerdict::Allowed
        ));
        match guard
            .check(CapabilityApi::Fetch, Some("GET"), "https://example.com/b")
            .await
        {
            GuardVerdict::Blocked(payload) => assert_eq!(payload.reason, BlockReason::RateLimited),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn capability_toggles_consult_compute_policy() {
        let mut policy = Policy::default();
        policy.compute.webrtc = Decision::Deny;
        policy.compute.workers = Decision::Allow;
        let guard = guard_with(policy, enforcing());
        assert!(guard.check_capability(CapabilityApi::Worker).is_ok());
        let err = guard
            .check_capability(CapabilityApi::WebRtc)
            .unwrap_err();
        assert!(err.to_string().starts_with("NetGuardBlocked"));
    }

    #[tokio::test]
    async fn ask_capability_emits_compute_permission() {
        let mut policy = Policy::default();
        policy.compute.webtransport = Decision::Ask;
        let bus = TelemetryBus::new();
        let asked = Arc::new(Mutex::new(Vec::new()));
        let asked_clone = Arc::clone(&asked);
        bus.subscribe(move |ev| {
            if ev.name == COMPUTE_PERMISSION {
                asked_clone.lock().unwrap().push(ev.payload.clone());
            }
        });
        let guard = NetworkGuard::new(enforcing(), Arc::new(policy), None, bus);
        assert!(guard.check_capability(CapabilityApi::WebTransport).is_err());
        assert_eq!(
            asked.lock().unwrap().as_slice(),
            &[serde_json::json!({ "feature": "webtransport" })]
        );
    }

    #[tokio::test]
    async fn stats_count_attempts_and_blocks() {
        let mut policy = Policy::default();
        policy.network.mode = PolicyMode::DefaultDeny;
        let guard = guard_with(policy, enforcing());
        let _ = guard
            .check(CapabilityApi::Fetch, Some("GET"), "https://one.example/")
            .await;
        let _ = guard
            .check(CapabilityApi::WebSocket, None, "wss://two.example/")
            .await;
        assert_eq!(guard.stats().attempts.load(Ordering::Relaxed), 2);
        assert_eq!(guard.stats().blocks.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn effective_response_cap_takes_min() {
        let mut policy = Policy::default();
        policy.network.max_response_bytes = 1000;
        policy
            .network
            .per_domain_response_bytes
            .insert("big.example".to_string(), 5000);
        policy
            .network
            .per_domain_response_bytes
            .insert("small.example".to_string(), 10);
        let guard = guard_with(policy, enforcing());
        assert_eq!(guard.effective_response_cap("big.example"), 1000);
        assert_eq!(guard.effective_response_cap("small.example"), 10);
        assert_eq!(guard.effective_response_cap("other.example"), 1000);
    }
}
