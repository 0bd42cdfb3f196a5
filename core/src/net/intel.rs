//! URLHaus threat-intelligence lookups with an in-memory TTL cache, optional
//! persisted cache, and in-flight dedup so each key has at most one
//! outstanding request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;
use tracing::warn;

use crate::flags;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntelMode {
    Host,
    Url,
}

#[derive(Debug, Clone)]
pub struct IntelConfig {
    pub enabled: bool,
    pub mode: IntelMode,
    pub api_base: String,
    pub auth_key: Option<String>,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub persist: bool,
    pub persist_key: String,
    pub persist_ttl: Duration,
    pub persist_max: usize,
    /// When set, hosts on the policy allow lists skip URLHaus entirely.
    pub respect_allows: bool,
}

impl IntelConfig {
    pub fn from_flags() -> Self {
        Self {
            enabled: *flags::VITE_URLHAUS_ENABLED,
            mode: match *flags::VITE_URLHAUS_MODE {
                "url" => IntelMode::Url,
                _ => IntelMode::Host,
            },
            api_base: flags::VITE_URLHAUS_API_BASE.to_string(),
            auth_key: flags::VITE_URLHAUS_AUTH_KEY.map(str::to_string),
            timeout: *flags::VITE_URLHAUS_TIMEOUT_MS,
            cache_ttl: Duration::from_secs(*flags::VITE_URLHAUS_CACHE_TTL_SEC),
            persist: *flags::VITE_URLHAUS_PERSIST,
            persist_key: flags::VITE_URLHAUS_PERSIST_KEY.to_string(),
            persist_ttl: Duration::from_secs(*flags::VITE_URLHAUS_PERSIST_TTL_SEC),
            persist_max: *flags::VITE_URLHAUS_PERSIST_MAX,
            respect_allows: *flags::VITE_URLHAUS_RESPECT_ALLOWS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Malicious,
    Suspicious,
    Clean,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CacheEntry {
    verdict: Verdict,
    expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistEntry {
    key: String,
    verdict: Verdict,
    expires_at: i64,
}

pub struct IntelClient {
    http: reqwest::Client,
    config: IntelConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Verdict>>>>,
}

impl IntelClient {
    pub fn new(config: IntelConfig) -> Self {
        let client = Self {
            http: reqwest::Client::new(),
            config,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        };
        client.load_persisted();
        client
    }

    pub fn mode(&self) -> IntelMode {
        self.config.mode
    }

    pub fn respects_allows(&self) -> bool {
        self.config.respect_allows
    }

    /// Resolves the verdict for one key (a host in host mode, a full URL in
    /// url mode). Network failures and timeouts degrade to `Unknown`;
    /// the guard never hard-fails on intel problems.
    pub async fn lookup(&self, key: &str) -> Verdict {
        if !self.config.enabled {
            return Verdict::Unknown;
        }
        let key = key.to_ascii_lowercase();

        if let Some(hit) = self.cache_get(&key) {
            return hit;
        }

        // Concurrent lookups for the same key share one request.
        let cell = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(inflight.entry(key.clone()).or_default())
        };
        let verdict = *cell.get_or_init(|| self.query(key.clone())).await;
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            inflight.remove(&key);
        }
        verdict
    }

    async fn query(&self, key: String) -> Verdict {
        let endpoint = match self.config.mode {
            IntelMode::Host => format!("{}/host/", self.config.api_base.trim_end_matches('/')),
            IntelMode::Url => format!("{}/url/", self.config.api_base.trim_end_matches('/')),
        };
        let field = match self.config.mode {
            IntelMode::Host => "host",
            IntelMode::Url => "url",
        };

        let mut request = self.http.post(&endpoint).form(&[(field, key.as_str())]);
        if let Some(auth) = &self.config.auth_key {
            request = request.header("Auth-Key", auth);
        }

        let verdict = match tokio::time::timeout(self.config.timeout, request.send()).await {
            Ok(Ok(response)) => match response.json::<Value>().await {
                Ok(body) => classify_response(&body),
                Err(err) => {
                    debug!("urlhaus response body unreadable: {err}");
                    Verdict::Unknown
                }
            },
            Ok(Err(err)) => {
                debug!("urlhaus request failed: {err}");
                Verdict::Unknown
            }
            Err(_elapsed) => {
                debug!("urlhaus request timed out for {key}");
                Verdict::Unknown
            }
        };

        self.cache_put(&key, verdict);
        verdict
    }

    fn cache_get(&self, key: &str) -> Option<Verdict> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(key)
            .filter(|entry| entry.expires_at > now_ms())
            .map(|entry| entry.verdict)
    }

    fn cache_put(&self, key: &str, verdict: Verdict) {
        // Malicious verdicts stick around twice as long.
        let ttl = if verdict == Verdict::Malicious {
            self.config.cache_ttl * 2
        } else {
            self.config.cache_ttl
        };
        let entry = CacheEntry {
            verdict,
            expires_at: now_ms() + ttl.as_millis() as i64,
        };
        {
            let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.insert(key.to_string(), entry);
        }
        if self.config.persist && verdict != Verdict::Unknown {
            self.save_persisted();
        }
    }

    fn persist_path(&self) -> Option<PathBuf> {
        let safe_key: String = self
            .config
            .persist_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        dirs::data_dir().map(|dir| dir.join("uicp").join(format!("{safe_key}.json")))
    }

    fn load_persisted(&self) {
        if !self.config.persist {
            return;
        }
        let Some(path) = self.persist_path() else {
            return;
        };
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return;
        };
        let entries: Vec<PersistEntry> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("persisted intel cache at {} is corrupt: {err}", path.display());
                return;
            }
        };
        let now = now_ms();
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        for entry in entries {
            if entry.expires_at > now {
                cache.insert(
                    entry.key,
                    CacheEntry {
                        verdict: entry.verdict,
                        expires_at: entry.expires_at,
                    },
                );
            }
        }
    }

    /// Best-effort write of the live entries, capped at `persist_max` with
    /// soonest-to-expire entries evicted first on overflow.
    fn save_persisted(&self) {
        let Some(path) = self.persist_path() else {
            return;
        };
        let now = now_ms();
        let mut entries: Vec<PersistEntry> = {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            cache
                .iter()
                .filter(|(_, entry)| entry.expires_at > now)
                .map(|(key, entry)| PersistEntry {
                    key: key.clone(),
                    verdict: entry.verdict,
                    expires_at: entry.expires_at,
                })
                .collect()
        };
        if entries.len() > self.config.persist_max {
            entries.sort_by_key(|entry| std::cmp::Reverse(entry.expires_at));
            entries.truncate(self.config.persist_max);
        }
        if let Some(parent) = path.parent()
            && std::fs::create_dir_all(parent).is_err()
        {
            return;
        }
        match serde_json::to_vec(&entries) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&path, bytes) {
                    debug!("failed to persist intel cache: {err}");
                }
            }
            Err(err) => debug!("failed to serialize intel cache: {err}"),
        }
    }
}

/// Maps a URLHaus response body to a verdict. Upstream has shipped both
/// `query_status` and the typo `query_staus`; both are accepted on purpose.
pub fn classify_response(body: &Value) -> Verdict {
    let status = body
        .get("query_status")
        .or_else(|| body.get("query_staus"))
        .and_then(|s| s.as_str());
    match status {
        Some("ok") => {
            let urls = body.get("urls").and_then(|u| u.as_array());
            match urls {
                Some(urls) if !urls.is_empty() => {
                    let any_online = urls.iter().any(|entry| {
                        entry.get("url_status").and_then(|s| s.as_str()) == Some("online")
                    });
                    if any_online {
                        Verdict::Malicious
                    } else {
                        Verdict::Suspicious
                    }
                }
                _ => Verdict::Clean,
            }
        }
        Some("no_results") => Verdict::Clean,
        _ => Verdict::Unknown,
    }
}
