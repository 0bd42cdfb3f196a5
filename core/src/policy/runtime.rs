//! Process-wide policy singleton.
//!
//! `set_runtime_policy` is the single write path; readers get a cheap
//! `Arc<Policy>` snapshot. Change listeners run synchronously on the writer's
//! call stack and are tried individually.

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::RwLock;

use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::flags;
use crate::policy::Policy;
use crate::policy::Presets;
use crate::policy::ensure_policy;

type PolicyListener = Arc<dyn Fn(&Policy) + Send + Sync>;

static CURRENT: LazyLock<RwLock<Arc<Policy>>> =
    LazyLock::new(|| RwLock::new(Arc::new(Policy::default())));
static LISTENERS: LazyLock<Mutex<Vec<(u64, PolicyListener)>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));
static NEXT_TOKEN: LazyLock<Mutex<u64>> = LazyLock::new(|| Mutex::new(0));

/// Snapshot of the policy currently in force.
pub fn get_effective_policy() -> Arc<Policy> {
    Arc::clone(&CURRENT.read().unwrap_or_else(|p| p.into_inner()))
}

/// Replaces the policy atomically and notifies subscribers synchronously. A
/// panicking listener never blocks the others.
pub fn set_runtime_policy(next: Policy) {
    let next = Arc::new(next);
    {
        let mut current = CURRENT.write().unwrap_or_else(|p| p.into_inner());
        *current = Arc::clone(&next);
    }
    let listeners: Vec<PolicyListener> = {
        let guard = LISTENERS.lock().unwrap_or_else(|p| p.into_inner());
        guard.iter().map(|(_, l)| Arc::clone(l)).collect()
    };
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(&next))).is_err() {
            warn!("policy change listener panicked");
        }
    }
}

pub fn subscribe_policy(listener: impl Fn(&Policy) + Send + Sync + 'static) -> u64 {
    let token = {
        let mut next = NEXT_TOKEN.lock().unwrap_or_else(|p| p.into_inner());
        *next += 1;
        *next
    };
    LISTENERS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push((token, Arc::new(listener)));
    token
}

pub fn unsubscribe_policy(token: u64) {
    LISTENERS
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .retain(|(id, _)| *id != token);
}

/// Drops every subscriber and restores defaults. Test-only escape hatch for
/// the global singleton.
pub fn reset_policy_for_tests() {
    LISTENERS.lock().unwrap_or_else(|p| p.into_inner()).clear();
    set_runtime_policy(Policy::default());
}

/// Serializes tests that touch the process-wide policy.
#[cfg(test)]
pub(crate) fn test_policy_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|p| p.into_inner())
}

/// Location of the persisted policy: `<data_dir>/uicp/policy.json`.
pub fn policy_file_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("uicp").join("policy.json"))
}

/// Resolves the startup policy.
///
/// Precedence: `UICP_SAFE_MODE` forces the locked preset; `UICP_POLICY`
/// carries inline JSON; otherwise the persisted file is read; otherwise the
/// balanced preset. Guard seed lists from the environment are merged on top
/// in every case except safe mode.
pub fn load_startup_policy() -> Policy {
    if *flags::UICP_SAFE_MODE {
        debug!("safe mode forces the locked preset");
        return Presets::locked();
    }

    let mut policy = if let Some(raw) = *flags::UICP_POLICY {
        match serde_json::from_str(raw) {
            Ok(value) => ensure_policy(&value),
            Err(err) => {
                warn!("UICP_POLICY is not valid JSON ({err}), using balanced preset");
                Presets::balanced()
            }
        }
    } else {
        load_persisted_policy().unwrap_or_else(Presets::balanced)
    };

    merge_env_seed_lists(&mut policy);
    policy
}

fn load_persisted_policy() -> Option<Policy> {
    let path = policy_file_path()?;
    let raw = std::fs::read_to_string(&path).ok()?;
    let value = serde_json::from_str(&raw)
        .map_err(|err| warn!("persisted policy at {} is corrupt: {err}", path.display()))
        .ok()?;
    Some(ensure_policy(&value))
}

/// Atomic rewrite: write to a temp file in the same directory, then rename.
pub fn persist_policy(policy: &Policy) -> Result<()> {
    let Some(path) = policy_file_path() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(policy)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn merge_env_seed_lists(policy: &mut Policy) {
    let push_all = |target: &mut Vec<String>, raw: &str| {
        for entry in raw.split(',') {
            let entry = entry.trim();
            if !entry.is_empty() && !target.iter().any(|existing| existing == entry) {
                target.push(entry.to_string());
            }
        }
    };
    push_all(&mut policy.network.allow_domains, *flags::VITE_GUARD_ALLOW_DOMAINS);
    push_all(&mut policy.network.block_domains, *flags::VITE_GUARD_BLOCK_DOMAINS);
    push_all(&mut policy.network.allow_ips, *flags::VITE_GUARD_ALLOW_IPS);
    push_all(&mut policy.network.allow_ip_ranges, *flags::VITE_GUARD_ALLOW_IP_RANGES);
    push_all(&mut policy.network.block_ips, *flags::VITE_GUARD_BLOCK_IPS);
    push_all(&mut policy.network.allow_paths, *flags::VITE_GUARD_ALLOW_PATHS);
}
