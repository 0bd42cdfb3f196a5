//! Monitor → enforce escalation for the network guard.
//!
//! The guard starts in monitor-only mode; every 15 seconds the controller
//! checks whether the observed false-positive ratio is low enough to flip to
//! enforcement. Stage survives restarts through a small JSON state file.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::flags;
use crate::net::guard::GuardStats;
use crate::net::guard::reinstall_network_guard;
use crate::util::now_ms;

const EVALUATION_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStage {
    Monitor,
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutState {
    pub stage: RolloutStage,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_escalated_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RolloutConfig {
    pub minutes_monitor: u64,
    pub fpr_threshold: f64,
    pub min_attempts: u64,
}

impl RolloutConfig {
    pub fn from_flags() -> Self {
        Self {
            minutes_monitor: *flags::VITE_GUARD_MINUTES_MONITOR,
            fpr_threshold: *flags::VITE_GUARD_FPR_THRESHOLD,
            min_attempts: *flags::VITE_GUARD_MIN_ATTEMPTS,
        }
    }
}

pub struct RolloutController {
    state: Mutex<RolloutState>,
    config: RolloutConfig,
    stats: Arc<GuardStats>,
    path: Option<PathBuf>,
}

impl RolloutController {
    /// Restores persisted stage (or the `VITE_GUARD_ROLLOUT_STAGE` override)
    /// and spawns the evaluation loop.
    pub fn start(config: RolloutConfig, stats: Arc<GuardStats>) -> Arc<Self> {
        let path = state_path();
        let state = load_state(path.as_deref()).unwrap_or(RolloutState {
            stage: initial_stage(),
            started_at: now_ms(),
            last_escalated_at: None,
        });

        if state.stage == RolloutStage::Enforce {
            reinstall_network_guard(Some(false));
        } else {
            reinstall_network_guard(Some(true));
        }

        let controller = Arc::new(Self {
            state: Mutex::new(state),
            config,
            stats,
            path,
        });

        let tick_handle = Arc::clone(&controller);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVALUATION_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick_handle.tick(now_ms());
            }
        });

        controller
    }

    pub fn stage(&self) -> RolloutStage {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).stage
    }

    /// One evaluation: escalate when the monitoring window has passed with
    /// enough traffic and a false-positive ratio under the threshold, or when
    /// the window passed with no attempts at all.
    pub fn tick(&self, now: i64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.stage == RolloutStage::Enforce {
            return false;
        }

        let elapsed_ms = now - state.started_at;
        let window_ms = (self.config.minutes_monitor * 60 * 1000) as i64;
        if elapsed_ms < window_ms {
            return false;
        }

        let attempts = self.stats.attempts.load(Ordering::Relaxed);
        let blocks = self.stats.blocks.load(Ordering::Relaxed);

        let quiet_window = attempts == 0;
        let healthy = attempts >= self.config.min_attempts
            && (blocks as f64 / attempts.max(1) as f64) <= self.config.fpr_threshold;

        if !(quiet_window || healthy) {
            debug!(
                attempts,
                blocks, "rollout stays in monitor: traffic not yet trustworthy"
            );
            return false;
        }

        info!(attempts, blocks, "escalating network guard to enforce");
        state.stage = RolloutStage::Enforce;
        state.last_escalated_at = Some(now);
        save_state(self.path.as_deref(), &state);
        drop(state);

        reinstall_network_guard(Some(false));
        true
    }
}

fn initial_stage() -> RolloutStage {
    match *flags::VITE_GUARD_ROLLOUT_STAGE {
        Some("enforce") => RolloutStage::Enforce,
        Some("monitor") => RolloutStage::Monitor,
        Some(other) => {
            warn!("unknown rollout stage override `{other}`, defaulting to monitor");
            RolloutStage::Monitor
        }
        None => RolloutStage::Monitor,
    }
}

fn state_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("uicp").join("netguard-rollout.json"))
}

fn load_state(path: Option<&std::path::Path>) -> Option<RolloutState> {
    let raw = std::fs::read_to_string(path?).ok()?;
    serde_json::from_str(&raw).ok()
}

fn save_state(path: Option<&std::path::Path>, state: &RolloutState) {
    let Some(path) = path else {
        return;
    };
    if let Some(parent) = path.parent()
        && std::fs::create_dir_all(parent).is_err()
    {
        return;
    }
    match serde_json::to_vec_pretty(state) {
        Ok(bytes) => {
            if let Err(err) = std::fs::write(path, bytes) {
                warn!("failed to persist rollout state: {err}");
            }
        }
        Err(err) => warn!("failed to serialize rollout state: {err}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn controller(config: RolloutConfig, stats: Arc<GuardStats>, started_at: i64) -> RolloutController {
        RolloutController {
            state: Mutex::new(RolloutState {
                stage: RolloutStage::Monitor,
                started_at,
                last_escalated_at: None,
            }),
            config,
            stats,
            path: None,
        }
    }

    fn config() -> RolloutConfig {
        RolloutConfig {
            minutes_monitor: 30,
            fpr_threshold: 0.001,
            min_attempts: 50,
        }
    }

    #[test]
    fn no_escalation_before_window() {
        let stats = Arc::new(GuardStats::default());
        stats.attempts.store(1000, Ordering::Relaxed);
        let ctl = controller(config(), stats, 0);
        assert!(!ctl.tick(10 * 60 * 1000));
        assert_eq!(ctl.stage(), RolloutStage::Monitor);
    }

    #[test]
    fn escalates_on_low_fpr() {
        let stats = Arc::new(GuardStats::default());
        stats.attempts.store(10_000, Ordering::Relaxed);
        stats.blocks.store(5, Ordering::Relaxed);
        let ctl = controller(config(), stats, 0);
        assert!(ctl.tick(31 * 60 * 1000));
        assert_eq!(ctl.stage(), RolloutStage::Enforce);
        assert!(ctl.state.lock().unwrap().last_escalated_at.is_some());
    }

    #[test]
    fn escalates_on_quiet_window() {
        let stats = Arc::new(GuardStats::default());
        let ctl = controller(config(), stats, 0);
        assert!(ctl.tick(31 * 60 * 1000));
        assert_eq!(ctl.stage(), RolloutStage::Enforce);
    }

    #[test]
    fn stays_in_monitor_on_high_fpr() {
        let stats = Arc::new(GuardStats::default());
        stats.attempts.store(100, Ordering::Relaxed);
        stats.blocks.store(10, Ordering::Relaxed);
        let ctl = controller(config(), stats, 0);
        assert!(!ctl.tick(31 * 60 * 1000));
        assert_eq!(ctl.stage(), RolloutStage::Monitor);
    }

    #[test]
    fn stays_in_monitor_below_min_attempts() {
        let stats = Arc::new(GuardStats::default());
        stats.attempts.store(10, Ordering::Relaxed);
        let ctl = controller(config(), stats, 0);
        assert!(!ctl.tick(31 * 60 * 1000));
    }

    #[test]
    fn second_tick_after_enforce_is_inert() {
        let stats = Arc::new(GuardStats::default());
        let ctl = controller(config(), stats, 0);
        assert!(ctl.tick(31 * 60 * 1000));
        assert!(!ctl.tick(32 * 60 * 1000));
    }
}
