//! Tunables for the scheduling core.
//!
//! Every struct carries defaults so deployments only spell out what they
//! change; the daemon layers a TOML file and environment on top.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    lock::{DEFAULT_LOCK_IDS, LockId},
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Lock contention and crash-restart backoff.
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
    /// Registration limits and liveness.
    pub agents: AgentConfig,
    pub allocator: AllocatorConfig,
    pub logs: LogConfig,
    /// Subsystem name -> advisory lock id.
    pub locks: LockConfig,
    pub events: EventConfig,
    pub startup: StartupConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of the anchor delay used as the jitter span.
    pub jitter_ratio: f32,
    /// How often a held lock's session is probed for liveness.
    pub lock_probe_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.25,
            lock_probe_interval_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    /// Exponential delay for the `attempt`-th consecutive failure, spread by
    /// `unit` (a value in `[0, 1]`) across the jitter window.
    pub fn backoff_delay(&self, attempt: u32, unit: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let max = self.backoff_max_ms as f64;
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let anchor = (self.backoff_base_ms as f64 * 2f64.powi(exp)).min(max);

        let span = anchor * f64::from(self.jitter_ratio.max(0.0));
        let lower = (anchor - span).max(0.0);
        let upper = (anchor + span).min(max);
        let jittered = lower + (upper - lower) * unit.clamp(0.0, 1.0);
        Duration::from_millis(jittered.round() as u64)
    }

    pub fn lock_probe_interval(&self) -> Duration {
        Duration::from_millis(self.lock_probe_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fallback full reconciliation cadence; also retries failed promotions.
    pub resync_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// An agent not heard from for this long is evicted.
    pub liveness_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    /// Pool used when a registration or workspace names none.
    pub default_pool: String,
    pub max_capacity: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 30_000,
            sweep_interval_ms: 10_000,
            default_pool: "default".to_string(),
            max_capacity: 64,
        }
    }
}

impl AgentConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Fallback allocation pass cadence when no events arrive.
    pub resync_interval_ms: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: 10_000,
        }
    }
}

impl AllocatorConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Tail poll cadence; bounds how stale a tailing client can be.
    pub poll_interval_ms: u64,
    /// Largest single append accepted from an agent.
    pub max_chunk_bytes: usize,
    /// Upper bound on one read while tailing a stream.
    pub read_window_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_chunk_bytes: 1024 * 1024,
            read_window_bytes: 64 * 1024,
        }
    }
}

impl LogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn read_window(&self) -> u64 {
        self.read_window_bytes.max(1)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Postgres NOTIFY channel carrying change events.
    pub channel: String,
    /// Per-subscriber buffer before a slow consumer starts lagging.
    pub buffer: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel: "runway_events".to_string(),
            buffer: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Startup fails if the event listener is not live within this window.
    pub listener_timeout_ms: u64,
    /// Upper bound on waiting for subsystems to stop at shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            listener_timeout_ms: 10_000,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl StartupConfig {
    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Subsystem name to advisory lock id. Entries given in configuration are
/// layered over the defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, LockId>",
    into = "BTreeMap<String, LockId>"
)]
pub struct LockConfig {
    pub ids: BTreeMap<String, LockId>,
}

impl From<BTreeMap<String, LockId>> for LockConfig {
    fn from(overrides: BTreeMap<String, LockId>) -> Self {
        let mut config = LockConfig::default();
        config.ids.extend(overrides);
        config
    }
}

impl From<LockConfig> for BTreeMap<String, LockId> {
    fn from(config: LockConfig) -> Self {
        config.ids
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ids: DEFAULT_LOCK_IDS
                .iter()
                .map(|(name, id)| ((*name).to_string(), *id))
                .collect(),
        }
    }
}

impl LockConfig {
    pub fn lock_id(&self, subsystem: &str) -> Option<LockId> {
        self.ids.get(subsystem).copied()
    }

    /// Rejects tables where two subsystems share an id or a required
    /// subsystem has none.
    pub fn validate(&self, required: &[&str]) -> Result<(), ModelError> {
        let mut seen: BTreeMap<LockId, &str> = BTreeMap::new();
        for (name, id) in &self.ids {
            if let Some(other) = seen.insert(*id, name) {
                return Err(ModelError::InvalidValue(format!(
                    "lock id {id} is shared by subsystems {other} and {name}"
                )));
            }
        }
        for name in required {
            if !self.ids.contains_key(*name) {
                return Err(ModelError::InvalidValue(format!(
                    "no lock id configured for subsystem {name}"
                )));
            }
        }
        Ok(())
    }
}
