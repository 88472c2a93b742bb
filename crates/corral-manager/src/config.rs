//! Manager configuration.
//!
//! All cadences default to the production values; tests shrink them to
//! keep the background loops fast. Loadable from a TOML file.

use std::path::Path;
use std::time::Duration;

use corral_pool::{InstanceType, PoolConfig};
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::ResourceManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Cluster the operator calls are scoped to.
    pub cluster_id: String,

    /// Backends that can only satisfy launches through a broker
    /// takeover (no direct pool reservation path).
    pub broker_required: bool,

    /// Idempotently create the store table at open.
    pub ensure_store: bool,

    /// CPU cores one instance occupies.
    pub cpu_per_instance: f64,
    /// Memory megabytes one instance occupies.
    pub mem_per_instance: f64,
    /// Per-platform/group instance sizing overrides.
    pub instance_types: Vec<InstanceType>,

    /// Node snapshot cadence (ms).
    pub sync_interval_ms: u64,
    /// Deploy tracer cadence (ms).
    pub checker_interval_ms: u64,
    /// Broker checker cadence (ms).
    pub broker_check_interval_ms: u64,
    /// Grace period before the first broker check (ms).
    pub broker_check_delay_ms: u64,
    /// Pool stats log cadence (ms).
    pub stats_log_interval_ms: u64,
    /// Lock reaper cadence (ms).
    pub lock_clean_interval_ms: u64,
    /// Age at which an idle lock entry is reaped (ms).
    pub lock_max_age_ms: u64,
    /// Published details refresh cadence (ms).
    pub detail_sync_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            broker_required: false,
            ensure_store: true,
            cpu_per_instance: 1.0,
            mem_per_instance: 1024.0,
            instance_types: Vec::new(),
            sync_interval_ms: 1_000,
            checker_interval_ms: 1_000,
            broker_check_interval_ms: 1_000,
            broker_check_delay_ms: 10_000,
            stats_log_interval_ms: 10_000,
            lock_clean_interval_ms: 600_000,
            lock_max_age_ms: 24 * 3600 * 1000,
            detail_sync_interval_ms: 1_000,
        }
    }
}

impl ManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ManagerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            cpu_per_instance: self.cpu_per_instance,
            mem_per_instance: self.mem_per_instance,
            instance_types: self.instance_types.clone(),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn checker_interval(&self) -> Duration {
        Duration::from_millis(self.checker_interval_ms)
    }

    pub fn broker_check_interval(&self) -> Duration {
        Duration::from_millis(self.broker_check_interval_ms)
    }

    pub fn broker_check_delay(&self) -> Duration {
        Duration::from_millis(self.broker_check_delay_ms)
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_millis(self.stats_log_interval_ms)
    }

    pub fn lock_clean_interval(&self) -> Duration {
        Duration::from_millis(self.lock_clean_interval_ms)
    }

    pub fn lock_max_age(&self) -> Duration {
        Duration::from_millis(self.lock_max_age_ms)
    }

    pub fn detail_sync_interval(&self) -> Duration {
        Duration::from_millis(self.detail_sync_interval_ms)
    }
}

/// Effective per-instance sizing for a platform/group pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InstanceSizing {
    pub cpu_per_instance: f64,
    pub mem_per_instance: f64,
}

impl ManagerConfig {
    /// Resolve the instance sizing a platform/group pair gets, falling
    /// back to the global per-instance settings.
    pub fn instance_sizing(&self, platform: &str, group: &str) -> InstanceSizing {
        let (cpu, mem) = self.pool_config().sizing_for(platform, group);
        InstanceSizing {
            cpu_per_instance: cpu,
            mem_per_instance: mem,
        }
    }
}
