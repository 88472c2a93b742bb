//! Node-info pool — in-memory accounting of instance capacity per
//! attribute-bucketed block.
//!
//! Nodes are bucketed by their `city`/`platform` labels; each block
//! tracks `total`, `deployed` and `no_ready` instance counts, where
//! `free = total - deployed - no_ready`. Reservations move free
//! capacity into `no_ready` immediately; the compensating release is
//! snapshot-gated by the caller (see `last_update_time`) so a
//! reservation is never double-counted against the next backend
//! snapshot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use corral_operator::{NodeInfo, ATTR_CITY, ATTR_PLATFORM};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PoolError, PoolResult};

/// Decides how many instances to take from a block's free capacity.
///
/// Receives the available count; returns the granted count, or
/// `PoolError::NotEnoughResources` when the available capacity cannot
/// satisfy the request.
pub type InstanceFilter = Box<dyn Fn(u32) -> PoolResult<u32> + Send + Sync>;

/// Per-instance sizing override for a platform/group pair.
#[derive(Debug, Clone, Default, serde::Deserialize, Serialize, PartialEq)]
pub struct InstanceType {
    pub platform: String,
    pub group: String,
    pub cpu_per_instance: f64,
    pub mem_per_instance: f64,
}

/// Pool sizing configuration.
#[derive(Debug, Clone, serde::Deserialize, Serialize, PartialEq)]
pub struct PoolConfig {
    /// CPU cores one instance occupies.
    pub cpu_per_instance: f64,
    /// Memory megabytes one instance occupies.
    pub mem_per_instance: f64,
    /// Per-platform/group sizing overrides.
    #[serde(default)]
    pub instance_types: Vec<InstanceType>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cpu_per_instance: 1.0,
            mem_per_instance: 1024.0,
            instance_types: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Effective per-instance sizing for a platform/group pair.
    pub fn sizing_for(&self, platform: &str, group: &str) -> (f64, f64) {
        let mut cpu = self.cpu_per_instance;
        let mut mem = self.mem_per_instance;
        for it in &self.instance_types {
            if it.platform != platform || it.group != group {
                continue;
            }
            if it.cpu_per_instance > 0.0 {
                cpu = it.cpu_per_instance;
            }
            if it.mem_per_instance > 0.0 {
                mem = it.mem_per_instance;
            }
            break;
        }
        (cpu, mem)
    }
}

/// Read-only per-block snapshot for the published details.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BlockDetail {
    pub key: String,
    pub total: u32,
    pub free: u32,
    pub no_ready: u32,
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub total: u32,
    pub free: u32,
    pub no_ready: u32,
    pub deployed: u32,
}

#[derive(Debug, Clone)]
struct Block {
    labels: HashMap<String, String>,
    total: u32,
    deployed: u32,
    no_ready: u32,
}

impl Block {
    fn free(&self) -> u32 {
        self.total.saturating_sub(self.deployed + self.no_ready)
    }

    fn matches(&self, condition: &HashMap<String, String>) -> bool {
        condition
            .iter()
            .all(|(k, v)| self.labels.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

struct PoolInner {
    blocks: HashMap<String, Block>,
    last_update: Option<Instant>,
}

/// Thread-safe accounting pool over attribute-bucketed blocks.
pub struct NodeInfoPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

/// Canonical block key for a city/platform label pair.
pub fn block_key(city: &str, platform: &str) -> String {
    format!("{city}/{platform}")
}

impl NodeInfoPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                blocks: HashMap::new(),
                last_update: None,
            }),
        }
    }

    /// Drop all accounting state. Used on role promotion before the
    /// recovered `no_ready` counts are re-established.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.clear();
        inner.last_update = None;
    }

    /// Reconcile totals from a backend node snapshot.
    ///
    /// `no_ready` counts carry across snapshots; blocks that vanished
    /// from the snapshot are retained at zero capacity while they still
    /// hold reservations, and dropped once drained.
    pub fn update_resources(&self, nodes: &[NodeInfo]) {
        let mut fresh: HashMap<String, Block> = HashMap::new();

        for node in nodes {
            if node.disabled {
                continue;
            }
            let city = node.label(ATTR_CITY);
            let platform = node.label(ATTR_PLATFORM);
            let key = block_key(city, platform);
            let (cpu_per, mem_per) = self.config.sizing_for(platform, city);

            let total = instances_fitting(node.cpu_total, node.mem_total, cpu_per, mem_per);
            let used = instances_occupied(node.cpu_used, node.mem_used, cpu_per, mem_per).min(total);

            let block = fresh.entry(key).or_insert_with(|| Block {
                labels: HashMap::from([
                    (ATTR_CITY.to_string(), city.to_string()),
                    (ATTR_PLATFORM.to_string(), platform.to_string()),
                ]),
                total: 0,
                deployed: 0,
                no_ready: 0,
            });
            block.total += total;
            block.deployed += used;
        }

        let mut inner = self.inner.lock().unwrap();

        // Carry reservations into the fresh block set.
        for (key, old) in &inner.blocks {
            if old.no_ready == 0 {
                continue;
            }
            match fresh.get_mut(key) {
                Some(block) => block.no_ready = old.no_ready,
                None => {
                    // Capacity vanished while a reservation is pending;
                    // keep the block so the release still has a target.
                    let mut retained = old.clone();
                    retained.total = 0;
                    retained.deployed = 0;
                    fresh.insert(key.clone(), retained);
                }
            }
        }

        inner.blocks = fresh;
        inner.last_update = Some(Instant::now());
        debug!(blocks = inner.blocks.len(), "node info pool reconciled");
    }

    /// Reserve instances from the best block matching `condition`.
    ///
    /// The chosen block is the matching one with the most free
    /// capacity; `filter` decides how many of its free instances to
    /// take. Returns the granted count and the block key the
    /// reservation is accounted under.
    pub fn get_free_instances(
        &self,
        condition: &HashMap<String, String>,
        filter: &InstanceFilter,
    ) -> PoolResult<(u32, String)> {
        let mut inner = self.inner.lock().unwrap();

        let key = inner
            .blocks
            .iter()
            .filter(|(_, b)| b.matches(condition) && b.free() > 0)
            .max_by_key(|(_, b)| b.free())
            .map(|(k, _)| k.clone())
            .ok_or(PoolError::NotEnoughResources)?;

        let block = inner.blocks.get_mut(&key).unwrap();
        let available = block.free();
        let granted = filter(available)?;
        if granted == 0 || granted > available {
            return Err(PoolError::NotEnoughResources);
        }

        block.no_ready += granted;
        debug!(%key, granted, available, "reserved no-ready instances");
        Ok((granted, key))
    }

    /// Return reserved-but-not-ready instances to free capacity.
    ///
    /// Callers must gate this on a snapshot observed after the
    /// reservation (via [`NodeInfoPool::last_update_time`]); releasing
    /// early would double-count the reservation against the next
    /// snapshot.
    pub fn release_no_ready_block(&self, key: &str, instance: u32) -> PoolResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let block = inner
            .blocks
            .get_mut(key)
            .ok_or_else(|| PoolError::UnknownBlock(key.to_string()))?;

        if block.no_ready < instance {
            warn!(
                %key,
                no_ready = block.no_ready,
                instance,
                "releasing more no-ready instances than reserved"
            );
        }
        block.no_ready = block.no_ready.saturating_sub(instance);
        debug!(%key, instance, no_ready = block.no_ready, "released no-ready instances");
        Ok(())
    }

    /// Re-establish a `no_ready` count for rows read from the store at
    /// recovery, without double-counting against the next snapshot.
    ///
    /// Creates a zero-capacity placeholder when the first snapshot has
    /// not arrived yet; totals fill in on the next reconcile.
    pub fn recover_no_ready_block(&self, key: &str, instance: u32) {
        let mut inner = self.inner.lock().unwrap();
        let block = inner.blocks.entry(key.to_string()).or_insert_with(|| Block {
            labels: labels_from_key(key),
            total: 0,
            deployed: 0,
            no_ready: 0,
        });
        block.no_ready += instance;
        debug!(%key, instance, no_ready = block.no_ready, "recovered no-ready instances");
    }

    /// Instant of the last successful reconcile, if any.
    pub fn last_update_time(&self) -> Option<Instant> {
        self.inner.lock().unwrap().last_update
    }

    /// Aggregate counters across all blocks.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = PoolStats::default();
        for block in inner.blocks.values() {
            stats.total += block.total;
            stats.free += block.free();
            stats.no_ready += block.no_ready;
            stats.deployed += block.deployed;
        }
        stats
    }

    /// One-line summary for periodic stats logging.
    pub fn stats_line(&self) -> String {
        let s = self.stats();
        format!(
            "total({}) free({}) noReady({}) deployed({})",
            s.total, s.free, s.no_ready, s.deployed
        )
    }

    /// Per-block snapshot for the published resource details.
    pub fn detail(&self) -> Vec<BlockDetail> {
        let inner = self.inner.lock().unwrap();
        let mut detail: Vec<BlockDetail> = inner
            .blocks
            .iter()
            .map(|(key, b)| BlockDetail {
                key: key.clone(),
                total: b.total,
                free: b.free(),
                no_ready: b.no_ready,
            })
            .collect();
        detail.sort_by(|a, b| a.key.cmp(&b.key));
        detail
    }
}

/// Whole instances a node's capacity can hold.
fn instances_fitting(cpu: f64, mem: f64, cpu_per: f64, mem_per: f64) -> u32 {
    let by_cpu = (cpu / cpu_per).floor();
    let by_mem = (mem / mem_per).floor();
    by_cpu.min(by_mem).max(0.0) as u32
}

/// Whole instances a node's usage already occupies.
fn instances_occupied(cpu: f64, mem: f64, cpu_per: f64, mem_per: f64) -> u32 {
    let by_cpu = (cpu / cpu_per).ceil();
    let by_mem = (mem / mem_per).ceil();
    by_cpu.max(by_mem).max(0.0) as u32
}

fn labels_from_key(key: &str) -> HashMap<String, String> {
    let (city, platform) = key.split_once('/').unwrap_or((key, ""));
    HashMap::from([
        (ATTR_CITY.to_string(), city.to_string()),
        (ATTR_PLATFORM.to_string(), platform.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(city: &str, platform: &str, cpu: f64, mem: f64) -> NodeInfo {
        NodeInfo {
            node_id: format!("{city}-{platform}-node"),
            labels: HashMap::from([
                (ATTR_CITY.to_string(), city.to_string()),
                (ATTR_PLATFORM.to_string(), platform.to_string()),
            ]),
            cpu_total: cpu,
            mem_total: mem,
            cpu_used: 0.0,
            mem_used: 0.0,
            disabled: false,
        }
    }

    fn test_pool() -> NodeInfoPool {
        NodeInfoPool::new(PoolConfig::default())
    }

    fn condition(city: &str, platform: &str) -> HashMap<String, String> {
        HashMap::from([
            (ATTR_CITY.to_string(), city.to_string()),
            (ATTR_PLATFORM.to_string(), platform.to_string()),
        ])
    }

    fn take(n: u32) -> InstanceFilter {
        Box::new(move |available| {
            if available < n {
                Err(PoolError::NotEnoughResources)
            } else {
                Ok(n)
            }
        })
    }

    #[test]
    fn reconcile_buckets_by_labels() {
        let pool = test_pool();
        pool.update_resources(&[
            test_node("sh", "linux", 4.0, 4.0 * 1024.0),
            test_node("sh", "linux", 6.0, 6.0 * 1024.0),
            test_node("sz", "linux", 3.0, 3.0 * 1024.0),
        ]);

        let detail = pool.detail();
        assert_eq!(detail.len(), 2);
        assert_eq!(detail[0].key, "sh/linux");
        assert_eq!(detail[0].total, 10);
        assert_eq!(detail[0].free, 10);
        assert_eq!(detail[1].key, "sz/linux");
        assert_eq!(detail[1].total, 3);
    }

    #[test]
    fn reserve_moves_free_to_no_ready() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 10.0, 10.0 * 1024.0)]);

        let (granted, key) = pool
            .get_free_instances(&condition("sh", "linux"), &take(3))
            .unwrap();
        assert_eq!(granted, 3);
        assert_eq!(key, "sh/linux");

        let stats = pool.stats();
        assert_eq!(stats.free, 7);
        assert_eq!(stats.no_ready, 3);
        assert_eq!(stats.total, 10);
    }

    #[test]
    fn reserve_fails_when_no_block_matches() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 10.0, 10.0 * 1024.0)]);

        let err = pool
            .get_free_instances(&condition("bj", "linux"), &take(1))
            .unwrap_err();
        assert_eq!(err, PoolError::NotEnoughResources);
    }

    #[test]
    fn reserve_fails_when_filter_rejects() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 2.0, 2.0 * 1024.0)]);

        let err = pool
            .get_free_instances(&condition("sh", "linux"), &take(5))
            .unwrap_err();
        assert_eq!(err, PoolError::NotEnoughResources);

        // A failed reservation leaves the accounting untouched.
        assert_eq!(pool.stats().free, 2);
        assert_eq!(pool.stats().no_ready, 0);
    }

    #[test]
    fn reserve_rejects_overdraw_and_zero_grants() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 2.0, 2.0 * 1024.0)]);

        let greedy: InstanceFilter = Box::new(|available| Ok(available + 1));
        assert_eq!(
            pool.get_free_instances(&condition("sh", "linux"), &greedy)
                .unwrap_err(),
            PoolError::NotEnoughResources
        );

        let nothing: InstanceFilter = Box::new(|_| Ok(0));
        assert_eq!(
            pool.get_free_instances(&condition("sh", "linux"), &nothing)
                .unwrap_err(),
            PoolError::NotEnoughResources
        );
    }

    #[test]
    fn city_only_condition_matches_platform_blocks() {
        let pool = test_pool();
        pool.update_resources(&[
            test_node("sh", "linux", 4.0, 4.0 * 1024.0),
            test_node("sh", "windows", 8.0, 8.0 * 1024.0),
        ]);

        // Most-free block wins when the condition is looser.
        let cond = HashMap::from([(ATTR_CITY.to_string(), "sh".to_string())]);
        let (granted, key) = pool.get_free_instances(&cond, &take(2)).unwrap();
        assert_eq!(granted, 2);
        assert_eq!(key, "sh/windows");
    }

    #[test]
    fn release_restores_free_capacity() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 5.0, 5.0 * 1024.0)]);
        pool.get_free_instances(&condition("sh", "linux"), &take(5))
            .unwrap();
        assert_eq!(pool.stats().free, 0);

        pool.release_no_ready_block("sh/linux", 5).unwrap();
        assert_eq!(pool.stats().free, 5);
        assert_eq!(pool.stats().no_ready, 0);
    }

    #[test]
    fn release_unknown_block_errors() {
        let pool = test_pool();
        assert!(matches!(
            pool.release_no_ready_block("nowhere/linux", 1),
            Err(PoolError::UnknownBlock(_))
        ));
    }

    #[test]
    fn no_ready_carries_across_reconciles() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 10.0, 10.0 * 1024.0)]);
        pool.get_free_instances(&condition("sh", "linux"), &take(4))
            .unwrap();

        pool.update_resources(&[test_node("sh", "linux", 10.0, 10.0 * 1024.0)]);
        let stats = pool.stats();
        assert_eq!(stats.no_ready, 4);
        assert_eq!(stats.free, 6);
    }

    #[test]
    fn vanished_block_retained_until_drained() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 5.0, 5.0 * 1024.0)]);
        pool.get_free_instances(&condition("sh", "linux"), &take(2))
            .unwrap();

        // Capacity disappears while the reservation is outstanding.
        pool.update_resources(&[]);
        assert_eq!(pool.stats().no_ready, 2);

        pool.release_no_ready_block("sh/linux", 2).unwrap();
        pool.update_resources(&[]);
        assert!(pool.detail().is_empty());
    }

    #[test]
    fn recover_reestablishes_reservations() {
        let pool = test_pool();
        pool.recover_no_ready_block("sh/linux", 3);
        assert_eq!(pool.stats().no_ready, 3);

        // The next snapshot fills in totals without double counting.
        pool.update_resources(&[test_node("sh", "linux", 10.0, 10.0 * 1024.0)]);
        let stats = pool.stats();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.no_ready, 3);
        assert_eq!(stats.free, 7);
    }

    #[test]
    fn conservation_across_operations() {
        let pool = test_pool();
        pool.update_resources(&[
            test_node("sh", "linux", 8.0, 8.0 * 1024.0),
            test_node("sh", "linux", 2.0, 2.0 * 1024.0),
        ]);

        pool.get_free_instances(&condition("sh", "linux"), &take(3))
            .unwrap();
        pool.get_free_instances(&condition("sh", "linux"), &take(2))
            .unwrap();
        pool.release_no_ready_block("sh/linux", 1).unwrap();

        let s = pool.stats();
        assert_eq!(s.free + s.no_ready + s.deployed, s.total);
    }

    #[test]
    fn used_capacity_counts_as_deployed() {
        let pool = test_pool();
        let mut node = test_node("sh", "linux", 10.0, 10.0 * 1024.0);
        node.cpu_used = 4.0;
        node.mem_used = 4.0 * 1024.0;
        pool.update_resources(&[node]);

        let s = pool.stats();
        assert_eq!(s.deployed, 4);
        assert_eq!(s.free, 6);
    }

    #[test]
    fn disabled_nodes_are_skipped() {
        let pool = test_pool();
        let mut node = test_node("sh", "linux", 10.0, 10.0 * 1024.0);
        node.disabled = true;
        pool.update_resources(&[node]);
        assert!(pool.detail().is_empty());
    }

    #[test]
    fn sizing_overrides_apply() {
        let config = PoolConfig {
            cpu_per_instance: 1.0,
            mem_per_instance: 1024.0,
            instance_types: vec![InstanceType {
                platform: "mac".to_string(),
                group: "sh".to_string(),
                cpu_per_instance: 2.0,
                mem_per_instance: 4096.0,
            }],
        };
        assert_eq!(config.sizing_for("mac", "sh"), (2.0, 4096.0));
        assert_eq!(config.sizing_for("linux", "sh"), (1.0, 1024.0));

        let pool = NodeInfoPool::new(config);
        pool.update_resources(&[test_node("sh", "mac", 8.0, 16.0 * 1024.0)]);
        // 8 cores / 2 per instance = 4; 16G / 4G = 4.
        assert_eq!(pool.stats().total, 4);
    }

    #[test]
    fn last_update_advances() {
        let pool = test_pool();
        assert!(pool.last_update_time().is_none());

        pool.update_resources(&[]);
        let first = pool.last_update_time().unwrap();
        pool.update_resources(&[]);
        let second = pool.last_update_time().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn reset_clears_everything() {
        let pool = test_pool();
        pool.update_resources(&[test_node("sh", "linux", 5.0, 5.0 * 1024.0)]);
        pool.reset();
        assert!(pool.detail().is_empty());
        assert!(pool.last_update_time().is_none());
    }
}
