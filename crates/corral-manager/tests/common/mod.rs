//! Shared fixtures for manager integration tests: a scripted operator
//! backend and a fast-cadence manager setup.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corral_manager::{ManagerConfig, ResourceManager, RoleEvent};
use corral_operator::{
    LaunchParam, NodeInfo, Operator, OperatorError, OperatorResult, ServiceInfo, ServiceStatus,
    ATTR_CITY, ATTR_PLATFORM,
};
use corral_pool::{InstanceFilter, PoolError};
use corral_state::{ResourceParam, ResourceStore};
use tokio::sync::mpsc;

#[derive(Default)]
struct ScriptState {
    nodes: Vec<NodeInfo>,
    statuses: HashMap<String, ServiceInfo>,
    launches: Vec<LaunchParam>,
    scales: Vec<(String, u32)>,
    releases: Vec<String>,
    fail_launch: bool,
}

/// Operator double whose node snapshots and service statuses are set
/// by the test, and which records every actuation it receives.
#[derive(Default)]
pub struct ScriptedOperator {
    state: Mutex<ScriptState>,
}

impl ScriptedOperator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.state.lock().unwrap().nodes = nodes;
    }

    pub fn set_status(&self, name: &str, status: ServiceStatus, current_instances: u32) {
        self.state.lock().unwrap().statuses.insert(
            name.to_string(),
            ServiceInfo {
                status,
                current_instances,
            },
        );
    }

    pub fn fail_launches(&self, fail: bool) {
        self.state.lock().unwrap().fail_launch = fail;
    }

    pub fn launches(&self) -> Vec<LaunchParam> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn scales(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().scales.clone()
    }

    pub fn releases(&self) -> Vec<String> {
        self.state.lock().unwrap().releases.clone()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn get_resource(&self, _cluster_id: &str) -> OperatorResult<Vec<NodeInfo>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn launch_server(&self, _cluster_id: &str, param: LaunchParam) -> OperatorResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_launch {
            return Err(OperatorError::Backend("scripted launch failure".into()));
        }
        state.statuses.insert(
            param.name.clone(),
            ServiceInfo {
                status: ServiceStatus::Staging,
                current_instances: 0,
            },
        );
        state.launches.push(param);
        Ok(())
    }

    async fn scale_server(
        &self,
        _cluster_id: &str,
        _namespace: &str,
        name: &str,
        target_instance: u32,
    ) -> OperatorResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.statuses.get_mut(name) {
            info.status = ServiceStatus::Staging;
        }
        state.scales.push((name.to_string(), target_instance));
        Ok(())
    }

    async fn get_server_status(
        &self,
        _cluster_id: &str,
        _namespace: &str,
        name: &str,
    ) -> OperatorResult<ServiceInfo> {
        let state = self.state.lock().unwrap();
        state
            .statuses
            .get(name)
            .cloned()
            .ok_or_else(|| OperatorError::NotFound(name.to_string()))
    }

    async fn release_server(
        &self,
        _cluster_id: &str,
        _namespace: &str,
        name: &str,
    ) -> OperatorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.statuses.remove(name);
        state.releases.push(name.to_string());
        Ok(())
    }
}

/// Cadences shrunk so background loops settle within milliseconds.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        cluster_id: "test-cluster".to_string(),
        sync_interval_ms: 10,
        checker_interval_ms: 10,
        broker_check_interval_ms: 10,
        broker_check_delay_ms: 20,
        stats_log_interval_ms: 60_000,
        lock_clean_interval_ms: 60_000,
        detail_sync_interval_ms: 10,
        ..ManagerConfig::default()
    }
}

/// A node holding `capacity` instances under the default sizing.
pub fn node(city: &str, platform: &str, capacity: u32) -> NodeInfo {
    NodeInfo {
        node_id: format!("{city}-{platform}-{capacity}"),
        labels: HashMap::from([
            (ATTR_CITY.to_string(), city.to_string()),
            (ATTR_PLATFORM.to_string(), platform.to_string()),
        ]),
        cpu_total: f64::from(capacity),
        mem_total: f64::from(capacity) * 1024.0,
        cpu_used: 0.0,
        mem_used: 0.0,
        disabled: false,
    }
}

pub fn param(city: &str, platform: &str, image: &str) -> ResourceParam {
    ResourceParam {
        city: city.to_string(),
        platform: platform.to_string(),
        image: image.to_string(),
        ..ResourceParam::default()
    }
}

/// Filter that takes exactly `n` instances or reports exhaustion.
pub fn take(n: u32) -> InstanceFilter {
    Box::new(move |available| {
        if available < n {
            return Err(PoolError::NotEnoughResources);
        }
        Ok(n)
    })
}

/// Filter that takes up to `n` instances.
pub fn take_up_to(n: u32) -> InstanceFilter {
    Box::new(move |available| {
        if available == 0 {
            return Err(PoolError::NotEnoughResources);
        }
        Ok(available.min(n))
    })
}

pub struct Harness {
    pub mgr: ResourceManager,
    pub operator: Arc<ScriptedOperator>,
    pub store: ResourceStore,
    pub roles: mpsc::Sender<RoleEvent>,
}

/// Stand up a manager on a scripted operator and in-memory store, with
/// the role loop running.
pub async fn harness() -> Harness {
    let operator = ScriptedOperator::new();
    let store = ResourceStore::open_in_memory().unwrap();
    let mgr = ResourceManager::new(fast_config(), operator.clone(), store.clone());

    let (roles, events) = mpsc::channel(8);
    let runner = mgr.clone();
    tokio::spawn(async move { runner.run(events).await });

    Harness {
        mgr,
        operator,
        store,
        roles,
    }
}

impl Harness {
    /// Promote to master and wait for the supervisor to come up.
    pub async fn promote(&self) {
        self.roles.send(RoleEvent::Master).await.unwrap();
        wait_for("manager running", || self.mgr.is_running()).await;
    }

    /// Demote and wait for the supervisor to stand down.
    pub async fn demote(&self) {
        self.roles.send(RoleEvent::Slave).await.unwrap();
        wait_for("manager stopped", || !self.mgr.is_running()).await;
    }
}

/// Poll `cond` until it holds, panicking after a couple of seconds.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
