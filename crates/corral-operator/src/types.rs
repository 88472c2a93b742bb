//! Wire types shared between the core and backend adapters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node-selector attribute key for the city label.
pub const ATTR_CITY: &str = "city";

/// Node-selector attribute key for the platform label.
pub const ATTR_PLATFORM: &str = "platform";

/// Capacity report for a single node, as seen by the backend.
///
/// Capacity and usage are raw CPU cores / memory megabytes; the pool
/// converts them into instance counts with its per-instance sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub node_id: String,
    /// Attribute labels this node is bucketed under (`city`, `platform`).
    pub labels: HashMap<String, String>,
    pub cpu_total: f64,
    pub mem_total: f64,
    pub cpu_used: f64,
    pub mem_used: f64,
    /// Disabled nodes are excluded from accounting entirely.
    #[serde(default)]
    pub disabled: bool,
}

impl NodeInfo {
    /// Label lookup with an empty-string default.
    pub fn label(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or("")
    }
}

/// A host-path volume handed to the backend at launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
}

/// Launch request for a new service.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParam {
    pub name: String,
    pub namespace: String,
    /// Node-selector condition, e.g. `{city: sh, platform: linux}`.
    pub attribute_condition: HashMap<String, String>,
    pub env: HashMap<String, String>,
    /// Named ports, `port_name -> protocol`. Port numbers are assigned
    /// by the backend.
    pub ports: HashMap<String, String>,
    pub volumes: HashMap<String, VolumeMount>,
    pub image: String,
    pub instance: u32,
}

/// Backend-reported lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Replicas are still coming up.
    Staging,
    /// All requested replicas are ready.
    Running,
    /// The deploy terminated unsuccessfully.
    Failed,
}

impl ServiceStatus {
    /// Running and Failed are both terminal for a deploy trace.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Failed)
    }
}

/// Status snapshot for a deployed service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub status: ServiceStatus,
    /// Replicas currently observed ready.
    pub current_instances: u32,
}
