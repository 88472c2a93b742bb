//! Persisted domain types for the corral resource store.
//!
//! A [`ResourceRecord`] is the unit of bookkeeping: one user-named
//! service, its request parameters, its accounting against the node
//! pool, and its lifecycle status. Rows are JSON-serialized into the
//! redb value column.

use corral_operator::VolumeMount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Globally unique resource identifier (user-scoped, normalised).
pub type ResourceId = String;

/// Request parameters a caller hands to the manager at `init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceParam {
    pub city: String,
    pub platform: String,
    /// Env key-values injected into containers.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Named ports, `port_name -> protocol`; port numbers are assigned
    /// by the backend scheduler.
    #[serde(default)]
    pub ports: HashMap<String, String>,
    /// Host-path volumes, keyed by name.
    #[serde(default)]
    pub volumes: HashMap<String, VolumeMount>,
    pub image: String,
    /// Set only on broker-owned resources.
    #[serde(default)]
    pub broker_name: String,
}

/// Lifecycle status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Init,
    Deploying,
    Running,
    Released,
    Deleting,
}

impl ResourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Init => "init",
            ResourceStatus::Deploying => "deploying",
            ResourceStatus::Running => "running",
            ResourceStatus::Released => "released",
            ResourceStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable resource row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    pub user: String,
    pub param: ResourceParam,

    /// Pool block this resource's reservation is accounted under.
    /// Empty while `init` and for broker-backed resources.
    #[serde(default)]
    pub resource_block_key: String,
    /// Instances reserved in the pool but not yet observed ready.
    #[serde(default)]
    pub no_ready_instance: u32,
    /// Instances the operator was told to run.
    #[serde(default)]
    pub request_instance: u32,

    pub status: ResourceStatus,

    /// On a normal resource satisfied by a broker takeover, the id of
    /// the broker resource that actually carries the deploy.
    #[serde(default)]
    pub broker_resource_id: String,
    /// On a broker-owned resource, the owning broker's name.
    #[serde(default)]
    pub broker_name: String,
    /// On a broker-owned resource, whether it has been handed to a
    /// normal resource.
    #[serde(default)]
    pub broker_sold: bool,

    /// Creation time, epoch seconds.
    pub init_time: u64,
}

impl ResourceRecord {
    /// A fresh row in `init` state.
    pub fn new(resource_id: &str, user: &str, param: ResourceParam, init_time: u64) -> Self {
        let broker_name = param.broker_name.clone();
        Self {
            resource_id: resource_id.to_string(),
            user: user.to_string(),
            param,
            resource_block_key: String::new(),
            no_ready_instance: 0,
            request_instance: 0,
            status: ResourceStatus::Init,
            broker_resource_id: String::new(),
            broker_name,
            broker_sold: false,
            init_time,
        }
    }

    /// True for rows owned by a broker rather than a user request.
    pub fn is_broker_owned(&self) -> bool {
        !self.broker_name.is_empty()
    }

    /// True for normal rows whose deploy is carried by a broker resource.
    pub fn is_broker_backed(&self) -> bool {
        !self.broker_resource_id.is_empty()
    }
}
