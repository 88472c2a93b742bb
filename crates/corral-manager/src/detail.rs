//! Published detail snapshots.
//!
//! Two read-only views refreshed by the supervisor's detail tickers:
//! per-block pool capacity and per-resource application state.

use corral_pool::{BlockDetail, PoolStats};
use corral_state::ResourceRecord;
use serde::Serialize;

/// Combined details handed to observers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Details {
    pub rsc: Vec<BlockDetail>,
    pub app: Vec<AppDetail>,
    pub stats: PoolStats,
}

/// Snapshot of one non-released registered resource.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppDetail {
    pub resource_id: String,
    pub broker_resource_id: String,
    pub broker_name: String,
    pub broker_sold: bool,
    pub user: String,
    pub status: String,
    pub image: String,
    pub create_time: u64,
    pub request_instance: u32,
    pub no_ready_instance: u32,
    /// City label the resource was placed under.
    pub label: String,
}

impl AppDetail {
    pub fn from_record(r: &ResourceRecord) -> Self {
        Self {
            resource_id: r.resource_id.clone(),
            broker_resource_id: r.broker_resource_id.clone(),
            broker_name: r.broker_name.clone(),
            broker_sold: r.broker_sold,
            user: r.user.clone(),
            status: r.status.to_string(),
            image: r.param.image.clone(),
            create_time: r.init_time,
            request_instance: r.request_instance,
            no_ready_instance: r.no_ready_instance,
            label: r.param.city.clone(),
        }
    }
}
