//! corral-operator — the adapter contract between the resource manager
//! and whatever container backend actually runs services.
//!
//! The core consumes exactly five capabilities: node snapshotting,
//! launch, scale, status, release. Backend adapters (a Kubernetes
//! operator, a Mesos operator, a bare-metal farm) live in their own
//! crates and implement [`Operator`]; nothing backend-specific leaks
//! past this boundary.

pub mod error;
pub mod types;

pub use error::{OperatorError, OperatorResult};
pub use types::*;

use async_trait::async_trait;

/// Capability set the resource manager drives a backend through.
///
/// Errors are opaque to the core: it logs them and surfaces them to
/// the caller unchanged. [`OperatorError::NotFound`] exists so
/// adapters can report a missing service distinctly from a backend
/// failure.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Snapshot current node capacity and labels for a cluster.
    async fn get_resource(&self, cluster_id: &str) -> OperatorResult<Vec<NodeInfo>>;

    /// Create a service with exactly `param.instance` replicas.
    async fn launch_server(&self, cluster_id: &str, param: LaunchParam) -> OperatorResult<()>;

    /// Resize a deployed service to `target_instance` replicas.
    async fn scale_server(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
        target_instance: u32,
    ) -> OperatorResult<()>;

    /// Current status and ready replica count of a service.
    async fn get_server_status(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<ServiceInfo>;

    /// Tear a service down.
    async fn release_server(
        &self,
        cluster_id: &str,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<()>;
}
