//! Per-user handler facade.
//!
//! A [`UserHandler`] binds a user identifier and rewrites caller
//! resource ids into the user-scoped namespace before handing the
//! operation to the manager. Handlers are interned per user and are
//! cheap to clone.

use corral_operator::ServiceInfo;
use corral_pool::InstanceFilter;
use corral_state::ResourceParam;

use crate::broker::{BrokerParam, BrokerStrategy};
use crate::config::InstanceSizing;
use crate::error::ManagerResult;
use crate::manager::ResourceManager;

/// Scopes manager operations under one user id.
#[derive(Clone)]
pub struct UserHandler {
    user: String,
    mgr: ResourceManager,
}

impl UserHandler {
    pub(crate) fn new(user: &str, mgr: ResourceManager) -> Self {
        Self {
            user: user.to_string(),
            mgr,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Register a resource row in `init` state.
    pub fn init(&self, resource_id: &str, param: ResourceParam) -> ManagerResult<()> {
        self.mgr
            .init(&self.scoped_id(resource_id), &self.user, param)
    }

    /// Launch the service, preferring a broker takeover. A non-empty
    /// `city` overrides the one given at `init`.
    pub async fn launch(
        &self,
        resource_id: &str,
        city: &str,
        filter: InstanceFilter,
    ) -> ManagerResult<()> {
        self.mgr
            .launch(&self.scoped_id(resource_id), &self.user, city, filter, true)
            .await
    }

    /// Grow a running service by whatever the filter takes from the pool.
    pub async fn scale(&self, resource_id: &str, filter: InstanceFilter) -> ManagerResult<()> {
        self.mgr
            .scale(&self.scoped_id(resource_id), &self.user, filter)
            .await
    }

    /// Query the operator for the service's status, folding the observed
    /// ready count back into the resource row.
    pub async fn get_service_info(&self, resource_id: &str) -> ManagerResult<ServiceInfo> {
        self.mgr
            .get_service_info(&self.scoped_id(resource_id), &self.user)
            .await
    }

    /// True while the resource is `init` or `deploying`; false for an
    /// unknown resource.
    pub fn is_service_preparing(&self, resource_id: &str) -> ManagerResult<bool> {
        self.mgr.is_service_preparing(&self.scoped_id(resource_id))
    }

    /// Tear the service down and return any outstanding reservation.
    pub async fn release(&self, resource_id: &str) -> ManagerResult<()> {
        self.mgr
            .release(&self.scoped_id(resource_id), &self.user)
            .await
    }

    /// Register a pre-warming broker owned by this user.
    pub fn add_broker(
        &self,
        name: &str,
        strategy: Box<dyn BrokerStrategy>,
        param: BrokerParam,
    ) -> ManagerResult<()> {
        self.mgr.add_broker(name, &self.user, strategy, param)
    }

    /// Effective per-instance sizing for a platform/group pair.
    pub fn instance_sizing(&self, platform: &str, group: &str) -> InstanceSizing {
        self.mgr.config().instance_sizing(platform, group)
    }

    /// Caller ids are prefixed with the user and normalised: lowercase,
    /// underscores replaced with hyphens.
    fn scoped_id(&self, resource_id: &str) -> String {
        format!("{}-{}", self.user, resource_id)
            .to_lowercase()
            .replace('_', "-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_state::ResourceStore;
    use std::sync::Arc;

    use crate::config::ManagerConfig;

    struct NoopOperator;

    #[async_trait::async_trait]
    impl corral_operator::Operator for NoopOperator {
        async fn get_resource(
            &self,
            _cluster_id: &str,
        ) -> corral_operator::OperatorResult<Vec<corral_operator::NodeInfo>> {
            Ok(Vec::new())
        }
        async fn launch_server(
            &self,
            _cluster_id: &str,
            _param: corral_operator::LaunchParam,
        ) -> corral_operator::OperatorResult<()> {
            Ok(())
        }
        async fn scale_server(
            &self,
            _cluster_id: &str,
            _namespace: &str,
            _name: &str,
            _target_instance: u32,
        ) -> corral_operator::OperatorResult<()> {
            Ok(())
        }
        async fn get_server_status(
            &self,
            _cluster_id: &str,
            _namespace: &str,
            _name: &str,
        ) -> corral_operator::OperatorResult<ServiceInfo> {
            Ok(ServiceInfo {
                status: corral_operator::ServiceStatus::Running,
                current_instances: 0,
            })
        }
        async fn release_server(
            &self,
            _cluster_id: &str,
            _namespace: &str,
            _name: &str,
        ) -> corral_operator::OperatorResult<()> {
            Ok(())
        }
    }

    fn handler_for(user: &str) -> UserHandler {
        let mgr = ResourceManager::new(
            ManagerConfig::default(),
            Arc::new(NoopOperator),
            ResourceStore::open_in_memory().unwrap(),
        );
        mgr.register_user(user)
    }

    #[test]
    fn scoped_id_prefixes_and_normalises() {
        let handler = handler_for("Alice");
        assert_eq!(handler.scoped_id("Job_One"), "alice-job-one");
        assert_eq!(handler.scoped_id("job1"), "alice-job1");
    }

    #[test]
    fn scoped_id_is_idempotent_under_reapplication() {
        let handler = handler_for("dist");
        let once = handler.scoped_id("task_7");
        // Re-normalising an already-normalised suffix changes nothing
        // beyond the prefix.
        let twice = handler.scoped_id(&once);
        assert_eq!(twice, format!("dist-{once}"));
        assert_eq!(once, "dist-task-7");
    }

    #[test]
    fn underscore_user_is_normalised_too() {
        let handler = handler_for("build_farm");
        assert_eq!(handler.scoped_id("x"), "build-farm-x");
    }
}
