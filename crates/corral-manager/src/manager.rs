//! Resource manager — role-driven supervisor and per-resource state
//! machine.
//!
//! The manager listens on a role-change channel and only mutates shared
//! state while this process holds the master role. On promotion it
//! recovers live rows from the store, rebuilds the pool's reservation
//! accounting, and spawns the background loops (node sync, lock reaper,
//! broker checker, detail publishers, deploy tracers); on demotion it
//! cancels them all through a single watch channel.
//!
//! Every mutating operation takes the per-resource lock for its full
//! duration and persists the row before the lock is released, so store
//! and memory move together.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use corral_operator::{LaunchParam, Operator, ServiceInfo, ATTR_CITY, ATTR_PLATFORM};
use corral_pool::{InstanceFilter, NodeInfoPool, PoolStats};
use corral_state::{ResourceParam, ResourceRecord, ResourceStatus, ResourceStore};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerParam, BrokerSet, BrokerStrategy};
use crate::config::ManagerConfig;
use crate::detail::{AppDetail, Details};
use crate::error::{ManagerError, ManagerResult};
use crate::handler::UserHandler;
use crate::locks::{LockTable, ResourceGuard};

/// Role tokens delivered by the leader-election source.
///
/// Redeliveries are tolerated: promotion while already master and
/// demotion while already stopped are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleEvent {
    Master,
    Slave,
    Unknown,
}

struct Inner {
    config: ManagerConfig,
    operator: Arc<dyn Operator>,
    store: ResourceStore,
    pool: NodeInfoPool,

    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,

    locks: LockTable,
    registered: Mutex<HashMap<String, ResourceRecord>>,
    handlers: Mutex<HashMap<String, UserHandler>>,
    broker_set: BrokerSet,

    rsc_detail: RwLock<(Vec<corral_pool::BlockDetail>, PoolStats)>,
    app_detail: RwLock<Vec<AppDetail>>,
}

/// Leader-elected broker of container resources.
///
/// Cheap to clone; all clones share one state. Callers obtain a
/// [`UserHandler`] through [`ResourceManager::register_user`] and drive
/// the state machine through it.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new(config: ManagerConfig, operator: Arc<dyn Operator>, store: ResourceStore) -> Self {
        let pool = NodeInfoPool::new(config.pool_config());
        let lock_max_age = config.lock_max_age();
        Self {
            inner: Arc::new(Inner {
                config,
                operator,
                store,
                pool,
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                locks: LockTable::new(lock_max_age),
                registered: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                broker_set: BrokerSet::new(),
                rsc_detail: RwLock::new((Vec::new(), PoolStats::default())),
                app_detail: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Intern a per-user handler. The same user always gets the same
    /// handler instance.
    pub fn register_user(&self, user: &str) -> UserHandler {
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers
            .entry(user.to_string())
            .or_insert_with(|| UserHandler::new(user, self.clone()))
            .clone()
    }

    /// Published pool and application details.
    pub fn details(&self) -> Details {
        let (rsc, stats) = self.inner.rsc_detail.read().unwrap().clone();
        let app = self.inner.app_detail.read().unwrap().clone();
        Details { rsc, app, stats }
    }

    /// True while this process holds the master role.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Drive the manager from a role-change event stream. Returns when
    /// the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<RoleEvent>) {
        info!("resource manager running, waiting for role change events");
        while let Some(event) = events.recv().await {
            info!(?event, "received role change event");
            match event {
                RoleEvent::Master => self.start().await,
                RoleEvent::Slave | RoleEvent::Unknown => self.stop(),
            }
        }
        info!("role change channel closed, resource manager exiting");
        self.stop();
    }

    // ── Role transitions ───────────────────────────────────────────

    async fn start(&self) {
        info!("start manager");
        if self.is_running() {
            warn!("manager has already started");
            return;
        }

        if let Err(e) = self.recover() {
            error!(error = %e, "start manager, recover failed");
            return;
        }

        let (tx, rx) = watch::channel(false);
        *self.inner.shutdown.lock().unwrap() = Some(tx);
        self.inner.running.store(true, Ordering::SeqCst);

        self.inner.broker_set.recover(self);

        // Tracers for every deploy that was in flight when we lost
        // (or never held) the master role.
        let deploying: Vec<(String, String)> = {
            let registered = self.inner.registered.lock().unwrap();
            registered
                .values()
                .filter(|r| r.status == ResourceStatus::Deploying)
                .map(|r| (r.resource_id.clone(), r.user.clone()))
                .collect()
        };
        for (resource_id, user) in deploying {
            self.spawn_tracer(resource_id, user, rx.clone());
        }

        let mgr = self.clone();
        tokio::spawn(mgr.run_sync(rx.clone()));
        let mgr = self.clone();
        tokio::spawn(mgr.run_lock_cleaner(rx.clone()));
        let mgr = self.clone();
        tokio::spawn(mgr.run_broker_checker(rx.clone()));
        let mgr = self.clone();
        tokio::spawn(mgr.run_rsc_detail_sync(rx.clone()));
        let mgr = self.clone();
        tokio::spawn(mgr.run_app_detail_sync(rx));
    }

    fn stop(&self) {
        info!("stop manager");
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            warn!("manager has already stopped");
            return;
        }
        if let Some(tx) = self.inner.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    /// Reload live rows from the store and rebuild in-memory accounting.
    fn recover(&self) -> ManagerResult<()> {
        info!("recover resources from store");
        let rows = self.inner.store.list_by_status(&[
            ResourceStatus::Init,
            ResourceStatus::Deploying,
            ResourceStatus::Running,
        ])?;

        self.inner.pool.reset();

        let mut registered = self.inner.registered.lock().unwrap();
        registered.clear();
        for r in rows {
            if r.no_ready_instance > 0 {
                self.inner
                    .pool
                    .recover_no_ready_block(&r.resource_block_key, r.no_ready_instance);
                info!(
                    resource_id = %r.resource_id,
                    no_ready = r.no_ready_instance,
                    "recovered no-ready instances"
                );
            }
            registered.insert(r.resource_id.clone(), r);
        }
        info!(resources = registered.len(), "recover done");
        Ok(())
    }

    // ── Background loops ───────────────────────────────────────────

    async fn run_sync(self, mut shutdown: watch::Receiver<bool>) {
        info!("begin to run node sync");
        let period = self.inner.config.sync_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let log_period = self.inner.config.stats_log_interval();
        let mut log_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + log_period, log_period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    warn!("node sync done");
                    return;
                }
                _ = log_ticker.tick() => {
                    info!(stats = %self.inner.pool.stats_line(), "pool resources");
                }
                _ = ticker.tick() => {
                    self.sync_node_resources().await;
                }
            }
        }
    }

    /// Pull one node snapshot from the operator into the pool.
    pub async fn sync_node_resources(&self) {
        match self
            .inner
            .operator
            .get_resource(&self.inner.config.cluster_id)
            .await
        {
            Ok(nodes) => self.inner.pool.update_resources(&nodes),
            Err(e) => error!(error = %e, "sync node resources failed"),
        }
    }

    async fn run_lock_cleaner(self, mut shutdown: watch::Receiver<bool>) {
        info!("begin to run lock cleaner");
        let period = self.inner.config.lock_clean_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    warn!("lock cleaner done");
                    return;
                }
                _ = ticker.tick() => {
                    let cleaned = self.inner.locks.clean();
                    info!(cleaned, remaining = self.inner.locks.len(), "cleaned resource locks");
                }
            }
        }
    }

    async fn run_broker_checker(self, mut shutdown: watch::Receiver<bool>) {
        // Grace period so the pool sees a few snapshots before brokers
        // start pre-warming.
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(self.inner.config.broker_check_delay()) => {}
        }

        info!("start broker checker");
        let period = self.inner.config.broker_check_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    warn!("broker checker done");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_brokers().await;
                }
            }
        }
    }

    async fn run_rsc_detail_sync(self, mut shutdown: watch::Receiver<bool>) {
        info!("begin to run rsc detail sync");
        let period = self.inner.config.detail_sync_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    warn!("rsc detail sync done");
                    return;
                }
                _ = ticker.tick() => {
                    self.publish_rsc_detail();
                }
            }
        }
    }

    async fn run_app_detail_sync(self, mut shutdown: watch::Receiver<bool>) {
        info!("begin to run app detail sync");
        let period = self.inner.config.detail_sync_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    warn!("app detail sync done");
                    return;
                }
                _ = ticker.tick() => {
                    self.publish_app_detail();
                }
            }
        }
    }

    /// Refresh the published per-block capacity snapshot.
    pub fn publish_rsc_detail(&self) {
        let snapshot = (self.inner.pool.detail(), self.inner.pool.stats());
        *self.inner.rsc_detail.write().unwrap() = snapshot;
    }

    /// Refresh the published per-resource application snapshot.
    pub fn publish_app_detail(&self) {
        let snapshot: Vec<AppDetail> = {
            let registered = self.inner.registered.lock().unwrap();
            registered
                .values()
                .filter(|r| r.status != ResourceStatus::Released)
                .map(AppDetail::from_record)
                .collect()
        };
        *self.inner.app_detail.write().unwrap() = snapshot;
    }

    // ── Deploy tracing ─────────────────────────────────────────────

    fn spawn_tracer(&self, resource_id: String, user: String, mut shutdown: watch::Receiver<bool>) {
        let mgr = self.clone();
        tokio::spawn(async move {
            info!(%resource_id, %user, "begin to trace resource until it finishes deploying");
            let period = mgr.inner.config.checker_interval();
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        warn!(%resource_id, %user, "trace done");
                        return;
                    }
                    _ = ticker.tick() => {
                        if mgr.is_finish_deploying(&resource_id, &user).await {
                            info!(%resource_id, %user, "finish deploying, tracer exit");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Spawn a tracer wired to the current master scope, if any.
    fn spawn_tracer_current(&self, resource_id: &str, user: &str) {
        let rx = self
            .inner
            .shutdown
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| tx.subscribe());
        match rx {
            Some(rx) => self.spawn_tracer(resource_id.to_string(), user.to_string(), rx),
            None => warn!(%resource_id, "manager stopped, not spawning tracer"),
        }
    }

    pub(crate) async fn is_finish_deploying(&self, resource_id: &str, user: &str) -> bool {
        match self.get_service_info(resource_id, user).await {
            Ok(info) => info.status.is_terminal(),
            // Resource gone means release has won the race; the trace
            // is finished.
            Err(e) if e.is_resource_no_exist() => true,
            Err(e) => {
                error!(%resource_id, %user, error = %e, "check finish deploying failed");
                false
            }
        }
    }

    /// Fold an observed ready count back into the row. This is the sole
    /// path by which `no_ready_instance` shrinks during a deploy.
    pub(crate) async fn fresh_deploying_status(
        &self,
        resource_id: &str,
        user: &str,
        ready: u32,
        terminated: bool,
    ) {
        let _guard = self.inner.locks.acquire(resource_id).await;
        debug!(%resource_id, %user, ready, terminated, "fresh deploying status");

        let mut r = match self.get_registered(resource_id) {
            Ok(r) => r,
            Err(e) => {
                error!(%resource_id, %user, error = %e, "fresh deploying status, get resource failed");
                return;
            }
        };

        if terminated {
            self.spawn_release_no_ready(&r.resource_block_key, r.no_ready_instance);
            r.no_ready_instance = 0;
        } else if ready <= r.request_instance {
            let current_no_ready = r.request_instance - ready;
            if r.no_ready_instance > current_no_ready {
                self.spawn_release_no_ready(
                    &r.resource_block_key,
                    r.no_ready_instance - current_no_ready,
                );
                r.no_ready_instance = current_no_ready;
            }
        }

        if terminated && r.status == ResourceStatus::Deploying {
            r.status = ResourceStatus::Running;
        }

        if let Err(e) = self.save_resource(&r) {
            error!(%resource_id, %user, error = %e, "fresh deploying status, save resource failed");
        }
    }

    // ── State machine operations ───────────────────────────────────

    pub(crate) fn init(
        &self,
        resource_id: &str,
        user: &str,
        param: ResourceParam,
    ) -> ManagerResult<()> {
        self.ensure_running()?;

        let mut registered = self.inner.registered.lock().unwrap();
        if registered.contains_key(resource_id) {
            return Err(ManagerError::ResourceAlreadyInit(resource_id.to_string()));
        }

        let r = ResourceRecord::new(resource_id, user, param, epoch_secs());
        self.inner.store.create_resource(&r)?;
        registered.insert(resource_id.to_string(), r);
        info!(%resource_id, %user, "resource init");
        Ok(())
    }

    pub(crate) async fn launch(
        &self,
        resource_id: &str,
        user: &str,
        city: &str,
        filter: InstanceFilter,
        use_broker: bool,
    ) -> ManagerResult<()> {
        self.ensure_running()?;

        let mut has_broker = false;
        {
            let _guard = self.inner.locks.acquire(resource_id).await;

            let mut r = self.get_registered(resource_id)?;
            if r.status != ResourceStatus::Init {
                warn!(%resource_id, %user, status = %r.status, "launch rejected");
                return Err(ManagerError::ApplicationAlreadyLaunched(
                    resource_id.to_string(),
                ));
            }

            let origin_city = r.param.city.clone();
            if !city.is_empty() {
                r.param.city = city.to_string();
            }

            // Try a pre-warmed takeover first.
            if use_broker {
                if let Ok(broker_id) = self
                    .inner
                    .broker_set
                    .apply(self, resource_id, user, &r.param, &filter)
                    .await
                {
                    info!(%resource_id, %broker_id, "applied resource from broker");
                    has_broker = true;
                    r.broker_resource_id = broker_id;
                }
            }

            // Backends without a direct reservation path must be
            // satisfied by a broker or not at all.
            if !has_broker && use_broker && self.inner.config.broker_required {
                warn!(%resource_id, "broker required but none could satisfy the request");
                return Err(ManagerError::BrokerNotEnoughResources);
            }

            if !has_broker {
                let condition = HashMap::from([
                    (ATTR_CITY.to_string(), r.param.city.clone()),
                    (ATTR_PLATFORM.to_string(), r.param.platform.clone()),
                ]);
                let (instance, block_key) =
                    self.inner.pool.get_free_instances(&condition, &filter)?;

                r.no_ready_instance = instance;
                r.resource_block_key = block_key;

                info!(%resource_id, %user, instance, city = %r.param.city, %origin_city, "launching service");
                if let Err(e) = self
                    .inner
                    .operator
                    .launch_server(
                        &self.inner.config.cluster_id,
                        LaunchParam {
                            name: resource_id.to_string(),
                            namespace: user.to_string(),
                            attribute_condition: condition,
                            env: r.param.env.clone(),
                            ports: r.param.ports.clone(),
                            volumes: r.param.volumes.clone(),
                            image: r.param.image.clone(),
                            instance,
                        },
                    )
                    .await
                {
                    error!(%resource_id, %user, error = %e, "launch service failed");
                    // Undo the reservation once the next snapshot lands.
                    self.spawn_release_no_ready(&r.resource_block_key, r.no_ready_instance);
                    return Err(e.into());
                }

                r.request_instance = instance;
            }

            r.status = ResourceStatus::Deploying;
            if let Err(e) = self.save_resource(&r) {
                error!(%resource_id, %user, error = %e, "launch service, save resource failed");
                self.spawn_release_no_ready(&r.resource_block_key, r.no_ready_instance);
                return Err(e);
            }
        }

        // A broker takeover may already be fully deployed; only trace
        // when there is still something to watch.
        if !has_broker || !self.is_finish_deploying(resource_id, user).await {
            self.spawn_tracer_current(resource_id, user);
        }

        info!(%resource_id, %user, "launch service done");
        Ok(())
    }

    pub(crate) async fn scale(
        &self,
        resource_id: &str,
        user: &str,
        filter: InstanceFilter,
    ) -> ManagerResult<()> {
        self.ensure_running()?;

        {
            let _guard = self.inner.locks.acquire(resource_id).await;

            let mut r = self.get_registered(resource_id)?;
            if r.status != ResourceStatus::Running {
                warn!(%resource_id, %user, status = %r.status, "scale rejected");
                return Err(ManagerError::ResourceNotRunning(resource_id.to_string()));
            }

            if r.is_broker_backed() {
                // The broker resource carries the deploy; scale it.
                let broker_id = r.broker_resource_id.clone();
                if let Err(e) = self.scale_boxed(&broker_id, user, filter).await {
                    error!(%resource_id, %broker_id, %user, error = %e, "scale broker resource failed");
                    return Err(e);
                }
            } else {
                let condition = HashMap::from([
                    (ATTR_CITY.to_string(), r.param.city.clone()),
                    (ATTR_PLATFORM.to_string(), r.param.platform.clone()),
                ]);
                let (delta, block_key) = self.inner.pool.get_free_instances(&condition, &filter)?;

                let target = r.request_instance + delta;
                r.no_ready_instance = delta;
                r.resource_block_key = block_key;

                info!(%resource_id, %user, from = r.request_instance, to = target, "scaling service");
                if let Err(e) = self
                    .inner
                    .operator
                    .scale_server(&self.inner.config.cluster_id, user, resource_id, target)
                    .await
                {
                    error!(%resource_id, %user, error = %e, "scale service failed");
                    self.spawn_release_no_ready(&r.resource_block_key, r.no_ready_instance);
                    return Err(e.into());
                }

                r.request_instance = target;
            }

            r.status = ResourceStatus::Deploying;
            if let Err(e) = self.save_resource(&r) {
                error!(%resource_id, %user, error = %e, "scale service, save resource failed");
                self.spawn_release_no_ready(&r.resource_block_key, r.no_ready_instance);
                return Err(e);
            }
        }

        self.spawn_tracer_current(resource_id, user);
        info!(%resource_id, %user, "scale service done");
        Ok(())
    }

    fn scale_boxed<'a>(
        &'a self,
        resource_id: &'a str,
        user: &'a str,
        filter: InstanceFilter,
    ) -> Pin<Box<dyn Future<Output = ManagerResult<()>> + Send + 'a>> {
        Box::pin(self.scale(resource_id, user, filter))
    }

    pub(crate) async fn release(&self, resource_id: &str, user: &str) -> ManagerResult<()> {
        self.ensure_running()?;

        let _guard = self.inner.locks.acquire(resource_id).await;

        let mut r = self.get_registered(resource_id)?;
        if r.status == ResourceStatus::Released {
            warn!(%resource_id, %user, "release rejected, already released");
            return Err(ManagerError::ResourceAlreadyReleased(
                resource_id.to_string(),
            ));
        }

        if r.is_broker_backed() {
            // The broker resource owns the deploy; releasing it tears
            // the service down, so no second operator call here.
            let broker_id = r.broker_resource_id.clone();
            info!(%resource_id, %broker_id, "release broker resource first");
            if let Err(e) = self.release_boxed(&broker_id, user).await {
                error!(%resource_id, %broker_id, %user, error = %e, "release broker resource failed");
                return Err(e);
            }
        } else if let Err(e) = self
            .inner
            .operator
            .release_server(&self.inner.config.cluster_id, user, resource_id)
            .await
        {
            error!(%resource_id, %user, error = %e, "release service failed");
            return Err(e.into());
        }

        if r.no_ready_instance > 0 {
            self.spawn_release_no_ready(&r.resource_block_key, r.no_ready_instance);
            r.no_ready_instance = 0;
        }
        r.status = ResourceStatus::Released;
        self.save_resource(&r)?;

        info!(%resource_id, %user, "release service done");
        Ok(())
    }

    fn release_boxed<'a>(
        &'a self,
        resource_id: &'a str,
        user: &'a str,
    ) -> Pin<Box<dyn Future<Output = ManagerResult<()>> + Send + 'a>> {
        Box::pin(self.release(resource_id, user))
    }

    pub(crate) async fn get_service_info(
        &self,
        resource_id: &str,
        user: &str,
    ) -> ManagerResult<ServiceInfo> {
        self.ensure_running()?;

        let target_id = self.get_server_real_name(resource_id).await?;
        let info = self
            .inner
            .operator
            .get_server_status(&self.inner.config.cluster_id, user, &target_id)
            .await?;

        let terminated = info.status.is_terminal();
        self.fresh_deploying_status(resource_id, user, info.current_instances, terminated)
            .await;
        Ok(info)
    }

    pub(crate) fn is_service_preparing(&self, resource_id: &str) -> ManagerResult<bool> {
        self.ensure_running()?;

        match self.get_registered(resource_id) {
            Ok(r) => Ok(matches!(
                r.status,
                ResourceStatus::Init | ResourceStatus::Deploying
            )),
            // An unknown resource is not preparing.
            Err(e) if e.is_resource_no_exist() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The name the operator actually knows the service by: the broker
    /// resource's id when the deploy was taken over.
    pub(crate) async fn get_server_real_name(&self, resource_id: &str) -> ManagerResult<String> {
        let _guard = self.inner.locks.acquire(resource_id).await;
        let r = self.get_registered(resource_id)?;
        if r.is_broker_backed() {
            return Ok(r.broker_resource_id);
        }
        Ok(resource_id.to_string())
    }

    // ── Broker plumbing ────────────────────────────────────────────

    pub(crate) fn add_broker(
        &self,
        name: &str,
        user: &str,
        strategy: Box<dyn BrokerStrategy>,
        param: BrokerParam,
    ) -> ManagerResult<()> {
        let broker = Broker::new(name, user, strategy, param);
        if self.is_running() {
            broker.recover(self);
        }
        self.inner.broker_set.add(broker);
        info!(broker = %name, %user, "broker added");
        Ok(())
    }

    async fn check_brokers(&self) {
        for broker in self.inner.broker_set.list() {
            self.check_broker(&broker).await;
        }
    }

    async fn check_broker(&self, broker: &Broker) {
        let delta = broker.ask_delta(self);
        if delta == 0 {
            return;
        }

        if delta > 0 {
            info!(broker = %broker.name(), delta, "launching broker resources");
            for _ in 0..delta {
                if let Err(e) = broker.launch(self).await {
                    error!(broker = %broker.name(), error = %e, "broker launch failed");
                    return;
                }
            }
            return;
        }

        info!(broker = %broker.name(), delta = -delta, "releasing broker resources");
        for _ in 0..(-delta) {
            if let Err(e) = broker.release(self).await {
                error!(broker = %broker.name(), error = %e, "broker release failed");
                return;
            }
        }
    }

    // ── Shared row plumbing ────────────────────────────────────────

    fn ensure_running(&self) -> ManagerResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ManagerError::ManagerNotRunning)
        }
    }

    pub(crate) async fn lock_resource(&self, resource_id: &str) -> ResourceGuard {
        self.inner.locks.acquire(resource_id).await
    }

    pub(crate) fn get_registered(&self, resource_id: &str) -> ManagerResult<ResourceRecord> {
        let registered = self.inner.registered.lock().unwrap();
        registered
            .get(resource_id)
            .cloned()
            .ok_or_else(|| ManagerError::ResourceNoExist(resource_id.to_string()))
    }

    /// Persist a row and mirror it into the registered map; released
    /// rows are evicted instead.
    pub(crate) fn save_resource(&self, r: &ResourceRecord) -> ManagerResult<()> {
        let mut registered = self.inner.registered.lock().unwrap();
        if r.status == ResourceStatus::Released {
            registered.remove(&r.resource_id);
        } else {
            registered.insert(r.resource_id.clone(), r.clone());
        }
        self.inner.store.put_resource(r)?;
        Ok(())
    }

    /// Ids of a broker's unsold live resources, sorted for determinism.
    pub(crate) fn broker_resource_ids(&self, broker_name: &str) -> Vec<String> {
        let registered = self.inner.registered.lock().unwrap();
        let mut ids: Vec<String> = registered
            .values()
            .filter(|r| r.broker_name == broker_name && !r.broker_sold)
            .map(|r| r.resource_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All live resource ids owned by a broker, sold or not.
    pub(crate) fn broker_owned_ids(&self, broker_name: &str) -> Vec<String> {
        let registered = self.inner.registered.lock().unwrap();
        registered
            .values()
            .filter(|r| r.broker_name == broker_name)
            .map(|r| r.resource_id.clone())
            .collect()
    }

    /// Drop a row that never made it past `init` (broker launch
    /// bookkeeping; the operator was never asked to run anything).
    pub(crate) async fn discard_init_resource(&self, resource_id: &str) {
        let _guard = self.inner.locks.acquire(resource_id).await;
        let mut r = match self.get_registered(resource_id) {
            Ok(r) => r,
            Err(_) => return,
        };
        if r.status != ResourceStatus::Init {
            return;
        }
        r.status = ResourceStatus::Released;
        if let Err(e) = self.save_resource(&r) {
            error!(%resource_id, error = %e, "discard init resource failed");
        }
    }

    // ── Reservation compensation ───────────────────────────────────

    /// Return a reservation to the pool, gated on the next snapshot.
    fn spawn_release_no_ready(&self, block_key: &str, instance: u32) {
        if instance == 0 || block_key.is_empty() {
            return;
        }
        let mgr = self.clone();
        let key = block_key.to_string();
        tokio::spawn(async move {
            mgr.release_no_ready_instance(&key, instance).await;
        });
    }

    /// Block until the pool has reconciled a snapshot taken after now,
    /// then release the reservation. Releasing before that snapshot
    /// would double-count the reservation (§ pool accounting).
    async fn release_no_ready_instance(&self, block_key: &str, instance: u32) {
        let reserved_at = Instant::now();
        loop {
            if let Some(updated) = self.inner.pool.last_update_time() {
                if updated > reserved_at {
                    if let Err(e) = self.inner.pool.release_no_ready_block(block_key, instance) {
                        warn!(%block_key, instance, error = %e, "release no-ready instances failed");
                    } else {
                        debug!(%block_key, instance, "released no-ready instances");
                    }
                    return;
                }
            }
            tokio::time::sleep(self.inner.config.sync_interval()).await;
        }
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
