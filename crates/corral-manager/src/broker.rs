//! Broker subsystem — pre-warmed hot-spare resources.
//!
//! A broker owns a pool of ordinary resource rows (marked with its
//! name) that are launched ahead of demand. A fresh `launch` can take
//! one over (`apply`), skipping the cold start entirely; the checker
//! loop keeps the pool at the size its strategy asks for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use corral_pool::{InstanceFilter, PoolError};
use corral_state::{ResourceParam, ResourceStatus};
use tracing::{info, warn};

use crate::error::{ManagerError, ManagerResult};
use crate::manager::ResourceManager;

/// Decides how far a broker's pool is from where it should be.
pub trait BrokerStrategy: Send + Sync {
    /// Signed delta from the current unsold count: positive to launch,
    /// negative to release.
    fn ask(&self, current: u32) -> i64;
}

/// Keep a constant number of hot spares.
#[derive(Debug, Clone, Copy)]
pub struct ConstStrategy {
    pub target: u32,
}

impl BrokerStrategy for ConstStrategy {
    fn ask(&self, current: u32) -> i64 {
        i64::from(self.target) - i64::from(current)
    }
}

/// Template and sizing for the resources a broker pre-warms.
#[derive(Debug, Clone)]
pub struct BrokerParam {
    /// Request template (city, platform, image, env, ...). The broker
    /// name is stamped onto owned rows automatically.
    pub param: ResourceParam,
    /// Instances per pre-warmed resource.
    pub instance: u32,
    /// Throttle window after the pool runs dry.
    pub cooling: Duration,
}

impl Default for BrokerParam {
    fn default() -> Self {
        Self {
            param: ResourceParam::default(),
            instance: 1,
            cooling: Duration::from_secs(60),
        }
    }
}

/// One pre-warming broker. Ownership of resources is derived from the
/// registered map (rows carrying this broker's name), so the broker
/// itself holds only naming and throttle state.
pub struct Broker {
    name: String,
    user: String,
    strategy: Box<dyn BrokerStrategy>,
    param: BrokerParam,
    seq: AtomicU64,
    cooling_until: Mutex<Option<Instant>>,
}

impl Broker {
    pub fn new(name: &str, user: &str, strategy: Box<dyn BrokerStrategy>, param: BrokerParam) -> Self {
        Self {
            name: name.to_string(),
            user: user.to_string(),
            strategy,
            param,
            seq: AtomicU64::new(0),
            cooling_until: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Unsold resources currently owned by this broker.
    pub fn current_num(&self, mgr: &ResourceManager) -> u32 {
        mgr.broker_resource_ids(&self.name).len() as u32
    }

    /// Delta the strategy wants applied this tick.
    pub(crate) fn ask_delta(&self, mgr: &ResourceManager) -> i64 {
        self.strategy.ask(self.current_num(mgr))
    }

    /// Re-derive the id sequence from surviving rows so freshly minted
    /// ids never collide after a role change.
    pub fn recover(&self, mgr: &ResourceManager) {
        let prefix = format!("{}-", self.name);
        let mut max_seq = 0u64;
        for id in mgr.broker_owned_ids(&self.name) {
            if let Some(n) = id.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
                max_seq = max_seq.max(n);
            }
        }
        self.seq.store(max_seq, Ordering::SeqCst);
        info!(broker = %self.name, seq = max_seq, "broker recovered");
    }

    /// Pre-warm one resource.
    ///
    /// Pool exhaustion starts the cooling window and surfaces as
    /// `BrokerNotEnoughResources`; further launches inside the window
    /// fail fast with `BrokeringUnderCoolingTime`.
    pub async fn launch(&self, mgr: &ResourceManager) -> ManagerResult<()> {
        if self.under_cooling() {
            return Err(ManagerError::BrokeringUnderCoolingTime);
        }

        let resource_id = self.next_resource_id();
        let mut param = self.param.param.clone();
        param.broker_name = self.name.clone();
        mgr.init(&resource_id, &self.user, param)?;

        let want = self.param.instance;
        let filter: InstanceFilter = Box::new(move |available| {
            if available < want {
                return Err(PoolError::NotEnoughResources);
            }
            Ok(want)
        });

        match mgr.launch(&resource_id, &self.user, "", filter, false).await {
            Ok(()) => {
                info!(broker = %self.name, %resource_id, "broker resource launched");
                Ok(())
            }
            Err(ManagerError::NotEnoughResources) => {
                self.begin_cooling();
                mgr.discard_init_resource(&resource_id).await;
                Err(ManagerError::BrokerNotEnoughResources)
            }
            Err(e) => {
                mgr.discard_init_resource(&resource_id).await;
                Err(e)
            }
        }
    }

    /// Release one unsold resource back to the pool.
    pub async fn release(&self, mgr: &ResourceManager) -> ManagerResult<()> {
        let Some(resource_id) = mgr.broker_resource_ids(&self.name).into_iter().next() else {
            warn!(broker = %self.name, "no unsold resource to release");
            return Ok(());
        };
        mgr.release(&resource_id, &self.user).await
    }

    /// Hand an unsold, compatible resource over to `applicant_id`.
    ///
    /// The chosen row is marked sold under its own lock, so a row can
    /// never be granted twice.
    pub(crate) async fn apply(
        &self,
        mgr: &ResourceManager,
        applicant_id: &str,
        user: &str,
        param: &ResourceParam,
        filter: &InstanceFilter,
    ) -> ManagerResult<String> {
        if !compatible(&self.param.param, param) {
            return Err(ManagerError::BrokerNotEnoughResources);
        }

        for resource_id in mgr.broker_resource_ids(&self.name) {
            {
                let _guard = mgr.lock_resource(&resource_id).await;
                let mut r = match mgr.get_registered(&resource_id) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if r.broker_sold
                    || !matches!(r.status, ResourceStatus::Deploying | ResourceStatus::Running)
                    || !compatible(&r.param, param)
                {
                    continue;
                }
                match filter(r.request_instance) {
                    Ok(n) if n > 0 && n <= r.request_instance => {}
                    _ => continue,
                }

                r.broker_sold = true;
                mgr.save_resource(&r)?;
            }
            info!(
                broker = %self.name,
                %resource_id,
                %applicant_id,
                %user,
                "broker resource sold"
            );
            return Ok(resource_id);
        }

        Err(ManagerError::BrokerNotEnoughResources)
    }

    fn next_resource_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.name, n)
    }

    fn under_cooling(&self) -> bool {
        match *self.cooling_until.lock().unwrap() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn begin_cooling(&self) {
        *self.cooling_until.lock().unwrap() = Some(Instant::now() + self.param.cooling);
        warn!(broker = %self.name, cooling = ?self.param.cooling, "broker entering cooling window");
    }
}

/// A request is compatible with a broker template when placement and
/// image agree.
fn compatible(template: &ResourceParam, request: &ResourceParam) -> bool {
    template.city == request.city
        && template.platform == request.platform
        && template.image == request.image
}

/// The set of registered brokers.
pub struct BrokerSet {
    brokers: Mutex<Vec<std::sync::Arc<Broker>>>,
}

impl BrokerSet {
    pub fn new() -> Self {
        Self {
            brokers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, broker: Broker) {
        self.brokers.lock().unwrap().push(std::sync::Arc::new(broker));
    }

    pub fn list(&self) -> Vec<std::sync::Arc<Broker>> {
        self.brokers.lock().unwrap().clone()
    }

    /// Recover every broker's id sequence on role promotion.
    pub fn recover(&self, mgr: &ResourceManager) {
        for broker in self.list() {
            broker.recover(mgr);
        }
    }

    /// Try each broker in turn for a takeover.
    pub(crate) async fn apply(
        &self,
        mgr: &ResourceManager,
        applicant_id: &str,
        user: &str,
        param: &ResourceParam,
        filter: &InstanceFilter,
    ) -> ManagerResult<String> {
        for broker in self.list() {
            match broker.apply(mgr, applicant_id, user, param, filter).await {
                Ok(id) => return Ok(id),
                Err(ManagerError::BrokerNotEnoughResources) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ManagerError::BrokerNotEnoughResources)
    }
}

impl Default for BrokerSet {
    fn default() -> Self {
        Self::new()
    }
}
