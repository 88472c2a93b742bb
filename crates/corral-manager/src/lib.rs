//! corral-manager — leader-elected container resource manager.
//!
//! Brokers a pool of compute instances exposed by a pluggable operator
//! backend and lets multiple users request, scale and release named
//! services. The manager only acts while it holds the master role;
//! role tokens arrive on a channel from the leader-election source.
//!
//! # Architecture
//!
//! ```text
//! RoleEvent channel ──► ResourceManager (supervisor)
//!                         ├── ResourceStore   (durable rows, corral-state)
//!                         ├── NodeInfoPool    (capacity accounting, corral-pool)
//!                         ├── Arc<dyn Operator> (backend seam, corral-operator)
//!                         ├── LockTable       (per-resource mutual exclusion)
//!                         ├── BrokerSet       (pre-warmed hot spares)
//!                         └── background loops (sync, lock reaper,
//!                             broker checker, detail publishers, tracers)
//! UserHandler (per user) ──► state machine ops (init/launch/scale/...)
//! ```

pub mod broker;
pub mod config;
pub mod detail;
pub mod error;
pub mod handler;
pub mod locks;
pub mod manager;

pub use broker::{Broker, BrokerParam, BrokerSet, BrokerStrategy, ConstStrategy};
pub use config::{InstanceSizing, ManagerConfig};
pub use detail::{AppDetail, Details};
pub use error::{ManagerError, ManagerResult};
pub use handler::UserHandler;
pub use locks::LockTable;
pub use manager::{ResourceManager, RoleEvent};
