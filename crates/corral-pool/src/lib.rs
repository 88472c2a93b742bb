//! corral-pool — capacity accounting for the corral resource manager.
//!
//! Tracks how many compute instances each attribute-bucketed block of
//! the node pool can still grant. The pool is purely in-memory and is
//! rebuilt from backend snapshots plus recovered reservations on role
//! promotion; see [`NodeInfoPool`].

pub mod error;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use pool::{
    block_key, BlockDetail, InstanceFilter, InstanceType, NodeInfoPool, PoolConfig, PoolStats,
};
