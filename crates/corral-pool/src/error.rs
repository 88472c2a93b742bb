//! Pool error types.

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during pool accounting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No matching block can grant the requested instances.
    #[error("not enough free instances in pool")]
    NotEnoughResources,

    /// A release/recover referenced a block key the pool has never seen.
    #[error("unknown resource block: {0}")]
    UnknownBlock(String),
}
