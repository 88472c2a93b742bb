//! Manager error surface.

use corral_pool::PoolError;
use thiserror::Error;

/// Result type alias for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors surfaced by the resource manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Any user operation while this process is not master.
    #[error("resource manager is not running")]
    ManagerNotRunning,

    #[error("resource already init: {0}")]
    ResourceAlreadyInit(String),

    #[error("resource no exist: {0}")]
    ResourceNoExist(String),

    #[error("application already launched: {0}")]
    ApplicationAlreadyLaunched(String),

    #[error("resource not running: {0}")]
    ResourceNotRunning(String),

    #[error("resource already released: {0}")]
    ResourceAlreadyReleased(String),

    /// The pool cannot grant the requested instances.
    #[error("not enough resources")]
    NotEnoughResources,

    /// A broker takeover was required or requested but none available.
    #[error("broker has not enough resources")]
    BrokerNotEnoughResources,

    /// The broker is throttled after exhausting the pool.
    #[error("brokering under cooling time")]
    BrokeringUnderCoolingTime,

    #[error("store error: {0}")]
    Store(#[from] corral_state::StateError),

    #[error("operator error: {0}")]
    Operator(#[from] corral_operator::OperatorError),
}

impl From<PoolError> for ManagerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NotEnoughResources => ManagerError::NotEnoughResources,
            PoolError::UnknownBlock(_) => ManagerError::NotEnoughResources,
        }
    }
}

impl ManagerError {
    /// True when a status query says the service is already gone.
    pub fn is_resource_no_exist(&self) -> bool {
        matches!(self, ManagerError::ResourceNoExist(_))
    }
}
