//! Operator error surface.

use thiserror::Error;

/// Result type alias for operator calls.
pub type OperatorResult<T> = Result<T, OperatorError>;

/// Errors a backend adapter may return.
///
/// The core does not branch on either variant; both reach the caller
/// unchanged. `NotFound` lets adapters report a missing service
/// distinctly from a backend failure.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("service not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}
