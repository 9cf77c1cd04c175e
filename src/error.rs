//! Tessera error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_DB_FLUSH: &str = "error flushing database state";
pub const ERR_INACTIVE_BASELINE: &str = "baseline topology can only be changed on an active cluster";

/// Grid error variants.
#[derive(Debug, Error)]
pub enum GridError {
    /// An operation was attempted in an invalid activation context.
    #[error("activation error: {0}")]
    Activation(String),
    /// The underlying resource or connection failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The underlying resource reported corrupted data; the affected unit must restart from zero.
    #[error("resource corrupted: {0}")]
    Corrupted(String),
    /// The transfer peer sent malformed or inconsistent data.
    #[error("transfer protocol error: {0}")]
    Protocol(String),
    /// The operation observed a stale baseline version or a deactivated cluster.
    #[error("operation cancelled, superseded by a newer topology")]
    Cancelled,
    /// A duplicate authoritative assignment of the same partition replica was detected.
    #[error("partition assignment conflict: {0}")]
    Conflict(String),
    /// Partitions which could not be rebalanced after exhausting all retries.
    #[error("failed to rebalance partitions {0:?}")]
    RebalanceFailed(Vec<u32>),
    /// A background task died before it could report its outcome.
    #[error("task failed: {0}")]
    TaskFailed(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
}

impl GridError {
    /// Check if a session failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Corrupted(_) | Self::Protocol(_))
    }

    /// Map an IO error coming from a transmittable target, surfacing corruption as its own variant.
    pub fn from_target(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::InvalidData => Self::Corrupted(err.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// A result type where the error is a `GridError`.
pub type GridResult<T> = ::std::result::Result<T, GridError>;

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
