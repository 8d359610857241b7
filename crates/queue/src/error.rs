//! Error taxonomy for the scheduling facade.

use rate::RateError;
use thiserror::Error;

use crate::ConnectionId;

/// Errors surfaced by the scheduling facade.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The given id does not name an attached connection.
    #[error("connection {0} is not attached")]
    UnknownConnection(ConnectionId),

    /// Idle timeouts must be nonzero or the worker would exit on every wake.
    #[error("queue runner idle timeout must be nonzero")]
    InvalidIdleTimeout,

    /// A rate-class operation failed on the connection's monitor.
    #[error(transparent)]
    Rate(#[from] RateError),
}
