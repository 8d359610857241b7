//! Error taxonomy for the rate layer.

use crate::RateClassId;
use thiserror::Error;

/// Contract violations surfaced by the rate layer.
///
/// All of these indicate a caller or routing bug, not a server anomaly;
/// server-sourced oddities (unknown change codes, oversized averages) are
/// absorbed instead of reported. Nothing is half-applied when an error is
/// returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateError {
    /// A rate-change update named a different class than the monitor holds.
    #[error("rate update for class {actual} applied to monitor for class {expected}")]
    ClassMismatch {
        /// Class the monitor was built for.
        expected: RateClassId,
        /// Class named by the update.
        actual: RateClassId,
    },

    /// A rate-change update named a class absent from the current snapshot.
    #[error("rate update for unknown class {0}")]
    UnknownClass(RateClassId),

    /// Error margins must be `-1` (inherit the connection default) or `>= 0`.
    #[error("invalid error margin {0}; expected -1 or a non-negative value")]
    InvalidErrorMargin(i64),
}
