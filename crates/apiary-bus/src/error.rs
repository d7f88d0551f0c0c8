//! Bus layer errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`BusError::Serialize`] | `BUS_SERIALIZE` | No |
//! | [`BusError::GroupUnavailable`] | `BUS_GROUP_UNAVAILABLE` | Yes |
//! | [`BusError::Closed`] | `BUS_CLOSED` | No |
//!
//! A failed publish during dispatch is a soft error: the scheduler
//! releases the pacing token and domain lease and requeues the task.

use apiary_types::ErrorCode;
use thiserror::Error;

/// Failure publishing onto the drone bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The payload could not be serialized.
    #[error("failed to serialize bus payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The destination group has no reachable subscriber.
    ///
    /// Transient: the drone may be reconnecting. The dispatch path treats
    /// this as a requeue, not a terminal failure.
    #[error("bus group unavailable: {0}")]
    GroupUnavailable(String),

    /// The transport has shut down.
    #[error("bus connection closed")]
    Closed,
}

impl ErrorCode for BusError {
    fn code(&self) -> &'static str {
        match self {
            Self::Serialize(_) => "BUS_SERIALIZE",
            Self::GroupUnavailable(_) => "BUS_GROUP_UNAVAILABLE",
            Self::Closed => "BUS_CLOSED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::GroupUnavailable(_))
    }
}
