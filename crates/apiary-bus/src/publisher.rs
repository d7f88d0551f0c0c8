//! Outbound transport contract.
//!
//! The orchestrator never talks to a socket directly; it hands fully
//! composed payloads to a [`BusPublisher`] supplied by the host process.
//! The concrete transport (authentication, reconnects, delivery retries)
//! lives behind this seam.

use async_trait::async_trait;

use apiary_types::DroneId;

use crate::{BusError, HubMessage, OperatorMessage};

/// Group every operator console subscribes to.
pub const OPERATORS_GROUP: &str = "operators";

/// Returns the bus group a drone listens on.
///
/// # Example
///
/// ```
/// use apiary_bus::drone_group;
/// use apiary_types::DroneId;
///
/// assert_eq!(drone_group(&DroneId::new("d1")), "drone_d1");
/// ```
#[must_use]
pub fn drone_group(drone_id: &DroneId) -> String {
    format!("drone_{}", drone_id)
}

/// Publishes orchestrator messages onto the drone bus.
///
/// Implementations must be safe to call concurrently from scheduler
/// workers. Delivery is at-least-once; the command lifecycle tracker
/// tolerates duplicate acknowledgements and results.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publishes a command or query to a single drone's group.
    async fn publish_to_drone(
        &self,
        drone_id: &DroneId,
        message: HubMessage,
    ) -> Result<(), BusError>;

    /// Broadcasts a notice to the operator group.
    async fn broadcast_operators(&self, message: OperatorMessage) -> Result<(), BusError>;
}
