//! Wire contracts for the Apiary drone orchestrator.
//!
//! This crate defines the payloads exchanged over the group-based
//! pub/sub bus and the outbound publishing seam the runtime depends on.
//! It contains no transport implementation: hosts plug a concrete bus
//! behind [`BusPublisher`], and the runtime stays transport-agnostic.
//!
//! ```text
//!                 ┌──────────────────────────┐
//!   HubMessage    │        the bus           │   DroneMessage
//!  ─────────────► │  drone_{id} groups       │ ◄──────────────
//!                 │  operators group         │
//!                 └──────────────────────────┘
//! ```
//!
//! # Delivery Model
//!
//! At-least-once. Consumers must tolerate duplicates: the lifecycle
//! tracker ignores repeated acknowledgements, and terminal signals for
//! an already-removed command are dropped.
//!
//! # Authentication
//!
//! Handled by the transport: connections whose `X-API-Key` header does
//! not match the configured server key are refused before any payload
//! reaches the runtime.

mod error;
mod messages;
mod publisher;

pub use error::BusError;
pub use messages::{
    Artifact, CommandErrorPayload, CommandPayload, CommandResultPayload, DroneMessage,
    DroneRegistrationPayload, HubMessage, InterventionNotice, InterventionPayload,
    OperatorMessage, QueryPayload, QueryResponsePayload, StatusPayload,
};
pub use publisher::{drone_group, BusPublisher, OPERATORS_GROUP};
