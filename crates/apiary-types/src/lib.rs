//! Core types for the Apiary drone orchestrator.
//!
//! This crate is the contract layer shared by the orchestrator runtime,
//! the bus payloads, and host processes:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Contract Layer                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  apiary-types  : ids, Task, Priority, ErrorCode  ◄── HERE   │
//! │  apiary-bus    : wire payloads, BusPublisher                │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Runtime Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  apiary-runtime : scheduler, queues, limiter, tracker,      │
//! │                   intervention, registry, sinks             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Identifier Design
//!
//! Command, drone and persona ids are string newtypes rather than UUIDs:
//! they are chosen by external parties (submitters pick command ids to
//! correlate results; drones register under provisioned names) and must
//! round-trip through the wire verbatim.
//!
//! # Parameter Bags
//!
//! Command parameters and persona traits are free-form JSON. The
//! [`ParamBag`] trait and helpers in [`params`] provide the lenient,
//! case-insensitive reads that intervention rules require.

mod error;
mod id;
pub mod params;
mod task;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use id::{CommandId, DroneId, PersonaId};
pub use params::{is_affirmative, string_values, ParamBag};
pub use task::{Priority, SessionRef, Task, TaskError};
