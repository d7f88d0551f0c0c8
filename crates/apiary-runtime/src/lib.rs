//! Apiary runtime - the drone orchestrator's dispatch pipeline.
//!
//! A long-running server core that routes browser-automation tasks to a
//! fleet of remote drones over a group-based message bus, enforcing
//! per-domain politeness and tracking every command from dispatch to
//! terminal signal.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Contract Layer                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  apiary-types   : ids, Task, Priority, ErrorCode            │
//! │  apiary-bus     : wire payloads, BusPublisher               │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Runtime Layer (THIS CRATE)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  scheduler/    : ready loop, selection, dispatch, retries   │
//! │  queue/        : priority ready queue, per-drone FIFOs      │
//! │  tracker       : command lifecycle, exactly-once release    │
//! │  domain/       : public-suffix index, domain limiter        │
//! │  intervention/ : operator sessions, rules, replay           │
//! │  registry      : drone records and heartbeats               │
//! │  inbound       : drone→hub message application              │
//! │  sinks         : artifact / session / dead-letter seams     │
//! │  config        : layered TOML + env configuration           │
//! │  metrics       : metric names and recording helpers         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Flow
//!
//! [`Scheduler::submit`](scheduler::Scheduler::submit) validates a task
//! and parks it on the priority ready queue. The ready loop matches it
//! to a capable drone and moves it to that drone's FIFO, whose worker
//! runs the admission gate: the drone's pacing token (non-blocking),
//! then a [`domain::DomainLease`]. The command is published, ownership
//! of both resources moves to the
//! [`tracker::CommandLifecycleTracker`], and an ack watcher enforces
//! the acknowledgement deadline. Inbound drone messages
//! ([`inbound::DroneEventHandler`]) drive the tracker to a terminal
//! state, which releases the lease and token exactly once.
//!
//! # What This Crate Does Not Do
//!
//! The transport, artifact stores, persona backend, metrics recorder
//! and the host process live elsewhere; this crate only defines their
//! seams ([`apiary_bus::BusPublisher`], [`sinks`], [`persona`]).

pub mod config;
pub mod domain;
pub mod inbound;
pub mod intervention;
pub mod metrics;
pub mod persona;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sinks;
pub mod tracker;

pub use inbound::DroneEventHandler;
pub use scheduler::{Scheduler, SchedulerDeps, SchedulerError};
