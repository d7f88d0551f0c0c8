//! Queues feeding the dispatch pipeline.
//!
//! Two tiers: the global [`ReadyQueue`] (bounded, priority-ordered)
//! between submission and drone selection, and one bounded FIFO per
//! drone ([`drone_queue`]) between selection and the wire.
//!
//! Priority affects the ready queue only; once routed to a drone, tasks
//! dispatch strictly in arrival order.

mod per_drone;
mod ready;

pub use per_drone::{drone_queue, DroneQueueHandle};
pub use ready::{ReadyQueue, ReadyQueueError};
