//! Scheduler layer errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`SchedulerError::Validation`] | `SCHED_VALIDATION` | No |
//! | [`SchedulerError::QueueClosed`] | `SCHED_QUEUE_CLOSED` | No |
//! | [`SchedulerError::ShuttingDown`] | `SCHED_SHUTTING_DOWN` | No |
//!
//! Everything else in the dispatch taxonomy (no eligible drone, denied
//! domain lease, missing persona, ack timeout) is handled internally by
//! requeueing or dead-lettering and never surfaces as an error.

use apiary_types::{ErrorCode, TaskError};
use thiserror::Error;

/// Failure submitting a task to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The task failed validation and was not enqueued.
    #[error(transparent)]
    Validation(#[from] TaskError),

    /// The scheduler has stopped accepting work.
    #[error("scheduler queue is closed")]
    QueueClosed,

    /// Submission raced shutdown.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl ErrorCode for SchedulerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "SCHED_VALIDATION",
            Self::QueueClosed => "SCHED_QUEUE_CLOSED",
            Self::ShuttingDown => "SCHED_SHUTTING_DOWN",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}
