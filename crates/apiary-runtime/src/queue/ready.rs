//! Bounded priority ready queue.
//!
//! The global intake buffer between submission and drone selection.
//! Ordering key: priority descending, then enqueue time ascending, then
//! a monotonic sequence. High jumps the line, but FIFO holds within a
//! priority.
//!
//! # Backpressure and Shutdown
//!
//! Capacity is enforced with a semaphore: `enqueue` waits for space
//! (observing the stop token), `dequeue` waits for an item.
//! [`complete`](ReadyQueue::complete) closes the queue; blocked
//! enqueuers fail, and dequeuers drain the remaining items before
//! returning `None`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use apiary_types::{ErrorCode, Task};

/// Failure enqueueing onto the ready queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadyQueueError {
    /// The queue was completed; no further tasks are accepted.
    #[error("ready queue is closed")]
    Closed,
    /// The stop token fired while waiting for space.
    #[error("enqueue cancelled by shutdown")]
    Cancelled,
}

impl ErrorCode for ReadyQueueError {
    fn code(&self) -> &'static str {
        match self {
            Self::Closed => "SCHED_READY_QUEUE_CLOSED",
            Self::Cancelled => "SCHED_READY_QUEUE_CANCELLED",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Entry {
    task: Task,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greatest = highest priority, then earliest enqueue,
        // then lowest sequence.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.task.enqueued_at.cmp(&self.task.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

/// Bounded, priority-ordered intake queue.
///
/// # Example
///
/// ```
/// use apiary_runtime::queue::ReadyQueue;
/// use apiary_types::Task;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let queue = ReadyQueue::new(8);
/// let stop = CancellationToken::new();
/// queue
///     .enqueue(Task::new("c1", "navigate", "p1"), &stop)
///     .await
///     .expect("space available");
/// let task = queue.dequeue().await.expect("task queued");
/// assert_eq!(task.command_id.as_str(), "c1");
/// # });
/// ```
#[derive(Debug)]
pub struct ReadyQueue {
    inner: Mutex<Inner>,
    /// Free capacity; enqueue acquires, dequeue returns.
    space: Semaphore,
    /// Queued items; dequeue acquires, enqueue adds.
    items: Semaphore,
}

impl ReadyQueue {
    /// Creates a queue with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            space: Semaphore::new(capacity),
            items: Semaphore::new(0),
        }
    }

    /// Enqueues a task, waiting for space when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`ReadyQueueError::Closed`] after [`Self::complete`] and
    /// [`ReadyQueueError::Cancelled`] when the stop token fires first.
    pub async fn enqueue(&self, task: Task, stop: &CancellationToken) -> Result<(), ReadyQueueError> {
        let permit = tokio::select! {
            biased;
            () = stop.cancelled() => return Err(ReadyQueueError::Cancelled),
            permit = self.space.acquire() => permit.map_err(|_| ReadyQueueError::Closed)?,
        };

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(ReadyQueueError::Closed);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry { task, seq });
        }
        permit.forget();
        self.items.add_permits(1);
        Ok(())
    }

    /// Dequeues the highest-priority task, waiting when empty.
    ///
    /// Returns `None` once the queue is completed and drained.
    pub async fn dequeue(&self) -> Option<Task> {
        loop {
            match self.items.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    let task = self.inner.lock().heap.pop().map(|entry| entry.task);
                    match task {
                        Some(task) => {
                            self.space.add_permits(1);
                            return Some(task);
                        }
                        // A drain racing a close can strip the heap
                        // under a granted permit; re-check.
                        None => {
                            if self.inner.lock().closed {
                                return None;
                            }
                        }
                    }
                }
                Err(_closed) => {
                    // Closed: drain whatever is left without permits.
                    return self.inner.lock().heap.pop().map(|entry| entry.task);
                }
            }
        }
    }

    /// Closes the queue: enqueues fail, dequeuers drain then get `None`.
    pub fn complete(&self) {
        self.inner.lock().closed = true;
        self.space.close();
        self.items.close();
    }

    /// Current queue length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Returns `true` when no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` after [`Self::complete`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
