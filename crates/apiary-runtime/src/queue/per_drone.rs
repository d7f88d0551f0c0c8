//! Per-drone dispatch queues.
//!
//! One bounded FIFO per known drone, created lazily on first
//! assignment. A single worker consumes each queue and runs the
//! dispatch sequence; everything upstream only holds a
//! [`DroneQueueHandle`].
//!
//! Closing is by handle drop: when the scheduler removes the handle
//! from its routing map, the worker drains the buffered tasks (each
//! dispatch then sees the drone's real state and reroutes) and exits on
//! the closed channel.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use apiary_types::{DroneId, Task};

/// Handle for enqueueing tasks onto one drone's queue.
#[derive(Debug, Clone)]
pub struct DroneQueueHandle {
    drone_id: DroneId,
    tx: mpsc::Sender<Task>,
}

/// Creates a drone queue, returning the handle and the worker-side
/// receiver.
#[must_use]
pub fn drone_queue(drone_id: DroneId, capacity: usize) -> (DroneQueueHandle, mpsc::Receiver<Task>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DroneQueueHandle { drone_id, tx }, rx)
}

impl DroneQueueHandle {
    /// The drone this queue feeds.
    #[must_use]
    pub fn drone_id(&self) -> &DroneId {
        &self.drone_id
    }

    /// Enqueues a task, waiting for space when the queue is full.
    ///
    /// Returns the task back when the queue closed or the stop token
    /// fired, so the caller can reroute it.
    pub async fn enqueue(&self, task: Task, stop: &CancellationToken) -> Result<(), Task> {
        tokio::select! {
            biased;
            () = stop.cancelled() => Err(task),
            slot = self.tx.reserve() => match slot {
                Ok(slot) => {
                    slot.send(task);
                    Ok(())
                }
                Err(_) => Err(task),
            },
        }
    }

    /// Enqueues without waiting. Returns the task back when the queue
    /// is full or closed.
    pub fn try_enqueue(&self, task: Task) -> Result<(), Task> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) | mpsc::error::TrySendError::Closed(task) => task,
        })
    }

    /// Number of tasks currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Returns `true` when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        Task::new(id, "navigate", "p1")
    }

    #[tokio::test]
    async fn fifo_order() {
        let (handle, mut rx) = drone_queue(DroneId::new("d1"), 4);
        let stop = CancellationToken::new();
        for id in ["a", "b", "c"] {
            handle.enqueue(task(id), &stop).await.expect("enqueue");
        }
        for id in ["a", "b", "c"] {
            assert_eq!(rx.recv().await.expect("task").command_id.as_str(), id);
        }
    }

    #[tokio::test]
    async fn try_enqueue_reports_full() {
        let (handle, mut rx) = drone_queue(DroneId::new("d1"), 1);
        handle.try_enqueue(task("a")).expect("fits");
        let bounced = handle.try_enqueue(task("b")).expect_err("full");
        assert_eq!(bounced.command_id.as_str(), "b");
        assert_eq!(handle.len(), 1);

        rx.recv().await.expect("drain");
        handle.try_enqueue(task("b")).expect("space freed");
    }

    #[tokio::test]
    async fn worker_sees_closed_queue_after_handles_drop() {
        let (handle, mut rx) = drone_queue(DroneId::new("d1"), 4);
        handle.try_enqueue(task("a")).expect("enqueue");
        drop(handle);

        // Buffered task drains first, then the channel reports closed.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_returns_task() {
        let (handle, _rx) = drone_queue(DroneId::new("d1"), 1);
        let stop = CancellationToken::new();
        handle.enqueue(task("a"), &stop).await.expect("fits");

        stop.cancel();
        let bounced = handle
            .enqueue(task("b"), &stop)
            .await
            .expect_err("cancelled");
        assert_eq!(bounced.command_id.as_str(), "b");
    }
}
