//! Persona-missing retry queue.
//!
//! Tasks whose persona cannot be loaded back off exponentially instead
//! of hammering the store. Entries wait in a time-ordered heap; a single
//! timer task pops whatever is due and puts it back on the ready queue
//! with a fresh enqueue timestamp.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;

use apiary_types::Task;

/// Jitter band applied to every backoff delay.
const JITTER_MIN: f64 = 0.75;
const JITTER_MAX: f64 = 1.25;

/// Computes the persona-missing backoff delay for an attempt.
///
/// `clamp(base · 2^(attempt−1), base, max_backoff) · jitter`, with
/// `base` floored at one second and `max_backoff` floored at `base`.
/// `jitter` is expected in the 0.75..=1.25 band; see [`jitter_factor`].
#[must_use]
pub fn backoff_delay(attempt: u32, base_sec: u64, max_backoff_sec: u64, jitter: f64) -> Duration {
    let base = base_sec.max(1) as f64;
    let max_backoff = (max_backoff_sec.max(base_sec.max(1))) as f64;

    // Capped exponent: past 2^32 the clamp has long since taken over.
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let raw = base * 2f64.powi(exponent);
    let clamped = raw.clamp(base, max_backoff);
    Duration::from_secs_f64(clamped * jitter)
}

/// Draws a uniform jitter factor in 0.75..=1.25.
#[must_use]
pub fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX)
}

struct RetryEntry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Time-ordered holding pen for persona-missing retries.
#[derive(Default)]
pub struct RetryQueue {
    inner: Mutex<RetryInner>,
    notify: Notify,
}

#[derive(Default)]
struct RetryInner {
    heap: BinaryHeap<Reverse<RetryEntry>>,
    next_seq: u64,
}

impl RetryQueue {
    /// Creates an empty retry queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a task to re-enter the ready queue at `due`.
    pub fn push(&self, task: Task, due: Instant) {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse(RetryEntry { due, seq, task }));
        }
        // Wake the timer so it can shorten its sleep.
        self.notify.notify_one();
    }

    /// Pops the earliest entry whose due time has arrived.
    #[must_use]
    pub fn pop_due(&self, now: Instant) -> Option<Task> {
        let mut inner = self.inner.lock();
        if inner.heap.peek().is_some_and(|Reverse(e)| e.due <= now) {
            inner.heap.pop().map(|Reverse(e)| e.task)
        } else {
            None
        }
    }

    /// Due time of the earliest pending entry.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        self.inner.lock().heap.peek().map(|Reverse(e)| e.due)
    }

    /// Number of pending retries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until [`Self::push`] is called.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
