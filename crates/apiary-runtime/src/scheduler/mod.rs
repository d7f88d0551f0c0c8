//! Task scheduler: the dispatch pipeline's control plane.
//!
//! ```text
//!  submit() ──► ReadyQueue ──► ready loop ──► per-drone queue ──► worker
//!                                 │  (capability match,             │
//!                                 │   load + fairness select)       ▼
//!                                 │                       dispatch sequence
//!                                 │                (pacing token → domain lease
//!                                 │                 → persona → publish → track)
//!                                 │                               │
//!                                 ◄── requeues ── ack watcher ◄───┘
//! ```
//!
//! # Task Topology
//!
//! One ready-loop reader, one worker per per-drone queue (restarted by
//! a supervisor while its queue is open), one persona-retry timer, one
//! metrics reporter, one heartbeat scanner, one limiter sweeper, plus a
//! short-lived ack watcher per in-flight command. A single stop token
//! cascades through all of them; cancellation is a clean exit, never an
//! error.

mod dispatch;
mod error;
mod retry;
mod selection;

pub use error::SchedulerError;
pub use retry::{backoff_delay, jitter_factor};
pub use selection::{eligible_drones, score, select_drone};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apiary_bus::{BusPublisher, InterventionNotice, OperatorMessage};
use apiary_types::{DroneId, Task};

use crate::config::{ApiaryConfig, SchedulingConfig};
use crate::domain::{DomainLimiter, PublicSuffixIndex};
use crate::metrics::{
    inc_counter, inc_drone_counter, record_drone_queue_length, record_ready_queue_length,
    TASKS_ENQUEUED, TASKS_PERSONA_MISSING_FAILED, TASKS_PERSONA_MISSING_REQUEUED,
    TASKS_PERSONA_MISSING_RETRY, TASKS_QUEUED, TASKS_REQUEUED,
};
use crate::persona::PersonaStore;
use crate::queue::{drone_queue, DroneQueueHandle, ReadyQueue, ReadyQueueError};
use crate::registry::DroneRegistry;
use crate::sinks::{DeadLetter, DeadLetterSink, InterventionNotifier};
use crate::tracker::CommandLifecycleTracker;

use dispatch::DRONE_DISCONNECTED;
use retry::RetryQueue;

/// Collaborators the scheduler is wired with at construction.
///
/// Registry and tracker are shared: the inbound message handler drives
/// the same instances.
pub struct SchedulerDeps {
    /// Drone registry (shared with the inbound handler).
    pub registry: Arc<DroneRegistry>,
    /// Command lifecycle tracker (shared with the inbound handler).
    pub tracker: Arc<CommandLifecycleTracker>,
    /// Registrable-domain derivation.
    pub suffix: Arc<PublicSuffixIndex>,
    /// Persona store.
    pub personas: Arc<dyn PersonaStore>,
    /// Outbound bus.
    pub bus: Arc<dyn BusPublisher>,
    /// Dead-letter sink.
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Operator-facing notifier.
    pub notifier: Arc<dyn InterventionNotifier>,
}

pub(crate) struct SchedulerCore {
    pub(crate) scheduling: SchedulingConfig,
    pub(crate) ready: ReadyQueue,
    pub(crate) registry: Arc<DroneRegistry>,
    pub(crate) tracker: Arc<CommandLifecycleTracker>,
    pub(crate) limiter: DomainLimiter,
    pub(crate) suffix: Arc<PublicSuffixIndex>,
    pub(crate) personas: Arc<dyn PersonaStore>,
    pub(crate) bus: Arc<dyn BusPublisher>,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) notifier: Arc<dyn InterventionNotifier>,
    pub(crate) retry: RetryQueue,
    pub(crate) stop: CancellationToken,
    queues: Mutex<HashMap<DroneId, DroneQueueHandle>>,
    pacing: Mutex<HashMap<DroneId, Arc<Semaphore>>>,
}

impl SchedulerCore {
    /// The drone's pacing semaphore, created on first use.
    pub(crate) fn pacing_for(&self, drone_id: &DroneId) -> Arc<Semaphore> {
        Arc::clone(
            self.pacing
                .lock()
                .entry(drone_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.scheduling.max_in_flight_per_drone))),
        )
    }

    /// The drone's queue handle; creates the queue and its supervised
    /// worker on first assignment.
    pub(crate) fn queue_for(self: &Arc<Self>, drone_id: &DroneId) -> DroneQueueHandle {
        let mut queues = self.queues.lock();
        if let Some(handle) = queues.get(drone_id) {
            return handle.clone();
        }
        let (handle, rx) = drone_queue(drone_id.clone(), self.scheduling.per_drone_queue_capacity);
        queues.insert(drone_id.clone(), handle.clone());
        drop(queues);

        let core = Arc::clone(self);
        let drone = drone_id.clone();
        tokio::spawn(supervise_worker(core, drone, rx));
        handle
    }

    /// Returns `true` while the drone's queue handle is routed to.
    pub(crate) fn queue_open(&self, drone_id: &DroneId) -> bool {
        self.queues.lock().contains_key(drone_id)
    }

    /// Drops the drone's queue handle and pacing entry. The worker
    /// drains the buffered tasks (each dispatch reroutes them) and
    /// exits on the closed channel.
    pub(crate) fn teardown_drone(&self, drone_id: &DroneId) {
        self.queues.lock().remove(drone_id);
        self.pacing.lock().remove(drone_id);
    }

    /// Puts a task back on the ready queue with a fresh enqueue time.
    pub(crate) async fn requeue_ready(&self, mut task: Task) {
        inc_counter(TASKS_REQUEUED);
        task.touch_enqueued();
        if let Err(err) = self.ready.enqueue(task, &self.stop).await {
            debug!(%err, "dropping task, ready queue unavailable");
        }
    }

    /// Puts a task back on a drone's queue, falling back to the ready
    /// queue when the drone queue is gone or full.
    pub(crate) async fn requeue_per_drone(&self, drone_id: &DroneId, task: Task) {
        inc_counter(TASKS_REQUEUED);
        let handle = self.queues.lock().get(drone_id).cloned();
        let mut bounced = match handle {
            Some(handle) => match handle.try_enqueue(task) {
                Ok(()) => return,
                Err(task) => task,
            },
            None => task,
        };
        bounced.touch_enqueued();
        if let Err(err) = self.ready.enqueue(bounced, &self.stop).await {
            debug!(%err, "dropping task, ready queue unavailable");
        }
    }

    /// Sleeps unless the stop token fires first.
    pub(crate) async fn sleep_cancellable(&self, duration: Duration) {
        tokio::select! {
            () = self.stop.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }

    /// Housekeeping pacing from config.
    pub(crate) fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.scheduling.dispatch_loop_delay_ms.max(1))
    }

    /// Disconnect handling shared by the heartbeat scanner and the
    /// transport-driven path: fail everything in flight (pre-ack
    /// watchers requeue their tasks) and retire the drone's queue.
    pub(crate) fn handle_drone_disconnected(&self, drone_id: &DroneId) {
        self.tracker.fail_all(drone_id, DRONE_DISCONNECTED);
        self.teardown_drone(drone_id);
    }
}

/// Persona-missing policy: backoff while retries remain, then
/// dead-letter and alert the operators.
pub(crate) async fn handle_persona_missing(
    core: &Arc<SchedulerCore>,
    drone_id: &DroneId,
    mut task: Task,
) {
    task.persona_retry_count += 1;
    let attempt = task.persona_retry_count;

    if attempt > core.scheduling.persona_missing_max_retries {
        warn!(
            command = %task.command_id,
            persona = %task.persona_id,
            attempts = attempt,
            "persona still missing, dead-lettering"
        );
        inc_counter(TASKS_PERSONA_MISSING_FAILED);
        core.tracker
            .fail(&task.command_id, drone_id, "missing_persona");

        let dead_letter = DeadLetter {
            command_id: task.command_id.clone(),
            reason: "missing_persona".to_string(),
            persona_id: Some(task.persona_id.clone()),
            drone_id: Some(drone_id.clone()),
            retry_count: attempt,
            failed_at_utc: Utc::now(),
            metadata: json!({
                "type": task.kind,
                "enqueuedAt": task.enqueued_at,
            }),
        };
        if let Err(err) = core.dead_letters.publish(dead_letter).await {
            warn!(%err, "dead-letter sink failed");
        }

        let notice = InterventionNotice {
            command_id: task.command_id.clone(),
            drone_id: Some(drone_id.clone()),
            kind: "dead_letter".to_string(),
            reason: "missing_persona".to_string(),
            requested_at_utc: Utc::now(),
            metadata: json!({
                "personaId": task.persona_id,
                "attempts": attempt,
            }),
        };
        if let Err(err) = core.notifier.notify(notice.clone()).await {
            warn!(%err, "intervention notifier failed");
        }
        if let Err(err) = core
            .bus
            .broadcast_operators(OperatorMessage::RequireIntervention(notice))
            .await
        {
            warn!(%err, "operator broadcast failed");
        }
    } else {
        inc_counter(TASKS_PERSONA_MISSING_RETRY);
        let delay = backoff_delay(
            attempt,
            core.scheduling.persona_missing_base_delay_sec,
            core.scheduling.persona_missing_max_backoff_sec,
            jitter_factor(),
        );
        debug!(
            command = %task.command_id,
            persona = %task.persona_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "persona missing, scheduling retry"
        );
        core.retry.push(task, Instant::now() + delay);
    }
}

/// The drone orchestrator's scheduler.
///
/// Owns the ready queue, the per-drone queues and their workers, the
/// domain limiter, and all housekeeping tasks. Constructed once per
/// process and shared by reference.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a scheduler from config and collaborators. Call
    /// [`start`](Self::start) to spawn the background loops.
    #[must_use]
    pub fn new(config: &ApiaryConfig, deps: SchedulerDeps) -> Self {
        let core = Arc::new(SchedulerCore {
            scheduling: config.scheduling.clone(),
            ready: ReadyQueue::new(config.scheduling.ready_queue_capacity),
            registry: deps.registry,
            tracker: deps.tracker,
            limiter: DomainLimiter::new(config.limits.clone()),
            suffix: deps.suffix,
            personas: deps.personas,
            bus: deps.bus,
            dead_letters: deps.dead_letters,
            notifier: deps.notifier,
            retry: RetryQueue::new(),
            stop: CancellationToken::new(),
            queues: Mutex::new(HashMap::new()),
            pacing: Mutex::new(HashMap::new()),
        });
        Self {
            core,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the background loops: ready reader, persona-retry timer,
    /// metrics reporter, heartbeat scanner and limiter sweeper.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!("scheduler starting");
        tasks.push(tokio::spawn(run_ready_loop(Arc::clone(&self.core))));
        tasks.push(tokio::spawn(run_retry_loop(Arc::clone(&self.core))));
        tasks.push(tokio::spawn(run_metrics_loop(Arc::clone(&self.core))));
        tasks.push(tokio::spawn(run_heartbeat_loop(Arc::clone(&self.core))));
        tasks.push(self.core.limiter.spawn_sweeper(self.core.stop.clone()));
    }

    /// Accepts a task into the pipeline.
    ///
    /// Validates, reduces `domain` to its registrable form, stamps the
    /// enqueue time and places the task on the ready queue (waiting for
    /// space when full).
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Validation`] for incomplete tasks and
    /// [`SchedulerError::QueueClosed`]/[`SchedulerError::ShuttingDown`]
    /// once shutdown has begun.
    pub async fn submit(&self, mut task: Task) -> Result<(), SchedulerError> {
        task.validate()?;
        if let Some(domain) = task.domain.as_deref() {
            task.domain = self.core.suffix.registrable_domain(domain);
        }
        task.touch_enqueued();

        self.core
            .ready
            .enqueue(task, &self.core.stop)
            .await
            .map_err(|err| match err {
                ReadyQueueError::Closed => SchedulerError::QueueClosed,
                ReadyQueueError::Cancelled => SchedulerError::ShuttingDown,
            })?;
        inc_counter(TASKS_ENQUEUED);
        Ok(())
    }

    /// Reports a drone disconnect (normally driven by the transport).
    ///
    /// Marks the drone disconnected, fails its in-flight commands with
    /// `drone_disconnected` (releasing their tokens and leases), and
    /// retires its queue. Commands that were still pre-ack are
    /// requeued by their watchers; acknowledged ones are not.
    pub fn drone_disconnected(&self, drone_id: &DroneId) {
        self.core.registry.mark_disconnected(drone_id);
        self.core.handle_drone_disconnected(drone_id);
    }

    /// Stops the pipeline: fires the stop token, closes the ready
    /// queue, retires every drone queue and joins the background loops.
    pub async fn shutdown(&self) {
        info!("scheduler shutting down");
        self.core.stop.cancel();
        self.core.ready.complete();
        self.core.queues.lock().clear();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "background loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Current ready-queue length.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.core.ready.len()
    }

    /// Number of persona retries waiting for their due time.
    #[must_use]
    pub fn retry_len(&self) -> usize {
        self.core.retry.len()
    }

    /// The stop token driving the pipeline's cancellation cascade.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.core.stop.clone()
    }
}

/// Reads the ready queue and routes each task to a drone queue.
async fn run_ready_loop(core: Arc<SchedulerCore>) {
    debug!("ready loop started");
    loop {
        let task = tokio::select! {
            biased;
            () = core.stop.cancelled() => break,
            task = core.ready.dequeue() => match task {
                Some(task) => task,
                None => break,
            },
        };
        route_task(&core, task).await;
    }
    debug!("ready loop stopped");
}

/// Selects a drone for one task and hands it to that drone's queue.
async fn route_task(core: &Arc<SchedulerCore>, task: Task) {
    let eligible = eligible_drones(core.registry.snapshot_all(), &task);
    if eligible.is_empty() {
        debug!(command = %task.command_id, "no eligible drone, parking for a second");
        core.sleep_cancellable(Duration::from_secs(1)).await;
        core.requeue_ready(task).await;
        return;
    }

    let Some(chosen) = select_drone(eligible, &task, Instant::now()) else {
        core.requeue_ready(task).await;
        return;
    };
    let drone_id = chosen.drone_id;
    let handle = core.queue_for(&drone_id);
    match handle.enqueue(task, &core.stop).await {
        Ok(()) => inc_drone_counter(TASKS_QUEUED, &drone_id),
        // The queue closed between lookup and enqueue.
        Err(task) => core.requeue_ready(task).await,
    }
}

/// Supervises one drone's dispatch worker, restarting it after panics
/// while the queue is open and the scheduler is running.
async fn supervise_worker(
    core: Arc<SchedulerCore>,
    drone_id: DroneId,
    rx: mpsc::Receiver<Task>,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    loop {
        let worker = tokio::spawn(worker_loop(
            Arc::clone(&core),
            drone_id.clone(),
            Arc::clone(&rx),
        ));
        match worker.await {
            Ok(()) => break,
            Err(err) => {
                if core.stop.is_cancelled() || !core.queue_open(&drone_id) {
                    break;
                }
                warn!(
                    drone = %drone_id,
                    panicked = err.is_panic(),
                    "dispatch worker died, restarting"
                );
                core.sleep_cancellable(core.dispatch_delay()).await;
            }
        }
    }
    debug!(drone = %drone_id, "dispatch worker supervisor exited");
}

/// One drone's dispatch loop: pops its queue and runs the dispatch
/// sequence until the queue closes or the stop token fires.
async fn worker_loop(
    core: Arc<SchedulerCore>,
    drone_id: DroneId,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
) {
    let mut rx = rx.lock().await;
    debug!(drone = %drone_id, "dispatch worker started");
    loop {
        let task = tokio::select! {
            biased;
            () = core.stop.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        dispatch::dispatch_task(&core, &drone_id, task).await;
    }
    debug!(drone = %drone_id, "dispatch worker stopped");
}

/// Pops due persona retries back onto the ready queue.
async fn run_retry_loop(core: Arc<SchedulerCore>) {
    debug!("persona retry loop started");
    loop {
        while let Some(mut task) = core.retry.pop_due(Instant::now()) {
            inc_counter(TASKS_PERSONA_MISSING_REQUEUED);
            task.touch_enqueued();
            if core.ready.enqueue(task, &core.stop).await.is_err() {
                debug!("persona retry loop stopping, ready queue unavailable");
                return;
            }
        }

        let until_due = core
            .retry
            .next_due()
            .map(|due| due.saturating_duration_since(Instant::now()));
        tokio::select! {
            biased;
            () = core.stop.cancelled() => break,
            () = core.retry.notified() => {}
            () = async {
                match until_due {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
    }
    debug!("persona retry loop stopped");
}

/// Publishes queue-length gauges.
async fn run_metrics_loop(core: Arc<SchedulerCore>) {
    let interval = core.dispatch_delay();
    loop {
        tokio::select! {
            () = core.stop.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        record_ready_queue_length(core.ready.len());
        let handles: Vec<DroneQueueHandle> = core.queues.lock().values().cloned().collect();
        for handle in handles {
            record_drone_queue_length(handle.drone_id(), handle.len());
        }
    }
}

/// Expires drones whose heartbeats went silent.
async fn run_heartbeat_loop(core: Arc<SchedulerCore>) {
    let expect = Duration::from_secs(core.scheduling.heartbeat_expect_sec.max(1));
    let grace = Duration::from_secs(core.scheduling.disconnect_grace_sec);
    loop {
        tokio::select! {
            () = core.stop.cancelled() => break,
            () = tokio::time::sleep(expect) => {}
        }
        for drone_id in core.registry.expire_stale(Instant::now(), expect, grace) {
            core.handle_drone_disconnected(&drone_id);
        }
    }
}
