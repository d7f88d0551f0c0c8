//! Per-drone dispatch sequence.
//!
//! One invocation per task, run by the drone's dedicated worker. The
//! admission gate is two-stage: the drone's pacing token first, then a
//! domain lease. Only after both are held does the command go on the
//! wire; ownership of both then transfers to the lifecycle tracker,
//! which releases them on whichever terminal signal arrives.
//!
//! Every failure before registration rolls the resources back and
//! requeues the task; nothing in here propagates errors upward.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use apiary_bus::{CommandPayload, HubMessage};
use apiary_types::{DroneId, Task};

use crate::metrics::{inc_drone_counter, COMMANDS_ACK_TIMEOUT, TASKS_DISPATCHED};
use crate::tracker::{AckOutcome, PacingToken};

use super::SchedulerCore;

/// Failure reason a disconnected drone's commands are failed with; the
/// ack watcher keys its requeue decision off this exact string.
pub(crate) const DRONE_DISCONNECTED: &str = "drone_disconnected";

/// Wait before retrying a task whose domain lease was denied.
const LEASE_DENIED_DELAY: Duration = Duration::from_secs(1);

pub(crate) async fn dispatch_task(core: &Arc<SchedulerCore>, drone_id: &DroneId, task: Task) {
    // Stage one: pacing token, non-blocking. A busy drone keeps the
    // task buffered on its own queue.
    let semaphore = core.pacing_for(drone_id);
    let token = match semaphore.try_acquire_owned() {
        Ok(permit) => PacingToken::new(permit),
        Err(_) => {
            debug!(drone = %drone_id, command = %task.command_id, "pacing token unavailable");
            core.sleep_cancellable(core.dispatch_delay()).await;
            core.requeue_per_drone(drone_id, task).await;
            return;
        }
    };

    // Fresh registry state: the snapshot taken at selection time may be
    // stale by the time the task reaches the front of the queue.
    match core.registry.snapshot(drone_id) {
        None => {
            drop(token);
            info!(drone = %drone_id, "drone vanished from registry, tearing down its queue");
            core.teardown_drone(drone_id);
            core.requeue_ready(task).await;
            return;
        }
        Some(info) if !info.status.is_idle() => {
            drop(token);
            debug!(drone = %drone_id, command = %task.command_id, "drone not idle, rerouting");
            core.sleep_cancellable(core.dispatch_delay()).await;
            core.requeue_ready(task).await;
            return;
        }
        Some(_) => {}
    }

    // Stage two: domain lease.
    let lease = match task.domain.as_deref() {
        Some(domain) => match core.limiter.try_acquire(drone_id, domain) {
            Ok(lease) => Some(lease),
            Err(reason) => {
                drop(token);
                debug!(
                    drone = %drone_id,
                    command = %task.command_id,
                    domain,
                    %reason,
                    "domain lease denied"
                );
                core.sleep_cancellable(LEASE_DENIED_DELAY).await;
                core.requeue_per_drone(drone_id, task).await;
                return;
            }
        },
        None => None,
    };

    // Persona load.
    let persona = match core.personas.load(&task.persona_id).await {
        Ok(Some(persona)) => persona,
        Ok(None) => {
            drop(lease);
            drop(token);
            super::handle_persona_missing(core, drone_id, task).await;
            return;
        }
        Err(err) => {
            warn!(persona = %task.persona_id, %err, "persona store error, requeueing task");
            drop(lease);
            drop(token);
            core.requeue_per_drone(drone_id, task).await;
            return;
        }
    };

    // Compose and publish.
    let payload = CommandPayload {
        command_id: task.command_id.clone(),
        kind: task.kind.clone(),
        parameters: task.parameters.clone(),
        persona: serde_json::to_value(&persona).unwrap_or(Value::Null),
        session: task.session.clone(),
        timeout_sec: task.timeout_sec,
    };
    if let Err(err) = core
        .bus
        .publish_to_drone(drone_id, HubMessage::ExecuteCommand(payload))
        .await
    {
        warn!(drone = %drone_id, command = %task.command_id, %err, "publish failed, requeueing");
        drop(lease);
        drop(token);
        core.requeue_per_drone(drone_id, task).await;
        return;
    }

    core.registry.mark_busy(drone_id, &task.command_id);
    core.registry.record_assignment(drone_id);
    inc_drone_counter(TASKS_DISPATCHED, drone_id);
    debug!(drone = %drone_id, command = %task.command_id, "command dispatched");

    // The tracker owns the token and lease from here on.
    if let Err(err) = core
        .tracker
        .register_dispatch(&task.command_id, drone_id, token, lease)
    {
        // Duplicate command id: the in-flight twin keeps its resources;
        // ours were already reclaimed by the tracker's rejection.
        error!(command = %task.command_id, %err, "dropping task after registration failure");
        core.registry.mark_idle(drone_id);
        return;
    }

    spawn_ack_watcher(Arc::clone(core), drone_id.clone(), task);
}

/// Watches one command's acknowledgement, fire-and-forget.
fn spawn_ack_watcher(core: Arc<SchedulerCore>, drone_id: DroneId, task: Task) {
    tokio::spawn(async move {
        let timeout = Duration::from_secs(core.scheduling.ack_timeout_sec);
        let outcome = tokio::select! {
            biased;
            // Shutdown is not an error; just stop watching.
            () = core.stop.cancelled() => return,
            outcome = core
                .tracker
                .wait_for_acknowledgement(&task.command_id, timeout) => outcome,
        };

        match outcome {
            AckOutcome::Acknowledged => {}
            AckOutcome::Failed(reason) if reason == DRONE_DISCONNECTED => {
                // The drone died before confirming; the command never
                // started, so the task gets another chance.
                info!(command = %task.command_id, drone = %drone_id, "requeueing after disconnect");
                core.requeue_ready(task).await;
            }
            AckOutcome::Failed(reason) => {
                debug!(command = %task.command_id, reason, "command failed before ack");
            }
            AckOutcome::Timeout => {
                warn!(
                    command = %task.command_id,
                    drone = %drone_id,
                    timeout_sec = core.scheduling.ack_timeout_sec,
                    "acknowledgement timed out"
                );
                inc_drone_counter(COMMANDS_ACK_TIMEOUT, &drone_id);
                core.tracker.fail(&task.command_id, &drone_id, "ack_timeout");
                core.registry.record_error(&drone_id);
                core.registry.mark_idle(&drone_id);
                core.requeue_ready(task).await;
            }
        }
    });
}
