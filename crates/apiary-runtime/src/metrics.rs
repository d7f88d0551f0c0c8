//! Orchestrator metrics.
//!
//! Metric names are stable consts so dashboards and alerts can reference
//! them without chasing call sites. Recording goes through small helpers
//! to keep label spelling consistent.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};

use apiary_types::DroneId;

// ============================================================================
// Queue Metrics
// ============================================================================

/// Current ready-queue length.
pub const QUEUE_GLOBAL_LENGTH: &str = "queue_global_length";

/// Current per-drone queue length.
pub const QUEUE_PER_DRONE_LENGTH: &str = "queue_per_drone_length";

/// Tasks accepted by submission.
pub const TASKS_ENQUEUED: &str = "tasks_enqueued_total";

/// Tasks routed onto a per-drone queue.
pub const TASKS_QUEUED: &str = "tasks_queued_total";

/// Commands published to a drone.
pub const TASKS_DISPATCHED: &str = "tasks_dispatched_total";

/// Tasks put back on a queue after a soft failure.
pub const TASKS_REQUEUED: &str = "tasks_requeued_total";

// ============================================================================
// Command Lifecycle Metrics
// ============================================================================

/// Commands that never got an acknowledgement in time.
pub const COMMANDS_ACK_TIMEOUT: &str = "commands_ack_timeout_total";

/// Commands acknowledged by their drone.
pub const COMMANDS_ACKNOWLEDGED: &str = "commands_acknowledged_total";

/// Commands completed successfully.
pub const COMMANDS_COMPLETED: &str = "commands_completed_total";

/// Commands that failed.
pub const COMMANDS_FAILED: &str = "commands_failed_total";

// ============================================================================
// Persona Retry Metrics
// ============================================================================

/// Persona-missing dispatches scheduled for retry.
pub const TASKS_PERSONA_MISSING_RETRY: &str = "tasks_persona_missing_retry_total";

/// Persona-missing dispatches that exhausted their retries.
pub const TASKS_PERSONA_MISSING_FAILED: &str = "tasks_persona_missing_failed_total";

/// Persona-missing retries put back on the ready queue.
pub const TASKS_PERSONA_MISSING_REQUEUED: &str = "tasks_persona_missing_requeued_total";

// ============================================================================
// Domain Limiter Metrics
// ============================================================================

/// Active domain leases per registrable domain.
pub const DOMAIN_SESSIONS_ACTIVE: &str = "domain_sessions_active";

// ============================================================================
// Intervention Metrics
// ============================================================================

/// Intervention sessions opened, by reason.
pub const INTERVENTIONS_TOTAL: &str = "drone_interventions_total";

/// Wall-clock duration of completed intervention sessions.
pub const INTERVENTION_WINDOW_MS: &str = "drone_intervention_window_ms";

/// Intervention sessions closed by the window timer.
pub const INTERVENTION_TIMEOUTS: &str = "drone_intervention_timeouts";

/// Intervention sessions closed by the step timer.
pub const INTERVENTION_STEP_TIMEOUTS: &str = "drone_intervention_step_timeouts";

/// Registers all metric descriptions.
///
/// Call once at host startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_gauge!(QUEUE_GLOBAL_LENGTH, "Current ready-queue length");
    describe_gauge!(QUEUE_PER_DRONE_LENGTH, "Current per-drone queue length");
    describe_counter!(TASKS_ENQUEUED, "Tasks accepted by submission");
    describe_counter!(TASKS_QUEUED, "Tasks routed onto a per-drone queue");
    describe_counter!(TASKS_DISPATCHED, "Commands published to a drone");
    describe_counter!(TASKS_REQUEUED, "Tasks requeued after a soft failure");
    describe_counter!(COMMANDS_ACK_TIMEOUT, "Commands that missed the ack timeout");
    describe_counter!(COMMANDS_ACKNOWLEDGED, "Commands acknowledged by their drone");
    describe_counter!(COMMANDS_COMPLETED, "Commands completed successfully");
    describe_counter!(COMMANDS_FAILED, "Commands that failed");
    describe_counter!(
        TASKS_PERSONA_MISSING_RETRY,
        "Persona-missing dispatches scheduled for retry"
    );
    describe_counter!(
        TASKS_PERSONA_MISSING_FAILED,
        "Persona-missing dispatches that exhausted their retries"
    );
    describe_counter!(
        TASKS_PERSONA_MISSING_REQUEUED,
        "Persona-missing retries returned to the ready queue"
    );
    describe_gauge!(DOMAIN_SESSIONS_ACTIVE, "Active domain leases per domain");
    describe_counter!(INTERVENTIONS_TOTAL, "Intervention sessions opened");
    describe_histogram!(
        INTERVENTION_WINDOW_MS,
        "Wall-clock duration of intervention sessions in milliseconds"
    );
    describe_counter!(
        INTERVENTION_TIMEOUTS,
        "Intervention sessions closed by the window timer"
    );
    describe_counter!(
        INTERVENTION_STEP_TIMEOUTS,
        "Intervention sessions closed by the step timer"
    );
}

/// Records the current ready-queue length.
pub fn record_ready_queue_length(len: usize) {
    gauge!(QUEUE_GLOBAL_LENGTH).set(len as f64);
}

/// Records the current length of one drone's queue.
pub fn record_drone_queue_length(drone_id: &DroneId, len: usize) {
    gauge!(QUEUE_PER_DRONE_LENGTH, "drone_id" => drone_id.to_string()).set(len as f64);
}

/// Increments a per-drone counter.
pub fn inc_drone_counter(name: &'static str, drone_id: &DroneId) {
    counter!(name, "drone_id" => drone_id.to_string()).increment(1);
}

/// Increments a plain counter.
pub fn inc_counter(name: &'static str) {
    counter!(name).increment(1);
}

/// Records the number of active leases for a domain.
pub fn record_domain_sessions(domain: &str, active: u32) {
    gauge!(DOMAIN_SESSIONS_ACTIVE, "domain" => domain.to_string()).set(f64::from(active));
}

/// Records an opened intervention session.
pub fn inc_interventions(reason: &str) {
    counter!(INTERVENTIONS_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Records the duration of a completed intervention session.
pub fn record_intervention_window_ms(ms: f64) {
    histogram!(INTERVENTION_WINDOW_MS).record(ms);
}
