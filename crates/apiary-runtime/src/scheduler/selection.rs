//! Drone eligibility and selection.
//!
//! Eligibility is capability inclusion: a drone qualifies when the
//! task's required labels are a subset of its advertised ones (an empty
//! requirement matches every drone). Disconnected drones are excluded;
//! routing to one would only bounce the task back.
//!
//! Selection then sorts eligible drones by current load, by how long
//! ago each was last assigned work (idle-longest first), and finally by
//! a composite score.

use std::cmp::Ordering;
use std::time::Instant;

use apiary_types::Task;

use crate::registry::{DroneInfo, DroneStatus};

/// Filters registry snapshots down to drones that can run the task.
#[must_use]
pub fn eligible_drones(drones: Vec<DroneInfo>, task: &Task) -> Vec<DroneInfo> {
    drones
        .into_iter()
        .filter(|drone| {
            drone.status != DroneStatus::Disconnected
                && task
                    .required_capabilities
                    .iter()
                    .all(|cap| drone.static_capabilities.contains(cap))
        })
        .collect()
}

/// Picks the drone a task should be routed to.
///
/// Ordering: `current_load` ascending, then `last_task_assigned_at`
/// ascending (never-assigned drones first), then [`score`] descending.
/// Returns `None` when no drone is eligible.
#[must_use]
pub fn select_drone(mut eligible: Vec<DroneInfo>, task: &Task, now: Instant) -> Option<DroneInfo> {
    eligible.sort_by(|a, b| {
        a.current_load
            .cmp(&b.current_load)
            .then_with(|| compare_last_assigned(a, b))
            .then_with(|| {
                score(b, task, now)
                    .partial_cmp(&score(a, task, now))
                    .unwrap_or(Ordering::Equal)
            })
    });
    eligible.into_iter().next()
}

fn compare_last_assigned(a: &DroneInfo, b: &DroneInfo) -> Ordering {
    match (a.last_task_assigned_at, b.last_task_assigned_at) {
        (None, None) => Ordering::Equal,
        // Never assigned sorts before any assignment time.
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a_at), Some(b_at)) => a_at.cmp(&b_at),
    }
}

/// Composite tiebreak score; higher is better.
///
/// Rewards capability overlap with the task, long idleness (capped),
/// and task priority; penalises load.
#[must_use]
pub fn score(drone: &DroneInfo, task: &Task, now: Instant) -> f64 {
    let overlap = task
        .required_capabilities
        .iter()
        .filter(|cap| drone.static_capabilities.contains(*cap))
        .count() as f64;
    let idle_bonus = (0.01 * drone.idle_minutes(now)).min(0.5);

    1.0 + 0.1 * overlap + idle_bonus - 0.2 * f64::from(drone.current_load)
        + 0.3 * f64::from(task.priority.ordinal())
}
