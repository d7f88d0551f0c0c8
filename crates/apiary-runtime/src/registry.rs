//! Drone registry.
//!
//! Owns the authoritative [`DroneInfo`] records. The scheduler and the
//! selection logic read point-in-time snapshots and drive transitions
//! through the methods here; nothing hands out references into the map.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use apiary_bus::DroneRegistrationPayload;
use apiary_types::{CommandId, DroneId};

/// Lifecycle status of a drone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DroneStatus {
    /// Connected and ready for work.
    Idle,
    /// Executing a command.
    Busy {
        /// The command being executed.
        current_command: CommandId,
    },
    /// Connection lost or heartbeats expired.
    Disconnected,
    /// Reported an unrecoverable internal error.
    Error,
}

impl DroneStatus {
    /// Returns `true` for [`DroneStatus::Idle`].
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Point-in-time view of one drone.
#[derive(Debug, Clone)]
pub struct DroneInfo {
    /// Drone id.
    pub drone_id: DroneId,
    /// Transport connection handle.
    pub connection_id: String,
    /// Drone software version.
    pub version: String,
    /// Capability labels the drone advertises.
    pub static_capabilities: BTreeSet<String>,
    /// Current lifecycle status.
    pub status: DroneStatus,
    /// Last heartbeat or status report.
    pub last_heartbeat: Instant,
    /// Last time the scheduler assigned this drone a task.
    pub last_task_assigned_at: Option<Instant>,
    /// Commands currently in flight on this drone.
    pub current_load: u32,
    /// Failures attributed to this drone (ack timeouts, reported errors).
    pub error_count: u32,
}

impl DroneInfo {
    /// Minutes since the drone was last assigned a task; time since
    /// registration when it never was.
    #[must_use]
    pub fn idle_minutes(&self, now: Instant) -> f64 {
        let since = match self.last_task_assigned_at {
            Some(at) => now.saturating_duration_since(at),
            None => now.saturating_duration_since(self.last_heartbeat),
        };
        since.as_secs_f64() / 60.0
    }
}

/// Registry of known drones.
#[derive(Debug, Default)]
pub struct DroneRegistry {
    drones: RwLock<HashMap<DroneId, DroneInfo>>,
}

impl DroneRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a drone or refreshes an existing registration.
    ///
    /// Re-registration resets status to Idle and replaces connection,
    /// version and capabilities; load and error counters reset too,
    /// since a re-registering drone has restarted.
    pub fn register(&self, payload: DroneRegistrationPayload) {
        let now = Instant::now();
        let info = DroneInfo {
            drone_id: payload.drone_id.clone(),
            connection_id: payload.connection_id,
            version: payload.version,
            static_capabilities: payload.capabilities.into_iter().collect(),
            status: DroneStatus::Idle,
            last_heartbeat: now,
            last_task_assigned_at: None,
            current_load: 0,
            error_count: 0,
        };
        let replaced = self
            .drones
            .write()
            .insert(payload.drone_id.clone(), info)
            .is_some();
        if replaced {
            info!(drone = %payload.drone_id, "drone re-registered");
        } else {
            info!(drone = %payload.drone_id, "drone registered");
        }
    }

    /// Returns a snapshot of one drone.
    #[must_use]
    pub fn snapshot(&self, drone_id: &DroneId) -> Option<DroneInfo> {
        self.drones.read().get(drone_id).cloned()
    }

    /// Returns snapshots of every known drone.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<DroneInfo> {
        self.drones.read().values().cloned().collect()
    }

    /// Marks a drone busy on a command and bumps its load.
    pub fn mark_busy(&self, drone_id: &DroneId, command_id: &CommandId) {
        if let Some(info) = self.drones.write().get_mut(drone_id) {
            info.status = DroneStatus::Busy {
                current_command: command_id.clone(),
            };
            info.current_load += 1;
        }
    }

    /// Marks a drone idle and drops one unit of load.
    pub fn mark_idle(&self, drone_id: &DroneId) {
        if let Some(info) = self.drones.write().get_mut(drone_id) {
            info.status = DroneStatus::Idle;
            info.current_load = info.current_load.saturating_sub(1);
        }
    }

    /// Marks a drone disconnected. Its in-flight commands are failed by
    /// the caller via the lifecycle tracker.
    pub fn mark_disconnected(&self, drone_id: &DroneId) {
        if let Some(info) = self.drones.write().get_mut(drone_id) {
            info.status = DroneStatus::Disconnected;
            info.current_load = 0;
            warn!(drone = %drone_id, "drone disconnected");
        }
    }

    /// Records a failure attributed to a drone.
    pub fn record_error(&self, drone_id: &DroneId) {
        if let Some(info) = self.drones.write().get_mut(drone_id) {
            info.error_count += 1;
        }
    }

    /// Records a task assignment for fairness ordering.
    pub fn record_assignment(&self, drone_id: &DroneId) {
        if let Some(info) = self.drones.write().get_mut(drone_id) {
            info.last_task_assigned_at = Some(Instant::now());
        }
    }

    /// Refreshes the heartbeat and, for status reports, the status.
    pub fn touch_heartbeat(&self, drone_id: &DroneId) {
        if let Some(info) = self.drones.write().get_mut(drone_id) {
            info.last_heartbeat = Instant::now();
            if info.status == DroneStatus::Disconnected {
                // The drone came back before anyone re-registered it.
                info.status = DroneStatus::Idle;
                debug!(drone = %drone_id, "drone heartbeat resumed");
            }
        }
    }

    /// Removes a drone entirely.
    pub fn remove(&self, drone_id: &DroneId) -> Option<DroneInfo> {
        self.drones.write().remove(drone_id)
    }

    /// Marks drones whose heartbeat is older than `expect + grace` as
    /// disconnected and returns their ids.
    pub fn expire_stale(
        &self,
        now: Instant,
        expect: std::time::Duration,
        grace: std::time::Duration,
    ) -> Vec<DroneId> {
        let deadline = expect + grace;
        let mut expired = Vec::new();
        let mut drones = self.drones.write();
        for (id, info) in drones.iter_mut() {
            if info.status != DroneStatus::Disconnected
                && now.saturating_duration_since(info.last_heartbeat) > deadline
            {
                info.status = DroneStatus::Disconnected;
                info.current_load = 0;
                expired.push(id.clone());
            }
        }
        drop(drones);
        for id in &expired {
            warn!(drone = %id, "drone heartbeat expired");
        }
        expired
    }
}
