//! Command lifecycle tracker.
//!
//! Correlates dispatch → acknowledgement → completion for every
//! in-flight command and owns the resources a dispatch acquired: the
//! drone's pacing token and the optional domain lease. Both are released
//! exactly once, by whichever terminal signal arrives first:
//! [`complete`](CommandLifecycleTracker::complete),
//! [`fail`](CommandLifecycleTracker::fail), or
//! [`fail_all`](CommandLifecycleTracker::fail_all) on disconnect.
//!
//! # Ordering
//!
//! Per command the signal order is total: `register → (ack | fail |
//! complete | timeout)`; any signal after the first terminal one finds
//! no state and is ignored. An acknowledgement timeout observed by
//! [`wait_for_acknowledgement`](CommandLifecycleTracker::wait_for_acknowledgement)
//! deliberately mutates nothing; the scheduler decides whether to fail
//! the command.

use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use apiary_types::{CommandId, DroneId, ErrorCode};

use crate::domain::DomainLease;
use crate::metrics::{inc_drone_counter, COMMANDS_ACKNOWLEDGED, COMMANDS_COMPLETED, COMMANDS_FAILED};

/// One in-flight permit on a drone's pacing semaphore.
///
/// Holding the token is what admits a command to the wire; dropping it
/// returns the permit. Ownership moves from the dispatch path into the
/// tracker at registration, so release happens exactly once no matter
/// which terminal path fires.
#[derive(Debug)]
pub struct PacingToken {
    _permit: OwnedSemaphorePermit,
}

impl PacingToken {
    /// Wraps an acquired pacing permit.
    #[must_use]
    pub fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }
}

/// Outcome of waiting for a command acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The drone confirmed it started the command.
    Acknowledged,
    /// The command failed before (or instead of) acknowledgement.
    Failed(String),
    /// No signal arrived within the wait deadline.
    Timeout,
}

/// Tracker layer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// A dispatch was registered under an id that is already in flight.
    #[error("command already tracked: {0}")]
    DuplicateCommand(CommandId),
}

impl ErrorCode for TrackerError {
    fn code(&self) -> &'static str {
        match self {
            Self::DuplicateCommand(_) => "TRACK_DUPLICATE_COMMAND",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct CommandState {
    drone_id: DroneId,
    pacing: Option<PacingToken>,
    lease: Option<DomainLease>,
    ack_tx: Option<oneshot::Sender<AckOutcome>>,
    ack_rx: Option<oneshot::Receiver<AckOutcome>>,
}

/// Tracks every in-flight command and its held resources.
#[derive(Debug, Default)]
pub struct CommandLifecycleTracker {
    states: DashMap<CommandId, CommandState>,
    /// Terminal outcomes for commands whose state is gone, so a late
    /// `wait_for_acknowledgement` still gets an answer. Cleared when the
    /// id is registered again or the outcome is consumed.
    completed: DashMap<CommandId, AckOutcome>,
}

impl CommandLifecycleTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dispatched command and takes ownership of its pacing
    /// token and domain lease.
    ///
    /// Clears any stale completion result recorded under the same id.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::DuplicateCommand`] when the id is already
    /// in flight; the caller keeps the token and lease and must roll
    /// back.
    pub fn register_dispatch(
        &self,
        command_id: &CommandId,
        drone_id: &DroneId,
        pacing: PacingToken,
        lease: Option<DomainLease>,
    ) -> Result<(), TrackerError> {
        use dashmap::mapref::entry::Entry;

        match self.states.entry(command_id.clone()) {
            Entry::Occupied(_) => Err(TrackerError::DuplicateCommand(command_id.clone())),
            Entry::Vacant(entry) => {
                self.completed.remove(command_id);
                let (ack_tx, ack_rx) = oneshot::channel();
                entry.insert(CommandState {
                    drone_id: drone_id.clone(),
                    pacing: Some(pacing),
                    lease,
                    ack_tx: Some(ack_tx),
                    ack_rx: Some(ack_rx),
                });
                debug!(command = %command_id, drone = %drone_id, "registered dispatch");
                Ok(())
            }
        }
    }

    /// Waits for the command's acknowledgement, racing the timeout.
    ///
    /// A timeout mutates nothing: the command stays tracked and the
    /// caller decides whether to fail it. When the command is unknown, a
    /// posted completion result is returned if one exists; otherwise the
    /// caller is late and the wait resolves `Acknowledged`.
    pub async fn wait_for_acknowledgement(
        &self,
        command_id: &CommandId,
        timeout: Duration,
    ) -> AckOutcome {
        let rx = {
            match self.states.get_mut(command_id) {
                Some(mut state) => state.ack_rx.take(),
                None => {
                    return self
                        .completed
                        .remove(command_id)
                        .map_or(AckOutcome::Acknowledged, |(_, outcome)| outcome);
                }
            }
        };
        let Some(mut rx) = rx else {
            // Another waiter already holds the future; this command is
            // being watched elsewhere.
            return self
                .completed
                .remove(command_id)
                .map_or(AckOutcome::Acknowledged, |(_, outcome)| outcome);
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => {
                // The sender vanished without resolving; only tracker
                // teardown does this.
                AckOutcome::Failed("tracker_closed".to_string())
            }
            Err(_elapsed) => {
                if let Some(mut state) = self.states.get_mut(command_id) {
                    state.ack_rx = Some(rx);
                }
                AckOutcome::Timeout
            }
        }
    }

    /// Resolves the command's acknowledgement future.
    ///
    /// Logs a warning when the acknowledging drone is not the one the
    /// command was dispatched to; the acknowledgement still counts.
    pub fn mark_acknowledged(&self, command_id: &CommandId, drone_id: &DroneId) {
        let tx = match self.states.get_mut(command_id) {
            Some(mut state) => {
                if state.drone_id != *drone_id {
                    warn!(
                        command = %command_id,
                        expected = %state.drone_id,
                        acknowledging = %drone_id,
                        "acknowledgement from unexpected drone"
                    );
                }
                state.ack_tx.take()
            }
            None => None,
        };
        if let Some(tx) = tx {
            let _ = tx.send(AckOutcome::Acknowledged);
            inc_drone_counter(COMMANDS_ACKNOWLEDGED, drone_id);
        }
    }

    /// Terminates a command successfully, releasing its resources.
    pub fn complete(&self, command_id: &CommandId, drone_id: &DroneId) {
        self.terminate(command_id, drone_id, AckOutcome::Acknowledged, true);
    }

    /// Terminates a command as failed, releasing its resources.
    pub fn fail(&self, command_id: &CommandId, drone_id: &DroneId, reason: &str) {
        self.terminate(
            command_id,
            drone_id,
            AckOutcome::Failed(reason.to_string()),
            false,
        );
    }

    /// Fails every tracked command belonging to a drone. Used on
    /// disconnect; pending acknowledgement waiters resolve to
    /// `Failed(reason)`.
    pub fn fail_all(&self, drone_id: &DroneId, reason: &str) {
        let ids: Vec<CommandId> = self
            .states
            .iter()
            .filter(|entry| entry.value().drone_id == *drone_id)
            .map(|entry| entry.key().clone())
            .collect();
        if !ids.is_empty() {
            warn!(drone = %drone_id, commands = ids.len(), reason, "failing all drone commands");
        }
        for id in ids {
            self.fail(&id, drone_id, reason);
        }
    }

    /// Returns `true` while a command is in flight.
    #[must_use]
    pub fn is_tracked(&self, command_id: &CommandId) -> bool {
        self.states.contains_key(command_id)
    }

    /// Number of in-flight commands.
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.states.len()
    }

    fn terminate(
        &self,
        command_id: &CommandId,
        drone_id: &DroneId,
        outcome: AckOutcome,
        success: bool,
    ) {
        match self.states.remove(command_id) {
            Some((_, mut state)) => {
                if state.drone_id != *drone_id {
                    warn!(
                        command = %command_id,
                        expected = %state.drone_id,
                        reporting = %drone_id,
                        "terminal signal from unexpected drone"
                    );
                }
                // With no waiter holding the ack future, the outcome is
                // posted for a late `wait_for_acknowledgement` instead.
                let nobody_waiting = state.ack_rx.is_some();
                if let Some(tx) = state.ack_tx.take() {
                    let _ = tx.send(outcome.clone());
                }
                // Lease first, then pacing token: the domain credit must
                // be back before the drone can admit its next command.
                if let Some(lease) = state.lease.take() {
                    lease.release();
                }
                drop(state.pacing.take());

                if nobody_waiting {
                    self.completed.insert(command_id.clone(), outcome);
                }
                let metric = if success { COMMANDS_COMPLETED } else { COMMANDS_FAILED };
                inc_drone_counter(metric, &state.drone_id);
                debug!(command = %command_id, drone = %drone_id, success, "command terminated");
            }
            None => {
                // Signals for an unknown (or already terminated) command
                // are dropped; the first terminal signal won.
                debug!(command = %command_id, "terminal signal for untracked command ignored");
            }
        }
    }
}
